//! End-to-end assembly and dispatch tests

use multitarea::{
    build_model, Batch, LabelTensor, ModelConfig, ModelError, SentEncKind, TaskDescriptor,
    TaskKind, TaskMetric, TaskOverrides, TokenBatch, Vocab, WordEmbs,
};
use ndarray::{arr1, arr2, Array2};

fn words(rows: Vec<Vec<usize>>) -> TokenBatch {
    let n = rows.len();
    let l = rows[0].len();
    let flat: Vec<usize> = rows.into_iter().flatten().collect();
    TokenBatch::from_words(Array2::from_shape_vec((n, l), flat).unwrap())
}

fn glue_roster() -> Vec<TaskDescriptor> {
    vec![
        TaskDescriptor::new("sst2", TaskKind::SingleClassification { n_classes: 2 }),
        TaskDescriptor::new(
            "mnli",
            TaskKind::PairClassification {
                n_classes: 3,
                word_in_context: false,
            },
        ),
        TaskDescriptor::new("sts-b", TaskKind::PairRegression),
    ]
}

#[test]
fn multi_task_roster_shares_one_encoder() {
    let cfg = ModelConfig::tiny();
    let vocab = Vocab::with_n_words(32);
    let tasks = glue_roster();
    let mut model = build_model(&cfg, &vocab, None, &tasks).unwrap();

    let single = Batch {
        input1: Some(words(vec![vec![2, 3, 4, 0]])),
        labels: Some(LabelTensor::Vec(arr1(&[1.0]))),
        ..Batch::default()
    };
    let out = model.forward(&tasks[0], &single, false);
    assert_eq!(out.logits.unwrap().dim(), (1, 2));

    let pair = Batch {
        input1: Some(words(vec![vec![2, 3, 4, 0]])),
        input2: Some(words(vec![vec![5, 6, 0, 0]])),
        labels: Some(LabelTensor::Vec(arr1(&[2.0]))),
        ..Batch::default()
    };
    let out = model.forward(&tasks[1], &pair, false);
    assert_eq!(out.logits.unwrap().dim(), (1, 3));

    let reg = Batch {
        input1: Some(words(vec![vec![2, 3, 0, 0]])),
        input2: Some(words(vec![vec![4, 5, 0, 0]])),
        labels: Some(LabelTensor::Vec(arr1(&[4.2]))),
        ..Batch::default()
    };
    let out = model.forward(&tasks[2], &reg, false);
    assert_eq!(out.logits.unwrap().dim(), (1, 1));
    assert!(matches!(model.metric("sts-b"), Some(TaskMetric::Mse(_))));
}

#[test]
fn bow_encoder_rejects_skip_embs_at_build() {
    let mut cfg = ModelConfig::tiny();
    cfg.sent_enc = SentEncKind::Bow;
    cfg.skip_embs = true;
    let vocab = Vocab::with_n_words(8);
    let err = build_model(&cfg, &vocab, None, &glue_roster()).unwrap_err();
    assert!(matches!(err, ModelError::InvalidEncoder(_)));
}

#[test]
fn pass_through_encoder_requires_skip_embs() {
    let mut cfg = ModelConfig::tiny();
    cfg.sent_enc = SentEncKind::None;
    cfg.skip_embs = false;
    let vocab = Vocab::with_n_words(8);
    let err = build_model(&cfg, &vocab, None, &glue_roster()).unwrap_err();
    assert!(matches!(err, ModelError::InvalidEncoder(_)));
}

#[test]
fn pass_through_with_skip_classifies_over_raw_embeddings() {
    let mut cfg = ModelConfig::tiny();
    cfg.sent_enc = SentEncKind::None;
    cfg.skip_embs = true;
    let vocab = Vocab::with_n_words(8);
    let tasks = vec![TaskDescriptor::new(
        "sst2",
        TaskKind::SingleClassification { n_classes: 2 },
    )];
    let mut model = build_model(&cfg, &vocab, None, &tasks).unwrap();
    let batch = Batch {
        input1: Some(words(vec![vec![2, 3, 0, 0]])),
        labels: Some(LabelTensor::Vec(arr1(&[0.0]))),
        ..Batch::default()
    };
    let out = model.forward(&tasks[0], &batch, false);
    assert_eq!(out.logits.unwrap().dim(), (1, 2));
}

#[test]
fn pretrained_embeddings_must_match_vocab() {
    let mut cfg = ModelConfig::tiny();
    cfg.word_embs = WordEmbs::Pretrained;
    let vocab = Vocab::with_n_words(8);
    // Row count off by one.
    let table = Array2::zeros((vocab.size("tokens") - 1, cfg.d_word));
    let err = build_model(&cfg, &vocab, Some(table), &glue_roster()).unwrap_err();
    assert!(matches!(err, ModelError::InvalidEmbeddings(_)));

    let table = Array2::from_elem((vocab.size("tokens"), cfg.d_word), 0.1);
    assert!(build_model(&cfg, &vocab, Some(table), &glue_roster()).is_ok());
}

#[test]
fn bidirectional_lm_scores_both_directions() {
    let cfg = ModelConfig::tiny();
    let vocab = Vocab::with_n_words(16);
    let tasks = vec![TaskDescriptor::new("wiki103", TaskKind::LanguageModeling)];
    let mut model = build_model(&cfg, &vocab, None, &tasks).unwrap();
    let batch = Batch {
        input1: Some(words(vec![vec![2, 3, 4, 5], vec![6, 7, 0, 0]])),
        targs: Some(arr2(&[[3, 4, 5, 6], [7, 8, 0, 0]])),
        targs_b: Some(arr2(&[[0, 2, 3, 4], [0, 6, 0, 0]])),
        ..Batch::default()
    };
    let out = model.forward(&tasks[0], &batch, false);
    // One row per position per direction.
    assert_eq!(
        out.logits.unwrap().dim(),
        (2 * 2 * 4, vocab.size("tokens"))
    );
    // 6 non-pad forward targets, doubled.
    assert_eq!(out.n_exs, 12);
    assert!(out.loss.unwrap() > 0.0);
}

#[test]
fn diagnostic_task_scores_with_aliased_classifier() {
    let mut cfg = ModelConfig::tiny();
    cfg.task_overrides.insert(
        "mnli-diagnostic".to_string(),
        TaskOverrides {
            use_classifier: Some("mnli".to_string()),
            ..TaskOverrides::default()
        },
    );
    let vocab = Vocab::with_n_words(16);
    let tasks = vec![
        TaskDescriptor::new(
            "mnli",
            TaskKind::PairClassification {
                n_classes: 3,
                word_in_context: false,
            },
        ),
        TaskDescriptor::new("mnli-diagnostic", TaskKind::Diagnostic { n_classes: 3 }),
    ];
    let mut model = build_model(&cfg, &vocab, None, &tasks).unwrap();
    let batch = Batch {
        input1: Some(words(vec![vec![2, 3, 0, 0]])),
        input2: Some(words(vec![vec![4, 5, 0, 0]])),
        labels: Some(LabelTensor::Vec(arr1(&[1.0]))),
        ..Batch::default()
    };
    // Both tasks produce 3-way logits through the one mnli module, and each
    // keeps its own metric accumulator.
    let out_main = model.forward(&tasks[0], &batch, false);
    let out_diag = model.forward(&tasks[1], &batch, false);
    assert_eq!(out_main.logits.unwrap().dim(), (1, 3));
    assert_eq!(out_diag.logits.unwrap().dim(), (1, 3));
    assert!(model.metric("mnli-diagnostic").is_some());
}

#[test]
fn word_in_context_appends_target_tokens() {
    let cfg = ModelConfig::tiny();
    let vocab = Vocab::with_n_words(16);
    let tasks = vec![TaskDescriptor::new(
        "wic",
        TaskKind::PairClassification {
            n_classes: 2,
            word_in_context: true,
        },
    )];
    let mut model = build_model(&cfg, &vocab, None, &tasks).unwrap();
    let batch = Batch {
        input1: Some(words(vec![vec![2, 3, 4, 0]])),
        input2: Some(words(vec![vec![5, 3, 6, 0]])),
        idx1: Some(arr1(&[1usize])),
        idx2: Some(arr1(&[1usize])),
        labels: Some(LabelTensor::Vec(arr1(&[1.0]))),
        ..Batch::default()
    };
    let out = model.forward(&tasks[0], &batch, false);
    assert_eq!(out.logits.unwrap().dim(), (1, 2));
    assert!(out.loss.is_some());
}

#[test]
fn classifier_map_persists_across_builds() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = ModelConfig::tiny();
    cfg.sep_embs_for_skip = true;
    cfg.skip_embs = true;
    cfg.run_dir = dir.path().to_path_buf();
    cfg.do_pretrain = true;
    let vocab = Vocab::with_n_words(16);

    let tasks = vec![TaskDescriptor::new(
        "mnli",
        TaskKind::PairClassification {
            n_classes: 3,
            word_in_context: false,
        },
    )];
    build_model(&cfg, &vocab, None, &tasks).unwrap();
    assert!(dir.path().join("classifier_task_map.json").is_file());

    // A continuation run with more tasks keeps the old assignment.
    cfg.do_pretrain = false;
    let more_tasks = vec![
        tasks[0].clone(),
        TaskDescriptor::new("sst2", TaskKind::SingleClassification { n_classes: 2 }),
    ];
    build_model(&cfg, &vocab, None, &more_tasks).unwrap();

    let raw = std::fs::read_to_string(dir.path().join("classifier_task_map.json")).unwrap();
    let map: std::collections::BTreeMap<String, usize> = serde_json::from_str(&raw).unwrap();
    assert_eq!(map["@pretrain@"], 0);
    assert_eq!(map["mnli"], 1);
    assert_eq!(map["sst2"], 2);
}

#[test]
fn continuation_run_without_map_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = ModelConfig::tiny();
    cfg.sep_embs_for_skip = true;
    cfg.skip_embs = true;
    cfg.run_dir = dir.path().to_path_buf();
    cfg.do_pretrain = false;
    cfg.allow_missing_task_map = false;
    let vocab = Vocab::with_n_words(16);
    let err = build_model(&cfg, &vocab, None, &glue_roster()).unwrap_err();
    assert!(matches!(err, ModelError::MissingClassifierMap(_)));
}

#[test]
fn lm_task_with_incompatible_encoder_fails() {
    let mut cfg = ModelConfig::tiny();
    cfg.sent_enc = SentEncKind::Transformer;
    let vocab = Vocab::with_n_words(16);
    let tasks = vec![TaskDescriptor::new("wiki103", TaskKind::LanguageModeling)];
    let err = build_model(&cfg, &vocab, None, &tasks).unwrap_err();
    assert!(matches!(err, ModelError::InvalidEncoder(_)));
}

#[test]
fn metrics_accumulate_and_reset() {
    let cfg = ModelConfig::tiny();
    let vocab = Vocab::with_n_words(16);
    let tasks = vec![TaskDescriptor::new(
        "sst2",
        TaskKind::SingleClassification { n_classes: 2 },
    )];
    let mut model = build_model(&cfg, &vocab, None, &tasks).unwrap();
    let batch = Batch {
        input1: Some(words(vec![vec![2, 3, 0, 0], vec![4, 5, 6, 0]])),
        labels: Some(LabelTensor::Vec(arr1(&[1.0, 0.0]))),
        ..Batch::default()
    };
    model.forward(&tasks[0], &batch, false);
    let v = model.metric("sst2").unwrap().value();
    assert!((0.0..=1.0).contains(&v));
    model.reset_metrics();
    assert_eq!(model.metric("sst2").unwrap().value(), 0.0);
}
