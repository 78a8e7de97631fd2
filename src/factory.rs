//! Task module factory
//!
//! Resolves parameters for every task, then builds each task's head with one
//! exhaustive match on the task kind. A task whose resolved classifier alias
//! points at another task gets no module of its own; dispatch follows the
//! alias at forward time. The shared pair-attention instance, when enabled,
//! is created here exactly once and handed to every pair head that opts in.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, info};

use crate::config::{ModelConfig, SentEncKind};
use crate::error::Result;
use crate::heads::{
    AttnPairEncoder, Classifier, EdgeClassifierModule, LmHead, MultipleChoiceModule, PairClassifier,
    PoolKind, Pooler, ReadingComprehensionModule, Seq2SeqDecoder, SingleClassifier,
    SpanClassifierModule, TaskModule, Tagger,
};
use crate::metrics::{
    Average, CategoricalAccuracy, IndexedAccuracy, MseMetric, TaskMetric,
};
use crate::params::{resolve_task_params, TaskParams};
use crate::task::{TaskDescriptor, TaskKind};
use crate::vocab::Vocab;

/// Everything the dispatch model needs per task
#[derive(Debug)]
pub struct TaskModules {
    pub params: HashMap<String, TaskParams>,
    pub modules: HashMap<String, TaskModule>,
    pub metrics: HashMap<String, TaskMetric>,
}

/// Build the per-task heads over a shared encoder of width `d_inp`
/// (`d_sent` plus the skip connection).
pub fn build_task_modules(
    cfg: &ModelConfig,
    tasks: &[TaskDescriptor],
    d_inp: usize,
    d_emb: usize,
    vocab: &Vocab,
) -> Result<TaskModules> {
    let mut params = HashMap::new();
    let mut modules = HashMap::new();
    let mut metrics = HashMap::new();

    // One shared cross-attention instance for every pair head that opts in.
    let shared_attn: Option<Rc<AttnPairEncoder>> = (cfg.shared_pair_attn && cfg.pair_attn)
        .then(|| Rc::new(AttnPairEncoder::new(d_inp, cfg.d_hid_attn, 9.01)));
    if shared_attn.is_some() {
        info!(d_hid_attn = cfg.d_hid_attn, "sharing one pair-attention instance across tasks");
    }

    for (i, task) in tasks.iter().enumerate() {
        let task_params = resolve_task_params(cfg, &task.name);
        let aliased = task_params.use_classifier != task.name;
        params.insert(task.name.clone(), task_params.clone());
        metrics.insert(task.name.clone(), metric_for(&task.kind));
        if aliased {
            debug!(
                task = %task.name,
                classifier = %task_params.use_classifier,
                "task reuses another task's classifier; no module built"
            );
            continue;
        }
        let seed = 11.0 + i as f32 * 0.37;
        let module = build_module(cfg, task, &task_params, d_inp, d_emb, vocab, &shared_attn, seed)?;
        debug!(task = %task.name, "built task module");
        modules.insert(task.name.clone(), module);
    }

    Ok(TaskModules {
        params,
        modules,
        metrics,
    })
}

#[allow(clippy::too_many_arguments)]
fn build_module(
    cfg: &ModelConfig,
    task: &TaskDescriptor,
    params: &TaskParams,
    d_inp: usize,
    d_emb: usize,
    vocab: &Vocab,
    shared_attn: &Option<Rc<AttnPairEncoder>>,
    seed: f32,
) -> Result<TaskModule> {
    let joint = cfg.joint_encoder;
    Ok(match &task.kind {
        TaskKind::SingleClassification { n_classes } => {
            let pooler = pooler_for(d_inp, params, joint, seed);
            let classifier = Classifier::from_params(pooler.d_out(), *n_classes, params, seed * 1.3)?;
            TaskModule::SingleCls(SingleClassifier { pooler, classifier })
        }
        TaskKind::PairClassification {
            n_classes,
            word_in_context,
        } => {
            if joint {
                // Pairs arrive as one joint sequence; word-in-context also
                // feeds the two target-token representations.
                let pooler = pooler_for(d_inp, params, true, seed);
                let d_cls = if *word_in_context { 3 * d_inp } else { d_inp };
                let classifier = Classifier::from_params(d_cls, *n_classes, params, seed * 1.3)?;
                TaskModule::SingleCls(SingleClassifier { pooler, classifier })
            } else {
                pair_module(d_inp, *n_classes, *word_in_context, params, shared_attn, seed)?
            }
        }
        TaskKind::PairRegression | TaskKind::PairOrdinalRegression => {
            if joint {
                let pooler = pooler_for(d_inp, params, true, seed);
                let classifier = Classifier::from_params(d_inp, 1, params, seed * 1.3)?;
                TaskModule::SingleCls(SingleClassifier { pooler, classifier })
            } else {
                pair_module(d_inp, 1, false, params, shared_attn, seed)?
            }
        }
        TaskKind::Tagging { n_tags } => TaskModule::Tagger(Tagger::new(d_inp, *n_tags, seed)),
        TaskKind::MultipleChoice { .. } => {
            // The forward joins question and choice along the sequence axis,
            // so one pooled vector feeds the scorer.
            let pooler = pooler_for(d_inp, params, joint, seed);
            let choice2scalar = Classifier::from_params(pooler.d_out(), 1, params, seed * 1.3)?;
            TaskModule::MultipleChoice(MultipleChoiceModule {
                pooler,
                choice2scalar,
            })
        }
        TaskKind::EdgeProbing { n_labels, .. } => {
            TaskModule::EdgeCls(EdgeClassifierModule::new(d_inp, *n_labels, params, seed)?)
        }
        TaskKind::SpanClassification { n_classes, n_spans } => TaskModule::SpanCls(
            SpanClassifierModule::new(d_inp, *n_classes, *n_spans, params, seed)?,
        ),
        TaskKind::LanguageModeling | TaskKind::LanguageModelingParsing => {
            let skip = if cfg.skip_embs { d_emb } else { 0 };
            // Left-to-right-only encoders feed their whole output to the
            // projection; the bidirectional LM feeds one direction's half.
            // Both get the skip-connected embeddings appended.
            let d_lm = match cfg.sent_enc {
                SentEncKind::Onlstm | SentEncKind::Prpn => cfg.d_word + skip,
                _ => cfg.d_hid + skip,
            };
            TaskModule::Lm(LmHead::new(d_lm, vocab.size("tokens"), seed))
        }
        TaskKind::SequenceGeneration {
            target_namespace, ..
        } => TaskModule::Decoder(Seq2SeqDecoder::new(
            d_inp,
            cfg.s2s.d_hid_dec,
            cfg.s2s.output_proj_input_dim,
            vocab.size(target_namespace),
            cfg.s2s.attention,
            seed,
        )),
        TaskKind::ReadingComprehension => {
            // Paragraph, question and answer are joined along the sequence
            // axis before pooling, so one pooled vector feeds the classifier.
            let pooler = pooler_for(d_inp, params, joint, seed);
            let classifier = Classifier::from_params(pooler.d_out(), 2, params, seed * 1.3)?;
            TaskModule::ReadingComp(ReadingComprehensionModule { pooler, classifier })
        }
        TaskKind::Diagnostic { n_classes } => {
            // A diagnostic set normally aliases another task's classifier;
            // when it does not, it gets its own pair head.
            if joint {
                let pooler = pooler_for(d_inp, params, true, seed);
                let classifier = Classifier::from_params(d_inp, *n_classes, params, seed * 1.3)?;
                TaskModule::SingleCls(SingleClassifier { pooler, classifier })
            } else {
                pair_module(d_inp, *n_classes, false, params, shared_attn, seed)?
            }
        }
    })
}

fn pair_module(
    d_inp: usize,
    n_classes: usize,
    word_in_context: bool,
    params: &TaskParams,
    shared_attn: &Option<Rc<AttnPairEncoder>>,
    seed: f32,
) -> Result<TaskModule> {
    let attn: Option<Rc<AttnPairEncoder>> = if params.attn {
        match shared_attn {
            Some(shared) => Some(Rc::clone(shared)),
            None => Some(Rc::new(AttnPairEncoder::new(
                d_inp,
                params.d_hid_attn,
                seed * 0.83,
            ))),
        }
    } else {
        None
    };
    // Pooled width per side; cross-attention replaces the projection.
    let (pooler, d_side) = match &attn {
        Some(a) => (
            Pooler::new(a.d_out(), params.d_proj, false, PoolKind::Max, seed),
            a.d_out(),
        ),
        None => (
            Pooler::new(d_inp, params.d_proj, true, PoolKind::Max, seed),
            params.d_proj,
        ),
    };
    // Word-in-context appends the target-token representation to each side.
    let d_side = if word_in_context {
        d_side + attn.as_ref().map_or(d_inp, |a| a.d_out())
    } else {
        d_side
    };
    let classifier = Classifier::from_params(4 * d_side, n_classes, params, seed * 1.3)?;
    Ok(TaskModule::PairCls(PairClassifier {
        pooler,
        classifier,
        attn,
    }))
}

fn pooler_for(d_inp: usize, params: &TaskParams, joint: bool, seed: f32) -> Pooler {
    if joint {
        Pooler::new(d_inp, params.d_proj, false, PoolKind::First, seed)
    } else {
        Pooler::new(d_inp, params.d_proj, true, PoolKind::Max, seed)
    }
}

fn metric_for(kind: &TaskKind) -> TaskMetric {
    match kind {
        TaskKind::PairRegression | TaskKind::PairOrdinalRegression => {
            TaskMetric::Mse(MseMetric::default())
        }
        TaskKind::LanguageModeling
        | TaskKind::LanguageModelingParsing
        | TaskKind::SequenceGeneration { .. } => TaskMetric::AvgLoss(Average::default()),
        TaskKind::ReadingComprehension => TaskMetric::Indexed(IndexedAccuracy::default()),
        TaskKind::SingleClassification { .. }
        | TaskKind::PairClassification { .. }
        | TaskKind::Tagging { .. }
        | TaskKind::MultipleChoice { .. }
        | TaskKind::EdgeProbing { .. }
        | TaskKind::SpanClassification { .. }
        | TaskKind::Diagnostic { .. } => TaskMetric::Accuracy(CategoricalAccuracy::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskOverrides;
    use crate::task::GenerationVariant;

    fn roster() -> Vec<TaskDescriptor> {
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
            TaskDescriptor::new("ccg", TaskKind::Tagging { n_tags: 10 }),
            TaskDescriptor::new("copa", TaskKind::MultipleChoice { n_choices: 2 }),
            TaskDescriptor::new(
                "spr1",
                TaskKind::EdgeProbing {
                    n_labels: 4,
                    n_spans: 2,
                },
            ),
            TaskDescriptor::new(
                "wsc",
                TaskKind::SpanClassification {
                    n_classes: 2,
                    n_spans: 2,
                },
            ),
            TaskDescriptor::new("multirc", TaskKind::ReadingComprehension),
            TaskDescriptor::new(
                "wmt",
                TaskKind::SequenceGeneration {
                    variant: GenerationVariant::Translation,
                    target_namespace: "tokens".to_string(),
                },
            ),
        ]
    }

    #[test]
    fn test_every_kind_gets_the_right_module() {
        let cfg = ModelConfig::tiny();
        let vocab = Vocab::with_n_words(16);
        let built = build_task_modules(&cfg, &roster(), 16, 16, &vocab).unwrap();
        assert!(matches!(built.modules["sst2"], TaskModule::SingleCls(_)));
        assert!(matches!(built.modules["mnli"], TaskModule::PairCls(_)));
        assert!(matches!(built.modules["sts-b"], TaskModule::PairCls(_)));
        assert!(matches!(built.modules["ccg"], TaskModule::Tagger(_)));
        assert!(matches!(built.modules["copa"], TaskModule::MultipleChoice(_)));
        assert!(matches!(built.modules["spr1"], TaskModule::EdgeCls(_)));
        assert!(matches!(built.modules["wsc"], TaskModule::SpanCls(_)));
        assert!(matches!(built.modules["multirc"], TaskModule::ReadingComp(_)));
        assert!(matches!(built.modules["wmt"], TaskModule::Decoder(_)));
        assert_eq!(built.params.len(), built.modules.len());
    }

    #[test]
    fn test_metric_kinds_follow_task_kinds() {
        let cfg = ModelConfig::tiny();
        let vocab = Vocab::with_n_words(16);
        let built = build_task_modules(&cfg, &roster(), 16, 16, &vocab).unwrap();
        assert!(matches!(built.metrics["sst2"], TaskMetric::Accuracy(_)));
        assert!(matches!(built.metrics["sts-b"], TaskMetric::Mse(_)));
        assert!(matches!(built.metrics["wmt"], TaskMetric::AvgLoss(_)));
        assert!(matches!(built.metrics["multirc"], TaskMetric::Indexed(_)));
    }

    #[test]
    fn test_aliased_task_builds_no_module() {
        let mut cfg = ModelConfig::tiny();
        cfg.task_overrides.insert(
            "mnli-diagnostic".to_string(),
            TaskOverrides {
                use_classifier: Some("mnli".to_string()),
                ..TaskOverrides::default()
            },
        );
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
        let vocab = Vocab::with_n_words(16);
        let built = build_task_modules(&cfg, &tasks, 16, 16, &vocab).unwrap();
        assert!(built.modules.contains_key("mnli"));
        assert!(!built.modules.contains_key("mnli-diagnostic"));
        // Parameters and metrics still exist for the aliased task.
        assert_eq!(built.params["mnli-diagnostic"].use_classifier, "mnli");
        assert!(built.metrics.contains_key("mnli-diagnostic"));
    }

    #[test]
    fn test_shared_pair_attn_is_one_instance() {
        let mut cfg = ModelConfig::tiny();
        cfg.pair_attn = true;
        cfg.shared_pair_attn = true;
        let tasks = vec![
            TaskDescriptor::new(
                "mnli",
                TaskKind::PairClassification {
                    n_classes: 3,
                    word_in_context: false,
                },
            ),
            TaskDescriptor::new(
                "rte",
                TaskKind::PairClassification {
                    n_classes: 2,
                    word_in_context: false,
                },
            ),
        ];
        let vocab = Vocab::with_n_words(16);
        let built = build_task_modules(&cfg, &tasks, 16, 16, &vocab).unwrap();
        let attn_of = |name: &str| match &built.modules[name] {
            TaskModule::PairCls(m) => m.attn.clone().expect("pair attention enabled"),
            _ => panic!("expected pair module"),
        };
        assert!(Rc::ptr_eq(&attn_of("mnli"), &attn_of("rte")));
    }

    #[test]
    fn test_unshared_pair_attn_is_per_task() {
        let mut cfg = ModelConfig::tiny();
        cfg.pair_attn = true;
        cfg.shared_pair_attn = false;
        let tasks = vec![
            TaskDescriptor::new(
                "mnli",
                TaskKind::PairClassification {
                    n_classes: 3,
                    word_in_context: false,
                },
            ),
            TaskDescriptor::new(
                "rte",
                TaskKind::PairClassification {
                    n_classes: 2,
                    word_in_context: false,
                },
            ),
        ];
        let vocab = Vocab::with_n_words(16);
        let built = build_task_modules(&cfg, &tasks, 16, 16, &vocab).unwrap();
        let attn_of = |name: &str| match &built.modules[name] {
            TaskModule::PairCls(m) => m.attn.clone().expect("pair attention enabled"),
            _ => panic!("expected pair module"),
        };
        assert!(!Rc::ptr_eq(&attn_of("mnli"), &attn_of("rte")));
    }

    #[test]
    fn test_unknown_classifier_type_propagates() {
        let mut cfg = ModelConfig::tiny();
        cfg.classifier = "svm".to_string();
        let vocab = Vocab::with_n_words(16);
        let err = build_task_modules(
            &cfg,
            &[TaskDescriptor::new(
                "sst2",
                TaskKind::SingleClassification { n_classes: 2 },
            )],
            16,
            16,
            &vocab,
        )
        .unwrap_err();
        assert!(matches!(err, crate::error::ModelError::UnknownClassifierType(_)));
    }
}
