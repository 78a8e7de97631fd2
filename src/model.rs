//! Multi-task dispatch model
//!
//! Owns the shared sentence encoder and the per-task heads, parameters and
//! metric accumulators, all keyed by task name in explicit maps. `forward`
//! matches exhaustively on the task kind and routes the batch to the right
//! routine; classifier reuse is a single-step name indirection through the
//! resolved `use_classifier`. Whenever a batch carries labels, the task's
//! metric accumulator is updated as a side effect.

use std::collections::HashMap;
use std::rc::Rc;

use ndarray::{concatenate, s, Array1, Array2, Array3, Axis};
use tracing::info;

use crate::batch::Batch;
use crate::config::ModelConfig;
use crate::embed::build_embeddings;
use crate::encoder::{build_sent_encoder, SharedEncoder};
use crate::error::Result;
use crate::factory::{build_task_modules, TaskModules};
use crate::heads::{AttnPairEncoder, EdgeLoss, TaskModule};
use crate::metrics::{argmax, TaskMetric};
use crate::params::TaskParams;
use crate::task::{TaskDescriptor, TaskKind};
use crate::vocab::Vocab;

/// Predictions requested with `predict = true`
#[derive(Debug, Clone)]
pub enum Predictions {
    /// Argmax class indices, one per example
    Classes(Array1<usize>),
    /// Continuous scores (regression)
    Scores(Array1<f32>),
}

/// Result of one dispatched forward pass
#[derive(Debug, Clone, Default)]
pub struct TaskOutput {
    /// Examples contributing to the loss; LM tasks count non-pad target
    /// positions (both directions for a bidirectional LM).
    pub n_exs: usize,
    /// Flattened logits, when the routine produces any
    pub logits: Option<Array2<f32>>,
    /// Present when the batch carried labels
    pub loss: Option<f32>,
    pub preds: Option<Predictions>,
}

/// The assembled model: shared encoder plus per-task everything
#[derive(Debug)]
pub struct MultiTaskModel {
    encoder: SharedEncoder,
    vocab: Vocab,
    joint_encoder: bool,
    task_params: HashMap<String, TaskParams>,
    modules: HashMap<String, TaskModule>,
    metrics: HashMap<String, TaskMetric>,
}

/// Assemble the full model: embeddings, shared encoder, per-task heads.
pub fn build_model(
    cfg: &ModelConfig,
    vocab: &Vocab,
    pretrained: Option<Array2<f32>>,
    tasks: &[TaskDescriptor],
) -> Result<MultiTaskModel> {
    let assembly = build_embeddings(cfg, vocab, tasks, pretrained)?;
    let d_emb = assembly.d_emb;
    let (encoder, d_sent) = build_sent_encoder(cfg, d_emb, tasks, assembly)?;
    let d_task_input = d_sent + if cfg.skip_embs { d_emb } else { 0 };
    let TaskModules {
        params,
        modules,
        metrics,
    } = build_task_modules(cfg, tasks, d_task_input, d_emb, vocab)?;

    let model = MultiTaskModel {
        encoder,
        vocab: vocab.clone(),
        joint_encoder: cfg.joint_encoder,
        task_params: params,
        modules,
        metrics,
    };
    info!(
        n_tasks = tasks.len(),
        d_task_input,
        total_params = model.param_count(),
        "assembled multi-task model"
    );
    Ok(model)
}

impl MultiTaskModel {
    /// The classifier module serving a task, following the task's
    /// `use_classifier` alias one step.
    fn classifier_for(&self, task_name: &str) -> (&TaskModule, &str) {
        let params = self
            .task_params
            .get(task_name)
            .unwrap_or_else(|| panic!("unknown task `{task_name}`"));
        let cls_name = params.use_classifier.as_str();
        let module = self
            .modules
            .get(cls_name)
            .unwrap_or_else(|| panic!("no module built for classifier `{cls_name}`"));
        (module, cls_name)
    }

    pub fn metric(&self, task_name: &str) -> Option<&TaskMetric> {
        self.metrics.get(task_name)
    }

    pub fn reset_metrics(&mut self) {
        for metric in self.metrics.values_mut() {
            metric.reset();
        }
    }

    pub fn param_count(&self) -> usize {
        let mut total = self.encoder.param_count();
        let mut seen: Vec<*const AttnPairEncoder> = Vec::new();
        for module in self.modules.values() {
            total += module.param_count();
            // The shared pair-attention instance counts once.
            if let TaskModule::PairCls(pair) = module {
                if let Some(attn) = &pair.attn {
                    let ptr = Rc::as_ptr(attn);
                    if !seen.contains(&ptr) {
                        seen.push(ptr);
                        total += attn.param_count();
                    }
                }
            }
        }
        total
    }

    /// Dispatch one batch to the task's forward routine.
    pub fn forward(&mut self, task: &TaskDescriptor, batch: &Batch, predict: bool) -> TaskOutput {
        match &task.kind {
            TaskKind::SingleClassification { .. } => {
                self.single_sentence_forward(task, batch, predict)
            }
            TaskKind::PairClassification { word_in_context, .. } => {
                self.pair_sentence_forward(task, batch, *word_in_context, false, predict)
            }
            TaskKind::PairRegression | TaskKind::PairOrdinalRegression => {
                self.pair_sentence_forward(task, batch, false, true, predict)
            }
            TaskKind::Tagging { .. } => self.tagger_forward(task, batch, predict),
            TaskKind::MultipleChoice { n_choices } => {
                self.mc_forward(task, batch, *n_choices, predict)
            }
            TaskKind::EdgeProbing { .. } => self.edge_forward(task, batch),
            TaskKind::SpanClassification { .. } => self.span_forward(task, batch, predict),
            TaskKind::LanguageModeling => {
                if self.encoder.is_left_to_right_only() {
                    self.lm_only_lr_forward(task, batch)
                } else {
                    self.lm_forward(task, batch)
                }
            }
            TaskKind::LanguageModelingParsing => self.lm_only_lr_forward(task, batch),
            TaskKind::SequenceGeneration { .. } => self.seq_gen_forward(task, batch),
            TaskKind::ReadingComprehension => self.rc_forward(task, batch, predict),
            TaskKind::Diagnostic { .. } => {
                self.pair_sentence_forward(task, batch, false, false, predict)
            }
        }
    }

    fn single_sentence_forward(
        &mut self,
        task: &TaskDescriptor,
        batch: &Batch,
        predict: bool,
    ) -> TaskOutput {
        let tokens = batch.field("input1", &batch.input1);
        let logits = {
            let (module, cls_name) = self.classifier_for(&task.name);
            let (sent, mask) = self.encoder.forward(tokens, cls_name);
            match module {
                TaskModule::SingleCls(head) => head.forward(&sent, &mask),
                _ => panic!("task `{}` bound to a non-classification module", task.name),
            }
        };
        let mut out = TaskOutput {
            n_exs: batch.n_exs(),
            ..TaskOutput::default()
        };
        if let Some(labels) = &batch.labels {
            let targets = labels.class_indices();
            out.loss = Some(cross_entropy(&logits, &targets, None));
            self.update_accuracy_masked(&task.name, &logits, &targets, batch.tagmask.as_ref());
        }
        if predict {
            out.preds = Some(Predictions::Classes(argmax_rows(&logits)));
        }
        out.logits = Some(logits);
        out
    }

    fn pair_sentence_forward(
        &mut self,
        task: &TaskDescriptor,
        batch: &Batch,
        word_in_context: bool,
        regression: bool,
        predict: bool,
    ) -> TaskOutput {
        let logits = if self.joint_encoder {
            let tokens = batch.field("inputs", &batch.inputs);
            let (module, cls_name) = self.classifier_for(&task.name);
            let (sent, mask) = self.encoder.forward(tokens, cls_name);
            let head = match module {
                TaskModule::SingleCls(head) => head,
                _ => panic!("task `{}` bound to a non-classification module", task.name),
            };
            if word_in_context {
                let idx1 = batch.idx1.as_ref().expect("batch missing required field `idx1`");
                let idx2 = batch.idx2.as_ref().expect("batch missing required field `idx2`");
                head.forward_with_indices(&sent, &mask, &[idx1, idx2])
            } else {
                head.forward(&sent, &mask)
            }
        } else {
            let t1 = batch.field("input1", &batch.input1);
            let t2 = batch.field("input2", &batch.input2);
            let (module, cls_name) = self.classifier_for(&task.name);
            let (s1, m1) = self.encoder.forward(t1, cls_name);
            let (s2, m2) = self.encoder.forward(t2, cls_name);
            let head = match module {
                TaskModule::PairCls(head) => head,
                _ => panic!("task `{}` bound to a non-pair module", task.name),
            };
            let (idx1, idx2) = if word_in_context {
                (batch.idx1.as_ref(), batch.idx2.as_ref())
            } else {
                (None, None)
            };
            head.forward(&s1, &s2, &m1, &m2, idx1, idx2)
        };

        let mut out = TaskOutput {
            n_exs: batch.n_exs(),
            ..TaskOutput::default()
        };
        if regression {
            assert_eq!(
                logits.ncols(),
                1,
                "regression head must produce a single score column"
            );
            let scores = logits.column(0).to_owned();
            if let Some(labels) = &batch.labels {
                let targets = labels.squeeze();
                out.loss = Some(mse(&scores, &targets));
                self.update_mse(&task.name, &scores, &targets);
            }
            if predict {
                out.preds = Some(Predictions::Scores(scores));
            }
        } else {
            if let Some(labels) = &batch.labels {
                let targets = labels.class_indices();
                out.loss = Some(cross_entropy(&logits, &targets, None));
                self.update_accuracy_masked(&task.name, &logits, &targets, batch.tagmask.as_ref());
            }
            if predict {
                out.preds = Some(Predictions::Classes(argmax_rows(&logits)));
            }
        }
        out.logits = Some(logits);
        out
    }

    fn tagger_forward(&mut self, task: &TaskDescriptor, batch: &Batch, predict: bool) -> TaskOutput {
        assert!(
            !self.encoder.is_bilm(),
            "tagging is not supported over the bidirectional LM encoder"
        );
        let tokens = batch.field("input1", &batch.input1);
        let (b, l) = (tokens.batch_size(), tokens.seq_len());
        assert!(l >= 2, "tagging input must include boundary tokens");
        let inner = l - 2;

        let logits = {
            let (module, cls_name) = self.classifier_for(&task.name);
            let (sent, _mask) = self.encoder.forward(tokens, cls_name);
            let tagger = match module {
                TaskModule::Tagger(m) => m,
                _ => panic!("task `{}` bound to a non-tagging module", task.name),
            };
            // Strip the boundary tokens added around every sentence.
            let stripped = sent.slice(s![.., 1..l - 1, ..]).to_owned();
            let tag_logits = tagger.forward(&stripped);
            let n_tags = tag_logits.dim().2;
            tag_logits.into_shape((b * inner, n_tags)).unwrap()
        };

        let mut out = TaskOutput {
            n_exs: batch.n_exs(),
            ..TaskOutput::default()
        };
        if let Some(targs) = &batch.targs {
            assert_eq!(
                targs.dim(),
                (b, inner),
                "tag targets must cover the boundary-stripped positions"
            );
            let flat_targs: Array1<usize> = targs.iter().copied().collect();
            let (kept_logits, kept_targs) = match &batch.keep_mask {
                Some(keep) => {
                    assert_eq!(keep.dim(), (b, inner), "keep mask shape mismatch");
                    let keep_flat: Vec<bool> = keep.iter().map(|&k| k != 0).collect();
                    filter_rows(&logits, &flat_targs, &keep_flat)
                }
                None => (logits.clone(), flat_targs),
            };
            let pad = self.vocab.padding_index();
            out.loss = Some(cross_entropy(&kept_logits, &kept_targs, Some(pad)));
            self.update_accuracy(&task.name, &kept_logits, &kept_targs);
        }
        if predict {
            out.preds = Some(Predictions::Classes(argmax_rows(&logits)));
        }
        out.logits = Some(logits);
        out
    }

    /// Bidirectional LM: split the encoder output into its direction halves,
    /// append the skip-connected features to both, and score each half
    /// against its direction's targets through the shared vocab projection.
    fn lm_forward(&mut self, task: &TaskDescriptor, batch: &Batch) -> TaskOutput {
        assert!(
            self.encoder.is_bilm(),
            "language modeling requires the bidirectional LM encoder"
        );
        let tokens = batch.field("input1", &batch.input1);
        let split = self.encoder.bilm_split_dim();
        let pad = self.vocab.padding_index();

        let (logits, loss, n_exs) = {
            let (module, cls_name) = self.classifier_for(&task.name);
            let (sent, _mask) = self.encoder.forward(tokens, cls_name);
            let head = match module {
                TaskModule::Lm(m) => m,
                _ => panic!("task `{}` bound to a non-LM module", task.name),
            };
            let d_total = sent.dim().2;
            let half_f = sent.slice(s![.., .., 0..split]);
            let half_b = sent.slice(s![.., .., split..2 * split]);
            let (fwd, bwd) = if d_total > 2 * split {
                let skip = sent.slice(s![.., .., 2 * split..]);
                (
                    concatenate(Axis(2), &[half_f, skip]).unwrap(),
                    concatenate(Axis(2), &[half_b, skip]).unwrap(),
                )
            } else {
                (half_f.to_owned(), half_b.to_owned())
            };
            let logits_f = flatten_positions(&head.forward(&fwd));
            let logits_b = flatten_positions(&head.forward(&bwd));

            let targs_f = batch.targs.as_ref().expect("batch missing required field `targs`");
            let targs_b = batch
                .targs_b
                .as_ref()
                .expect("batch missing required field `targs_b`");
            let flat_f: Array1<usize> = targs_f.iter().copied().collect();
            let flat_b: Array1<usize> = targs_b.iter().copied().collect();
            let logits = concatenate(Axis(0), &[logits_f.view(), logits_b.view()]).unwrap();
            let targets = concatenate(Axis(0), &[flat_f.view(), flat_b.view()]).unwrap();
            let loss = cross_entropy(&logits, &targets, Some(pad));
            let non_pad = flat_f.iter().filter(|&&t| t != pad).count();
            (logits, loss, non_pad * 2)
        };

        self.update_avg_loss(&task.name, loss);
        TaskOutput {
            n_exs,
            logits: Some(logits),
            loss: Some(loss),
            preds: None,
        }
    }

    /// Left-to-right-only LM (ordered-neurons / parse-inducing encoders):
    /// the full encoder output scores the forward targets.
    fn lm_only_lr_forward(&mut self, task: &TaskDescriptor, batch: &Batch) -> TaskOutput {
        let tokens = batch.field("input1", &batch.input1);
        let pad = self.vocab.padding_index();

        let (logits, loss, n_exs) = {
            let (module, cls_name) = self.classifier_for(&task.name);
            let (sent, _mask) = self.encoder.forward(tokens, cls_name);
            let head = match module {
                TaskModule::Lm(m) => m,
                _ => panic!("task `{}` bound to a non-LM module", task.name),
            };
            let logits = flatten_positions(&head.forward(&sent));
            let targs = batch.targs.as_ref().expect("batch missing required field `targs`");
            let targets: Array1<usize> = targs.iter().copied().collect();
            let loss = cross_entropy(&logits, &targets, Some(pad));
            let non_pad = targets.iter().filter(|&&t| t != pad).count();
            (logits, loss, non_pad)
        };

        self.update_avg_loss(&task.name, loss);
        TaskOutput {
            n_exs,
            logits: Some(logits),
            loss: Some(loss),
            preds: None,
        }
    }

    fn mc_forward(
        &mut self,
        task: &TaskDescriptor,
        batch: &Batch,
        n_choices: usize,
        predict: bool,
    ) -> TaskOutput {
        assert_eq!(
            batch.choices.len(),
            n_choices,
            "batch supplies {} choices, task expects {n_choices}",
            batch.choices.len()
        );
        let logits = {
            let (module, cls_name) = self.classifier_for(&task.name);
            let head = match module {
                TaskModule::MultipleChoice(m) => m,
                _ => panic!("task `{}` bound to a non-choice module", task.name),
            };
            let mut columns: Vec<Array2<f32>> = Vec::with_capacity(n_choices);
            if self.joint_encoder {
                // Each choice field already contains question + choice.
                for choice in &batch.choices {
                    let (sent, mask) = self.encoder.forward(choice, cls_name);
                    let emb = head.pooler.forward(&sent, &mask);
                    columns.push(head.choice2scalar.forward2(&emb));
                }
            } else {
                // Question and choice token representations are joined along
                // the sequence axis and pooled as one sequence.
                let question = batch.field("question", &batch.question);
                let (q_sent, q_mask) = self.encoder.forward(question, cls_name);
                for choice in &batch.choices {
                    let (c_sent, c_mask) = self.encoder.forward(choice, cls_name);
                    let sent = concatenate(Axis(1), &[q_sent.view(), c_sent.view()]).unwrap();
                    let mask = concatenate(Axis(1), &[q_mask.view(), c_mask.view()]).unwrap();
                    let emb = head.pooler.forward(&sent, &mask);
                    columns.push(head.choice2scalar.forward2(&emb));
                }
            }
            let views: Vec<_> = columns.iter().map(Array2::view).collect();
            concatenate(Axis(1), &views).unwrap()
        };

        let mut out = TaskOutput {
            n_exs: batch.n_exs(),
            ..TaskOutput::default()
        };
        if let Some(labels) = &batch.labels {
            let targets = labels.class_indices();
            out.loss = Some(cross_entropy(&logits, &targets, None));
            self.update_accuracy(&task.name, &logits, &targets);
        }
        if predict {
            out.preds = Some(Predictions::Classes(argmax_rows(&logits)));
        }
        out.logits = Some(logits);
        out
    }

    fn rc_forward(&mut self, task: &TaskDescriptor, batch: &Batch, predict: bool) -> TaskOutput {
        let logits = {
            let (module, cls_name) = self.classifier_for(&task.name);
            let head = match module {
                TaskModule::ReadingComp(m) => m,
                _ => panic!("task `{}` bound to a non-RC module", task.name),
            };
            if self.joint_encoder {
                let tokens = batch.field("para_quest_ans", &batch.para_quest_ans);
                let (sent, mask) = self.encoder.forward(tokens, cls_name);
                let emb = head.pooler.forward(&sent, &mask);
                head.classifier.forward2(&emb)
            } else {
                // Paragraph, question and answer token representations are
                // joined along the sequence axis and pooled as one sequence.
                let para = batch.field("paragraph", &batch.paragraph);
                let quest = batch.field("question", &batch.question);
                let ans = batch.field("answer", &batch.answer);
                let (p_sent, p_mask) = self.encoder.forward(para, cls_name);
                let (q_sent, q_mask) = self.encoder.forward(quest, cls_name);
                let (a_sent, a_mask) = self.encoder.forward(ans, cls_name);
                let sent =
                    concatenate(Axis(1), &[p_sent.view(), q_sent.view(), a_sent.view()]).unwrap();
                let mask =
                    concatenate(Axis(1), &[p_mask.view(), q_mask.view(), a_mask.view()]).unwrap();
                let emb = head.pooler.forward(&sent, &mask);
                head.classifier.forward2(&emb)
            }
        };

        let mut out = TaskOutput {
            n_exs: batch.n_exs(),
            ..TaskOutput::default()
        };
        if let Some(labels) = &batch.labels {
            let targets = labels.class_indices();
            out.loss = Some(cross_entropy(&logits, &targets, None));
            let par = batch
                .par_idx
                .as_ref()
                .expect("batch missing required field `par_idx`");
            let qst = batch
                .qst_idx
                .as_ref()
                .expect("batch missing required field `qst_idx`");
            let idxs: Vec<(usize, usize)> =
                par.iter().copied().zip(qst.iter().copied()).collect();
            self.update_indexed(&task.name, &logits, &targets, &idxs);
        }
        if predict {
            out.preds = Some(Predictions::Classes(argmax_rows(&logits)));
        }
        out.logits = Some(logits);
        out
    }

    fn span_forward(&mut self, task: &TaskDescriptor, batch: &Batch, predict: bool) -> TaskOutput {
        let tokens = batch.field("input1", &batch.input1);
        let spans = batch
            .spans1
            .as_ref()
            .expect("batch missing required field `spans1`");
        let logits = {
            let (module, cls_name) = self.classifier_for(&task.name);
            let (sent, _mask) = self.encoder.forward(tokens, cls_name);
            match module {
                TaskModule::SpanCls(head) => head.forward(&sent, spans),
                _ => panic!("task `{}` bound to a non-span module", task.name),
            }
        };

        let mut out = TaskOutput {
            n_exs: batch.n_exs(),
            ..TaskOutput::default()
        };
        if let Some(labels) = &batch.labels {
            let targets = labels.class_indices();
            out.loss = Some(cross_entropy(&logits, &targets, None));
            self.update_accuracy(&task.name, &logits, &targets);
        }
        if predict {
            out.preds = Some(Predictions::Classes(argmax_rows(&logits)));
        }
        out.logits = Some(logits);
        out
    }

    fn edge_forward(&mut self, task: &TaskDescriptor, batch: &Batch) -> TaskOutput {
        let tokens = batch.field("input1", &batch.input1);
        let spans1 = batch
            .spans1
            .as_ref()
            .expect("batch missing required field `spans1`");
        let spans2 = batch
            .spans2
            .as_ref()
            .expect("batch missing required field `spans2`");
        let (logits, loss_kind) = {
            let (module, cls_name) = self.classifier_for(&task.name);
            let (sent, _mask) = self.encoder.forward(tokens, cls_name);
            match module {
                TaskModule::EdgeCls(head) => (head.forward(&sent, spans1, spans2), head.loss),
                _ => panic!("task `{}` bound to a non-edge module", task.name),
            }
        };

        let mut out = TaskOutput {
            n_exs: logits.nrows(),
            ..TaskOutput::default()
        };
        if let Some(span_labels) = &batch.span_labels {
            assert_eq!(
                span_labels.nrows(),
                logits.nrows(),
                "one label row per span pair"
            );
            let loss = match loss_kind {
                EdgeLoss::Sigmoid => bce_with_logits(&logits, span_labels),
                EdgeLoss::Softmax => {
                    let targets = argmax_rows(span_labels);
                    cross_entropy(&logits, &targets, None)
                }
            };
            out.loss = Some(loss);
            let targets = argmax_rows(span_labels);
            self.update_accuracy(&task.name, &logits, &targets);
        }
        out.logits = Some(logits);
        out
    }

    fn seq_gen_forward(&mut self, task: &TaskDescriptor, batch: &Batch) -> TaskOutput {
        let tokens = batch.field("input1", &batch.input1);
        let pad = self.vocab.padding_index();
        let (logits, loss) = {
            let (module, cls_name) = self.classifier_for(&task.name);
            let (sent, mask) = self.encoder.forward(tokens, cls_name);
            let decoder = match module {
                TaskModule::Decoder(m) => m,
                _ => panic!("task `{}` bound to a non-decoder module", task.name),
            };
            let targs = batch.targs.as_ref().expect("batch missing required field `targs`");
            let logits = flatten_positions(&decoder.forward(&sent, &mask, targs));
            let targets: Array1<usize> = targs.iter().copied().collect();
            let loss = cross_entropy(&logits, &targets, Some(pad));
            (logits, loss)
        };

        self.update_avg_loss(&task.name, loss);
        TaskOutput {
            n_exs: batch.n_exs(),
            logits: Some(logits),
            loss: Some(loss),
            preds: None,
        }
    }

    /// Accuracy update honoring an optional per-example tag mask: masked-out
    /// examples contribute to the loss but not to the metric.
    fn update_accuracy_masked(
        &mut self,
        task_name: &str,
        logits: &Array2<f32>,
        targets: &Array1<usize>,
        tagmask: Option<&Array1<u8>>,
    ) {
        match tagmask {
            Some(mask) => {
                let keep: Vec<bool> = mask.iter().map(|&m| m != 0).collect();
                let (kept_logits, kept_targets) = filter_rows(logits, targets, &keep);
                self.update_accuracy(task_name, &kept_logits, &kept_targets);
            }
            None => self.update_accuracy(task_name, logits, targets),
        }
    }

    fn update_accuracy(&mut self, task_name: &str, logits: &Array2<f32>, targets: &Array1<usize>) {
        match self.metrics.get_mut(task_name) {
            Some(TaskMetric::Accuracy(m)) => m.update(logits, targets),
            Some(_) => panic!("metric kind mismatch for task `{task_name}`"),
            None => panic!("no metric registered for task `{task_name}`"),
        }
    }

    fn update_mse(&mut self, task_name: &str, scores: &Array1<f32>, targets: &Array1<f32>) {
        match self.metrics.get_mut(task_name) {
            Some(TaskMetric::Mse(m)) => m.update(scores, targets),
            Some(_) => panic!("metric kind mismatch for task `{task_name}`"),
            None => panic!("no metric registered for task `{task_name}`"),
        }
    }

    fn update_avg_loss(&mut self, task_name: &str, loss: f32) {
        match self.metrics.get_mut(task_name) {
            Some(TaskMetric::AvgLoss(m)) => m.update(loss),
            Some(_) => panic!("metric kind mismatch for task `{task_name}`"),
            None => panic!("no metric registered for task `{task_name}`"),
        }
    }

    fn update_indexed(
        &mut self,
        task_name: &str,
        logits: &Array2<f32>,
        targets: &Array1<usize>,
        idxs: &[(usize, usize)],
    ) {
        match self.metrics.get_mut(task_name) {
            Some(TaskMetric::Indexed(m)) => m.update(logits, targets, idxs),
            Some(_) => panic!("metric kind mismatch for task `{task_name}`"),
            None => panic!("no metric registered for task `{task_name}`"),
        }
    }
}

/// Mean cross entropy over rows, skipping rows whose target equals
/// `ignore_index`. Rows are raw logits; the log-sum-exp is computed stably.
fn cross_entropy(
    logits: &Array2<f32>,
    targets: &Array1<usize>,
    ignore_index: Option<usize>,
) -> f32 {
    assert_eq!(
        logits.nrows(),
        targets.len(),
        "logits and targets must agree on example count"
    );
    let mut total = 0.0_f64;
    let mut count = 0usize;
    for (row, &target) in logits.rows().into_iter().zip(targets.iter()) {
        if ignore_index == Some(target) {
            continue;
        }
        assert!(
            target < row.len(),
            "target class {target} out of range ({} classes)",
            row.len()
        );
        let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let lse = max + row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
        total += f64::from(lse - row[target]);
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        (total / count as f64) as f32
    }
}

fn mse(scores: &Array1<f32>, targets: &Array1<f32>) -> f32 {
    assert_eq!(
        scores.len(),
        targets.len(),
        "scores and targets must agree on example count"
    );
    if scores.is_empty() {
        return 0.0;
    }
    let sum: f64 = scores
        .iter()
        .zip(targets.iter())
        .map(|(&s, &t)| f64::from((s - t) * (s - t)))
        .sum();
    (sum / scores.len() as f64) as f32
}

/// Multi-label binary cross entropy on raw logits, averaged over all entries.
fn bce_with_logits(logits: &Array2<f32>, targets: &Array2<f32>) -> f32 {
    assert_eq!(logits.dim(), targets.dim(), "logit/label shape mismatch");
    let mut total = 0.0_f64;
    for (&x, &y) in logits.iter().zip(targets.iter()) {
        // max(x, 0) - x*y + ln(1 + exp(-|x|)), the stable formulation.
        let v = x.max(0.0) - x * y + (-x.abs()).exp().ln_1p();
        total += f64::from(v);
    }
    (total / logits.len() as f64) as f32
}

fn flatten_positions(logits: &Array3<f32>) -> Array2<f32> {
    let (b, l, d) = logits.dim();
    logits.to_owned().into_shape((b * l, d)).unwrap()
}

fn argmax_rows(logits: &Array2<f32>) -> Array1<usize> {
    logits
        .rows()
        .into_iter()
        .map(|row| argmax(row.iter().copied()))
        .collect()
}

fn filter_rows(
    logits: &Array2<f32>,
    targets: &Array1<usize>,
    keep: &[bool],
) -> (Array2<f32>, Array1<usize>) {
    assert_eq!(logits.nrows(), keep.len(), "keep mask length mismatch");
    let kept: Vec<usize> = keep
        .iter()
        .enumerate()
        .filter_map(|(i, &k)| k.then_some(i))
        .collect();
    let mut out_logits = Array2::zeros((kept.len(), logits.ncols()));
    let mut out_targets = Array1::zeros(kept.len());
    for (row, &src) in kept.iter().enumerate() {
        out_logits.row_mut(row).assign(&logits.row(src));
        out_targets[row] = targets[src];
    }
    (out_logits, out_targets)
}
