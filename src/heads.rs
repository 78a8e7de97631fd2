//! Task-head building blocks
//!
//! Poolers, classifiers and the per-kind head modules the factory wires
//! together. The pair classifier implements the four-way feature scheme
//! `[r1, r2, |r1 - r2|, r1 * r2]`; the cross-attention pair encoder is held
//! behind an `Rc` so one instance can be shared by every pair task that opts
//! in.

use std::rc::Rc;

use ndarray::{concatenate, s, Array1, Array2, Array3, ArrayView2, Axis};

use crate::batch::Span;
use crate::error::{ModelError, Result};
use crate::nn::{dot_attention, sin_init, softmax1, BiRnn, Linear, Rnn};
use crate::params::TaskParams;

/// Sentence-representation pooling strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Feature-wise max over valid positions
    Max,
    /// First-token representation (joint single-sequence encodings)
    First,
}

/// Pools a `(batch, seq, d)` representation down to `(batch, d_out)`,
/// optionally projecting first.
#[derive(Debug, Clone)]
pub struct Pooler {
    proj: Option<Linear>,
    kind: PoolKind,
    d_out: usize,
}

impl Pooler {
    pub fn new(d_inp: usize, d_proj: usize, project: bool, kind: PoolKind, seed: f32) -> Self {
        let proj = project.then(|| Linear::new(d_inp, d_proj, seed));
        Self {
            proj,
            kind,
            d_out: if project { d_proj } else { d_inp },
        }
    }

    pub fn d_out(&self) -> usize {
        self.d_out
    }

    pub fn forward(&self, sent: &Array3<f32>, mask: &Array2<f32>) -> Array2<f32> {
        let projected = match &self.proj {
            Some(p) => p.forward3(sent),
            None => sent.clone(),
        };
        let (b, l, d) = projected.dim();
        let mut out = Array2::zeros((b, d));
        match self.kind {
            PoolKind::First => {
                for i in 0..b {
                    out.row_mut(i)
                        .assign(&projected.index_axis(Axis(0), i).row(0));
                }
            }
            PoolKind::Max => {
                for i in 0..b {
                    let frame = projected.index_axis(Axis(0), i);
                    let mut best = Array1::from_elem(d, f32::NEG_INFINITY);
                    let mut any = false;
                    for t in 0..l {
                        if mask[[i, t]] != 0.0 {
                            any = true;
                            best.zip_mut_with(&frame.row(t), |b, &v| *b = b.max(v));
                        }
                    }
                    if any {
                        out.row_mut(i).assign(&best);
                    }
                }
            }
        }
        out
    }

    pub fn param_count(&self) -> usize {
        self.proj.as_ref().map_or(0, Linear::param_count)
    }
}

/// Final classification layer: logistic regression or a one/two hidden layer
/// MLP depending on the configured classifier type.
#[derive(Debug, Clone)]
pub struct Classifier {
    layers: Vec<Linear>,
}

impl Classifier {
    /// Build from the resolved task parameters; unknown classifier types are
    /// a configuration error.
    pub fn from_params(d_inp: usize, n_classes: usize, params: &TaskParams, seed: f32) -> Result<Self> {
        let d_hid = params.d_hid;
        let layers = match params.cls_type.as_str() {
            "log_reg" => vec![Linear::new(d_inp, n_classes, seed)],
            "mlp" => vec![
                Linear::new(d_inp, d_hid, seed),
                Linear::new(d_hid, n_classes, seed * 1.3),
            ],
            "fancy_mlp" => vec![
                Linear::new(d_inp, d_hid, seed),
                Linear::new(d_hid, d_hid, seed * 1.3),
                Linear::new(d_hid, n_classes, seed * 1.7),
            ],
            other => return Err(ModelError::UnknownClassifierType(other.to_string())),
        };
        Ok(Self { layers })
    }

    pub fn n_classes(&self) -> usize {
        self.layers.last().map_or(0, Linear::d_out)
    }

    pub fn forward2(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut h = x.clone();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward2(&h);
            if i < last {
                h.mapv_inplace(f32::tanh);
            }
        }
        h
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(Linear::param_count).sum()
    }
}

/// Token representations gathered at one index per example: `(batch, d)`.
fn gather_tokens(sent: &Array3<f32>, idxs: &Array1<usize>) -> Array2<f32> {
    let (b, l, d) = sent.dim();
    assert_eq!(idxs.len(), b, "one token index per example");
    let mut out = Array2::zeros((b, d));
    for i in 0..b {
        let idx = idxs[i];
        assert!(idx < l, "token index {idx} out of range for length {l}");
        out.row_mut(i).assign(&sent.index_axis(Axis(0), i).row(idx));
    }
    out
}

/// Pool + classify one sentence representation
#[derive(Debug, Clone)]
pub struct SingleClassifier {
    pub pooler: Pooler,
    pub classifier: Classifier,
}

impl SingleClassifier {
    pub fn forward(&self, sent: &Array3<f32>, mask: &Array2<f32>) -> Array2<f32> {
        let emb = self.pooler.forward(sent, mask);
        self.classifier.forward2(&emb)
    }

    /// Pool, then append token representations gathered at the given indices
    /// before classifying (word-in-context under a joint encoder).
    pub fn forward_with_indices(
        &self,
        sent: &Array3<f32>,
        mask: &Array2<f32>,
        idxs: &[&Array1<usize>],
    ) -> Array2<f32> {
        let mut parts = vec![self.pooler.forward(sent, mask)];
        for idx in idxs {
            parts.push(gather_tokens(sent, idx));
        }
        let views: Vec<_> = parts.iter().map(Array2::view).collect();
        let emb = concatenate(Axis(1), &views).unwrap();
        self.classifier.forward2(&emb)
    }

    pub fn param_count(&self) -> usize {
        self.pooler.param_count() + self.classifier.param_count()
    }
}

/// Cross-attention pair encoder: each sequence attends over the other, the
/// concatenated `[rep, attended]` features run through a bidirectional
/// modeling recurrence. One instance may be shared by several tasks.
#[derive(Debug)]
pub struct AttnPairEncoder {
    modeling: BiRnn,
}

impl AttnPairEncoder {
    pub fn new(d_in: usize, d_hid_attn: usize, seed: f32) -> Self {
        Self {
            modeling: BiRnn::new(2 * d_in, d_hid_attn, seed),
        }
    }

    pub fn d_out(&self) -> usize {
        self.modeling.d_out()
    }

    pub fn forward(
        &self,
        s1: &Array3<f32>,
        s2: &Array3<f32>,
        mask1: &Array2<f32>,
        mask2: &Array2<f32>,
    ) -> (Array3<f32>, Array3<f32>) {
        (
            self.attend(s1, s2, mask2),
            self.attend(s2, s1, mask1),
        )
    }

    fn attend(&self, q: &Array3<f32>, kv: &Array3<f32>, kv_mask: &Array2<f32>) -> Array3<f32> {
        let (b, l, d) = q.dim();
        let mut combined = Array3::zeros((b, l, 2 * d));
        for i in 0..b {
            let q_frame = q.index_axis(Axis(0), i);
            let ctx = dot_attention(q_frame, kv.index_axis(Axis(0), i), kv_mask.row(i));
            let cat = concatenate(Axis(1), &[q_frame.view(), ctx.view()]).unwrap();
            combined.index_axis_mut(Axis(0), i).assign(&cat);
        }
        self.modeling.forward(&combined)
    }

    pub fn param_count(&self) -> usize {
        self.modeling.param_count()
    }
}

/// Pair head: pools both sides, classifies the four-way feature combination.
#[derive(Debug, Clone)]
pub struct PairClassifier {
    pub pooler: Pooler,
    pub classifier: Classifier,
    pub attn: Option<Rc<AttnPairEncoder>>,
}

impl PairClassifier {
    pub fn forward(
        &self,
        s1: &Array3<f32>,
        s2: &Array3<f32>,
        mask1: &Array2<f32>,
        mask2: &Array2<f32>,
        idx1: Option<&Array1<usize>>,
        idx2: Option<&Array1<usize>>,
    ) -> Array2<f32> {
        let (s1, s2) = match &self.attn {
            Some(attn) => attn.forward(s1, s2, mask1, mask2),
            None => (s1.clone(), s2.clone()),
        };
        let mut emb1 = self.pooler.forward(&s1, mask1);
        let mut emb2 = self.pooler.forward(&s2, mask2);
        if let Some(idx) = idx1 {
            let t = gather_tokens(&s1, idx);
            emb1 = concatenate(Axis(1), &[emb1.view(), t.view()]).unwrap();
        }
        if let Some(idx) = idx2 {
            let t = gather_tokens(&s2, idx);
            emb2 = concatenate(Axis(1), &[emb2.view(), t.view()]).unwrap();
        }
        let diff = (&emb1 - &emb2).mapv(f32::abs);
        let prod = &emb1 * &emb2;
        let pair = concatenate(
            Axis(1),
            &[emb1.view(), emb2.view(), diff.view(), prod.view()],
        )
        .unwrap();
        self.classifier.forward2(&pair)
    }

    pub fn param_count(&self) -> usize {
        // The shared attention instance is counted once by the model, not per
        // task.
        self.pooler.param_count() + self.classifier.param_count()
    }
}

/// Per-position tag projection
#[derive(Debug, Clone)]
pub struct Tagger {
    hid2tag: Linear,
}

impl Tagger {
    pub fn new(d_inp: usize, n_tags: usize, seed: f32) -> Self {
        Self {
            hid2tag: Linear::new(d_inp, n_tags, seed),
        }
    }

    pub fn forward(&self, sent: &Array3<f32>) -> Array3<f32> {
        self.hid2tag.forward3(sent)
    }

    pub fn param_count(&self) -> usize {
        self.hid2tag.param_count()
    }
}

/// Vocabulary projection for language modeling; one instance serves both
/// directions of a bidirectional LM.
#[derive(Debug, Clone)]
pub struct LmHead {
    hid2voc: Linear,
}

impl LmHead {
    pub fn new(d_inp: usize, n_vocab: usize, seed: f32) -> Self {
        Self {
            hid2voc: Linear::new(d_inp, n_vocab, seed),
        }
    }

    pub fn d_in(&self) -> usize {
        self.hid2voc.d_in()
    }

    pub fn forward(&self, hid: &Array3<f32>) -> Array3<f32> {
        self.hid2voc.forward3(hid)
    }

    pub fn param_count(&self) -> usize {
        self.hid2voc.param_count()
    }
}

/// Multiple-choice head: pools each joined question+choice sequence and
/// scores it with a choice-to-scalar layer.
#[derive(Debug, Clone)]
pub struct MultipleChoiceModule {
    pub pooler: Pooler,
    pub choice2scalar: Classifier,
}

impl MultipleChoiceModule {
    pub fn param_count(&self) -> usize {
        self.pooler.param_count() + self.choice2scalar.param_count()
    }
}

/// Reading-comprehension head: the paragraph, question and answer token
/// representations joined along the sequence axis, pooled once, and
/// classified as correct/incorrect.
#[derive(Debug, Clone)]
pub struct ReadingComprehensionModule {
    pub pooler: Pooler,
    pub classifier: Classifier,
}

impl ReadingComprehensionModule {
    pub fn param_count(&self) -> usize {
        self.pooler.param_count() + self.classifier.param_count()
    }
}

/// How span token representations collapse to one vector
#[derive(Debug, Clone)]
pub enum SpanPooling {
    Mean,
    Max,
    /// Learned-query attention over the span tokens
    Attn { query: Array1<f32> },
}

impl SpanPooling {
    pub fn parse(name: &str, d_inp: usize, seed: f32) -> Result<Self> {
        match name {
            "mean" => Ok(SpanPooling::Mean),
            "max" => Ok(SpanPooling::Max),
            "attn" => Ok(SpanPooling::Attn {
                query: sin_init(1, d_inp, seed).row(0).to_owned(),
            }),
            other => Err(ModelError::UnknownSpanPooling(other.to_string())),
        }
    }

    /// Pool one `[start, end)` span of a `(seq, d)` frame.
    pub fn pool(&self, frame: ArrayView2<f32>, span: Span) -> Array1<f32> {
        let (start, end) = span;
        assert!(
            start < end && end <= frame.nrows(),
            "span [{start}, {end}) out of range for length {}",
            frame.nrows()
        );
        let window = frame.slice(s![start..end, ..]);
        match self {
            SpanPooling::Mean => window.mean_axis(Axis(0)).unwrap(),
            SpanPooling::Max => {
                let mut best = Array1::from_elem(frame.ncols(), f32::NEG_INFINITY);
                for row in window.rows() {
                    best.zip_mut_with(&row, |b, &v| *b = b.max(v));
                }
                best
            }
            SpanPooling::Attn { query } => {
                let scores: Array1<f32> = window.rows().into_iter().map(|r| r.dot(query)).collect();
                let weights = softmax1(&scores);
                let mut out = Array1::zeros(frame.ncols());
                for (w, row) in weights.iter().zip(window.rows()) {
                    out = out + row.mapv(|v| v * w);
                }
                out
            }
        }
    }
}

/// Span classification: pools a fixed number of spans per example, projects
/// each and classifies the concatenation.
#[derive(Debug, Clone)]
pub struct SpanClassifierModule {
    pooling: SpanPooling,
    proj: Linear,
    classifier: Classifier,
    n_spans: usize,
}

impl SpanClassifierModule {
    pub fn new(
        d_inp: usize,
        n_classes: usize,
        n_spans: usize,
        params: &TaskParams,
        seed: f32,
    ) -> Result<Self> {
        let pooling = SpanPooling::parse(&params.cls_span_pooling, d_inp, seed * 0.7)?;
        let proj = Linear::new(d_inp, params.d_proj, seed);
        let classifier = Classifier::from_params(n_spans * params.d_proj, n_classes, params, seed * 1.9)?;
        Ok(Self {
            pooling,
            proj,
            classifier,
            n_spans,
        })
    }

    /// `spans[i]` holds the spans for example `i`; each example must supply
    /// exactly the configured span count.
    pub fn forward(&self, sent: &Array3<f32>, spans: &[Vec<Span>]) -> Array2<f32> {
        let b = sent.dim().0;
        assert_eq!(spans.len(), b, "one span list per example");
        let mut embs = Array2::zeros((b, self.n_spans * self.proj.d_out()));
        for i in 0..b {
            assert_eq!(
                spans[i].len(),
                self.n_spans,
                "example {i} supplies {} spans, expected {}",
                spans[i].len(),
                self.n_spans
            );
            let frame = sent.index_axis(Axis(0), i);
            for (j, &span) in spans[i].iter().enumerate() {
                let pooled = self.pooling.pool(frame, span);
                let projected = self.proj.forward1(pooled.view()).mapv(f32::tanh);
                let d = self.proj.d_out();
                embs.row_mut(i)
                    .slice_mut(s![j * d..(j + 1) * d])
                    .assign(&projected);
            }
        }
        self.classifier.forward2(&embs)
    }

    pub fn param_count(&self) -> usize {
        self.proj.param_count() + self.classifier.param_count()
    }
}

/// Edge-probing loss family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeLoss {
    /// Multi-label sigmoid + binary cross entropy
    Sigmoid,
    /// Single-label softmax cross entropy
    Softmax,
}

impl EdgeLoss {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "sigmoid" => Ok(EdgeLoss::Sigmoid),
            "softmax" => Ok(EdgeLoss::Softmax),
            other => Err(ModelError::UnknownLossFunction(other.to_string())),
        }
    }
}

/// Edge probing: classifies (span1, span2) pairs drawn from one sentence,
/// one logit row per span pair across the whole batch.
#[derive(Debug, Clone)]
pub struct EdgeClassifierModule {
    pooling: SpanPooling,
    proj: Linear,
    classifier: Classifier,
    pub loss: EdgeLoss,
    /// Context half-window smoothed into each position before span pooling.
    cnn_context: usize,
}

impl EdgeClassifierModule {
    pub fn new(d_inp: usize, n_labels: usize, params: &TaskParams, seed: f32) -> Result<Self> {
        let pooling = SpanPooling::parse(&params.cls_span_pooling, d_inp, seed * 0.7)?;
        let proj = Linear::new(d_inp, params.d_proj, seed);
        let classifier = Classifier::from_params(2 * params.d_proj, n_labels, params, seed * 1.9)?;
        let loss = EdgeLoss::parse(&params.cls_loss_fn)?;
        Ok(Self {
            pooling,
            proj,
            classifier,
            loss,
            cnn_context: params.edgeprobe_cnn_context,
        })
    }

    fn contextualize(&self, frame: ArrayView2<f32>) -> Array2<f32> {
        if self.cnn_context == 0 {
            return frame.to_owned();
        }
        let (l, d) = frame.dim();
        let mut out = Array2::zeros((l, d));
        for t in 0..l {
            let lo = t.saturating_sub(self.cnn_context);
            let hi = (t + self.cnn_context + 1).min(l);
            let window = frame.slice(s![lo..hi, ..]);
            out.row_mut(t).assign(&window.mean_axis(Axis(0)).unwrap());
        }
        out
    }

    /// One logit row per (span1, span2) pair, rows ordered example-major.
    pub fn forward(
        &self,
        sent: &Array3<f32>,
        spans1: &[Vec<Span>],
        spans2: &[Vec<Span>],
    ) -> Array2<f32> {
        let b = sent.dim().0;
        assert_eq!(spans1.len(), b, "one span list per example");
        assert_eq!(spans2.len(), b, "one span list per example");
        let mut rows: Vec<Array1<f32>> = Vec::new();
        for i in 0..b {
            assert_eq!(
                spans1[i].len(),
                spans2[i].len(),
                "example {i} has unpaired spans"
            );
            let frame = self.contextualize(sent.index_axis(Axis(0), i));
            for (&sp1, &sp2) in spans1[i].iter().zip(spans2[i].iter()) {
                let r1 = self.proj.forward1(self.pooling.pool(frame.view(), sp1).view());
                let r2 = self.proj.forward1(self.pooling.pool(frame.view(), sp2).view());
                let pair = concatenate(Axis(0), &[r1.view(), r2.view()]).unwrap();
                rows.push(pair);
            }
        }
        let d = 2 * self.proj.d_out();
        let mut stacked = Array2::zeros((rows.len(), d));
        for (i, row) in rows.iter().enumerate() {
            stacked.row_mut(i).assign(row);
        }
        self.classifier.forward2(&stacked)
    }

    pub fn param_count(&self) -> usize {
        self.proj.param_count() + self.classifier.param_count()
    }
}

/// Recurrent sequence-generation decoder fed gold previous tokens
/// (scheduled-sampling probability is fixed at zero).
#[derive(Debug, Clone)]
pub struct Seq2SeqDecoder {
    target_table: Array2<f32>,
    cell: Rnn,
    attention: DecoderAttentionLayer,
    pre_out: Linear,
    out_proj: Linear,
}

/// Decoder-side attention over the encoder states
#[derive(Debug, Clone)]
pub enum DecoderAttentionLayer {
    None,
    /// Dot-product scoring; queries are projected to the encoder width when
    /// the hidden sizes differ.
    Dot { proj: Option<Linear> },
    Bilinear { w: Array2<f32> },
}

impl Seq2SeqDecoder {
    pub fn new(
        d_enc: usize,
        d_hid_dec: usize,
        output_proj_input_dim: usize,
        n_target_vocab: usize,
        attention: crate::config::DecoderAttention,
        seed: f32,
    ) -> Self {
        let attention = match attention {
            crate::config::DecoderAttention::None => DecoderAttentionLayer::None,
            crate::config::DecoderAttention::Dot => DecoderAttentionLayer::Dot {
                proj: (d_hid_dec != d_enc).then(|| Linear::new(d_hid_dec, d_enc, seed * 0.61)),
            },
            crate::config::DecoderAttention::Bilinear => DecoderAttentionLayer::Bilinear {
                w: sin_init(d_hid_dec, d_enc, seed * 0.61),
            },
        };
        let d_ctx = match attention {
            DecoderAttentionLayer::None => 0,
            _ => d_enc,
        };
        Self {
            target_table: sin_init(n_target_vocab, d_hid_dec, seed),
            cell: Rnn::new(d_hid_dec, d_hid_dec, seed * 1.3),
            attention,
            pre_out: Linear::new(d_hid_dec + d_ctx, output_proj_input_dim, seed * 1.7),
            out_proj: Linear::new(output_proj_input_dim, n_target_vocab, seed * 2.3),
        }
    }

    /// Logits over the target vocabulary, `(batch, targ_len, n_vocab)`.
    /// Step `t` sees the gold token at `t - 1`; step 0 sees the padding row.
    pub fn forward(
        &self,
        enc: &Array3<f32>,
        enc_mask: &Array2<f32>,
        targs: &Array2<usize>,
    ) -> Array3<f32> {
        let (b, l) = targs.dim();
        let d = self.cell.d_hid();
        // Shift targets right by one step; padding id 0 embeds to zero.
        let mut inputs = Array3::zeros((b, l, d));
        for i in 0..b {
            for t in 1..l {
                let id = targs[[i, t - 1]];
                if id != 0 && id < self.target_table.nrows() {
                    inputs
                        .index_axis_mut(Axis(0), i)
                        .row_mut(t)
                        .assign(&self.target_table.row(id));
                }
            }
        }
        let hidden = self.cell.forward(&inputs, false);
        let n_vocab = self.out_proj.d_out();
        let mut logits = Array3::zeros((b, l, n_vocab));
        for i in 0..b {
            let h_frame = hidden.index_axis(Axis(0), i);
            let enc_frame = enc.index_axis(Axis(0), i);
            let combined: Array2<f32> = match &self.attention {
                DecoderAttentionLayer::None => h_frame.to_owned(),
                DecoderAttentionLayer::Dot { proj } => {
                    let ctx = match proj {
                        Some(p) => {
                            let q = p.forward2(&h_frame.to_owned());
                            dot_attention(q.view(), enc_frame, enc_mask.row(i))
                        }
                        None => dot_attention(h_frame, enc_frame, enc_mask.row(i)),
                    };
                    concatenate(Axis(1), &[h_frame.view(), ctx.view()]).unwrap()
                }
                DecoderAttentionLayer::Bilinear { w } => {
                    let q = h_frame.dot(w);
                    let ctx = dot_attention(q.view(), enc_frame, enc_mask.row(i));
                    concatenate(Axis(1), &[h_frame.view(), ctx.view()]).unwrap()
                }
            };
            let projected = self.pre_out.forward2(&combined).mapv(f32::tanh);
            logits
                .index_axis_mut(Axis(0), i)
                .assign(&self.out_proj.forward2(&projected));
        }
        logits
    }

    pub fn param_count(&self) -> usize {
        let attn = match &self.attention {
            DecoderAttentionLayer::Bilinear { w } => w.len(),
            DecoderAttentionLayer::Dot { proj } => proj.as_ref().map_or(0, Linear::param_count),
            DecoderAttentionLayer::None => 0,
        };
        self.target_table.len()
            + self.cell.param_count()
            + attn
            + self.pre_out.param_count()
            + self.out_proj.param_count()
    }
}

/// The head owned by one task; the variant is fixed by the task kind.
#[derive(Debug)]
pub enum TaskModule {
    SingleCls(SingleClassifier),
    PairCls(PairClassifier),
    Tagger(Tagger),
    Lm(LmHead),
    MultipleChoice(MultipleChoiceModule),
    ReadingComp(ReadingComprehensionModule),
    SpanCls(SpanClassifierModule),
    EdgeCls(EdgeClassifierModule),
    Decoder(Seq2SeqDecoder),
}

impl TaskModule {
    pub fn param_count(&self) -> usize {
        match self {
            TaskModule::SingleCls(m) => m.param_count(),
            TaskModule::PairCls(m) => m.param_count(),
            TaskModule::Tagger(m) => m.param_count(),
            TaskModule::Lm(m) => m.param_count(),
            TaskModule::MultipleChoice(m) => m.param_count(),
            TaskModule::ReadingComp(m) => m.param_count(),
            TaskModule::SpanCls(m) => m.param_count(),
            TaskModule::EdgeCls(m) => m.param_count(),
            TaskModule::Decoder(m) => m.param_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::params::resolve_task_params;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    fn params() -> TaskParams {
        resolve_task_params(&ModelConfig::tiny(), "t")
    }

    #[test]
    fn test_max_pooler_ignores_padding() {
        let pooler = Pooler::new(2, 2, false, PoolKind::Max, 0.1);
        let mut sent = Array3::zeros((1, 3, 2));
        sent[[0, 0, 0]] = 1.0;
        sent[[0, 1, 0]] = 2.0;
        sent[[0, 2, 0]] = 99.0; // padded position
        let mask = arr2(&[[1.0, 1.0, 0.0]]);
        let out = pooler.forward(&sent, &mask);
        assert_relative_eq!(out[[0, 0]], 2.0);
    }

    #[test]
    fn test_first_pooler_takes_position_zero() {
        let pooler = Pooler::new(2, 2, false, PoolKind::First, 0.1);
        let mut sent = Array3::zeros((1, 2, 2));
        sent[[0, 0, 1]] = 7.0;
        sent[[0, 1, 1]] = 3.0;
        let mask = arr2(&[[1.0, 1.0]]);
        assert_relative_eq!(pooler.forward(&sent, &mask)[[0, 1]], 7.0);
    }

    #[test]
    fn test_classifier_types_and_unknown() {
        let p = params();
        let mlp = Classifier::from_params(4, 3, &p, 0.5).unwrap();
        assert_eq!(mlp.n_classes(), 3);
        assert_eq!(mlp.forward2(&Array2::zeros((2, 4))).dim(), (2, 3));

        let mut bad = p.clone();
        bad.cls_type = "svm".to_string();
        let err = Classifier::from_params(4, 3, &bad, 0.5).unwrap_err();
        assert!(matches!(err, ModelError::UnknownClassifierType(_)));
    }

    #[test]
    fn test_pair_classifier_four_way_width() {
        let p = params();
        let pooler = Pooler::new(6, 4, true, PoolKind::Max, 0.3);
        let classifier = Classifier::from_params(4 * 4, 3, &p, 0.5).unwrap();
        let head = PairClassifier {
            pooler,
            classifier,
            attn: None,
        };
        let s1 = Array3::from_elem((2, 3, 6), 0.1);
        let s2 = Array3::from_elem((2, 4, 6), 0.2);
        let m1 = Array2::ones((2, 3));
        let m2 = Array2::ones((2, 4));
        let logits = head.forward(&s1, &s2, &m1, &m2, None, None);
        assert_eq!(logits.dim(), (2, 3));
    }

    #[test]
    fn test_attn_pair_encoder_output_width() {
        let attn = AttnPairEncoder::new(6, 5, 0.4);
        assert_eq!(attn.d_out(), 10);
        let s1 = Array3::from_elem((1, 3, 6), 0.1);
        let s2 = Array3::from_elem((1, 4, 6), 0.2);
        let (o1, o2) = attn.forward(&s1, &s2, &Array2::ones((1, 3)), &Array2::ones((1, 4)));
        assert_eq!(o1.dim(), (1, 3, 10));
        assert_eq!(o2.dim(), (1, 4, 10));
    }

    #[test]
    fn test_span_pooling_mean_and_unknown() {
        let frame = arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        let mean = SpanPooling::Mean.pool(frame.view(), (0, 2));
        assert_relative_eq!(mean[0], 2.0);
        assert_relative_eq!(mean[1], 3.0);
        let max = SpanPooling::Max.pool(frame.view(), (1, 3));
        assert_relative_eq!(max[1], 6.0);
        assert!(matches!(
            SpanPooling::parse("centroid", 2, 0.1),
            Err(ModelError::UnknownSpanPooling(_))
        ));
    }

    #[test]
    fn test_span_classifier_shapes() {
        let p = params();
        let module = SpanClassifierModule::new(6, 2, 2, &p, 0.6).unwrap();
        let sent = Array3::from_elem((2, 5, 6), 0.1);
        let spans = vec![vec![(0, 2), (3, 5)], vec![(1, 3), (2, 4)]];
        assert_eq!(module.forward(&sent, &spans).dim(), (2, 2));
    }

    #[test]
    fn test_edge_classifier_one_row_per_pair() {
        let mut p = params();
        p.cls_loss_fn = "sigmoid".to_string();
        let module = EdgeClassifierModule::new(6, 4, &p, 0.7).unwrap();
        let sent = Array3::from_elem((2, 5, 6), 0.1);
        let spans1 = vec![vec![(0, 1), (1, 2)], vec![(0, 2)]];
        let spans2 = vec![vec![(2, 3), (3, 4)], vec![(3, 5)]];
        let logits = module.forward(&sent, &spans1, &spans2);
        assert_eq!(logits.dim(), (3, 4));
        assert_eq!(module.loss, EdgeLoss::Sigmoid);
    }

    #[test]
    fn test_edge_loss_parse_rejects_unknown() {
        assert!(matches!(
            EdgeLoss::parse("hinge"),
            Err(ModelError::UnknownLossFunction(_))
        ));
    }

    #[test]
    fn test_decoder_logits_shape() {
        let dec = Seq2SeqDecoder::new(8, 8, 8, 12, crate::config::DecoderAttention::Dot, 0.8);
        let enc = Array3::from_elem((2, 4, 8), 0.1);
        let enc_mask = Array2::ones((2, 4));
        let targs = arr2(&[[2, 3, 4], [5, 6, 0]]);
        let logits = dec.forward(&enc, &enc_mask, &targs);
        assert_eq!(logits.dim(), (2, 3, 12));
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_single_classifier_with_indices_widens_input() {
        let p = params();
        let pooler = Pooler::new(6, 6, false, PoolKind::First, 0.2);
        let classifier = Classifier::from_params(3 * 6, 2, &p, 0.9).unwrap();
        let head = SingleClassifier { pooler, classifier };
        let sent = Array3::from_elem((2, 4, 6), 0.1);
        let mask = Array2::ones((2, 4));
        let idx1 = ndarray::arr1(&[1, 2]);
        let idx2 = ndarray::arr1(&[3, 0]);
        let logits = head.forward_with_indices(&sent, &mask, &[&idx1, &idx2]);
        assert_eq!(logits.dim(), (2, 2));
    }
}
