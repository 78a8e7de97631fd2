//! Shared sentence encoder
//!
//! Exactly one contextualization strategy sits on top of the assembled
//! embeddings. The strategies form a closed set; `build_sent_encoder`
//! enforces the legal combinations (pass-through requires the skip
//! connection, bag-of-words forbids it, language modeling forces the
//! bidirectional-LM recurrent layer) and reports the encoder output width.

use ndarray::{concatenate, Array1, Array2, Array3, Axis};
use tracing::info;

use crate::batch::TokenBatch;
use crate::classifier_map::ClassifierNameMap;
use crate::config::{ModelConfig, SentEncKind};
use crate::embed::{mixture_index, ContextualRecurrent, EmbeddingAssembly, TokenEmbedder};
use crate::error::{ModelError, Result};
use crate::nn::{dot_attention, mask_fill, sin_init, BiRnn, Highway, Linear, Rnn};
use crate::task::TaskDescriptor;

/// Ordered-neurons recurrent layer: hidden units decay at different rates
/// through a cumulative master forget gate.
#[derive(Debug, Clone)]
pub struct OrderedNeuronsLayer {
    proj: Linear,
    w_gate: Linear,
    u_gate: Array2<f32>,
    cell: Rnn,
    d_out: usize,
}

impl OrderedNeuronsLayer {
    pub fn new(d_in: usize, d_out: usize) -> Self {
        Self {
            proj: Linear::new(d_in, d_out, 1.01),
            w_gate: Linear::new(d_out, d_out, 1.13),
            u_gate: sin_init(d_out, d_out, 1.27),
            cell: Rnn::new(d_out, d_out, 1.31),
            d_out,
        }
    }

    pub fn d_out(&self) -> usize {
        self.d_out
    }

    pub fn forward(&self, embs: &Array3<f32>) -> Array3<f32> {
        let x = self.proj.forward3(embs);
        let candidate = self.cell.forward(&x, false);
        let (b, l, d) = x.dim();
        let mut out = Array3::zeros((b, l, d));
        for i in 0..b {
            let mut h: Array1<f32> = Array1::zeros(d);
            for t in 0..l {
                let x_t = x.index_axis(Axis(0), i).row(t).to_owned();
                // Cumulative softmax: earlier units forget more slowly.
                let gate_pre = self.w_gate.forward1(x_t.view()) + h.dot(&self.u_gate);
                let gate_soft = crate::nn::softmax1(&gate_pre);
                let mut cum = 0.0;
                let master: Array1<f32> = gate_soft
                    .iter()
                    .map(|&g| {
                        cum += g;
                        cum
                    })
                    .collect();
                let cand = candidate.index_axis(Axis(0), i).row(t).to_owned();
                h = &master * &h + (1.0 - &master) * &cand;
                out.index_axis_mut(Axis(0), i).row_mut(t).assign(&h);
            }
        }
        out
    }

    pub fn param_count(&self) -> usize {
        self.proj.param_count()
            + self.w_gate.param_count()
            + self.u_gate.len()
            + self.cell.param_count()
    }
}

/// Parse-inducing recurrent layer: a scalar syntactic-distance gate decides
/// how much of the running state crosses each token boundary.
#[derive(Debug, Clone)]
pub struct ParseInducingLayer {
    proj: Linear,
    distance: Linear,
    cell: Rnn,
    d_out: usize,
}

impl ParseInducingLayer {
    pub fn new(d_in: usize, d_out: usize) -> Self {
        Self {
            proj: Linear::new(d_in, d_out, 2.01),
            distance: Linear::new(d_out, 1, 2.17),
            cell: Rnn::new(d_out, d_out, 2.29),
            d_out,
        }
    }

    pub fn d_out(&self) -> usize {
        self.d_out
    }

    pub fn forward(&self, embs: &Array3<f32>) -> Array3<f32> {
        let x = self.proj.forward3(embs);
        let candidate = self.cell.forward(&x, false);
        let (b, l, d) = x.dim();
        let mut out = Array3::zeros((b, l, d));
        for i in 0..b {
            let frame = x.index_axis(Axis(0), i);
            let mut h: Array1<f32> = Array1::zeros(d);
            for t in 0..l {
                let x_t = frame.row(t);
                let dist = 1.0 / (1.0 + (-self.distance.forward1(x_t)[0]).exp());
                let cand = candidate.index_axis(Axis(0), i).row(t).to_owned();
                h = h.mapv(|v| v * (1.0 - dist)) + cand.mapv(|v| v * dist);
                out.index_axis_mut(Axis(0), i).row_mut(t).assign(&h);
            }
        }
        out
    }

    pub fn param_count(&self) -> usize {
        self.proj.param_count() + self.distance.param_count() + self.cell.param_count()
    }
}

/// Bidirectional language-model recurrent layer. Unlike the plain recurrent
/// layer, the two halves of the output are guaranteed to be the forward and
/// backward direction features in order, which the LM forward relies on.
#[derive(Debug, Clone)]
pub struct BiLmLayer {
    fwd: Rnn,
    bwd: Rnn,
}

impl BiLmLayer {
    pub fn new(d_in: usize, d_hid: usize) -> Self {
        Self {
            fwd: Rnn::new(d_in, d_hid, 3.01),
            bwd: Rnn::new(d_in, d_hid, 3.17),
        }
    }

    pub fn d_out(&self) -> usize {
        2 * self.fwd.d_hid()
    }

    pub fn forward(&self, embs: &Array3<f32>) -> Array3<f32> {
        let f = self.fwd.forward(embs, false);
        let b = self.bwd.forward(embs, true);
        concatenate(Axis(2), &[f.view(), b.view()]).unwrap()
    }

    pub fn param_count(&self) -> usize {
        self.fwd.param_count() + self.bwd.param_count()
    }
}

/// Stacked self-attention encoder
#[derive(Debug, Clone)]
pub struct SelfAttnLayer {
    proj: Linear,
    layers: Vec<(Linear, Linear)>,
    d_out: usize,
}

impl SelfAttnLayer {
    pub fn new(d_in: usize, d_proj: usize, d_ff: usize, n_layers: usize) -> Self {
        let layers = (0..n_layers)
            .map(|i| {
                (
                    Linear::new(d_proj, d_ff, 4.01 + i as f32 * 0.1),
                    Linear::new(d_ff, d_proj, 4.51 + i as f32 * 0.1),
                )
            })
            .collect();
        Self {
            proj: Linear::new(d_in, d_proj, 4.91),
            layers,
            d_out: d_proj,
        }
    }

    pub fn d_out(&self) -> usize {
        self.d_out
    }

    pub fn forward(&self, embs: &Array3<f32>, mask: &Array2<f32>) -> Array3<f32> {
        let mut x = self.proj.forward3(embs);
        let b = x.dim().0;
        for (up, down) in &self.layers {
            let mut attended = x.clone();
            for i in 0..b {
                let frame = x.index_axis(Axis(0), i);
                let ctx = dot_attention(frame, frame, mask.row(i));
                attended.index_axis_mut(Axis(0), i).assign(&ctx);
            }
            let x_res = &x + &attended;
            let ff = down.forward3(&up.forward3(&x_res).mapv(|v| v.max(0.0)));
            x = x_res + ff;
        }
        x
    }

    pub fn param_count(&self) -> usize {
        self.proj.param_count()
            + self
                .layers
                .iter()
                .map(|(a, b)| a.param_count() + b.param_count())
                .sum::<usize>()
    }
}

/// Closed set of contextualization strategies
#[derive(Debug, Clone)]
pub enum PhraseLayer {
    OrderedNeurons(OrderedNeuronsLayer),
    ParseInducing(ParseInducingLayer),
    BiLm(BiLmLayer),
    Rnn(BiRnn),
    SelfAttn(SelfAttnLayer),
    /// Pass-through: the skip connection exposes the raw embeddings.
    Null,
}

impl PhraseLayer {
    pub fn output_dim(&self) -> usize {
        match self {
            PhraseLayer::OrderedNeurons(l) => l.d_out(),
            PhraseLayer::ParseInducing(l) => l.d_out(),
            PhraseLayer::BiLm(l) => l.d_out(),
            PhraseLayer::Rnn(l) => l.d_out(),
            PhraseLayer::SelfAttn(l) => l.d_out(),
            PhraseLayer::Null => 0,
        }
    }

    pub fn forward(&self, embs: &Array3<f32>, mask: &Array2<f32>) -> Option<Array3<f32>> {
        match self {
            PhraseLayer::OrderedNeurons(l) => Some(l.forward(embs)),
            PhraseLayer::ParseInducing(l) => Some(l.forward(embs)),
            PhraseLayer::BiLm(l) => Some(l.forward(embs)),
            PhraseLayer::Rnn(l) => Some(l.forward(embs)),
            PhraseLayer::SelfAttn(l) => Some(l.forward(embs, mask)),
            PhraseLayer::Null => None,
        }
    }

    pub fn param_count(&self) -> usize {
        match self {
            PhraseLayer::OrderedNeurons(l) => l.param_count(),
            PhraseLayer::ParseInducing(l) => l.param_count(),
            PhraseLayer::BiLm(l) => l.param_count(),
            PhraseLayer::Rnn(l) => l.param_count(),
            PhraseLayer::SelfAttn(l) => l.param_count(),
            PhraseLayer::Null => 0,
        }
    }
}

/// Embedder + highways + phrase layer + optional residual and skip
#[derive(Debug, Clone)]
pub struct SentenceEncoder {
    embedder: TokenEmbedder,
    highways: Vec<Highway>,
    phrase: PhraseLayer,
    skip_embs: bool,
    contextual_recurrent: Option<ContextualRecurrent>,
}

impl SentenceEncoder {
    fn embed(&self, tokens: &TokenBatch, mixture: usize) -> Array3<f32> {
        let mut embs = self.embedder.forward(tokens, mixture);
        if let Some(residual) = &self.contextual_recurrent {
            let word_embs = self
                .embedder
                .word_embs_only(tokens)
                .expect("contextual recurrent residual requires word embeddings");
            let res = residual.forward(&word_embs);
            embs = concatenate(Axis(2), &[embs.view(), res.view()]).unwrap();
        }
        for hw in &self.highways {
            embs = hw.forward(&embs);
        }
        embs
    }

    fn forward(&self, tokens: &TokenBatch, mixture: usize) -> (Array3<f32>, Array2<f32>) {
        let mask = validity_mask(&tokens.words);
        let embs = self.embed(tokens, mixture);
        let mut out = match self.phrase.forward(&embs, &mask) {
            Some(ctx) if self.skip_embs => {
                concatenate(Axis(2), &[ctx.view(), embs.view()]).unwrap()
            }
            Some(ctx) => ctx,
            // Pass-through layer: only the skip connection survives.
            None => embs,
        };
        mask_fill(&mut out, &mask);
        (out, mask)
    }

    pub fn param_count(&self) -> usize {
        self.embedder.param_count()
            + self.highways.iter().map(Highway::param_count).sum::<usize>()
            + self.phrase.param_count()
            + self
                .contextual_recurrent
                .as_ref()
                .map_or(0, ContextualRecurrent::param_count)
    }
}

/// Bag-of-words encoder: no contextualization, heads pool raw embeddings.
#[derive(Debug, Clone)]
pub struct BowSentEncoder {
    embedder: TokenEmbedder,
}

impl BowSentEncoder {
    fn forward(&self, tokens: &TokenBatch, mixture: usize) -> (Array3<f32>, Array2<f32>) {
        let mask = validity_mask(&tokens.words);
        let mut embs = self.embedder.forward(tokens, mixture);
        mask_fill(&mut embs, &mask);
        (embs, mask)
    }

    pub fn param_count(&self) -> usize {
        self.embedder.param_count()
    }
}

/// The one encoder instance shared by all tasks
#[derive(Debug)]
pub struct SharedEncoder {
    kind: EncoderKind,
    classifier_map: ClassifierNameMap,
    sep_embs_for_skip: bool,
}

#[derive(Debug)]
enum EncoderKind {
    Sentence(SentenceEncoder),
    BagOfWords(BowSentEncoder),
}

impl SharedEncoder {
    /// Contextualize one token field for the given classifier identity,
    /// returning `(representation, validity mask)` with padded positions
    /// zero-filled.
    pub fn forward(
        &self,
        tokens: &TokenBatch,
        classifier_name: &str,
    ) -> (Array3<f32>, Array2<f32>) {
        let mixture = mixture_index(&self.classifier_map, self.sep_embs_for_skip, classifier_name);
        match &self.kind {
            EncoderKind::Sentence(enc) => enc.forward(tokens, mixture),
            EncoderKind::BagOfWords(enc) => enc.forward(tokens, mixture),
        }
    }

    /// True when the phrase layer is the bidirectional-LM recurrent layer.
    pub fn is_bilm(&self) -> bool {
        matches!(
            &self.kind,
            EncoderKind::Sentence(SentenceEncoder {
                phrase: PhraseLayer::BiLm(_),
                ..
            })
        )
    }

    /// True for strategies that only support left-to-right language modeling.
    pub fn is_left_to_right_only(&self) -> bool {
        matches!(
            &self.kind,
            EncoderKind::Sentence(SentenceEncoder {
                phrase: PhraseLayer::OrderedNeurons(_) | PhraseLayer::ParseInducing(_),
                ..
            })
        )
    }

    /// Per-direction feature width of the bidirectional-LM layer.
    pub fn bilm_split_dim(&self) -> usize {
        match &self.kind {
            EncoderKind::Sentence(SentenceEncoder {
                phrase: PhraseLayer::BiLm(l),
                ..
            }) => l.d_out() / 2,
            _ => panic!("bilm_split_dim called on a non-BiLM encoder"),
        }
    }

    pub fn classifier_map(&self) -> &ClassifierNameMap {
        &self.classifier_map
    }

    pub fn param_count(&self) -> usize {
        match &self.kind {
            EncoderKind::Sentence(enc) => enc.param_count(),
            EncoderKind::BagOfWords(enc) => enc.param_count(),
        }
    }
}

fn validity_mask(words: &Array2<usize>) -> Array2<f32> {
    words.mapv(|id| if id == 0 { 0.0 } else { 1.0 })
}

/// Select and wire the contextualization strategy.
///
/// Returns the shared encoder and its output width `d_sent` (before the skip
/// connection is accounted for).
pub fn build_sent_encoder(
    cfg: &ModelConfig,
    d_emb: usize,
    tasks: &[TaskDescriptor],
    assembly: EmbeddingAssembly,
) -> Result<(SharedEncoder, usize)> {
    let EmbeddingAssembly {
        embedder,
        contextual_recurrent,
        classifier_map,
        ..
    } = assembly;
    let highways = (0..cfg.n_layers_highway)
        .map(|i| Highway::new(d_emb, 5.01 + i as f32 * 0.1))
        .collect::<Vec<_>>();
    let any_lm = tasks.iter().any(TaskDescriptor::is_language_modeling);

    let sentence = |phrase: PhraseLayer| EncoderKind::Sentence(SentenceEncoder {
        embedder: embedder.clone(),
        highways: highways.clone(),
        phrase,
        skip_embs: cfg.skip_embs,
        contextual_recurrent: contextual_recurrent.clone(),
    });

    let bilm = || {
        info!("using bidirectional-LM sentence encoder");
        (
            sentence(PhraseLayer::BiLm(BiLmLayer::new(d_emb, cfg.d_hid))),
            2 * cfg.d_hid,
        )
    };

    let (kind, d_sent) = match cfg.sent_enc {
        SentEncKind::Onlstm => {
            info!("using ordered-neurons sentence encoder");
            (
                sentence(PhraseLayer::OrderedNeurons(OrderedNeuronsLayer::new(
                    d_emb, cfg.d_word,
                ))),
                cfg.d_word,
            )
        }
        SentEncKind::Prpn => {
            info!("using parse-inducing sentence encoder");
            (
                sentence(PhraseLayer::ParseInducing(ParseInducingLayer::new(
                    d_emb, cfg.d_word,
                ))),
                cfg.d_word,
            )
        }
        enc_kind
            if any_lm && !matches!(enc_kind, SentEncKind::Rnn | SentEncKind::Bilm) =>
        {
            return Err(ModelError::InvalidEncoder(format!(
                "language-modeling tasks require a recurrent LM encoder, got {enc_kind:?}"
            )));
        }
        enc_kind
            if (any_lm || enc_kind == SentEncKind::Bilm)
                && cfg.contextual
                && !cfg.contextual_chars_only =>
        {
            return Err(ModelError::InvalidEncoder(
                "language modeling with the full contextual embedder is not supported; \
                 restrict it to character-only mode"
                    .to_string(),
            ));
        }
        SentEncKind::Bilm => bilm(),
        SentEncKind::Rnn if any_lm => bilm(),
        SentEncKind::Bow => {
            if cfg.skip_embs {
                return Err(ModelError::InvalidEncoder(
                    "skip connection is not supported with the bag-of-words encoder".to_string(),
                ));
            }
            info!("using bag-of-words sentence encoder");
            (
                EncoderKind::BagOfWords(BowSentEncoder {
                    embedder: embedder.clone(),
                }),
                d_emb,
            )
        }
        SentEncKind::Rnn => (
            sentence(PhraseLayer::Rnn(BiRnn::new(d_emb, cfg.d_hid, 6.01))),
            2 * cfg.d_hid,
        ),
        SentEncKind::Transformer => {
            info!("using self-attention stack for the shared encoder");
            (
                sentence(PhraseLayer::SelfAttn(SelfAttnLayer::new(
                    d_emb,
                    cfg.d_tproj,
                    cfg.d_ff,
                    cfg.n_layers_enc,
                ))),
                cfg.d_tproj,
            )
        }
        SentEncKind::None => {
            if !cfg.skip_embs {
                return Err(ModelError::InvalidEncoder(
                    "skip_embs must be set for the pass-through encoder".to_string(),
                ));
            }
            info!("no shared contextualization; exposing word representations directly");
            (sentence(PhraseLayer::Null), 0)
        }
    };

    Ok((
        SharedEncoder {
            kind,
            classifier_map,
            sep_embs_for_skip: cfg.sep_embs_for_skip,
        },
        d_sent,
    ))
}
