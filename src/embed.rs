//! Embedding assembler
//!
//! Combines word, character and contextual embedders into one fixed-width
//! per-token vector. When separate contextual mixtures per classifier are
//! configured, the distinct classifier-target names are enumerated in sorted
//! order and bound to stable indices through the persisted
//! [`ClassifierNameMap`]; the contextual embedder then exposes one mixture
//! slot per assigned index.

use ndarray::{concatenate, Array1, Array2, Array3, Axis};
use tracing::info;

use crate::batch::TokenBatch;
use crate::classifier_map::{ClassifierNameMap, PRETRAIN_CLASSIFIER};
use crate::config::{ModelConfig, WordEmbs};
use crate::error::{ModelError, Result};
use crate::nn::{sin_init, softmax1, Linear};
use crate::params::resolve_task_params;
use crate::task::TaskDescriptor;
use crate::vocab::Vocab;

/// Width of the character-only contextual sub-mode.
pub const D_CONTEXTUAL_CHARS: usize = 512;
/// Width of the full contextual embedder.
pub const D_CONTEXTUAL_FULL: usize = 1024;
/// Internal representation layers mixed by the full contextual embedder.
pub const N_CONTEXTUAL_LAYERS: usize = 3;

/// Word-level lookup table
#[derive(Debug, Clone)]
pub struct WordEmbedding {
    table: Array2<f32>,
    padding_index: usize,
}

impl WordEmbedding {
    pub fn scratch(n_vocab: usize, d_word: usize, padding_index: usize) -> Self {
        Self {
            table: sin_init(n_vocab, d_word, 0.111),
            padding_index,
        }
    }

    pub fn pretrained(table: Array2<f32>, padding_index: usize) -> Self {
        Self {
            table,
            padding_index,
        }
    }

    pub fn d_out(&self) -> usize {
        self.table.ncols()
    }

    pub fn forward(&self, words: &Array2<usize>) -> Array3<f32> {
        let (b, l) = words.dim();
        let d = self.d_out();
        let mut out = Array3::zeros((b, l, d));
        for i in 0..b {
            for t in 0..l {
                let id = words[[i, t]];
                if id != self.padding_index && id < self.table.nrows() {
                    out.index_axis_mut(Axis(0), i)
                        .row_mut(t)
                        .assign(&self.table.row(id));
                }
            }
        }
        out
    }

    pub fn param_count(&self) -> usize {
        self.table.len()
    }
}

/// Character CNN: embeds characters, convolves with several filter widths,
/// max-pools over positions and projects back down to `d_char`.
#[derive(Debug, Clone)]
pub struct CharCnnEmbedding {
    char_table: Array2<f32>,
    filters: Vec<(usize, Linear)>,
    out: Linear,
    d_char: usize,
}

impl CharCnnEmbedding {
    pub fn new(n_chars: usize, d_char: usize, n_filters: usize, sizes: &[usize]) -> Self {
        let filters = sizes
            .iter()
            .enumerate()
            .map(|(i, &k)| (k, Linear::new(k * d_char, n_filters, 0.21 + i as f32 * 0.07)))
            .collect::<Vec<_>>();
        let out = Linear::new(sizes.len() * n_filters, d_char, 0.77);
        Self {
            char_table: sin_init(n_chars, d_char, 0.33),
            filters,
            out,
            d_char,
        }
    }

    pub fn d_out(&self) -> usize {
        self.d_char
    }

    pub fn forward(&self, chars: &Array3<usize>) -> Array3<f32> {
        let (b, l, w) = chars.dim();
        let d_char = self.d_char;
        let mut out = Array3::zeros((b, l, d_char));
        for i in 0..b {
            for t in 0..l {
                // Embed this token's characters: (w, d_char)
                let mut emb = Array2::zeros((w, d_char));
                for c in 0..w {
                    let id = chars[[i, t, c]];
                    if id > 0 && id < self.char_table.nrows() {
                        emb.row_mut(c).assign(&self.char_table.row(id));
                    }
                }
                // Convolve + max-pool per filter width, then concatenate.
                let mut pooled: Vec<f32> = Vec::new();
                for (k, filter) in &self.filters {
                    let n_out = filter.d_out();
                    let mut best = Array1::from_elem(n_out, 0.0_f32);
                    if w >= *k {
                        for start in 0..=(w - k) {
                            let window: Array1<f32> = emb
                                .slice(ndarray::s![start..start + k, ..])
                                .iter()
                                .copied()
                                .collect();
                            let act = filter.forward1(window.view()).mapv(|v| v.max(0.0));
                            best.zip_mut_with(&act, |b, &a| *b = b.max(a));
                        }
                    }
                    pooled.extend(best.iter());
                }
                let token_vec = self.out.forward1(Array1::from(pooled).view());
                out.index_axis_mut(Axis(0), i).row_mut(t).assign(&token_vec);
            }
        }
        out
    }

    pub fn param_count(&self) -> usize {
        self.char_table.len()
            + self.filters.iter().map(|(_, f)| f.param_count()).sum::<usize>()
            + self.out.param_count()
    }
}

/// Contextual token embedder: either the character-CNN sub-mode or the full
/// embedder with per-classifier scalar mixtures over its internal layers.
#[derive(Debug, Clone)]
pub enum ContextualEmbedder {
    CharsOnly,
    Full {
        layers: Vec<Linear>,
        /// One row of layer-mix weights per mixture slot.
        mix_weights: Array2<f32>,
    },
}

impl ContextualEmbedder {
    pub fn chars_only() -> Self {
        ContextualEmbedder::CharsOnly
    }

    pub fn full(n_mixtures: usize) -> Self {
        let layers = (1..N_CONTEXTUAL_LAYERS)
            .map(|i| Linear::new(D_CONTEXTUAL_FULL, D_CONTEXTUAL_FULL, 0.41 + i as f32 * 0.13))
            .collect();
        ContextualEmbedder::Full {
            layers,
            mix_weights: sin_init(n_mixtures, N_CONTEXTUAL_LAYERS, 0.59),
        }
    }

    pub fn d_out(&self) -> usize {
        match self {
            ContextualEmbedder::CharsOnly => D_CONTEXTUAL_CHARS,
            ContextualEmbedder::Full { .. } => D_CONTEXTUAL_FULL,
        }
    }

    pub fn n_mixtures(&self) -> usize {
        match self {
            ContextualEmbedder::CharsOnly => 1,
            ContextualEmbedder::Full { mix_weights, .. } => mix_weights.nrows(),
        }
    }

    /// Deterministic base vector standing in for the pretrained network's
    /// token representation.
    fn base_vector(token_id: usize, d: usize) -> Array1<f32> {
        Array1::from_shape_fn(d, |j| ((token_id as f32 * 0.731 + j as f32 * 0.173).sin()) * 0.1)
    }

    pub fn forward(&self, words: &Array2<usize>, mixture: usize) -> Array3<f32> {
        let (b, l) = words.dim();
        let d = self.d_out();
        let mut out = Array3::zeros((b, l, d));
        match self {
            ContextualEmbedder::CharsOnly => {
                for i in 0..b {
                    for t in 0..l {
                        let id = words[[i, t]];
                        if id != 0 {
                            out.index_axis_mut(Axis(0), i)
                                .row_mut(t)
                                .assign(&Self::base_vector(id, d));
                        }
                    }
                }
            }
            ContextualEmbedder::Full {
                layers,
                mix_weights,
            } => {
                assert!(
                    mixture < mix_weights.nrows(),
                    "mixture index {mixture} out of range ({} slots)",
                    mix_weights.nrows()
                );
                let weights = softmax1(&mix_weights.row(mixture).to_owned());
                for i in 0..b {
                    for t in 0..l {
                        let id = words[[i, t]];
                        if id == 0 {
                            continue;
                        }
                        let mut layer_out = Self::base_vector(id, d);
                        let mut mixed = layer_out.mapv(|v| v * weights[0]);
                        for (li, layer) in layers.iter().enumerate() {
                            layer_out = layer.forward1(layer_out.view()).mapv(f32::tanh);
                            mixed = mixed + layer_out.mapv(|v| v * weights[li + 1]);
                        }
                        out.index_axis_mut(Axis(0), i).row_mut(t).assign(&mixed);
                    }
                }
            }
        }
        out
    }

    pub fn param_count(&self) -> usize {
        match self {
            ContextualEmbedder::CharsOnly => 0,
            ContextualEmbedder::Full {
                layers,
                mix_weights,
            } => layers.iter().map(Linear::param_count).sum::<usize>() + mix_weights.len(),
        }
    }
}

/// Contextual recurrent embedding appended downstream as a residual add-on;
/// runs a bidirectional recurrence over the word-table vectors.
#[derive(Debug, Clone)]
pub struct ContextualRecurrent {
    rnn: crate::nn::BiRnn,
}

impl ContextualRecurrent {
    pub fn new(d_word: usize) -> Self {
        Self {
            rnn: crate::nn::BiRnn::new(d_word, d_word, 0.87),
        }
    }

    pub fn d_out(&self) -> usize {
        self.rnn.d_out()
    }

    pub fn forward(&self, word_embs: &Array3<f32>) -> Array3<f32> {
        self.rnn.forward(word_embs)
    }

    pub fn param_count(&self) -> usize {
        self.rnn.param_count()
    }
}

/// Unified embedder: concatenates the enabled sources per token
#[derive(Debug, Clone)]
pub struct TokenEmbedder {
    word: Option<WordEmbedding>,
    chars: Option<CharCnnEmbedding>,
    contextual: Option<ContextualEmbedder>,
}

impl TokenEmbedder {
    /// Width of the concatenated output (excludes the recurrent residual).
    pub fn d_emb(&self) -> usize {
        self.word.as_ref().map_or(0, WordEmbedding::d_out)
            + self.chars.as_ref().map_or(0, CharCnnEmbedding::d_out)
            + self.contextual.as_ref().map_or(0, ContextualEmbedder::d_out)
    }

    /// Word-table vectors alone, for the recurrent residual path.
    pub fn word_embs_only(&self, tokens: &TokenBatch) -> Option<Array3<f32>> {
        self.word.as_ref().map(|w| w.forward(&tokens.words))
    }

    pub fn forward(&self, tokens: &TokenBatch, mixture: usize) -> Array3<f32> {
        let mut parts: Vec<Array3<f32>> = Vec::new();
        if let Some(word) = &self.word {
            parts.push(word.forward(&tokens.words));
        }
        if let Some(chars) = &self.chars {
            let char_ids = tokens
                .chars
                .as_ref()
                .unwrap_or_else(|| panic!("batch missing character ids for char embedder"));
            parts.push(chars.forward(char_ids));
        }
        if let Some(ctx) = &self.contextual {
            parts.push(ctx.forward(&tokens.words, mixture));
        }
        assert!(!parts.is_empty(), "no embedding sources enabled");
        let views: Vec<_> = parts.iter().map(Array3::view).collect();
        concatenate(Axis(2), &views).unwrap()
    }

    pub fn param_count(&self) -> usize {
        self.word.as_ref().map_or(0, WordEmbedding::param_count)
            + self.chars.as_ref().map_or(0, CharCnnEmbedding::param_count)
            + self.contextual.as_ref().map_or(0, ContextualEmbedder::param_count)
    }
}

/// Output of the embedding assembler
#[derive(Debug)]
pub struct EmbeddingAssembly {
    /// Total per-token width including the recurrent residual.
    pub d_emb: usize,
    pub embedder: TokenEmbedder,
    pub contextual_recurrent: Option<ContextualRecurrent>,
    pub classifier_map: ClassifierNameMap,
}

/// Build the unified embedder from the configuration.
///
/// `pretrained` supplies the word table when `word_embs = pretrained`; its
/// row count must match the token vocabulary.
pub fn build_embeddings(
    cfg: &ModelConfig,
    vocab: &Vocab,
    tasks: &[TaskDescriptor],
    pretrained: Option<Array2<f32>>,
) -> Result<EmbeddingAssembly> {
    let n_token_vocab = vocab.size("tokens");
    let mut d_emb = 0;

    let word = match cfg.word_embs {
        WordEmbs::None => {
            info!("not using word embeddings");
            None
        }
        WordEmbs::Scratch => {
            info!(d_word = cfg.d_word, "training word embeddings from scratch");
            Some(WordEmbedding::scratch(
                n_token_vocab,
                cfg.d_word,
                vocab.padding_index(),
            ))
        }
        WordEmbs::Pretrained => {
            let table = pretrained.ok_or_else(|| {
                ModelError::InvalidEmbeddings(
                    "word_embs = pretrained but no table was supplied".to_string(),
                )
            })?;
            if table.nrows() != n_token_vocab {
                return Err(ModelError::InvalidEmbeddings(format!(
                    "pretrained table has {} rows but the vocabulary has {} tokens",
                    table.nrows(),
                    n_token_vocab
                )));
            }
            info!(shape = ?table.dim(), "using pretrained word embeddings");
            Some(WordEmbedding::pretrained(table, vocab.padding_index()))
        }
    };
    let d_word = word.as_ref().map_or(0, WordEmbedding::d_out);
    d_emb += d_word;

    let contextual_recurrent = if cfg.contextual_recurrent {
        if cfg.word_embs != WordEmbs::Pretrained {
            return Err(ModelError::InvalidEmbeddings(
                "contextual recurrent embeddings require pretrained word vectors".to_string(),
            ));
        }
        let layer = ContextualRecurrent::new(d_word);
        d_emb += layer.d_out();
        info!("using contextual recurrent embeddings");
        Some(layer)
    } else {
        None
    };

    let chars = if cfg.char_embs {
        info!("using character embeddings");
        let enc = CharCnnEmbedding::new(
            vocab.size("chars").max(2),
            cfg.d_char,
            cfg.n_char_filters,
            &cfg.char_filter_sizes,
        );
        d_emb += enc.d_out();
        Some(enc)
    } else {
        None
    };

    // Per-classifier mixture bookkeeping. The map is loaded, extended with
    // any newly seen classifier names, and written back even when the full
    // contextual embedder is off, so a later run can rely on it.
    let classifier_map = if cfg.sep_embs_for_skip {
        let mut map = ClassifierNameMap::load_or_init(
            &cfg.run_dir,
            cfg.do_pretrain || cfg.allow_missing_task_map,
        )?;
        let names: Vec<String> = tasks
            .iter()
            .map(|t| resolve_task_params(cfg, &t.name).use_classifier)
            .collect();
        map.assign(names.iter().map(String::as_str));
        map.save(&cfg.run_dir)?;
        map
    } else {
        ClassifierNameMap::fresh()
    };

    let contextual = if cfg.contextual {
        if cfg.contextual_chars_only {
            info!("using contextual embedder in character-only mode");
            let enc = ContextualEmbedder::chars_only();
            d_emb += enc.d_out();
            Some(enc)
        } else {
            info!(
                n_mixtures = classifier_map.n_mixtures(),
                "using full contextual embedder with per-classifier mixtures"
            );
            let enc = ContextualEmbedder::full(classifier_map.n_mixtures());
            d_emb += enc.d_out();
            Some(enc)
        }
    } else {
        None
    };

    if d_emb == 0 {
        return Err(ModelError::NoEmbeddings);
    }

    Ok(EmbeddingAssembly {
        d_emb,
        embedder: TokenEmbedder {
            word,
            chars,
            contextual,
        },
        contextual_recurrent,
        classifier_map,
    })
}

/// Mixture index for a classifier name: its map entry when separate mixtures
/// are enabled, otherwise the shared pretrain slot.
pub fn mixture_index(
    map: &ClassifierNameMap,
    sep_embs_for_skip: bool,
    classifier_name: &str,
) -> usize {
    if sep_embs_for_skip {
        map.index_of(classifier_name)
            .unwrap_or_else(|| panic!("classifier `{classifier_name}` missing from map"))
    } else {
        map.index_of(PRETRAIN_CLASSIFIER).unwrap_or(0)
    }
}
