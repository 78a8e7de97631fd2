//! Model configuration
//!
//! One flat struct carries every knob the builders consume, with serde
//! round-tripping and a `tiny()` preset for tests. Per-task overrides live in
//! an explicit map rather than dynamically-named attributes; the resolver in
//! `params` merges them with the global defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Word-embedding source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordEmbs {
    /// No word-level table (contextual embeddings only)
    None,
    /// Trained from scratch at `d_word`
    Scratch,
    /// Loaded from a pretrained table supplied to `build_model`
    Pretrained,
}

/// Shared contextualization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentEncKind {
    /// Ordered-neurons recurrent layer
    Onlstm,
    /// Parse-inducing recurrent layer
    Prpn,
    /// Bidirectional language-model recurrent layer
    Bilm,
    /// No contextualization; heads pool raw embeddings
    Bow,
    /// Plain bidirectional recurrent layer
    Rnn,
    /// Stacked self-attention
    Transformer,
    /// Pass-through; requires the raw-embedding skip connection
    None,
}

/// Attention variant for the sequence-generation decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderAttention {
    None,
    Dot,
    Bilinear,
}

/// Sequence-generation decoder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seq2SeqConfig {
    pub d_hid_dec: usize,
    pub n_layers_dec: usize,
    pub output_proj_input_dim: usize,
    pub attention: DecoderAttention,
}

/// Per-task overrides for classifier hyperparameters. Unset fields fall back
/// to the global defaults in `ModelConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOverrides {
    pub classifier: Option<String>,
    pub classifier_hid_dim: Option<usize>,
    pub d_proj: Option<usize>,
    pub pair_attn: Option<bool>,
    pub d_hid_attn: Option<usize>,
    pub classifier_dropout: Option<f32>,
    pub classifier_loss_fn: Option<String>,
    pub classifier_span_pooling: Option<String>,
    pub edgeprobe_cnn_context: Option<usize>,
    /// Reuse another task's classifier instead of building one.
    pub use_classifier: Option<String>,
}

/// Everything the model builders need to know
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    // Embedding sources
    pub word_embs: WordEmbs,
    pub d_word: usize,
    pub embeddings_train: bool,
    pub char_embs: bool,
    pub d_char: usize,
    pub n_char_filters: usize,
    pub char_filter_sizes: Vec<usize>,
    /// Contextual recurrent embedding appended as a residual add-on.
    /// Requires pretrained word vectors.
    pub contextual_recurrent: bool,
    /// Full contextual token embedder with per-classifier layer mixtures.
    pub contextual: bool,
    /// Restrict the contextual embedder to its character CNN only.
    pub contextual_chars_only: bool,
    /// Joint-encoding embedder: pairs arrive as one concatenated sequence and
    /// heads pool the first token instead of max-pooling.
    pub joint_encoder: bool,

    // Sentence encoder
    pub sent_enc: SentEncKind,
    pub d_hid: usize,
    pub n_layers_enc: usize,
    pub n_layers_highway: usize,
    pub d_tproj: usize,
    pub d_ff: usize,
    pub n_heads: usize,
    /// Concatenate raw embeddings onto the encoder output.
    pub skip_embs: bool,
    /// Separate contextual-mixture weights per classifier, persisted in the
    /// classifier map file.
    pub sep_embs_for_skip: bool,
    pub dropout: f32,

    // Classifier defaults
    pub classifier: String,
    pub classifier_hid_dim: usize,
    pub d_proj: usize,
    pub classifier_dropout: f32,
    pub pair_attn: bool,
    pub d_hid_attn: usize,
    /// One pair-attention instance shared by every task that opts in.
    pub shared_pair_attn: bool,
    pub classifier_loss_fn: String,
    pub classifier_span_pooling: String,
    pub edgeprobe_cnn_context: usize,

    // Sequence generation
    pub s2s: Seq2SeqConfig,
    pub max_seq_len: usize,
    pub max_word_v_size: usize,

    // Run state
    pub run_dir: PathBuf,
    pub do_pretrain: bool,
    pub allow_missing_task_map: bool,

    pub task_overrides: HashMap<String, TaskOverrides>,
}

impl ModelConfig {
    /// Small configuration for tests: scratch word embeddings, plain
    /// recurrent encoder, every optional source off.
    pub fn tiny() -> Self {
        Self {
            word_embs: WordEmbs::Scratch,
            d_word: 16,
            embeddings_train: true,
            char_embs: false,
            d_char: 8,
            n_char_filters: 4,
            char_filter_sizes: vec![2, 3],
            contextual_recurrent: false,
            contextual: false,
            contextual_chars_only: false,
            joint_encoder: false,
            sent_enc: SentEncKind::Rnn,
            d_hid: 8,
            n_layers_enc: 1,
            n_layers_highway: 0,
            d_tproj: 8,
            d_ff: 16,
            n_heads: 2,
            skip_embs: false,
            sep_embs_for_skip: false,
            dropout: 0.2,
            classifier: "mlp".to_string(),
            classifier_hid_dim: 8,
            d_proj: 8,
            classifier_dropout: 0.2,
            pair_attn: false,
            d_hid_attn: 8,
            shared_pair_attn: false,
            classifier_loss_fn: "softmax".to_string(),
            classifier_span_pooling: "mean".to_string(),
            edgeprobe_cnn_context: 0,
            s2s: Seq2SeqConfig {
                d_hid_dec: 8,
                n_layers_dec: 1,
                output_proj_input_dim: 8,
                attention: DecoderAttention::Dot,
            },
            max_seq_len: 16,
            max_word_v_size: 64,
            run_dir: PathBuf::from("."),
            do_pretrain: true,
            allow_missing_task_map: false,
            task_overrides: HashMap::new(),
        }
    }

    /// Overrides for one task, or an empty set when none were given.
    pub fn overrides_for(&self, task_name: &str) -> TaskOverrides {
        self.task_overrides.get(task_name).cloned().unwrap_or_default()
    }
}
