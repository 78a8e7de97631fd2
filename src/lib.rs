//! Multi-task NLU model assembly
//!
//! Builds a multi-task natural-language-understanding model from a
//! configuration, a task roster and a vocabulary, then dispatches
//! (task, batch) pairs to the right forward routine:
//! - Embedding assembly (word / character / contextual sources)
//! - One shared sentence encoder chosen from a closed strategy set
//! - Per-task heads, parameters and metric accumulators in explicit maps
//! - Classifier reuse across tasks through a single-step name alias
//! - A persisted classifier-name map keeping contextual-mixture indices
//!   stable across runs
//!
//! # Example
//!
//! ```
//! use multitarea::{build_model, Batch, LabelTensor, ModelConfig, TaskDescriptor, TaskKind,
//!                  TokenBatch, Vocab};
//! use ndarray::{arr1, arr2};
//!
//! let cfg = ModelConfig::tiny();
//! let vocab = Vocab::with_n_words(16);
//! let tasks = vec![TaskDescriptor::new(
//!     "sst2",
//!     TaskKind::SingleClassification { n_classes: 2 },
//! )];
//! let mut model = build_model(&cfg, &vocab, None, &tasks).unwrap();
//!
//! let batch = Batch {
//!     input1: Some(TokenBatch::from_words(arr2(&[[2, 3, 4, 0]]))),
//!     labels: Some(LabelTensor::Vec(arr1(&[1.0]))),
//!     ..Batch::default()
//! };
//! let out = model.forward(&tasks[0], &batch, true);
//! assert!(out.loss.is_some());
//! ```

pub mod batch;
pub mod classifier_map;
pub mod config;
pub mod embed;
pub mod encoder;
pub mod error;
pub mod factory;
pub mod heads;
pub mod metrics;
pub mod model;
pub mod nn;
pub mod params;
pub mod task;
pub mod vocab;

pub use batch::{Batch, LabelTensor, Span, TokenBatch};
pub use classifier_map::{ClassifierNameMap, CLASSIFIER_MAP_FILE, PRETRAIN_CLASSIFIER};
pub use config::{
    DecoderAttention, ModelConfig, Seq2SeqConfig, SentEncKind, TaskOverrides, WordEmbs,
};
pub use embed::build_embeddings;
pub use encoder::{build_sent_encoder, SharedEncoder};
pub use error::{ModelError, Result};
pub use factory::{build_task_modules, TaskModules};
pub use heads::TaskModule;
pub use metrics::TaskMetric;
pub use model::{build_model, MultiTaskModel, Predictions, TaskOutput};
pub use params::{resolve_task_params, TaskParams};
pub use task::{GenerationVariant, TaskDescriptor, TaskKind};
pub use vocab::Vocab;
