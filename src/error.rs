//! Model build error types
//!
//! Configuration errors are fatal and raised at build time; the operator
//! fixes the configuration and reruns. Forward-time invariant violations are
//! asserts in the forward routines, not values of this type.

use thiserror::Error;

/// Errors raised while assembling the model
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no embeddings enabled: every embedding source is turned off")]
    NoEmbeddings,

    #[error("invalid encoder configuration: {0}")]
    InvalidEncoder(String),

    #[error("invalid embedding configuration: {0}")]
    InvalidEmbeddings(String),

    #[error("classifier map {0} should already exist (continuation run without do_pretrain or allow_missing_task_map)")]
    MissingClassifierMap(String),

    #[error("classifier map {0} violates its invariants: {1}")]
    CorruptClassifierMap(String, String),

    #[error("unknown classifier type: {0}")]
    UnknownClassifierType(String),

    #[error("unknown span pooling strategy: {0}")]
    UnknownSpanPooling(String),

    #[error("unknown classifier loss function: {0}")]
    UnknownLossFunction(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("classifier map is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for model-build operations
pub type Result<T> = std::result::Result<T, ModelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ModelError::NoEmbeddings;
        assert!(format!("{}", err).contains("no embeddings enabled"));

        let err = ModelError::InvalidEncoder("bow with skip_embs".to_string());
        assert!(format!("{}", err).contains("bow with skip_embs"));

        let err = ModelError::MissingClassifierMap("run/classifier_task_map.json".to_string());
        assert!(format!("{}", err).contains("should already exist"));

        let err = ModelError::UnknownClassifierType("svm".to_string());
        assert!(format!("{}", err).contains("svm"));
    }
}
