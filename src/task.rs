//! Task descriptors
//!
//! A task is one supervised objective (classification, tagging, generation,
//! ...) sharing the common sentence encoder. The task kind is a closed enum:
//! both the module builder and the batch dispatcher match on it exhaustively,
//! so adding a kind without handling it everywhere is a compile error.

use serde::{Deserialize, Serialize};

/// Which sequence-generation family a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationVariant {
    /// Translation: targets in their own vocabulary namespace
    Translation,
    /// Monolingual seq2seq (denoising, paraphrase, ...)
    Seq2Seq,
}

/// Closed set of task kinds with their kind-specific metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    SingleClassification {
        n_classes: usize,
    },
    PairClassification {
        n_classes: usize,
        /// Word-in-context disambiguation: the head additionally consumes the
        /// target word's token representation from each sentence.
        word_in_context: bool,
    },
    PairRegression,
    PairOrdinalRegression,
    Tagging {
        n_tags: usize,
    },
    MultipleChoice {
        n_choices: usize,
    },
    EdgeProbing {
        n_labels: usize,
        n_spans: usize,
    },
    SpanClassification {
        n_classes: usize,
        n_spans: usize,
    },
    LanguageModeling,
    /// Language modeling used to train parse-inducing encoders; always
    /// left-to-right.
    LanguageModelingParsing,
    SequenceGeneration {
        variant: GenerationVariant,
        target_namespace: String,
    },
    /// Multiple-choice reading comprehension: each (paragraph, question,
    /// answer) triple is classified independently.
    ReadingComprehension,
    /// Diagnostic set scored with another task's classifier (via
    /// `use_classifier`).
    Diagnostic {
        n_classes: usize,
    },
}

/// Immutable identity and metadata for one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub name: String,
    pub kind: TaskKind,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// True for kinds whose labels are continuous and scored with MSE.
    pub fn is_regression(&self) -> bool {
        matches!(
            self.kind,
            TaskKind::PairRegression | TaskKind::PairOrdinalRegression
        )
    }

    /// True for language-modeling kinds; their presence constrains the
    /// sentence-encoder choice.
    pub fn is_language_modeling(&self) -> bool {
        matches!(
            self.kind,
            TaskKind::LanguageModeling | TaskKind::LanguageModelingParsing
        )
    }

    /// Number of output classes for classification-family kinds.
    pub fn n_classes(&self) -> Option<usize> {
        match self.kind {
            TaskKind::SingleClassification { n_classes }
            | TaskKind::PairClassification { n_classes, .. }
            | TaskKind::SpanClassification { n_classes, .. }
            | TaskKind::Diagnostic { n_classes } => Some(n_classes),
            TaskKind::ReadingComprehension => Some(2),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regression_predicate() {
        let t = TaskDescriptor::new("sts-b", TaskKind::PairRegression);
        assert!(t.is_regression());
        let t = TaskDescriptor::new("sst2", TaskKind::SingleClassification { n_classes: 2 });
        assert!(!t.is_regression());
    }

    #[test]
    fn test_lm_predicate() {
        let t = TaskDescriptor::new("wiki103", TaskKind::LanguageModeling);
        assert!(t.is_language_modeling());
        let t = TaskDescriptor::new("wsj-lm", TaskKind::LanguageModelingParsing);
        assert!(t.is_language_modeling());
    }

    #[test]
    fn test_n_classes() {
        let t = TaskDescriptor::new("mnli", TaskKind::PairClassification {
            n_classes: 3,
            word_in_context: false,
        });
        assert_eq!(t.n_classes(), Some(3));
        let t = TaskDescriptor::new("multirc", TaskKind::ReadingComprehension);
        assert_eq!(t.n_classes(), Some(2));
        let t = TaskDescriptor::new("wiki103", TaskKind::LanguageModeling);
        assert_eq!(t.n_classes(), None);
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let t = TaskDescriptor::new(
            "wmt",
            TaskKind::SequenceGeneration {
                variant: GenerationVariant::Translation,
                target_namespace: "targets".to_string(),
            },
        );
        let json = serde_json::to_string(&t).unwrap();
        let back: TaskDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
