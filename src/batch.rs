//! Batch structure consumed by the dispatch model
//!
//! Fields are task-kind dependent: single-input tasks fill `input1`, pair
//! tasks `input1`/`input2` (or a single joint `inputs` under a joint
//! encoder), multiple choice `question`/`choice{i}`, reading comprehension
//! `paragraph`/`question`/`answer` (or joint `para_quest_ans`). Targets,
//! masks and span metadata ride alongside as explicit optional fields.

use ndarray::{Array1, Array2, Array3};

/// Token indices for one input field: `(batch, seq_len)` word ids with
/// padding index 0, plus optional `(batch, seq_len, word_len)` character ids.
#[derive(Debug, Clone)]
pub struct TokenBatch {
    pub words: Array2<usize>,
    pub chars: Option<Array3<usize>>,
}

impl TokenBatch {
    pub fn from_words(words: Array2<usize>) -> Self {
        Self { words, chars: None }
    }

    pub fn batch_size(&self) -> usize {
        self.words.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.words.ncols()
    }
}

/// A label tensor as it arrives from the data pipeline; rank is not
/// guaranteed, so the squeezing rules live here: a 0-d label broadcasts to
/// size 1, and a 2-d label must have a trailing singleton dimension.
#[derive(Debug, Clone)]
pub enum LabelTensor {
    Scalar(f32),
    Vec(Array1<f32>),
    Mat(Array2<f32>),
}

impl LabelTensor {
    /// Apply the label-dimension squeezing rules, yielding a rank-1 tensor.
    pub fn squeeze(&self) -> Array1<f32> {
        match self {
            LabelTensor::Scalar(v) => Array1::from(vec![*v]),
            LabelTensor::Vec(v) => v.clone(),
            LabelTensor::Mat(m) => {
                assert_eq!(
                    m.ncols(),
                    1,
                    "labels with rank > 1 must have a trailing singleton dimension"
                );
                m.column(0).to_owned()
            }
        }
    }

    /// Squeezed labels as class indices.
    pub fn class_indices(&self) -> Array1<usize> {
        self.squeeze().mapv(|v| v as usize)
    }
}

/// Half-open `[start, end)` token span.
pub type Span = (usize, usize);

/// One training/inference batch: named token fields plus optional labels,
/// targets, masks, and span/index metadata.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub input1: Option<TokenBatch>,
    pub input2: Option<TokenBatch>,
    /// Joint single-sequence encoding of a pair.
    pub inputs: Option<TokenBatch>,
    pub question: Option<TokenBatch>,
    pub choices: Vec<TokenBatch>,
    pub paragraph: Option<TokenBatch>,
    pub answer: Option<TokenBatch>,
    pub para_quest_ans: Option<TokenBatch>,

    pub labels: Option<LabelTensor>,
    /// Forward-direction word targets for LM / generation, `(batch, seq_len)`.
    pub targs: Option<Array2<usize>>,
    /// Backward-direction word targets for bidirectional LM.
    pub targs_b: Option<Array2<usize>>,
    /// Positions to keep when computing tagging loss; 0 discards positions
    /// introduced by tokenization (sub-word continuation markers).
    pub keep_mask: Option<Array2<u8>>,
    /// Per-example metric mask for tagging-style sets scored as
    /// classification; masked-out examples count toward the loss but not
    /// the accuracy.
    pub tagmask: Option<Array1<u8>>,

    /// Target-word position per example for word-in-context tasks.
    pub idx1: Option<Array1<usize>>,
    pub idx2: Option<Array1<usize>>,

    /// Span boundaries per example for span classification / edge probing.
    pub spans1: Option<Vec<Vec<Span>>>,
    pub spans2: Option<Vec<Vec<Span>>>,
    /// Multi-hot span labels for edge probing, one row per span.
    pub span_labels: Option<Array2<f32>>,

    /// Paragraph/question indices for indexed metric bookkeeping.
    pub par_idx: Option<Vec<usize>>,
    pub qst_idx: Option<Vec<usize>>,
}

impl Batch {
    /// Fetch a required token field, panicking with the field name when the
    /// data pipeline failed to supply it.
    pub fn field<'a>(&'a self, name: &str, field: &'a Option<TokenBatch>) -> &'a TokenBatch {
        field
            .as_ref()
            .unwrap_or_else(|| panic!("batch missing required field `{name}`"))
    }

    /// Number of examples, taken from whichever input field is present.
    pub fn n_exs(&self) -> usize {
        for field in [
            &self.input1,
            &self.inputs,
            &self.question,
            &self.paragraph,
            &self.answer,
            &self.para_quest_ans,
        ] {
            if let Some(tb) = field {
                return tb.batch_size();
            }
        }
        if let Some(tb) = self.choices.first() {
            return tb.batch_size();
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_label_squeeze_scalar_broadcasts() {
        let labels = LabelTensor::Scalar(2.0);
        let squeezed = labels.squeeze();
        assert_eq!(squeezed.len(), 1);
        assert_eq!(squeezed[0], 2.0);
    }

    #[test]
    fn test_label_squeeze_matrix_drops_singleton() {
        let labels = LabelTensor::Mat(arr2(&[[1.0], [0.0], [2.0]]));
        let squeezed = labels.squeeze();
        assert_eq!(squeezed.len(), 3);
        assert_eq!(labels.class_indices().to_vec(), vec![1, 0, 2]);
    }

    #[test]
    #[should_panic(expected = "trailing singleton")]
    fn test_label_squeeze_rejects_wide_matrix() {
        let labels = LabelTensor::Mat(arr2(&[[1.0, 2.0], [0.0, 1.0]]));
        labels.squeeze();
    }

    #[test]
    fn test_n_exs_from_input1() {
        let batch = Batch {
            input1: Some(TokenBatch::from_words(arr2(&[[1, 2, 3], [4, 5, 0]]))),
            ..Batch::default()
        };
        assert_eq!(batch.n_exs(), 2);
    }

    #[test]
    fn test_n_exs_from_choices() {
        let batch = Batch {
            choices: vec![TokenBatch::from_words(arr2(&[[1, 2], [3, 4], [5, 6]]))],
            ..Batch::default()
        };
        assert_eq!(batch.n_exs(), 3);
    }

    #[test]
    #[should_panic(expected = "missing required field `input1`")]
    fn test_missing_field_panics_with_name() {
        let batch = Batch::default();
        batch.field("input1", &batch.input1);
    }
}
