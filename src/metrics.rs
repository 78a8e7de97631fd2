//! Per-task metric accumulators
//!
//! The dispatcher's only side effect: whenever labels are present, the
//! forward routine pushes (predictions-or-logits, labels) into the task's
//! accumulator. External reporting code reads and resets the value; the
//! metric mathematics themselves stay deliberately small.

use ndarray::{Array1, Array2};

/// Running mean of scalar observations (loss tracking for LM / generation)
#[derive(Debug, Clone, Default)]
pub struct Average {
    sum: f64,
    count: usize,
}

impl Average {
    pub fn update(&mut self, value: f32) {
        self.sum += f64::from(value);
        self.count += 1;
    }

    pub fn value(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }
}

/// Argmax accuracy over class logits
#[derive(Debug, Clone, Default)]
pub struct CategoricalAccuracy {
    correct: usize,
    total: usize,
}

impl CategoricalAccuracy {
    pub fn update(&mut self, logits: &Array2<f32>, labels: &Array1<usize>) {
        assert_eq!(
            logits.nrows(),
            labels.len(),
            "logits and labels must agree on example count"
        );
        for (row, &label) in logits.rows().into_iter().zip(labels.iter()) {
            if argmax(row.iter().copied()) == label {
                self.correct += 1;
            }
            self.total += 1;
        }
    }

    pub fn value(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f32 / self.total as f32
        }
    }

    pub fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}

/// Mean squared error accumulator for regression tasks
#[derive(Debug, Clone, Default)]
pub struct MseMetric {
    sum_sq: f64,
    count: usize,
}

impl MseMetric {
    pub fn update(&mut self, scores: &Array1<f32>, labels: &Array1<f32>) {
        assert_eq!(scores.len(), labels.len());
        for (&s, &l) in scores.iter().zip(labels.iter()) {
            self.sum_sq += f64::from((s - l) * (s - l));
            self.count += 1;
        }
    }

    pub fn value(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum_sq / self.count as f64) as f32
        }
    }

    pub fn reset(&mut self) {
        self.sum_sq = 0.0;
        self.count = 0;
    }
}

/// Accuracy grouped by (paragraph, question) index pairs, for reading
/// comprehension where per-question aggregates matter.
#[derive(Debug, Clone, Default)]
pub struct IndexedAccuracy {
    inner: CategoricalAccuracy,
    groups: Vec<(usize, usize)>,
}

impl IndexedAccuracy {
    pub fn update(
        &mut self,
        logits: &Array2<f32>,
        labels: &Array1<usize>,
        idxs: &[(usize, usize)],
    ) {
        assert_eq!(logits.nrows(), idxs.len(), "one index pair per example");
        self.inner.update(logits, labels);
        self.groups.extend_from_slice(idxs);
    }

    pub fn value(&self) -> f32 {
        self.inner.value()
    }

    pub fn reset(&mut self) {
        self.inner.reset();
        self.groups.clear();
    }
}

/// The accumulator owned by one task; which variant depends on the task kind.
#[derive(Debug, Clone)]
pub enum TaskMetric {
    Accuracy(CategoricalAccuracy),
    Mse(MseMetric),
    AvgLoss(Average),
    Indexed(IndexedAccuracy),
}

impl TaskMetric {
    pub fn value(&self) -> f32 {
        match self {
            TaskMetric::Accuracy(m) => m.value(),
            TaskMetric::Mse(m) => m.value(),
            TaskMetric::AvgLoss(m) => m.value(),
            TaskMetric::Indexed(m) => m.value(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            TaskMetric::Accuracy(m) => m.reset(),
            TaskMetric::Mse(m) => m.reset(),
            TaskMetric::AvgLoss(m) => m.reset(),
            TaskMetric::Indexed(m) => m.reset(),
        }
    }
}

pub(crate) fn argmax(values: impl Iterator<Item = f32>) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, v) in values.enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}
