//! Small forward-only neural primitives
//!
//! Linear maps, simple recurrences, highway layers and attention helpers
//! shared by the embedder, the sentence encoder and the task heads. Weights
//! use deterministic sin-pattern initialisation so builds are reproducible
//! without a random-number dependency.

use ndarray::{concatenate, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};

/// Xavier-scaled deterministic initialisation.
pub(crate) fn sin_init(rows: usize, cols: usize, seed: f32) -> Array2<f32> {
    let scale = (2.0 / (rows + cols) as f32).sqrt();
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        (((i * cols + j) as f32) * seed).sin() * scale
    })
}

pub(crate) fn softmax1(x: &Array1<f32>) -> Array1<f32> {
    let max = x.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp = x.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Fully-connected layer
#[derive(Debug, Clone)]
pub struct Linear {
    pub w: Array2<f32>,
    pub b: Array1<f32>,
}

impl Linear {
    pub fn new(d_in: usize, d_out: usize, seed: f32) -> Self {
        Self {
            w: sin_init(d_in, d_out, seed),
            b: Array1::zeros(d_out),
        }
    }

    pub fn d_in(&self) -> usize {
        self.w.nrows()
    }

    pub fn d_out(&self) -> usize {
        self.w.ncols()
    }

    pub fn forward1(&self, x: ArrayView1<f32>) -> Array1<f32> {
        x.dot(&self.w) + &self.b
    }

    pub fn forward2(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.w) + &self.b
    }

    /// Apply to every position of a `(batch, seq, d_in)` tensor.
    pub fn forward3(&self, x: &Array3<f32>) -> Array3<f32> {
        let (b, l, _) = x.dim();
        let mut out = Array3::zeros((b, l, self.d_out()));
        for i in 0..b {
            let y = x.index_axis(Axis(0), i).dot(&self.w) + &self.b;
            out.index_axis_mut(Axis(0), i).assign(&y);
        }
        out
    }

    pub fn param_count(&self) -> usize {
        self.w.len() + self.b.len()
    }
}

/// Single-direction tanh recurrence
#[derive(Debug, Clone)]
pub struct Rnn {
    w: Array2<f32>,
    u: Array2<f32>,
    d_hid: usize,
}

impl Rnn {
    pub fn new(d_in: usize, d_hid: usize, seed: f32) -> Self {
        Self {
            w: sin_init(d_in, d_hid, seed),
            u: sin_init(d_hid, d_hid, seed * 1.7),
            d_hid,
        }
    }

    pub fn d_hid(&self) -> usize {
        self.d_hid
    }

    /// Run over `(batch, seq, d_in)`, returning `(batch, seq, d_hid)`.
    /// With `reverse` the recurrence consumes the sequence right-to-left but
    /// outputs stay position-aligned.
    pub fn forward(&self, x: &Array3<f32>, reverse: bool) -> Array3<f32> {
        let (b, l, _) = x.dim();
        let mut out = Array3::zeros((b, l, self.d_hid));
        for i in 0..b {
            let mut h: Array1<f32> = Array1::zeros(self.d_hid);
            let steps: Vec<usize> = if reverse {
                (0..l).rev().collect()
            } else {
                (0..l).collect()
            };
            for t in steps {
                let x_t = x.index_axis(Axis(0), i);
                let pre = x_t.row(t).dot(&self.w) + h.dot(&self.u);
                h = pre.mapv(f32::tanh);
                out.index_axis_mut(Axis(0), i).row_mut(t).assign(&h);
            }
        }
        out
    }

    pub fn param_count(&self) -> usize {
        self.w.len() + self.u.len()
    }
}

/// Bidirectional tanh recurrence; output width is `2 * d_hid`
#[derive(Debug, Clone)]
pub struct BiRnn {
    fwd: Rnn,
    bwd: Rnn,
}

impl BiRnn {
    pub fn new(d_in: usize, d_hid: usize, seed: f32) -> Self {
        Self {
            fwd: Rnn::new(d_in, d_hid, seed),
            bwd: Rnn::new(d_in, d_hid, seed * 2.3),
        }
    }

    pub fn d_out(&self) -> usize {
        2 * self.fwd.d_hid()
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let f = self.fwd.forward(x, false);
        let b = self.bwd.forward(x, true);
        concatenate(Axis(2), &[f.view(), b.view()]).unwrap()
    }

    pub fn param_count(&self) -> usize {
        self.fwd.param_count() + self.bwd.param_count()
    }
}

/// Highway layer: gated blend of a transform and the identity
#[derive(Debug, Clone)]
pub struct Highway {
    transform: Linear,
    gate: Linear,
}

impl Highway {
    pub fn new(dim: usize, seed: f32) -> Self {
        Self {
            transform: Linear::new(dim, dim, seed),
            gate: Linear::new(dim, dim, seed * 3.1),
        }
    }

    pub fn forward(&self, x: &Array3<f32>) -> Array3<f32> {
        let h = self.transform.forward3(x).mapv(f32::tanh);
        let g = self.gate.forward3(x).mapv(sigmoid);
        &g * &h + (1.0 - &g) * x
    }

    pub fn param_count(&self) -> usize {
        self.transform.param_count() + self.gate.param_count()
    }
}

/// Scaled dot-product attention of `q` over `(k, v)` rows, respecting a
/// validity mask on the key side.
pub(crate) fn dot_attention(
    q: ArrayView2<f32>,
    kv: ArrayView2<f32>,
    kv_mask: ArrayView1<f32>,
) -> Array2<f32> {
    let d = q.ncols() as f32;
    let mut out = Array2::zeros(q.raw_dim());
    for (qi, q_row) in q.rows().into_iter().enumerate() {
        let mut scores: Array1<f32> = kv.rows().into_iter().map(|k| q_row.dot(&k)).collect();
        scores /= d.sqrt();
        for (s, &m) in scores.iter_mut().zip(kv_mask.iter()) {
            if m == 0.0 {
                *s = f32::NEG_INFINITY;
            }
        }
        let weights = softmax1(&scores);
        let mut ctx: Array1<f32> = Array1::zeros(kv.ncols());
        for (w, v_row) in weights.iter().zip(kv.rows()) {
            ctx = ctx + v_row.mapv(|v| v * w);
        }
        out.row_mut(qi).assign(&ctx);
    }
    out
}

/// Zero out padded positions of a `(batch, seq, d)` representation.
pub(crate) fn mask_fill(reps: &mut Array3<f32>, mask: &Array2<f32>) {
    let (b, l, _) = reps.dim();
    for i in 0..b {
        for t in 0..l {
            if mask[[i, t]] == 0.0 {
                reps.index_axis_mut(Axis(0), i).row_mut(t).fill(0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    #[test]
    fn test_linear_shapes() {
        let lin = Linear::new(4, 3, 0.123);
        let x = Array2::from_elem((2, 4), 0.5);
        let y = lin.forward2(&x);
        assert_eq!(y.dim(), (2, 3));
        let x3 = Array3::from_elem((2, 5, 4), 0.5);
        assert_eq!(lin.forward3(&x3).dim(), (2, 5, 3));
        assert_eq!(lin.param_count(), 4 * 3 + 3);
    }

    #[test]
    fn test_rnn_output_width_and_finiteness() {
        let rnn = Rnn::new(4, 6, 0.2);
        let x = Array3::from_elem((2, 3, 4), 0.1);
        let y = rnn.forward(&x, false);
        assert_eq!(y.dim(), (2, 3, 6));
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_birnn_concatenates_directions() {
        let rnn = BiRnn::new(4, 5, 0.3);
        let x = Array3::from_elem((1, 3, 4), 0.1);
        assert_eq!(rnn.forward(&x).dim(), (1, 3, 10));
        assert_eq!(rnn.d_out(), 10);
    }

    #[test]
    fn test_highway_preserves_shape() {
        let hw = Highway::new(4, 0.4);
        let x = Array3::from_elem((2, 3, 4), 0.2);
        assert_eq!(hw.forward(&x).dim(), (2, 3, 4));
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax1(&ndarray::arr1(&[1.0, 2.0, 3.0]));
        assert_relative_eq!(p.sum(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_dot_attention_ignores_masked_keys() {
        let q = arr2(&[[1.0, 0.0]]);
        let kv = arr2(&[[1.0, 0.0], [0.0, 100.0]]);
        let mask = ndarray::arr1(&[1.0, 0.0]);
        let out = dot_attention(q.view(), kv.view(), mask.view());
        // Second key is masked out, so the context is the first row exactly.
        assert_relative_eq!(out[[0, 0]], 1.0, epsilon = 1e-5);
        assert_relative_eq!(out[[0, 1]], 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_mask_fill_zeroes_padded_positions() {
        let mut reps = Array3::from_elem((1, 2, 3), 1.0);
        let mask = arr2(&[[1.0, 0.0]]);
        mask_fill(&mut reps, &mask);
        assert_eq!(reps[[0, 0, 0]], 1.0);
        assert_eq!(reps[[0, 1, 2]], 0.0);
    }
}
