// src/model/output.rs
//
// Output activations applied to the assignment-layer logits, plus the small
// row-wise numeric helpers (softmax, argmax) shared by the model and losses.

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

/// Elementwise activation for a single continuous output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    /// Signed control in (-1, 1).
    Tanh,
    /// Magnitude-only control in [0, inf).
    Relu,
    Identity,
}

impl Activation {
    fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.max(0.0),
            Activation::Identity => x,
        }
    }

    /// Derivative expressed through the input `x` and output `y`.
    fn derivative(self, x: f64, y: f64) -> f64 {
        match self {
            Activation::Tanh => 1.0 - y * y,
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Identity => 1.0,
        }
    }
}

/// Activation mapping logits (batch × channels) to surrogate outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputActivation {
    /// Probabilities over discrete actions.
    Softmax,
    /// Tanh on every channel.
    Tanh,
    /// One activation per channel.
    PerChannel(Vec<Activation>),
    Identity,
}

impl OutputActivation {
    /// Per-channel activations for `channels` logit columns.
    fn channels(&self, channels: usize) -> Result<Vec<Activation>> {
        Ok(match self {
            OutputActivation::Tanh => vec![Activation::Tanh; channels],
            OutputActivation::PerChannel(acts) => {
                if acts.len() != channels {
                    bail!(
                        "{} per-channel activations for {channels} output channels",
                        acts.len()
                    );
                }
                acts.clone()
            }
            OutputActivation::Identity | OutputActivation::Softmax => {
                vec![Activation::Identity; channels]
            }
        })
    }

    pub fn apply(&self, logits: &Array2<f64>) -> Result<Array2<f64>> {
        if let OutputActivation::Softmax = self {
            return Ok(softmax_rows(logits));
        }
        let acts = self.channels(logits.ncols())?;
        let mut out = logits.clone();
        for mut row in out.rows_mut() {
            for (v, act) in row.iter_mut().zip(&acts) {
                *v = act.apply(*v);
            }
        }
        Ok(out)
    }

    /// Pull a gradient w.r.t. the outputs back to the logits.
    pub fn backward(
        &self,
        logits: &Array2<f64>,
        outputs: &Array2<f64>,
        d_outputs: &Array2<f64>,
    ) -> Result<Array2<f64>> {
        if let OutputActivation::Softmax = self {
            let mut d = Array2::zeros(logits.raw_dim());
            for b in 0..logits.nrows() {
                let y = outputs.row(b);
                let g = d_outputs.row(b);
                let dot = y.dot(&g);
                for k in 0..logits.ncols() {
                    d[[b, k]] = y[k] * (g[k] - dot);
                }
            }
            return Ok(d);
        }
        let acts = self.channels(logits.ncols())?;
        let mut d = d_outputs.clone();
        for ((b, k), v) in d.indexed_iter_mut() {
            *v *= acts[k].derivative(logits[[b, k]], outputs[[b, k]]);
        }
        Ok(d)
    }
}

/// Numerically stable row-wise softmax.
pub fn softmax_rows(x: &Array2<f64>) -> Array2<f64> {
    let mut out = x.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Stable softmax of a single vector.
pub fn softmax(x: ArrayView1<f64>) -> Array1<f64> {
    let max = x.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
    let e = x.mapv(|v| (v - max).exp());
    let sum = e.sum();
    e / sum
}

/// Row-wise log-sum-exp.
pub fn logsumexp_rows(x: &Array2<f64>) -> Array1<f64> {
    x.map_axis(Axis(1), |row| {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        max + row.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
    })
}

/// Index of the largest element; the first index wins on ties.
pub fn argmax(x: ArrayView1<f64>) -> usize {
    let mut best = 0;
    for (i, &v) in x.iter().enumerate() {
        if v > x[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = array![[1000.0, 1000.0], [0.0, -1.0]];
        let y = softmax_rows(&x);
        for row in y.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
        assert!((y[[0, 0]] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn per_channel_bounds() {
        let act = OutputActivation::PerChannel(vec![Activation::Tanh, Activation::Relu, Activation::Relu]);
        let y = act.apply(&array![[5.0, -2.0, 3.0]]).unwrap();
        assert!((y[[0, 0]] - 5f64.tanh()).abs() < 1e-12);
        assert_eq!(y[[0, 1]], 0.0);
        assert_eq!(y[[0, 2]], 3.0);
    }

    #[test]
    fn per_channel_width_must_match_logits() {
        let act = OutputActivation::PerChannel(vec![Activation::Tanh, Activation::Relu]);
        let logits = array![[0.5, 0.5, 0.5]];
        assert!(act.apply(&logits).is_err());
        assert!(act.backward(&logits, &logits, &logits).is_err());
        assert!(OutputActivation::Tanh.apply(&logits).is_ok());
    }

    #[test]
    fn argmax_first_wins() {
        assert_eq!(argmax(array![1.0, 3.0, 3.0].view()), 1);
        assert_eq!(argmax(array![-1.0].view()), 0);
    }
}
