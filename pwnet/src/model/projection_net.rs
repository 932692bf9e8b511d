// src/model/projection_net.rs
//
// Optional projection network mapping raw policy embeddings (L) into the
// prototype comparison space (D):
//
//     linear(L -> D) -> normalization -> ReLU -> linear(D -> D)
//
// Linear layers are evaluated row by row with a fixed summation order, so a
// row's transform in evaluation mode does not depend on what else is in the
// batch. Prototype projection relies on this.

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, ArrayViewMutD, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::Gradients;

pub const NORM_EPSILON: f64 = 1e-5;
pub const BATCH_NORM_MOMENTUM: f64 = 0.1;

/// Which normalization sits between the two linear layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormKind {
    /// Feature-wise batch normalization with affine parameters and running stats.
    Batch,
    /// Per-row normalization over features, no affine parameters.
    Instance,
}

/// Train uses batch statistics (and updates running stats); Eval uses frozen stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm {
    pub gamma: Array1<f64>,
    pub beta: Array1<f64>,
    pub running_mean: Array1<f64>,
    pub running_var: Array1<f64>,
    pub momentum: f64,
    pub eps: f64,
}

impl BatchNorm {
    fn new(dim: usize) -> Self {
        Self {
            gamma: Array1::ones(dim),
            beta: Array1::zeros(dim),
            running_mean: Array1::zeros(dim),
            running_var: Array1::ones(dim),
            momentum: BATCH_NORM_MOMENTUM,
            eps: NORM_EPSILON,
        }
    }

    fn update_running(&mut self, mean: &Array1<f64>, var_unbiased: &Array1<f64>) {
        let m = self.momentum;
        self.running_mean = &self.running_mean * (1.0 - m) + mean * m;
        self.running_var = &self.running_var * (1.0 - m) + var_unbiased * m;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Normalization {
    Batch(BatchNorm),
    Instance { eps: f64 },
}

#[derive(Debug, Clone)]
enum NormCache {
    /// `inv_std` per feature; `batch_stats` is false when running stats were used.
    Batch {
        xhat: Array2<f64>,
        inv_std: Array1<f64>,
        batch_stats: bool,
    },
    /// `inv_std` per row.
    Instance { xhat: Array2<f64>, inv_std: Array1<f64> },
}

/// Intermediate activations kept for the backward pass.
#[derive(Debug, Clone)]
pub struct NetCache {
    input: Array2<f64>,
    norm: NormCache,
    /// Post-normalization, pre-ReLU.
    normed: Array2<f64>,
    /// Post-ReLU.
    hidden: Array2<f64>,
}

struct BatchStats {
    mean: Array1<f64>,
    var_unbiased: Array1<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionNet {
    /// D × L
    pub w1: Array2<f64>,
    pub b1: Array1<f64>,
    pub norm: Normalization,
    /// D × D
    pub w2: Array2<f64>,
    pub b2: Array1<f64>,
}

fn uniform_matrix<R: Rng>(rng: &mut R, rows: usize, cols: usize, bound: f64) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..bound))
}

fn uniform_vector<R: Rng>(rng: &mut R, len: usize, bound: f64) -> Array1<f64> {
    Array1::from_shape_fn(len, |_| rng.gen_range(-bound..bound))
}

fn linear(x: &Array2<f64>, w: &Array2<f64>, b: &Array1<f64>) -> Array2<f64> {
    let mut out = Array2::zeros((x.nrows(), w.nrows()));
    for (i, xr) in x.rows().into_iter().enumerate() {
        for (j, wr) in w.rows().into_iter().enumerate() {
            out[[i, j]] = xr.dot(&wr) + b[j];
        }
    }
    out
}

impl ProjectionNet {
    /// Weights and biases uniform in `±1/sqrt(fan_in)`.
    pub fn new<R: Rng>(input_dim: usize, output_dim: usize, norm: NormKind, rng: &mut R) -> Self {
        let bound1 = 1.0 / (input_dim.max(1) as f64).sqrt();
        let bound2 = 1.0 / (output_dim.max(1) as f64).sqrt();
        let w1 = uniform_matrix(rng, output_dim, input_dim, bound1);
        let b1 = uniform_vector(rng, output_dim, bound1);
        let w2 = uniform_matrix(rng, output_dim, output_dim, bound2);
        let b2 = uniform_vector(rng, output_dim, bound2);
        let norm = match norm {
            NormKind::Batch => Normalization::Batch(BatchNorm::new(output_dim)),
            NormKind::Instance => Normalization::Instance { eps: NORM_EPSILON },
        };
        Self { w1, b1, norm, w2, b2 }
    }

    pub fn input_dim(&self) -> usize {
        self.w1.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.w2.nrows()
    }

    fn normalize(&self, h: &Array2<f64>, mode: Mode) -> (Array2<f64>, NormCache, Option<BatchStats>) {
        match &self.norm {
            Normalization::Batch(bn) => {
                let n = h.nrows();
                let (mean, var, stats) = if mode == Mode::Train && n > 1 {
                    let mean = h.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(h.ncols()));
                    let var = h.var_axis(Axis(0), 0.0);
                    let var_unbiased = &var * (n as f64 / (n as f64 - 1.0));
                    let stats = BatchStats {
                        mean: mean.clone(),
                        var_unbiased,
                    };
                    (mean, var, Some(stats))
                } else {
                    (bn.running_mean.clone(), bn.running_var.clone(), None)
                };
                let inv_std = var.mapv(|v| 1.0 / (v + bn.eps).sqrt());
                let xhat = (h - &mean) * &inv_std;
                let out = &xhat * &bn.gamma + &bn.beta;
                let cache = NormCache::Batch {
                    xhat,
                    inv_std,
                    batch_stats: stats.is_some(),
                };
                (out, cache, stats)
            }
            Normalization::Instance { eps } => {
                let mean = h.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(h.nrows()));
                let var = h.var_axis(Axis(1), 0.0);
                let inv_std = var.mapv(|v| 1.0 / (v + eps).sqrt());
                let xhat = (h - &mean.view().insert_axis(Axis(1))) * &inv_std.view().insert_axis(Axis(1));
                let cache = NormCache::Instance {
                    xhat: xhat.clone(),
                    inv_std,
                };
                (xhat, cache, None)
            }
        }
    }

    fn forward_impl(&self, x: &Array2<f64>, mode: Mode) -> (Array2<f64>, NetCache, Option<BatchStats>) {
        let h = linear(x, &self.w1, &self.b1);
        let (normed, norm, stats) = self.normalize(&h, mode);
        let hidden = normed.mapv(|v| v.max(0.0));
        let out = linear(&hidden, &self.w2, &self.b2);
        let cache = NetCache {
            input: x.clone(),
            norm,
            normed,
            hidden,
        };
        (out, cache, stats)
    }

    /// Forward pass keeping a cache for backprop. In `Train` mode batch
    /// normalization updates its running statistics.
    pub fn forward(&mut self, x: &Array2<f64>, mode: Mode) -> (Array2<f64>, NetCache) {
        let (out, cache, stats) = self.forward_impl(x, mode);
        if let (Normalization::Batch(bn), Some(stats)) = (&mut self.norm, stats) {
            bn.update_running(&stats.mean, &stats.var_unbiased);
        }
        (out, cache)
    }

    /// Forward pass without touching running statistics.
    pub fn forward_frozen(&self, x: &Array2<f64>, mode: Mode) -> (Array2<f64>, NetCache) {
        let (out, cache, _) = self.forward_impl(x, mode);
        (out, cache)
    }

    /// Evaluation-mode transform.
    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        self.forward_impl(x, Mode::Eval).0
    }

    /// Accumulate parameter gradients into `grads` and return d(loss)/d(input).
    pub fn backward(
        &self,
        cache: &NetCache,
        d_out: &Array2<f64>,
        grads: &mut Gradients,
    ) -> Result<Array2<f64>> {
        grads.accumulate("net.w2", &d_out.t().dot(&cache.hidden));
        grads.accumulate("net.b2", &d_out.sum_axis(Axis(0)));
        let d_hidden = d_out.dot(&self.w2);
        let mut d_normed = d_hidden;
        ndarray::Zip::from(&mut d_normed)
            .and(&cache.normed)
            .for_each(|g, &n| {
                if n <= 0.0 {
                    *g = 0.0;
                }
            });

        let d_h = match (&self.norm, &cache.norm) {
            (
                Normalization::Batch(bn),
                NormCache::Batch {
                    xhat,
                    inv_std,
                    batch_stats,
                },
            ) => {
                grads.accumulate("net.gamma", &(&d_normed * xhat).sum_axis(Axis(0)));
                grads.accumulate("net.beta", &d_normed.sum_axis(Axis(0)));
                let d_xhat = &d_normed * &bn.gamma;
                if *batch_stats {
                    let n = d_xhat.nrows() as f64;
                    let sum_d = d_xhat.sum_axis(Axis(0));
                    let sum_dx = (&d_xhat * xhat).sum_axis(Axis(0));
                    let centered = &d_xhat * n - &sum_d - &(xhat * &sum_dx);
                    centered * &(inv_std / n)
                } else {
                    d_xhat * inv_std
                }
            }
            (Normalization::Instance { .. }, NormCache::Instance { xhat, inv_std }) => {
                let k = d_normed.ncols() as f64;
                let sum_d = d_normed.sum_axis(Axis(1)).insert_axis(Axis(1));
                let sum_dx = (&d_normed * xhat).sum_axis(Axis(1)).insert_axis(Axis(1));
                let centered = &d_normed * k - &sum_d - &(xhat * &sum_dx);
                centered * &(inv_std / k).insert_axis(Axis(1))
            }
            (Normalization::Batch(_), NormCache::Instance { .. }) => {
                bail!("instance-norm cache handed to a batch-norm network")
            }
            (Normalization::Instance { .. }, NormCache::Batch { .. }) => {
                bail!("batch-norm cache handed to an instance-norm network")
            }
        };

        grads.accumulate("net.w1", &d_h.t().dot(&cache.input));
        grads.accumulate("net.b1", &d_h.sum_axis(Axis(0)));
        Ok(d_h.dot(&self.w1))
    }

    pub fn params_mut(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, f64>)> {
        let mut out = vec![
            ("net.w1", self.w1.view_mut().into_dyn()),
            ("net.b1", self.b1.view_mut().into_dyn()),
            ("net.w2", self.w2.view_mut().into_dyn()),
            ("net.b2", self.b2.view_mut().into_dyn()),
        ];
        if let Normalization::Batch(bn) = &mut self.norm {
            out.push(("net.gamma", bn.gamma.view_mut().into_dyn()));
            out.push(("net.beta", bn.beta.view_mut().into_dyn()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sample(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn eval_transform_is_row_independent() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let net = ProjectionNet::new(6, 4, NormKind::Instance, &mut rng);
        let x = sample(5, 6, 1);
        let all = net.transform(&x);
        let one = net.transform(&x.slice(ndarray::s![2..3, ..]).to_owned());
        assert_eq!(all.row(2), one.row(0));
    }

    #[test]
    fn batch_norm_train_updates_running_stats() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut net = ProjectionNet::new(3, 4, NormKind::Batch, &mut rng);
        let x = sample(8, 3, 2);
        net.forward(&x, Mode::Train);
        match &net.norm {
            Normalization::Batch(bn) => {
                assert!(bn.running_mean.iter().any(|&m| m != 0.0));
            }
            Normalization::Instance { .. } => unreachable!(),
        }
    }

    #[test]
    fn single_row_batch_uses_running_stats() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut net = ProjectionNet::new(3, 4, NormKind::Batch, &mut rng);
        let x = sample(1, 3, 2);
        let (train_out, _) = net.forward(&x, Mode::Train);
        assert_eq!(train_out, net.transform(&x));
    }

    #[test]
    fn instance_norm_rows_are_standardized() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let net = ProjectionNet::new(5, 6, NormKind::Instance, &mut rng);
        let x = sample(3, 5, 4);
        let h = linear(&x, &net.w1, &net.b1);
        let (normed, _, _) = net.normalize(&h, Mode::Eval);
        for row in normed.rows() {
            assert!(row.mean().unwrap().abs() < 1e-9);
        }
    }

    #[test]
    fn cache_from_another_norm_kind_is_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let batch = ProjectionNet::new(3, 4, NormKind::Batch, &mut rng);
        let instance = ProjectionNet::new(3, 4, NormKind::Instance, &mut rng);
        let x = sample(4, 3, 9);
        let (out, cache) = instance.forward_frozen(&x, Mode::Eval);
        let d_out = Array2::ones(out.raw_dim());
        let mut grads = Gradients::default();
        assert!(instance.backward(&cache, &d_out, &mut grads).is_ok());
        assert!(batch.backward(&cache, &d_out, &mut Gradients::default()).is_err());
    }
}
