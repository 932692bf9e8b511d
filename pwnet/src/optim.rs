// src/optim.rs
//
// Adam with L2 weight decay folded into the gradient, plus a per-epoch
// exponential learning-rate decay.
//
// Moment estimates are keyed by parameter name, so a parameter replaced in
// place (prototype projection) keeps its optimizer state.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use ndarray::{ArrayD, ArrayViewMutD, Zip};

use crate::model::Gradients;

#[derive(Debug, Clone)]
struct Moments {
    m: ArrayD<f64>,
    v: ArrayD<f64>,
}

#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    step: u64,
    state: BTreeMap<&'static str, Moments>,
}

impl Adam {
    pub fn new(lr: f64, weight_decay: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            step: 0,
            state: BTreeMap::new(),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn steps_taken(&self) -> u64 {
        self.step
    }

    /// One update of every parameter that has a gradient. A gradient whose
    /// shape differs from its parameter fails the step before anything moves.
    pub fn step(
        &mut self,
        params: Vec<(&'static str, ArrayViewMutD<'_, f64>)>,
        grads: &Gradients,
    ) -> Result<()> {
        if let Some(name) = grads.conflicts().first() {
            bail!("gradient contributions for {name} disagree on shape");
        }
        for (name, param) in &params {
            if let Some(grad) = grads.get(name) {
                if grad.shape() != param.shape() {
                    bail!(
                        "gradient for {name} has shape {:?}, parameter has {:?}",
                        grad.shape(),
                        param.shape()
                    );
                }
            }
        }

        self.step += 1;
        let t = self.step as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);
        let (b1, b2, eps, wd, lr) = (self.beta1, self.beta2, self.eps, self.weight_decay, self.lr);

        for (name, mut param) in params {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let moments = self.state.entry(name).or_insert_with(|| Moments {
                m: ArrayD::zeros(param.raw_dim()),
                v: ArrayD::zeros(param.raw_dim()),
            });
            Zip::from(&mut param)
                .and(grad)
                .and(&mut moments.m)
                .and(&mut moments.v)
                .for_each(|p, &g, m, v| {
                    let g = g + wd * *p;
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
        Ok(())
    }
}

/// Multiply the learning rate by `gamma` once per epoch.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialDecay {
    pub gamma: f64,
}

impl ExponentialDecay {
    pub fn step(&self, optimizer: &mut Adam) {
        optimizer.set_learning_rate(optimizer.learning_rate() * self.gamma);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut p: Array1<f64> = array![1.0, -2.0];
        let mut grads = Gradients::default();
        grads.accumulate("w", &array![0.5, -3.0]);
        let mut adam = Adam::new(0.1, 0.0);
        adam.step(vec![("w", p.view_mut().into_dyn())], &grads).unwrap();
        // Bias-corrected first step is lr * g / |g|.
        assert!((p[0] - 0.9).abs() < 1e-6);
        assert!((p[1] + 1.9).abs() < 1e-6);
    }

    #[test]
    fn params_without_gradients_are_untouched() {
        let mut p: Array1<f64> = array![1.0];
        let mut adam = Adam::new(0.1, 0.0);
        adam.step(vec![("frozen", p.view_mut().into_dyn())], &Gradients::default())
            .unwrap();
        assert_eq!(p[0], 1.0);
    }

    #[test]
    fn misshapen_gradient_fails_without_moving_anything() {
        let mut w: Array1<f64> = array![1.0, 2.0];
        let mut b: Array1<f64> = array![3.0];
        let mut grads = Gradients::default();
        grads.accumulate("w", &array![0.5, 0.5]);
        grads.accumulate("b", &array![1.0, 1.0]);
        let mut adam = Adam::new(0.1, 0.0);
        let err = adam
            .step(
                vec![("w", w.view_mut().into_dyn()), ("b", b.view_mut().into_dyn())],
                &grads,
            )
            .unwrap_err();
        assert!(err.to_string().contains("gradient for b"));
        assert_eq!(w, array![1.0, 2.0]);
        assert_eq!(b, array![3.0]);
        assert_eq!(adam.steps_taken(), 0);
    }

    #[test]
    fn conflicting_contributions_fail_the_step() {
        let mut w: Array1<f64> = array![1.0, 2.0];
        let mut grads = Gradients::default();
        grads.accumulate("w", &array![0.5, 0.5]);
        grads.accumulate("w", &array![[1.0, 1.0]]);
        assert_eq!(grads.conflicts(), &["w"]);
        let mut adam = Adam::new(0.1, 0.0);
        assert!(adam.step(vec![("w", w.view_mut().into_dyn())], &grads).is_err());
        assert_eq!(w, array![1.0, 2.0]);
    }

    #[test]
    fn exponential_decay() {
        let mut adam = Adam::new(0.01, 0.0);
        let decay = ExponentialDecay { gamma: 0.95 };
        decay.step(&mut adam);
        decay.step(&mut adam);
        assert!((adam.learning_rate() - 0.01 * 0.95 * 0.95).abs() < 1e-15);
    }
}
