// src/schedule.rs
//
// Epoch-indexed schedules used by the trainer:
// - TemperatureSchedule: annealed logit scale for the soft-slot assignment.
// - ProjectionSchedule: when periodic prototype projection runs mid-training.

use serde::{Deserialize, Serialize};

/// Below this temperature the soft-slot assignment falls back to a plain
/// softmax over the raw presence logits.
pub const MIN_TEMPERATURE: f64 = 1e-6;

/// Square-root ramp from `start` to `ceiling` over `ramp_epochs`, then flat.
///
/// `t(e) = start * sqrt(alpha * e)` for `e < ramp_epochs`, where
/// `alpha = (ceiling / start)^2 / ramp_epochs`, and `ceiling` afterwards.
/// Epoch 0 therefore yields 0, i.e. the plain-softmax fallback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSchedule {
    pub start: f64,
    pub ceiling: f64,
    pub ramp_epochs: usize,
}

impl Default for TemperatureSchedule {
    fn default() -> Self {
        Self {
            start: 1.3,
            ceiling: 1000.0,
            ramp_epochs: 30,
        }
    }
}

impl TemperatureSchedule {
    pub fn temperature(&self, epoch: usize) -> f64 {
        if self.ramp_epochs == 0 || epoch >= self.ramp_epochs {
            return self.ceiling;
        }
        let ratio = self.ceiling / self.start;
        let alpha = ratio * ratio / self.ramp_epochs as f64;
        let t = self.start * (alpha * epoch as f64).sqrt();
        // Rounding can push the last ramp step a hair past the ceiling.
        t.min(self.ceiling)
    }
}

/// Periodic projection: every `every` epochs once `min_epoch` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionSchedule {
    pub min_epoch: usize,
    pub every: usize,
}

impl ProjectionSchedule {
    pub fn is_due(&self, epoch: usize) -> bool {
        self.every > 0 && epoch >= self.min_epoch && epoch % self.every == 0
    }
}
