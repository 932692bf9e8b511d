// src/model/assignment.rs
//
// Class/slot assignment: routes prototype similarities (batch × P) to output
// logits (batch × C).
//
// Strict regime: a fixed C × P matrix, never updated.
// Soft-slot regime: a trainable C × P × S presence tensor normalized over
// prototypes per (class, slot), followed by a trainable C × (C·S)
// class-identity map. Each slot carries mass 1/S so that every class slice
// of the normalized assignment sums to 1.

use ndarray::{s, Array1, Array2, Array3, Axis};
use rand::Rng;
use rand_distr::{Distribution, Gumbel, Normal};
use serde::{Deserialize, Serialize};

use super::output::softmax;
use super::Gradients;
use crate::schedule::MIN_TEMPERATURE;

/// Layout of a fixed prototype-to-channel map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrictLayout {
    /// Prototype `j` belongs to class `j / (P / C)`.
    Blocks,
    /// Prototype `2k` adds +1 and prototype `2k + 1` adds -1 to channel `k`.
    SignedPairs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrictAssignment {
    layout: StrictLayout,
    /// C × P, frozen.
    weights: Array2<f64>,
}

impl StrictAssignment {
    pub fn new(
        layout: StrictLayout,
        num_prototypes: usize,
        num_classes: usize,
        incorrect_weight: f64,
    ) -> anyhow::Result<Self> {
        if num_classes == 0 || num_prototypes == 0 {
            anyhow::bail!("strict assignment needs at least one class and one prototype");
        }
        let mut weights = Array2::zeros((num_classes, num_prototypes));
        match layout {
            StrictLayout::Blocks => {
                if num_prototypes % num_classes != 0 {
                    anyhow::bail!(
                        "block layout needs prototypes ({num_prototypes}) divisible by classes ({num_classes})"
                    );
                }
                let per_class = num_prototypes / num_classes;
                for c in 0..num_classes {
                    for j in 0..num_prototypes {
                        weights[[c, j]] = if j / per_class == c { 1.0 } else { incorrect_weight };
                    }
                }
            }
            StrictLayout::SignedPairs => {
                if num_prototypes != 2 * num_classes {
                    anyhow::bail!(
                        "signed-pair layout needs exactly 2 prototypes per channel, got {num_prototypes} for {num_classes}"
                    );
                }
                for k in 0..num_classes {
                    weights[[k, 2 * k]] = 1.0;
                    weights[[k, 2 * k + 1]] = -1.0;
                }
            }
        }
        Ok(Self { layout, weights })
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    pub fn layout(&self) -> StrictLayout {
        self.layout
    }

    /// The class (channel) prototype `p` is attached to.
    pub fn prototype_class(&self, p: usize) -> usize {
        match self.layout {
            StrictLayout::Blocks => p / (self.weights.ncols() / self.weights.nrows()),
            StrictLayout::SignedPairs => p / 2,
        }
    }

    pub fn forward(&self, sim: &Array2<f64>) -> Array2<f64> {
        sim.dot(&self.weights.t())
    }

    pub fn backward(&self, d_logits: &Array2<f64>) -> Array2<f64> {
        d_logits.dot(&self.weights)
    }
}

/// Cached normalization for one forward pass.
#[derive(Debug, Clone)]
pub struct AssignmentCache {
    /// Per-slot softmax outputs (C × P × S), before the 1/S scaling.
    slot_softmax: Array3<f64>,
    /// d(softmax input)/d(presence): 1 without temperature, t/tau with it.
    input_scale: f64,
    /// P × (C·S): normalized assignment laid out as `[p, c * S + s]`.
    assignment: Array2<f64>,
    /// batch × (C·S) mixed similarities.
    mixed: Array2<f64>,
}

impl AssignmentCache {
    /// Normalized assignment as a C × P × S tensor.
    pub fn normalized(&self) -> Array3<f64> {
        &self.slot_softmax / self.slot_softmax.dim().2 as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftSlotAssignment {
    /// C × P × S presence logits.
    pub presence: Array3<f64>,
    /// C × (C·S), trainable; starts at the structural template.
    pub class_identity: Array2<f64>,
    /// 1 on each class's own slots, 0 elsewhere.
    template: Array2<f64>,
    /// Gumbel-softmax relaxation temperature.
    tau: f64,
}

impl SoftSlotAssignment {
    pub fn new<R: Rng>(
        num_classes: usize,
        num_prototypes: usize,
        slots_per_class: usize,
        incorrect_weight: f64,
        tau: f64,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        if num_classes == 0 || num_prototypes == 0 || slots_per_class == 0 {
            anyhow::bail!("soft-slot assignment needs classes, prototypes and slots");
        }
        if tau <= 0.0 {
            anyhow::bail!("gumbel tau must be positive, got {tau}");
        }
        // Xavier normal over a C × P × S tensor.
        let fan_in = (num_prototypes * slots_per_class) as f64;
        let fan_out = (num_classes * slots_per_class) as f64;
        let std = (2.0 / (fan_in + fan_out)).sqrt();
        let normal = Normal::new(0.0, std)?;
        let presence = Array3::from_shape_fn((num_classes, num_prototypes, slots_per_class), |_| {
            normal.sample(rng)
        });

        let width = num_classes * slots_per_class;
        let template = Array2::from_shape_fn((num_classes, width), |(c, i)| {
            if i / slots_per_class == c {
                1.0
            } else {
                0.0
            }
        });
        let class_identity = template.mapv(|t| if t == 1.0 { 1.0 } else { incorrect_weight });
        Ok(Self {
            presence,
            class_identity,
            template,
            tau,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.presence.dim().0
    }

    pub fn num_prototypes(&self) -> usize {
        self.presence.dim().1
    }

    pub fn slots_per_class(&self) -> usize {
        self.presence.dim().2
    }

    /// 1 where the class-identity map connects a class to another class's slot.
    pub fn incorrect_mask(&self) -> Array2<f64> {
        self.template.mapv(|t| 1.0 - t)
    }

    /// Normalize the presence tensor. With `noise`, the temperature-scaled
    /// logits are perturbed before the relaxed softmax.
    fn normalize(&self, temperature: f64, noise: Option<&Array3<f64>>) -> (Array3<f64>, f64) {
        let (nc, np, ns) = self.presence.dim();
        let annealed = temperature >= MIN_TEMPERATURE;
        let input_scale = if annealed { temperature / self.tau } else { 1.0 };
        let mut out = Array3::zeros((nc, np, ns));
        for c in 0..nc {
            for sl in 0..ns {
                let logits: Array1<f64> = if annealed {
                    let mut u = self.presence.slice(s![c, .., sl]).mapv(|v| v * temperature);
                    if let Some(g) = noise {
                        u += &g.slice(s![c, .., sl]);
                    }
                    u / self.tau
                } else {
                    self.presence.slice(s![c, .., sl]).to_owned()
                };
                out.slice_mut(s![c, .., sl]).assign(&softmax(logits.view()));
            }
        }
        (out, input_scale)
    }

    /// Deterministic normalized assignment (C × P × S) at `temperature`.
    pub fn normalized(&self, temperature: f64) -> Array3<f64> {
        let (y, _) = self.normalize(temperature, None);
        y / self.slots_per_class() as f64
    }

    /// Logits for a batch of similarities. Gumbel noise is drawn from `rng`
    /// when one is given and the temperature is annealed.
    pub fn forward<R: Rng>(
        &self,
        sim: &Array2<f64>,
        temperature: f64,
        rng: Option<&mut R>,
    ) -> anyhow::Result<(Array2<f64>, AssignmentCache)> {
        let noise = match rng {
            Some(rng) if temperature >= MIN_TEMPERATURE => {
                let gumbel = Gumbel::new(0.0, 1.0)?;
                Some(Array3::from_shape_fn(self.presence.raw_dim(), |_| gumbel.sample(rng)))
            }
            _ => None,
        };
        let (slot_softmax, input_scale) = self.normalize(temperature, noise.as_ref());
        let (nc, np, ns) = slot_softmax.dim();
        let mut assignment = Array2::zeros((np, nc * ns));
        for c in 0..nc {
            for p in 0..np {
                for sl in 0..ns {
                    assignment[[p, c * ns + sl]] = slot_softmax[[c, p, sl]] / ns as f64;
                }
            }
        }
        let mixed = sim.dot(&assignment);
        let logits = mixed.dot(&self.class_identity.t());
        Ok((
            logits,
            AssignmentCache {
                slot_softmax,
                input_scale,
                assignment,
                mixed,
            },
        ))
    }

    /// Accumulates `presence` and `class_identity` gradients; returns d/d(sim).
    pub fn backward(
        &self,
        cache: &AssignmentCache,
        sim: &Array2<f64>,
        d_logits: &Array2<f64>,
        grads: &mut Gradients,
    ) -> Array2<f64> {
        grads.accumulate("class_identity", &d_logits.t().dot(&cache.mixed));
        let d_mixed = d_logits.dot(&self.class_identity);
        let d_sim = d_mixed.dot(&cache.assignment.t());
        // P × (C·S)
        let d_assignment = sim.t().dot(&d_mixed);

        let (nc, np, ns) = cache.slot_softmax.dim();
        let mut d_presence = Array3::zeros((nc, np, ns));
        for c in 0..nc {
            for sl in 0..ns {
                let y = cache.slot_softmax.slice(s![c, .., sl]);
                let dy: Array1<f64> = d_assignment.column(c * ns + sl).mapv(|v| v / ns as f64);
                let dot = y.dot(&dy);
                for p in 0..np {
                    d_presence[[c, p, sl]] = y[p] * (dy[p] - dot) * cache.input_scale;
                }
            }
        }
        grads.accumulate("presence", &d_presence);
        d_sim
    }

    /// Total assignment weight of each prototype for `class`, summed over slots.
    pub fn class_weights(normalized: &Array3<f64>, class: usize) -> Array1<f64> {
        normalized.index_axis(Axis(0), class).sum_axis(Axis(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Assignment {
    Strict(StrictAssignment),
    SoftSlot(SoftSlotAssignment),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn blocks_layout_has_one_positive_entry_per_prototype() {
        let a = StrictAssignment::new(StrictLayout::Blocks, 6, 3, -0.5).unwrap();
        for p in 0..6 {
            let col = a.weights().column(p);
            assert_eq!(col.iter().filter(|&&w| w == 1.0).count(), 1);
            assert_eq!(col[a.prototype_class(p)], 1.0);
        }
        assert_eq!(a.weights()[[0, 2]], -0.5);
    }

    #[test]
    fn signed_pairs_layout() {
        let a = StrictAssignment::new(StrictLayout::SignedPairs, 8, 4, 0.0).unwrap();
        for k in 0..4 {
            let row = a.weights().row(k);
            assert_eq!(row.iter().filter(|&&w| w == 1.0).count(), 1);
            assert_eq!(row[2 * k], 1.0);
            assert_eq!(row[2 * k + 1], -1.0);
        }
        assert!(StrictAssignment::new(StrictLayout::SignedPairs, 6, 4, 0.0).is_err());
    }

    #[test]
    fn class_slices_sum_to_one() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let soft = SoftSlotAssignment::new(3, 7, 2, -1.0, 0.5, &mut rng).unwrap();
        for &t in &[0.0, MIN_TEMPERATURE, 1.3, 50.0, 1000.0] {
            let a = soft.normalized(t);
            for c in 0..3 {
                let total = a.index_axis(Axis(0), c).sum();
                assert!((total - 1.0).abs() < 1e-9, "t={t} class {c}: {total}");
            }
        }
    }

    #[test]
    fn gumbel_forward_keeps_slices_normalized() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let soft = SoftSlotAssignment::new(2, 5, 3, 0.0, 0.5, &mut rng).unwrap();
        let sim = Array2::from_elem((4, 5), 1.0);
        let (_, cache) = soft.forward(&sim, 10.0, Some(&mut rng)).unwrap();
        let a = cache.normalized();
        for c in 0..2 {
            assert!((a.index_axis(Axis(0), c).sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn class_identity_starts_at_template() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let soft = SoftSlotAssignment::new(3, 7, 2, -1.0, 0.5, &mut rng).unwrap();
        assert_eq!(soft.class_identity[[1, 2]], 1.0);
        assert_eq!(soft.class_identity[[1, 3]], 1.0);
        assert_eq!(soft.class_identity[[1, 0]], -1.0);
        assert_eq!(soft.incorrect_mask()[[1, 2]], 0.0);
        assert_eq!(soft.incorrect_mask()[[1, 4]], 1.0);
    }
}
