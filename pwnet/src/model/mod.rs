// src/model/mod.rs
//
// The surrogate ("wrapper") model.
//
//     embeddings (B × L)
//       -> [projection network]          comparison space Z (B × D)
//       -> prototype layer                distances / similarities (B × P)
//       -> class/slot assignment          logits (B × C)
//       -> output activation              surrogate actions
//
// One model type covers every experiment family; it is parameterized by
// action kind, assignment regime and presence of the projection network.
// Gradients are computed by hand: each layer exposes a backward pass that
// accumulates into a `Gradients` map keyed by parameter name.
//
// Lifecycle: a freshly built model is `Trained`; prototype projection moves it
// to `Projected`, after which gradient steps are refused until
// `resume_training` is called.

pub mod assignment;
pub mod output;
pub mod projection_net;
pub mod prototype;

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3, ArrayBase, ArrayD, ArrayViewMutD, Data, Dimension};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::{AssignmentConfig, ModelConfig, PrototypeSpace};
use crate::types::{Action, ActionKind};

use self::assignment::{Assignment, AssignmentCache, SoftSlotAssignment, StrictAssignment};
use self::output::argmax;
use self::projection_net::{Mode, NetCache, ProjectionNet};
use self::prototype::{distance_backward, prototype_layer, similarity_grad, PrototypeActivations};

/// Parameter gradients keyed by parameter name.
#[derive(Debug, Default, Clone)]
pub struct Gradients {
    tensors: BTreeMap<&'static str, ArrayD<f64>>,
    /// Names that received contributions of two different shapes.
    conflicts: Vec<&'static str>,
}

impl Gradients {
    pub fn accumulate<S, D>(&mut self, name: &'static str, grad: &ArrayBase<S, D>)
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        let g = grad.view().into_dyn();
        match self.tensors.get_mut(name) {
            Some(acc) if acc.shape() == g.shape() => *acc += &g,
            Some(_) => {
                if !self.conflicts.contains(&name) {
                    self.conflicts.push(name);
                }
            }
            None => {
                self.tensors.insert(name, g.to_owned());
            }
        }
    }

    pub fn merge(&mut self, other: Gradients) {
        for name in other.conflicts {
            if !self.conflicts.contains(&name) {
                self.conflicts.push(name);
            }
        }
        for (name, g) in other.tensors {
            self.accumulate(name, &g);
        }
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.tensors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tensors.keys().copied()
    }

    /// Parameters whose contributions disagreed on shape.
    pub fn conflicts(&self) -> &[&'static str] {
        &self.conflicts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelPhase {
    Trained,
    /// Prototype `k` was copied from training example `sources[k]`.
    Projected { sources: Vec<usize> },
}

/// Everything one forward pass produced, kept for the loss and backward pass.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    /// Comparison-space embeddings (B × D).
    pub comparison: Array2<f64>,
    /// Comparison-space prototypes (P × D).
    pub prototypes: Array2<f64>,
    pub activations: PrototypeActivations,
    pub logits: Array2<f64>,
    pub outputs: Array2<f64>,
    /// Normalized assignment (C × P × S) used by this pass; soft-slot only.
    pub assignment: Option<Array3<f64>>,
    net_cache: Option<NetCache>,
    prototype_cache: Option<NetCache>,
    assignment_cache: Option<AssignmentCache>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurrogateModel {
    config: ModelConfig,
    net: Option<ProjectionNet>,
    /// P × storage dim (D, or L for raw-space prototypes).
    prototypes: Array2<f64>,
    assignment: Assignment,
    /// Current soft-slot temperature; unused by the strict regime.
    temperature: f64,
    phase: ModelPhase,
}

impl SurrogateModel {
    pub fn new<R: Rng>(config: &ModelConfig, rng: &mut R) -> Result<Self> {
        let num_classes = config.num_classes();
        let net = config
            .projection_net
            .map(|norm| ProjectionNet::new(config.latent_size, config.prototype_size, norm, rng));

        let normal = Normal::new(0.0, 1.0)?;
        let prototypes = Array2::from_shape_fn(
            (config.num_prototypes, config.prototype_storage_dim()),
            |_| normal.sample(rng),
        );

        let (assignment, temperature) = match &config.assignment {
            AssignmentConfig::Strict {
                layout,
                incorrect_weight,
            } => (
                Assignment::Strict(StrictAssignment::new(
                    *layout,
                    config.num_prototypes,
                    num_classes,
                    *incorrect_weight,
                )?),
                0.0,
            ),
            AssignmentConfig::SoftSlot {
                slots_per_class,
                incorrect_weight,
                tau,
                temperature,
            } => (
                Assignment::SoftSlot(SoftSlotAssignment::new(
                    num_classes,
                    config.num_prototypes,
                    *slots_per_class,
                    *incorrect_weight,
                    *tau,
                    rng,
                )?),
                temperature.temperature(0),
            ),
        };

        Ok(Self {
            config: config.clone(),
            net,
            prototypes,
            assignment,
            temperature,
            phase: ModelPhase::Trained,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn phase(&self) -> &ModelPhase {
        &self.phase
    }

    pub fn num_prototypes(&self) -> usize {
        self.prototypes.nrows()
    }

    /// Prototype parameters in their storage space.
    pub fn prototypes(&self) -> &Array2<f64> {
        &self.prototypes
    }

    pub fn projection_net(&self) -> Option<&ProjectionNet> {
        self.net.as_ref()
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    pub fn strict_assignment(&self) -> Option<&StrictAssignment> {
        match &self.assignment {
            Assignment::Strict(s) => Some(s),
            Assignment::SoftSlot(_) => None,
        }
    }

    pub fn soft_assignment(&self) -> Option<&SoftSlotAssignment> {
        match &self.assignment {
            Assignment::SoftSlot(s) => Some(s),
            Assignment::Strict(_) => None,
        }
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature;
    }

    fn check_input(&self, x: &Array2<f64>) -> Result<()> {
        if x.ncols() != self.config.latent_size {
            bail!(
                "embedding width {} does not match model latent size {}",
                x.ncols(),
                self.config.latent_size
            );
        }
        Ok(())
    }

    /// Training-capable forward pass. In `Train` mode batch-norm running
    /// statistics are updated and, with an `rng`, the soft-slot assignment
    /// samples Gumbel noise.
    pub fn forward(
        &mut self,
        x: &Array2<f64>,
        mode: Mode,
        rng: Option<&mut ChaCha8Rng>,
    ) -> Result<ForwardPass> {
        self.check_input(x)?;
        let (z, net_cache) = match self.net.as_mut() {
            Some(net) => {
                let (z, cache) = net.forward(x, mode);
                (z, Some(cache))
            }
            None => (x.clone(), None),
        };
        self.finish_forward(z, net_cache, rng)
    }

    /// Deterministic evaluation-mode forward pass.
    pub fn forward_eval(&self, x: &Array2<f64>) -> Result<ForwardPass> {
        self.check_input(x)?;
        let (z, net_cache) = match &self.net {
            Some(net) => {
                let (z, cache) = net.forward_frozen(x, Mode::Eval);
                (z, Some(cache))
            }
            None => (x.clone(), None),
        };
        self.finish_forward(z, net_cache, None)
    }

    fn finish_forward(
        &self,
        comparison: Array2<f64>,
        net_cache: Option<NetCache>,
        rng: Option<&mut ChaCha8Rng>,
    ) -> Result<ForwardPass> {
        let (prototypes, prototype_cache) = self.comparison_prototypes_cached();
        let activations = prototype_layer(&comparison, &prototypes, self.config.epsilon);
        let (logits, assignment_cache) = match &self.assignment {
            Assignment::Strict(s) => (s.forward(&activations.similarities), None),
            Assignment::SoftSlot(s) => {
                let (logits, cache) = s.forward(&activations.similarities, self.temperature, rng)?;
                (logits, Some(cache))
            }
        };
        let outputs = self.config.output.apply(&logits)?;
        let assignment = assignment_cache.as_ref().map(|c| c.normalized());
        Ok(ForwardPass {
            comparison,
            prototypes,
            activations,
            logits,
            outputs,
            assignment,
            net_cache,
            prototype_cache,
            assignment_cache,
        })
    }

    fn comparison_prototypes_cached(&self) -> (Array2<f64>, Option<NetCache>) {
        match (self.config.prototype_space, &self.net) {
            (PrototypeSpace::Raw, Some(net)) => {
                let (q, cache) = net.forward_frozen(&self.prototypes, Mode::Eval);
                (q, Some(cache))
            }
            _ => (self.prototypes.clone(), None),
        }
    }

    /// Comparison-space embeddings of `x` in evaluation mode.
    pub fn embed(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        self.check_input(x)?;
        Ok(match &self.net {
            Some(net) => net.transform(x),
            None => x.clone(),
        })
    }

    /// Prototypes as seen by the distance computation.
    pub fn comparison_prototypes(&self) -> Array2<f64> {
        self.comparison_prototypes_cached().0
    }

    /// Surrogate outputs (probabilities or bounded controls) for a batch.
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        Ok(self.forward_eval(x)?.outputs)
    }

    /// Surrogate action for a single embedding.
    pub fn act(&self, latent: &[f64]) -> Result<Action> {
        let x = Array2::from_shape_vec((1, latent.len()), latent.to_vec())
            .context("latent vector does not form a 1-row batch")?;
        let out = self.predict(&x)?;
        let row = out.row(0);
        Ok(match self.config.action_kind {
            ActionKind::Discrete { .. } => Action::Discrete(argmax(row)),
            ActionKind::Continuous { .. } => Action::Continuous(row.to_vec()),
        })
    }

    /// Backprop from the loss gradients on logits, distances and
    /// comparison-space prototypes to every trainable parameter.
    pub fn backward(
        &self,
        pass: &ForwardPass,
        d_logits: &Array2<f64>,
        d_distances: &Array2<f64>,
        d_prototypes: &Array2<f64>,
    ) -> Result<Gradients> {
        let mut grads = Gradients::default();
        let sim = &pass.activations.similarities;
        let d_sim = match &self.assignment {
            Assignment::Strict(s) => s.backward(d_logits),
            Assignment::SoftSlot(s) => {
                let cache = pass
                    .assignment_cache
                    .as_ref()
                    .context("soft-slot forward pass is missing its assignment cache")?;
                s.backward(cache, sim, d_logits, &mut grads)
            }
        };

        let eps = self.config.epsilon;
        let mut d_dist = d_distances.clone();
        ndarray::Zip::from(&mut d_dist)
            .and(&d_sim)
            .and(&pass.activations.distances)
            .for_each(|g, &ds, &d| *g += ds * similarity_grad(d, eps));

        let (d_z, mut d_q) = distance_backward(&pass.comparison, &pass.prototypes, &d_dist);
        d_q += d_prototypes;

        match (&self.net, &pass.net_cache) {
            (Some(net), Some(cache)) => {
                net.backward(cache, &d_z, &mut grads)?;
            }
            (None, None) => {}
            _ => bail!("forward pass does not belong to this model"),
        }

        match (&self.net, &pass.prototype_cache) {
            (Some(net), Some(cache)) => {
                let d_raw = net.backward(cache, &d_q, &mut grads)?;
                grads.accumulate("prototypes", &d_raw);
            }
            _ => grads.accumulate("prototypes", &d_q),
        }
        Ok(grads)
    }

    /// Fails if the model has been projected and not explicitly resumed.
    pub fn ensure_trainable(&self) -> Result<()> {
        if let ModelPhase::Projected { .. } = self.phase {
            bail!("model prototypes have been projected; call resume_training() before taking gradient steps");
        }
        Ok(())
    }

    /// Re-enter the `Trained` phase after a projection.
    pub fn resume_training(&mut self) {
        self.phase = ModelPhase::Trained;
    }

    /// Replace every prototype and record where each one came from.
    pub(crate) fn replace_prototypes(&mut self, prototypes: Array2<f64>, sources: Vec<usize>) -> Result<()> {
        if prototypes.raw_dim() != self.prototypes.raw_dim() || sources.len() != prototypes.nrows() {
            bail!(
                "replacement prototypes have shape {:?} (sources {}), expected {:?}",
                prototypes.shape(),
                sources.len(),
                self.prototypes.shape()
            );
        }
        self.prototypes = prototypes;
        self.phase = ModelPhase::Projected { sources };
        Ok(())
    }

    /// Mutable views of every trainable parameter. Fixed structural weights
    /// and normalization running statistics are not included.
    pub fn trainable_params_mut(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, f64>)> {
        let mut out = Vec::new();
        if let Some(net) = self.net.as_mut() {
            out.extend(net.params_mut());
        }
        out.push(("prototypes", self.prototypes.view_mut().into_dyn()));
        if let Assignment::SoftSlot(soft) = &mut self.assignment {
            out.push(("presence", soft.presence.view_mut().into_dyn()));
            out.push(("class_identity", soft.class_identity.view_mut().into_dyn()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Preset, WrapperConfig};
    use rand::SeedableRng;

    fn model_for(preset: Preset, latent: usize, seed: u64) -> SurrogateModel {
        let mut cfg = WrapperConfig::for_preset(preset).model;
        cfg.latent_size = latent;
        cfg.prototype_size = 5;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        SurrogateModel::new(&cfg, &mut rng).unwrap()
    }

    #[test]
    fn shapes_per_preset() {
        let x = Array2::from_elem((3, 6), 0.25);
        for preset in [Preset::BipedalWalker, Preset::CarRacing, Preset::LunarLander] {
            let mut m = model_for(preset, 6, 1);
            let pass = m.forward(&x, Mode::Train, None).unwrap();
            let c = m.config().num_classes();
            assert_eq!(pass.outputs.dim(), (3, c));
            assert_eq!(pass.activations.distances.dim(), (3, m.num_prototypes()));
            assert_eq!(pass.comparison.ncols(), 5);
        }
    }

    #[test]
    fn wrong_latent_width_is_rejected() {
        let m = model_for(Preset::LunarLander, 6, 1);
        assert!(m.predict(&Array2::zeros((2, 7))).is_err());
    }

    #[test]
    fn projected_model_refuses_training_until_resumed() {
        let mut m = model_for(Preset::LunarLander, 6, 2);
        let protos = m.prototypes().clone();
        m.replace_prototypes(protos, vec![0, 1, 2, 3]).unwrap();
        assert!(m.ensure_trainable().is_err());
        m.resume_training();
        assert!(m.ensure_trainable().is_ok());
    }

    #[test]
    fn discrete_act_returns_valid_action() {
        let m = model_for(Preset::LunarLander, 6, 3);
        let a = m.act(&[0.1, -0.2, 0.3, 0.0, 1.0, -1.0]).unwrap();
        assert!(a.conforms_to(m.config().action_kind));
    }
}
