// src/config.rs
//
// Central configuration for wrapper experiments.
//
// A `WrapperConfig` is built from one of three named presets, one per
// experiment family (BipedalWalker, CarRacing, LunarLander), then optionally
// adjusted through `PWNET_*` environment variables. Every loss coefficient
// and schedule constant lives here rather than in the training code.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::dataset::LabelDerivation;
use crate::loss::{ClusterMode, LossConfig, LossWeights, SeparationMode};
use crate::model::assignment::StrictLayout;
use crate::model::output::{Activation, OutputActivation};
use crate::model::projection_net::NormKind;
use crate::model::prototype::DEFAULT_EPSILON;
use crate::schedule::{ProjectionSchedule, TemperatureSchedule};
use crate::types::ActionKind;

/// Configuration format version, recorded in checkpoints and summaries.
pub const CONFIG_VERSION: &str = "pwnet-config-v1";

/// Experiment family preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preset {
    BipedalWalker,
    CarRacing,
    LunarLander,
}

impl Preset {
    /// Stable lowercase name (used in logs, paths and summaries).
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::BipedalWalker => "bipedal_walker",
            Preset::CarRacing => "car_racing",
            Preset::LunarLander => "lunar_lander",
        }
    }

    /// Parse a preset name (case-insensitive). Returns None if unrecognized.
    pub fn parse(s: &str) -> Option<Preset> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "bipedal_walker" | "bipedalwalker" | "bipedal" | "bw" => Some(Preset::BipedalWalker),
            "car_racing" | "carracing" | "car" | "cr" => Some(Preset::CarRacing),
            "lunar_lander" | "lunarlander" | "lunar" | "ll" => Some(Preset::LunarLander),
            _ => None,
        }
    }
}

/// Source of the effective preset.
///
/// Precedence order (highest to lowest):
/// 1. CLI argument (--preset)
/// 2. Environment variable (PWNET_PRESET)
/// 3. Default (LunarLander)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetSource {
    Cli,
    Env,
    Default,
}

impl PresetSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresetSource::Cli => "cli",
            PresetSource::Env => "env",
            PresetSource::Default => "default",
        }
    }
}

/// Resolved preset with its source for logging.
#[derive(Debug, Clone, Copy)]
pub struct EffectivePreset {
    pub preset: Preset,
    pub source: PresetSource,
}

impl EffectivePreset {
    /// Format: `effective_preset=<preset> source=<source>`
    pub fn log_startup(&self) {
        eprintln!(
            "effective_preset={} source={}",
            self.preset.as_str(),
            self.source.as_str()
        );
    }
}

/// Resolve the effective preset: CLI, then `PWNET_PRESET`, then LunarLander.
///
/// An unparseable `PWNET_PRESET` is reported and skipped.
pub fn resolve_effective_preset(cli_preset: Option<Preset>) -> EffectivePreset {
    if let Some(preset) = cli_preset {
        return EffectivePreset {
            preset,
            source: PresetSource::Cli,
        };
    }

    if let Ok(raw) = std::env::var("PWNET_PRESET") {
        match Preset::parse(&raw) {
            Some(preset) => {
                return EffectivePreset {
                    preset,
                    source: PresetSource::Env,
                }
            }
            None => {
                eprintln!("[config] WARN: could not parse PWNET_PRESET = {raw:?}; ignoring");
            }
        }
    }

    EffectivePreset {
        preset: Preset::LunarLander,
        source: PresetSource::Default,
    }
}

/// Where prototypes live before the distance computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrototypeSpace {
    /// Prototypes are comparison-space vectors (D).
    Comparison,
    /// Prototypes are raw-embedding vectors (L) mapped through the projection network.
    Raw,
}

/// Class/slot assignment regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssignmentConfig {
    Strict {
        layout: StrictLayout,
        incorrect_weight: f64,
    },
    SoftSlot {
        slots_per_class: usize,
        incorrect_weight: f64,
        /// Gumbel-softmax relaxation temperature.
        tau: f64,
        temperature: TemperatureSchedule,
    },
}

/// Model shape and regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Raw embedding dimension (L).
    pub latent_size: usize,
    /// Comparison-space dimension (D).
    pub prototype_size: usize,
    pub num_prototypes: usize,
    pub action_kind: ActionKind,
    pub prototype_space: PrototypeSpace,
    /// Normalization of the projection network, or None for no network.
    pub projection_net: Option<NormKind>,
    pub assignment: AssignmentConfig,
    pub output: OutputActivation,
    /// How continuous labels are mapped to classes where a loss needs classes.
    pub label_derivation: LabelDerivation,
    /// Similarity transform epsilon.
    pub epsilon: f64,
}

impl ModelConfig {
    pub fn num_classes(&self) -> usize {
        self.action_kind.output_dim()
    }

    /// Dimension of the space the prototypes are stored in.
    pub fn prototype_storage_dim(&self) -> usize {
        match self.prototype_space {
            PrototypeSpace::Comparison => self.prototype_size,
            PrototypeSpace::Raw => self.latent_size,
        }
    }

    pub fn slots_per_class(&self) -> Option<usize> {
        match self.assignment {
            AssignmentConfig::SoftSlot { slots_per_class, .. } => Some(slots_per_class),
            AssignmentConfig::Strict { .. } => None,
        }
    }

    pub fn temperature_schedule(&self) -> Option<TemperatureSchedule> {
        match self.assignment {
            AssignmentConfig::SoftSlot { temperature, .. } => Some(temperature),
            AssignmentConfig::Strict { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// L2 penalty folded into the Adam gradient.
    pub weight_decay: f64,
    /// Per-epoch exponential learning-rate decay factor.
    pub lr_decay_gamma: f64,
    /// Base seed; iteration `i` trains with `seed + i`.
    pub seed: u64,
    /// Mid-training projection, if any.
    pub periodic_projection: Option<ProjectionSchedule>,
    /// Truncate the dataset to its first N examples.
    pub max_samples: Option<usize>,
    /// Write exemplar frames when projecting after training.
    pub export_exemplars: bool,
}

/// Closed-loop evaluation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    pub episodes: usize,
    pub max_steps: usize,
    pub seed: u64,
}

/// Dataset collection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectConfig {
    pub episodes: usize,
    pub max_steps: usize,
    pub render: bool,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrapperConfig {
    pub version: String,
    pub preset: Preset,
    /// Short name used for weight/result/prototype paths.
    pub run_name: String,
    pub iterations: usize,
    pub model: ModelConfig,
    pub loss: LossConfig,
    pub train: TrainConfig,
    pub eval: EvalConfig,
    pub collect: CollectConfig,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        WrapperConfig::for_preset(Preset::LunarLander)
    }
}

impl WrapperConfig {
    /// Build the configuration for a preset.
    pub fn for_preset(preset: Preset) -> Self {
        let train = TrainConfig {
            epochs: 100,
            batch_size: 32,
            learning_rate: 0.01,
            weight_decay: 1e-8,
            lr_decay_gamma: 0.95,
            seed: 0,
            periodic_projection: None,
            max_samples: None,
            export_exemplars: true,
        };
        let eval = EvalConfig {
            episodes: 30,
            max_steps: 10_000,
            seed: 1_000,
        };
        let collect = CollectConfig {
            episodes: 100,
            max_steps: 2_000,
            render: true,
            seed: 0,
        };

        match preset {
            Preset::BipedalWalker => WrapperConfig {
                version: CONFIG_VERSION.to_string(),
                preset,
                run_name: "pwnet_star".to_string(),
                iterations: 15,
                model: ModelConfig {
                    latent_size: 300,
                    prototype_size: 50,
                    num_prototypes: 8,
                    action_kind: ActionKind::Continuous { dim: 4 },
                    prototype_space: PrototypeSpace::Comparison,
                    projection_net: Some(NormKind::Batch),
                    assignment: AssignmentConfig::Strict {
                        layout: StrictLayout::SignedPairs,
                        incorrect_weight: 0.0,
                    },
                    output: OutputActivation::Tanh,
                    label_derivation: LabelDerivation::DominantChannel,
                    epsilon: DEFAULT_EPSILON,
                },
                loss: LossConfig {
                    weights: LossWeights {
                        imitation: 1.0,
                        clustering: 0.08,
                        separation: 0.008,
                        orthogonality: 0.0,
                        sparsity: 0.0,
                    },
                    clustering: ClusterMode::AllPrototypes,
                    separation: SeparationMode::PrototypePairs,
                },
                train: TrainConfig {
                    batch_size: 64,
                    max_samples: Some(100_000),
                    ..train
                },
                eval: EvalConfig {
                    episodes: 10,
                    max_steps: 2_000,
                    ..eval
                },
                collect,
            },
            Preset::CarRacing => WrapperConfig {
                version: CONFIG_VERSION.to_string(),
                preset,
                run_name: "myprotonet".to_string(),
                iterations: 5,
                model: ModelConfig {
                    latent_size: 256,
                    prototype_size: 50,
                    num_prototypes: 7,
                    action_kind: ActionKind::Continuous { dim: 3 },
                    prototype_space: PrototypeSpace::Raw,
                    projection_net: Some(NormKind::Instance),
                    assignment: AssignmentConfig::SoftSlot {
                        slots_per_class: 2,
                        incorrect_weight: 0.0,
                        tau: 0.5,
                        temperature: TemperatureSchedule {
                            start: 1.3,
                            ceiling: 1000.0,
                            ramp_epochs: 30,
                        },
                    },
                    output: OutputActivation::PerChannel(vec![
                        Activation::Tanh,
                        Activation::Relu,
                        Activation::Relu,
                    ]),
                    label_derivation: LabelDerivation::DominantChannel,
                    epsilon: DEFAULT_EPSILON,
                },
                loss: LossConfig {
                    weights: LossWeights {
                        imitation: 1.0,
                        clustering: 0.08,
                        separation: 0.008,
                        orthogonality: 1.0,
                        sparsity: 1e-4,
                    },
                    clustering: ClusterMode::TopSlots,
                    separation: SeparationMode::UnassignedSlots,
                },
                train: TrainConfig {
                    epochs: 50,
                    ..train
                },
                eval,
                collect: CollectConfig {
                    max_steps: 10_000,
                    ..collect
                },
            },
            Preset::LunarLander => WrapperConfig {
                version: CONFIG_VERSION.to_string(),
                preset,
                run_name: "pwnet_star_star".to_string(),
                iterations: 15,
                model: ModelConfig {
                    latent_size: 128,
                    prototype_size: 50,
                    num_prototypes: 4,
                    action_kind: ActionKind::Discrete { num_actions: 4 },
                    prototype_space: PrototypeSpace::Comparison,
                    projection_net: Some(NormKind::Batch),
                    assignment: AssignmentConfig::Strict {
                        layout: StrictLayout::Blocks,
                        incorrect_weight: 0.0,
                    },
                    output: OutputActivation::Softmax,
                    label_derivation: LabelDerivation::Identity,
                    epsilon: DEFAULT_EPSILON,
                },
                loss: LossConfig {
                    weights: LossWeights {
                        imitation: 1.0,
                        clustering: 0.8,
                        separation: 0.08,
                        orthogonality: 0.0,
                        sparsity: 0.0,
                    },
                    clustering: ClusterMode::OwnClass,
                    separation: SeparationMode::OtherClasses,
                },
                train: TrainConfig {
                    periodic_projection: Some(ProjectionSchedule {
                        min_epoch: 10,
                        every: 4,
                    }),
                    ..train
                },
                eval,
                collect: CollectConfig {
                    max_steps: 10_000,
                    ..collect
                },
            },
        }
    }

    /// Build a config from a preset, then apply `PWNET_*` overrides.
    ///
    /// Unparseable values are reported on stderr and ignored.
    pub fn from_env_or_preset(preset: Preset) -> Self {
        let mut cfg = WrapperConfig::for_preset(preset);

        env_override("PWNET_EPOCHS", &mut cfg.train.epochs);
        env_override("PWNET_ITERATIONS", &mut cfg.iterations);
        env_override("PWNET_BATCH_SIZE", &mut cfg.train.batch_size);
        env_override("PWNET_LR", &mut cfg.train.learning_rate);
        env_override("PWNET_SEED", &mut cfg.train.seed);
        env_override("PWNET_EVAL_EPISODES", &mut cfg.eval.episodes);
        env_override("PWNET_CLUSTER_WEIGHT", &mut cfg.loss.weights.clustering);
        env_override("PWNET_SEPARATION_WEIGHT", &mut cfg.loss.weights.separation);

        cfg
    }

    /// Reject configurations whose dimensions or regimes don't fit together.
    pub fn validate(&self) -> Result<()> {
        let m = &self.model;
        let classes = m.num_classes();
        if classes == 0 {
            bail!("action space has no outputs");
        }
        if m.num_prototypes == 0 || m.latent_size == 0 || m.prototype_size == 0 {
            bail!("latent size, prototype size and prototype count must all be positive");
        }
        if m.projection_net.is_none() {
            if m.prototype_space == PrototypeSpace::Raw {
                bail!("raw-space prototypes need a projection network");
            }
            if m.prototype_size != m.latent_size {
                bail!(
                    "without a projection network the comparison space is the latent space: prototype_size {} != latent_size {}",
                    m.prototype_size,
                    m.latent_size
                );
            }
        }
        if !(m.epsilon > 0.0) {
            bail!("similarity epsilon must be positive, got {}", m.epsilon);
        }

        match &m.assignment {
            AssignmentConfig::Strict { layout, .. } => match layout {
                StrictLayout::Blocks if m.num_prototypes % classes != 0 => bail!(
                    "block layout needs prototypes ({}) divisible by classes ({classes})",
                    m.num_prototypes
                ),
                StrictLayout::SignedPairs if m.num_prototypes != 2 * classes => bail!(
                    "signed-pair layout needs 2 prototypes per channel: {} prototypes for {classes} channels",
                    m.num_prototypes
                ),
                _ => {}
            },
            AssignmentConfig::SoftSlot {
                slots_per_class,
                tau,
                ..
            } => {
                if *slots_per_class == 0 || *slots_per_class > m.num_prototypes {
                    bail!(
                        "slots per class must be in 1..={}, got {slots_per_class}",
                        m.num_prototypes
                    );
                }
                if !(*tau > 0.0) {
                    bail!("gumbel tau must be positive, got {tau}");
                }
            }
        }

        match (&m.action_kind, &m.output) {
            (ActionKind::Discrete { .. }, OutputActivation::Softmax) => {}
            (ActionKind::Discrete { .. }, other) => {
                bail!("discrete actions need a softmax output, got {other:?}")
            }
            (ActionKind::Continuous { .. }, OutputActivation::Softmax) => {
                bail!("continuous actions cannot use a softmax output")
            }
            (ActionKind::Continuous { dim }, OutputActivation::PerChannel(acts)) if acts.len() != *dim => {
                bail!("per-channel output lists {} activations for {dim} channels", acts.len())
            }
            _ => {}
        }

        let soft = m.slots_per_class().is_some();
        if !soft && matches!(self.loss.clustering, ClusterMode::TopSlots) {
            bail!("top-slot clustering needs the soft-slot regime");
        }
        if !soft && matches!(self.loss.separation, SeparationMode::UnassignedSlots) {
            bail!("unassigned-slot separation needs the soft-slot regime");
        }
        if m.action_kind.is_discrete() && m.label_derivation != LabelDerivation::Identity {
            bail!("discrete labels are already classes; use the identity label derivation");
        }

        let t = &self.train;
        if t.batch_size == 0 {
            bail!("batch size must be positive");
        }
        if !(t.learning_rate > 0.0) {
            bail!("learning rate must be positive, got {}", t.learning_rate);
        }
        if let Some(p) = t.periodic_projection {
            if p.every == 0 {
                bail!("periodic projection interval must be positive");
            }
        }
        if self.eval.max_steps == 0 || self.collect.max_steps == 0 {
            bail!("step caps must be positive");
        }
        Ok(())
    }
}

fn env_override<T>(name: &str, slot: &mut T)
where
    T: std::str::FromStr + std::fmt::Display,
{
    if let Ok(raw) = std::env::var(name) {
        match raw.trim().parse::<T>() {
            Ok(v) => {
                *slot = v;
                eprintln!("[config] {name} = {slot} (overrode default)");
            }
            Err(_) => {
                eprintln!(
                    "[config] WARN: could not parse {name} = {raw:?} as {}; using default {slot}",
                    std::any::type_name::<T>()
                );
            }
        }
    }
}
