//! Prototype wrapper networks for black-box RL policies.
//!
//! A surrogate model learns to imitate a frozen policy from the latent
//! embeddings that policy computes, deciding by similarity to a small set of
//! prototypes. After training every prototype is projected onto its nearest
//! real training state, so each decision can be explained by concrete
//! exemplars. The binary (`src/main.rs`) is a thin harness around
//! [`experiment::Experiment`].

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod experiment;
pub mod io;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod projection;
pub mod rl;
pub mod schedule;
pub mod trainer;
pub mod types;

// --- Re-exports for ergonomic external use ---------------------------------

pub use checkpoint::{load_checkpoint, save_checkpoint, Checkpoint};

pub use config::{
    resolve_effective_preset, AssignmentConfig, ModelConfig, Preset, PrototypeSpace, WrapperConfig,
};

pub use dataset::{DatasetStore, LabelDerivation, Labels, TrainingSet};

pub use experiment::{synthetic_experiment, Experiment, ExperimentPaths, ExperimentSummary};

pub use logging::{JsonlScalarSink, NoopScalarSink, ResultsLog, ScalarSink};

pub use loss::{composite_loss, ClusterMode, LossBreakdown, LossConfig, LossWeights, SeparationMode};

pub use metrics::{MeanStdErr, OnlineStats};

pub use model::{ModelPhase, SurrogateModel};

pub use projection::{export_exemplars, project_prototypes, ProjectionReport};

pub use schedule::{ProjectionSchedule, TemperatureSchedule};

pub use trainer::{TrainerState, TrainingMetric, TrainingOutcome};

pub use types::{Action, ActionKind, Frame};
