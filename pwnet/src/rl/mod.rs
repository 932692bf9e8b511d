// src/rl/mod.rs
//
// Interfaces to the black-box side of an experiment and the loops that drive
// them.
//
// Key components:
// - BlackBoxPolicy: frozen pretrained policy exposing state -> (action, latent)
// - Environment: gym-style reset/step/render simulator
// - DatasetCollector: rolls out the black box to build a TrainingSet
// - EvaluationHarness: closed-loop rollouts with the surrogate in control
// - SyntheticEnv / SyntheticPolicy: seeded stand-ins for real simulators

pub mod collector;
pub mod env;
pub mod harness;
pub mod policy;
pub mod synthetic;

pub use collector::DatasetCollector;
pub use env::{Environment, StepInfo, StepResult};
pub use harness::{EpisodeSummary, EvaluationHarness, EvaluationSummary, TerminationReason};
pub use policy::{BlackBoxPolicy, PolicyOutput};
pub use synthetic::{SyntheticEnv, SyntheticPolicy, SYNTHETIC_POLICY_VERSION};
