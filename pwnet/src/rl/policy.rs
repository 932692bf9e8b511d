// src/rl/policy.rs
//
// The black-box policy being imitated. Only its interface is known: given a
// state it returns the action it would take and the latent embedding its
// backbone computed on the way.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::{Action, ActionKind};

/// One decision of the black-box policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOutput {
    pub action: Action,
    /// Backbone embedding of the state; the surrogate's input.
    pub latent: Vec<f64>,
}

/// Frozen pretrained decision-maker.
pub trait BlackBoxPolicy {
    /// Version string recorded in dataset provenance.
    fn version(&self) -> &str;

    fn action_kind(&self) -> ActionKind;

    /// Width of the latent vectors returned by `act`.
    fn latent_size(&self) -> usize;

    /// Decide on an action for `state`.
    fn act(&mut self, state: &[f64]) -> Result<PolicyOutput>;

    /// Called at the start of each episode.
    fn reset_episode(&mut self, _seed: u64) {}
}
