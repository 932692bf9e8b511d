// src/rl/env.rs
//
// Gym-style environment interface.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::{Action, ActionKind, Frame};

/// Result of one environment step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// The observation after taking the action.
    pub observation: Vec<f64>,
    /// The reward for this step.
    pub reward: f64,
    /// Whether the episode has terminated.
    pub done: bool,
    pub info: StepInfo,
}

/// Additional information returned from a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    /// Step index within the episode (0-based).
    pub step: usize,
    /// Termination reason if done.
    pub termination_reason: Option<String>,
}

/// Opaque step/reset simulator.
pub trait Environment {
    fn action_kind(&self) -> ActionKind;

    /// Width of observations returned by `reset` and `step`.
    fn observation_size(&self) -> usize;

    /// Start a new episode. The same seed yields the same episode.
    fn reset(&mut self, seed: Option<u64>) -> Vec<f64>;

    /// Advance one step. Errors on an action that does not fit `action_kind`.
    fn step(&mut self, action: &Action) -> Result<StepResult>;

    /// Render the current state, if the environment can.
    fn render(&self) -> Option<Frame> {
        None
    }
}
