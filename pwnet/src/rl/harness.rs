// src/rl/harness.rs
//
// Closed-loop evaluation: the surrogate drives the environment.
//
// Each step the frozen black box still sees the state, producing the latent
// the surrogate consumes and the reference action it is scored against. The
// surrogate's action is the one applied to the environment.
//
// Episode `e` is reset with seed `base_seed + e`.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::config::EvalConfig;
use crate::model::SurrogateModel;

use super::env::Environment;
use super::policy::BlackBoxPolicy;

/// Episode termination reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// The environment reported `done`.
    Done,
    /// The step cap was reached first.
    StepCap,
}

/// Summary of a completed episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode: usize,
    pub seed: u64,
    pub termination_reason: TerminationReason,
    /// One reward sample per step taken.
    pub rewards: Vec<f64>,
    /// Per-step imitation error against the black-box action.
    pub errors: Vec<f64>,
    /// Steps on which the surrogate chose the black-box action (discrete only).
    pub agreements: usize,
}

impl EpisodeSummary {
    pub fn steps(&self) -> usize {
        self.rewards.len()
    }

    pub fn total_reward(&self) -> f64 {
        self.rewards.iter().sum()
    }

    pub fn total_error(&self) -> f64 {
        self.errors.iter().sum()
    }
}

/// Results of one evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub episodes: Vec<EpisodeSummary>,
    /// Mean episode reward.
    pub mean_reward: f64,
    /// Mean per-step imitation error over all steps.
    pub mean_error: f64,
    /// Agreement rate over all steps (discrete actions only).
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct EvaluationHarness {
    episodes: usize,
    max_steps: usize,
    base_seed: u64,
    verbosity: u8,
}

impl EvaluationHarness {
    pub fn new(episodes: usize, max_steps: usize, base_seed: u64) -> Self {
        Self {
            episodes,
            max_steps,
            base_seed,
            verbosity: 0,
        }
    }

    pub fn from_config(cfg: &EvalConfig) -> Self {
        Self::new(cfg.episodes, cfg.max_steps, cfg.seed)
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Run one episode with the surrogate in control.
    pub fn run_episode<E, P>(
        &self,
        env: &mut E,
        policy: &mut P,
        model: &SurrogateModel,
        episode: usize,
    ) -> Result<EpisodeSummary>
    where
        E: Environment + ?Sized,
        P: BlackBoxPolicy + ?Sized,
    {
        let seed = self.base_seed + episode as u64;
        let mut state = env.reset(Some(seed));
        policy.reset_episode(seed);

        let discrete = env.action_kind().is_discrete();
        let mut rewards = Vec::new();
        let mut errors = Vec::new();
        let mut agreements = 0;
        let mut termination_reason = TerminationReason::StepCap;

        for _ in 0..self.max_steps {
            let reference = policy.act(&state)?;
            let action = model.act(&reference.latent)?;
            let error = action.imitation_error(&reference.action)?;
            if discrete && action == reference.action {
                agreements += 1;
            }
            errors.push(error);

            let result = env.step(&action)?;
            rewards.push(result.reward);
            state = result.observation;
            if result.done {
                termination_reason = TerminationReason::Done;
                break;
            }
        }

        let summary = EpisodeSummary {
            episode,
            seed,
            termination_reason,
            rewards,
            errors,
            agreements,
        };
        if self.verbosity > 0 {
            eprintln!(
                "[harness] episode {episode}: reward {:.3} over {} steps ({:?})",
                summary.total_reward(),
                summary.steps(),
                summary.termination_reason
            );
        }
        Ok(summary)
    }

    /// Run every configured episode and aggregate.
    pub fn evaluate<E, P>(&self, env: &mut E, policy: &mut P, model: &SurrogateModel) -> Result<EvaluationSummary>
    where
        E: Environment + ?Sized,
        P: BlackBoxPolicy + ?Sized,
    {
        if self.episodes == 0 {
            bail!("evaluation needs at least one episode");
        }
        if env.action_kind() != model.config().action_kind {
            bail!(
                "surrogate acts in {:?} but the environment expects {:?}",
                model.config().action_kind,
                env.action_kind()
            );
        }

        let mut episodes = Vec::with_capacity(self.episodes);
        for episode in 0..self.episodes {
            episodes.push(self.run_episode(env, policy, model, episode)?);
        }

        let total_steps: usize = episodes.iter().map(EpisodeSummary::steps).sum();
        let mean_reward =
            episodes.iter().map(EpisodeSummary::total_reward).sum::<f64>() / episodes.len() as f64;
        let mean_error = if total_steps == 0 {
            0.0
        } else {
            episodes.iter().map(EpisodeSummary::total_error).sum::<f64>() / total_steps as f64
        };
        let accuracy = if env.action_kind().is_discrete() && total_steps > 0 {
            let hits: usize = episodes.iter().map(|e| e.agreements).sum();
            Some(hits as f64 / total_steps as f64)
        } else {
            None
        };

        Ok(EvaluationSummary {
            episodes,
            mean_reward,
            mean_error,
            accuracy,
        })
    }
}
