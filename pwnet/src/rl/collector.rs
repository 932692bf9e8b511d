// src/rl/collector.rs
//
// Dataset collection: roll out the black-box policy in its environment and
// record (latent, action) pairs, optionally with the frame rendered before
// each decision.
//
// Episode `e` is reset with seed `base_seed + e` so a collection run is
// reproducible.

use anyhow::{bail, Context, Result};

use crate::config::CollectConfig;
use crate::dataset::{CollectionInfo, TrainingSet};
use crate::metrics::OnlineStats;
use crate::types::{Action, Frame};

use super::env::Environment;
use super::policy::BlackBoxPolicy;

#[derive(Debug, Clone)]
pub struct DatasetCollector {
    episodes: usize,
    max_steps: usize,
    render: bool,
    base_seed: u64,
    verbosity: u8,
}

impl DatasetCollector {
    pub fn new(episodes: usize, max_steps: usize, render: bool, base_seed: u64) -> Self {
        Self {
            episodes,
            max_steps,
            render,
            base_seed,
            verbosity: 0,
        }
    }

    pub fn from_config(cfg: &CollectConfig) -> Self {
        Self::new(cfg.episodes, cfg.max_steps, cfg.render, cfg.seed)
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Collect a training set. Fails if the policy and environment disagree
    /// on the action space, or if rendering was requested and the environment
    /// cannot render.
    pub fn collect<E, P>(&self, env: &mut E, policy: &mut P) -> Result<(TrainingSet, CollectionInfo)>
    where
        E: Environment + ?Sized,
        P: BlackBoxPolicy + ?Sized,
    {
        let kind = policy.action_kind();
        if env.action_kind() != kind {
            bail!(
                "policy acts in {kind:?} but the environment expects {:?}",
                env.action_kind()
            );
        }
        if self.episodes == 0 {
            bail!("collection needs at least one episode");
        }

        let mut latents: Vec<Vec<f64>> = Vec::new();
        let mut actions: Vec<Action> = Vec::new();
        let mut frames: Vec<Frame> = Vec::new();
        let mut episode_rewards = OnlineStats::default();

        for episode in 0..self.episodes {
            let seed = self.base_seed + episode as u64;
            let mut state = env.reset(Some(seed));
            policy.reset_episode(seed);
            let mut episode_reward = 0.0;

            for _ in 0..self.max_steps {
                if self.render {
                    let Some(frame) = env.render() else {
                        bail!("rendering requested but the environment returned no frame");
                    };
                    frames.push(frame);
                }
                let out = policy.act(&state)?;
                if out.latent.len() != policy.latent_size() {
                    bail!(
                        "policy returned a latent of width {}, expected {}",
                        out.latent.len(),
                        policy.latent_size()
                    );
                }
                let result = env.step(&out.action)?;
                latents.push(out.latent);
                actions.push(out.action);
                episode_reward += result.reward;
                state = result.observation;
                if result.done {
                    break;
                }
            }

            episode_rewards
                .add(episode_reward)
                .with_context(|| format!("episode {episode} reward"))?;
            if self.verbosity > 0 {
                eprintln!(
                    "[collector] episode {episode}: reward {episode_reward:.3}, {} samples so far",
                    latents.len()
                );
            }
        }

        let frames = if self.render { Some(frames) } else { None };
        let set = TrainingSet::from_steps(&latents, &actions, kind, frames)?;
        let info = CollectionInfo {
            policy_version: policy.version().to_string(),
            episodes: self.episodes,
            mean_episode_reward: episode_rewards.mean(),
            seed: self.base_seed,
        };
        Ok((set, info))
    }
}
