// src/rl/synthetic.rs
//
// Seeded stand-ins for a real simulator and a pretrained agent, so the full
// collect -> train -> project -> evaluate pipeline runs without external
// dependencies.
//
// SyntheticEnv: a noisy linear system. Each step the state decays toward the
// origin, the action pushes on it, and the reward is `1 - mean(s^2)`. The
// episode ends at the horizon or when any coordinate leaves `±STATE_BOUND`.
//
// SyntheticPolicy: a frozen two-layer network. The latent is
// `tanh(W1 · state)`; the action is the head applied to the latent, through
// argmax (discrete) or the configured output activation (continuous).

use anyhow::{bail, Result};
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::model::output::{argmax, OutputActivation};
use crate::types::{Action, ActionKind, Frame};

use super::env::{Environment, StepInfo, StepResult};
use super::policy::{BlackBoxPolicy, PolicyOutput};

pub const SYNTHETIC_POLICY_VERSION: &str = "synthetic-policy-v1";

const STATE_DECAY: f64 = 0.9;
const ACTION_GAIN: f64 = 0.2;
const STATE_NOISE: f64 = 0.05;
const STATE_BOUND: f64 = 3.0;
const FRAME_SIZE: usize = 16;

pub struct SyntheticEnv {
    observation_size: usize,
    action_kind: ActionKind,
    horizon: usize,
    state: Vec<f64>,
    step: usize,
    done: bool,
    episodes_started: u64,
    rng: ChaCha8Rng,
}

impl SyntheticEnv {
    pub fn new(observation_size: usize, action_kind: ActionKind, horizon: usize) -> Result<Self> {
        if observation_size == 0 || horizon == 0 {
            bail!("synthetic env needs a non-empty observation and a positive horizon");
        }
        if action_kind.output_dim() == 0 {
            bail!("synthetic env needs a non-empty action space");
        }
        Ok(Self {
            observation_size,
            action_kind,
            horizon,
            state: vec![0.0; observation_size],
            step: 0,
            done: true,
            episodes_started: 0,
            rng: ChaCha8Rng::seed_from_u64(0),
        })
    }

    fn control(&self, action: &Action) -> Vec<f64> {
        let mut u = vec![0.0; self.observation_size];
        match action {
            Action::Discrete(a) => {
                let i = a % self.observation_size;
                u[i] = self.state[i].signum();
            }
            Action::Continuous(v) => {
                for (ui, &vi) in u.iter_mut().zip(v) {
                    *ui = vi;
                }
            }
        }
        u
    }

    fn channel(&self, i: usize) -> u8 {
        let v = self.state.get(i).copied().unwrap_or(0.0);
        ((v.tanh() + 1.0) * 127.5).round().clamp(0.0, 255.0) as u8
    }
}

impl Environment for SyntheticEnv {
    fn action_kind(&self) -> ActionKind {
        self.action_kind
    }

    fn observation_size(&self) -> usize {
        self.observation_size
    }

    fn reset(&mut self, seed: Option<u64>) -> Vec<f64> {
        let seed = seed.unwrap_or(self.episodes_started);
        self.episodes_started += 1;
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        let rng = &mut self.rng;
        self.state = (0..self.observation_size)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();
        self.step = 0;
        self.done = false;
        self.state.clone()
    }

    fn step(&mut self, action: &Action) -> Result<StepResult> {
        if self.done {
            bail!("step called on a finished episode; reset first");
        }
        if !action.conforms_to(self.action_kind) {
            bail!("action {action:?} does not fit {:?}", self.action_kind);
        }
        let u = self.control(action);
        let noise = Normal::new(0.0, STATE_NOISE)?;
        for (s, ui) in self.state.iter_mut().zip(u) {
            *s = STATE_DECAY * *s - ACTION_GAIN * ui + noise.sample(&mut self.rng);
        }
        let mean_sq = self.state.iter().map(|s| s * s).sum::<f64>() / self.observation_size as f64;
        let reward = 1.0 - mean_sq;

        let info_step = self.step;
        self.step += 1;
        let termination_reason = if self.state.iter().any(|s| s.abs() > STATE_BOUND) {
            Some("out_of_bounds".to_string())
        } else if self.step >= self.horizon {
            Some("horizon".to_string())
        } else {
            None
        };
        self.done = termination_reason.is_some();

        Ok(StepResult {
            observation: self.state.clone(),
            reward,
            done: self.done,
            info: StepInfo {
                step: info_step,
                termination_reason,
            },
        })
    }

    /// A small frame: background colour from the first three coordinates,
    /// a white marker at the (s0, s1) position.
    fn render(&self) -> Option<Frame> {
        let bg = [self.channel(0), self.channel(1), self.channel(2)];
        let to_pixel = |v: f64| {
            let t = (v / STATE_BOUND).clamp(-1.0, 1.0);
            (((t + 1.0) * 0.5) * (FRAME_SIZE - 1) as f64).round() as usize
        };
        let mx = to_pixel(self.state.first().copied().unwrap_or(0.0));
        let my = to_pixel(self.state.get(1).copied().unwrap_or(0.0));

        let mut rgb = Vec::with_capacity(FRAME_SIZE * FRAME_SIZE * 3);
        for y in 0..FRAME_SIZE {
            for x in 0..FRAME_SIZE {
                if x == mx && y == my {
                    rgb.extend_from_slice(&[255, 255, 255]);
                } else {
                    rgb.extend_from_slice(&bg);
                }
            }
        }
        Frame::new(FRAME_SIZE, FRAME_SIZE, rgb).ok()
    }
}

pub struct SyntheticPolicy {
    encoder: Array2<f64>,
    head: Array2<f64>,
    action_kind: ActionKind,
    output: OutputActivation,
}

impl SyntheticPolicy {
    /// Random frozen weights drawn from `N(0, 1/fan_in)`.
    pub fn new(
        observation_size: usize,
        latent_size: usize,
        action_kind: ActionKind,
        output: OutputActivation,
        seed: u64,
    ) -> Result<Self> {
        if observation_size == 0 || latent_size == 0 {
            bail!("synthetic policy needs non-empty observations and latents");
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let enc = Normal::new(0.0, 1.0 / (observation_size as f64).sqrt())?;
        let head = Normal::new(0.0, 2.0 / (latent_size as f64).sqrt())?;
        let encoder = Array2::from_shape_fn((latent_size, observation_size), |_| enc.sample(&mut rng));
        let head = Array2::from_shape_fn((action_kind.output_dim(), latent_size), |_| {
            head.sample(&mut rng)
        });
        Ok(Self {
            encoder,
            head,
            action_kind,
            output,
        })
    }
}

impl BlackBoxPolicy for SyntheticPolicy {
    fn version(&self) -> &str {
        SYNTHETIC_POLICY_VERSION
    }

    fn action_kind(&self) -> ActionKind {
        self.action_kind
    }

    fn latent_size(&self) -> usize {
        self.encoder.nrows()
    }

    fn act(&mut self, state: &[f64]) -> Result<PolicyOutput> {
        if state.len() != self.encoder.ncols() {
            bail!(
                "state has width {}, policy expects {}",
                state.len(),
                self.encoder.ncols()
            );
        }
        let s = Array1::from(state.to_vec());
        let latent = self.encoder.dot(&s).mapv(f64::tanh);
        let logits = self.head.dot(&latent);
        let action = match self.action_kind {
            ActionKind::Discrete { .. } => Action::Discrete(argmax(logits.view())),
            ActionKind::Continuous { .. } => {
                let row = logits.insert_axis(ndarray::Axis(0));
                Action::Continuous(self.output.apply(&row)?.iter().copied().collect())
            }
        };
        Ok(PolicyOutput {
            action,
            latent: latent.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::output::Activation;

    fn rollout(env: &mut SyntheticEnv, policy: &mut SyntheticPolicy, seed: u64) -> Vec<f64> {
        let mut s = env.reset(Some(seed));
        let mut rewards = Vec::new();
        loop {
            let out = policy.act(&s).unwrap();
            let r = env.step(&out.action).unwrap();
            rewards.push(r.reward);
            s = r.observation;
            if r.done {
                break;
            }
        }
        rewards
    }

    #[test]
    fn same_seed_same_episode() {
        let kind = ActionKind::Discrete { num_actions: 4 };
        let mut env = SyntheticEnv::new(6, kind, 25).unwrap();
        let mut policy = SyntheticPolicy::new(6, 10, kind, OutputActivation::Softmax, 3).unwrap();
        let a = rollout(&mut env, &mut policy, 9);
        let b = rollout(&mut env, &mut policy, 9);
        assert_eq!(a, b);
        assert!(a.len() <= 25);
    }

    #[test]
    fn continuous_actions_respect_output_activation() {
        let kind = ActionKind::Continuous { dim: 3 };
        let output =
            OutputActivation::PerChannel(vec![Activation::Tanh, Activation::Relu, Activation::Relu]);
        let mut env = SyntheticEnv::new(5, kind, 10).unwrap();
        let mut policy = SyntheticPolicy::new(5, 8, kind, output, 1).unwrap();
        let s = env.reset(Some(0));
        let out = policy.act(&s).unwrap();
        assert_eq!(out.latent.len(), 8);
        let a = out.action.as_continuous().unwrap();
        assert!(a[0].abs() <= 1.0);
        assert!(a[1] >= 0.0 && a[2] >= 0.0);
    }

    #[test]
    fn step_after_done_is_rejected() {
        let kind = ActionKind::Discrete { num_actions: 2 };
        let mut env = SyntheticEnv::new(3, kind, 1).unwrap();
        env.reset(Some(0));
        let r = env.step(&Action::Discrete(0)).unwrap();
        assert!(r.done);
        assert!(env.step(&Action::Discrete(0)).is_err());
    }

    #[test]
    fn render_has_expected_size() {
        let kind = ActionKind::Continuous { dim: 2 };
        let mut env = SyntheticEnv::new(4, kind, 5).unwrap();
        env.reset(Some(2));
        let frame = env.render().unwrap();
        assert_eq!(frame.rgb.len(), FRAME_SIZE * FRAME_SIZE * 3);
    }
}
