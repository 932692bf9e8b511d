// src/types.rs
//
// Shared value types for the wrapper pipeline:
// - ActionKind / Action: the black-box policy's action space and values.
// - Frame: an optional rendered RGB observation used for exemplar export.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Shape of a policy's action space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    /// One of `num_actions` discrete choices.
    Discrete { num_actions: usize },
    /// A real-valued control vector of length `dim`.
    Continuous { dim: usize },
}

impl ActionKind {
    /// Number of surrogate output channels for this action space.
    ///
    /// This is also the number of classes the prototypes are partitioned into.
    pub fn output_dim(&self) -> usize {
        match *self {
            ActionKind::Discrete { num_actions } => num_actions,
            ActionKind::Continuous { dim } => dim,
        }
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self, ActionKind::Discrete { .. })
    }
}

/// A single action, either taken by the black box or proposed by the surrogate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    Discrete(usize),
    Continuous(Vec<f64>),
}

impl Action {
    /// Whether this action is a valid member of `kind`.
    pub fn conforms_to(&self, kind: ActionKind) -> bool {
        match (self, kind) {
            (Action::Discrete(a), ActionKind::Discrete { num_actions }) => *a < num_actions,
            (Action::Continuous(v), ActionKind::Continuous { dim }) => v.len() == dim,
            _ => false,
        }
    }

    pub fn as_discrete(&self) -> Option<usize> {
        match self {
            Action::Discrete(a) => Some(*a),
            Action::Continuous(_) => None,
        }
    }

    pub fn as_continuous(&self) -> Option<&[f64]> {
        match self {
            Action::Discrete(_) => None,
            Action::Continuous(v) => Some(v),
        }
    }

    /// Per-step imitation error between `self` and a reference action.
    ///
    /// Continuous: squared error averaged over action dimensions.
    /// Discrete: 0.0 on agreement, 1.0 on disagreement.
    pub fn imitation_error(&self, reference: &Action) -> Result<f64> {
        match (self, reference) {
            (Action::Discrete(a), Action::Discrete(b)) => Ok(if a == b { 0.0 } else { 1.0 }),
            (Action::Continuous(a), Action::Continuous(b)) => {
                if a.len() != b.len() || a.is_empty() {
                    bail!(
                        "action dimension mismatch: {} vs {}",
                        a.len(),
                        b.len()
                    );
                }
                let sse: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
                Ok(sse / a.len() as f64)
            }
            _ => bail!("cannot compare a discrete action with a continuous one"),
        }
    }
}

/// A rendered RGB frame (row-major, 3 bytes per pixel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub width: usize,
    pub height: usize,
    pub rgb: Vec<u8>,
}

impl Frame {
    pub fn new(width: usize, height: usize, rgb: Vec<u8>) -> Result<Self> {
        let frame = Self { width, height, rgb };
        frame.check()?;
        Ok(frame)
    }

    /// Fails unless the buffer holds exactly `width * height` RGB pixels.
    pub fn check(&self) -> Result<()> {
        let expected = self.width * self.height * 3;
        if self.rgb.len() != expected {
            bail!(
                "frame buffer has {} bytes, expected {}x{}x3 = {expected}",
                self.rgb.len(),
                self.width,
                self.height
            );
        }
        Ok(())
    }

    /// Encode as a binary PPM (P6) image.
    pub fn to_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.extend_from_slice(&self.rgb);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_error_is_disagreement() {
        let a = Action::Discrete(2);
        assert_eq!(a.imitation_error(&Action::Discrete(2)).unwrap(), 0.0);
        assert_eq!(a.imitation_error(&Action::Discrete(0)).unwrap(), 1.0);
    }

    #[test]
    fn continuous_error_is_mean_squared() {
        let a = Action::Continuous(vec![1.0, 0.0]);
        let b = Action::Continuous(vec![0.0, 2.0]);
        assert!((a.imitation_error(&b).unwrap() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn mixed_kinds_are_rejected() {
        let a = Action::Discrete(0);
        assert!(a.imitation_error(&Action::Continuous(vec![0.0])).is_err());
    }

    #[test]
    fn conforms_checks_range_and_dim() {
        assert!(Action::Discrete(3).conforms_to(ActionKind::Discrete { num_actions: 4 }));
        assert!(!Action::Discrete(4).conforms_to(ActionKind::Discrete { num_actions: 4 }));
        assert!(!Action::Continuous(vec![0.0; 3]).conforms_to(ActionKind::Continuous { dim: 4 }));
    }

    #[test]
    fn ppm_header_and_payload() {
        let frame = Frame::new(2, 1, vec![1, 2, 3, 4, 5, 6]).unwrap();
        let ppm = frame.to_ppm();
        assert!(ppm.starts_with(b"P6\n2 1\n255\n"));
        assert_eq!(&ppm[ppm.len() - 6..], &[1, 2, 3, 4, 5, 6]);
        assert!(Frame::new(2, 2, vec![0; 3]).is_err());
    }
}
