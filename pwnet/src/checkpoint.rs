// src/checkpoint.rs
//
// Model checkpoints: the full surrogate (parameters, running statistics,
// temperature and phase) serialized as JSON and written atomically.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::io::persist;
use crate::model::SurrogateModel;

pub const CHECKPOINT_FORMAT_VERSION: &str = "pwnet-checkpoint-v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: String,
    /// Epoch the snapshot was taken at, if taken during training.
    pub epoch: Option<usize>,
    /// Training metric at that epoch.
    pub metric: Option<f64>,
    pub model: SurrogateModel,
}

pub fn save_checkpoint(
    path: &Path,
    model: &SurrogateModel,
    epoch: Option<usize>,
    metric: Option<f64>,
) -> Result<()> {
    let ckpt = Checkpoint {
        format_version: CHECKPOINT_FORMAT_VERSION.to_string(),
        epoch,
        metric,
        model: model.clone(),
    };
    let json = serde_json::to_vec(&ckpt).context("Failed to serialize checkpoint")?;
    persist(path, &json)
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let raw = std::fs::read(path)
        .with_context(|| format!("Failed to read checkpoint: {}", path.display()))?;
    let ckpt: Checkpoint = serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse checkpoint: {}", path.display()))?;
    if ckpt.format_version != CHECKPOINT_FORMAT_VERSION {
        bail!(
            "checkpoint {} has format {}, expected {}",
            path.display(),
            ckpt.format_version,
            CHECKPOINT_FORMAT_VERSION
        );
    }
    Ok(ckpt)
}
