// src/dataset.rs
//
// Training data: (embedding, action label) pairs collected from the black-box
// policy, optionally with the rendered frame of each visited state.
//
// On disk a dataset is a directory of `.npy` arrays plus a `metadata.json`
// manifest carrying the SHA256 of each array file:
//
//     X_train.npy     f64 [N, L]
//     a_train.npy     f64 [N, A] (continuous) | i64 [N] (discrete)
//     obs_train.npy   u8  [N, H, W, 3] (optional)
//     metadata.json
//
// The manifest is written last, so its presence marks a complete dataset.
// Loading verifies every digest and refuses a tampered or stale set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2, Array4, ArrayView1, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::io::{load_npy_verified, persist, persist_npy};
use crate::types::{Action, ActionKind, Frame};

pub const DATASET_FORMAT_VERSION: &str = "pwnet-dataset-v2";

pub const EMBEDDINGS_FILE: &str = "X_train.npy";
pub const ACTIONS_FILE: &str = "a_train.npy";
pub const FRAMES_FILE: &str = "obs_train.npy";
const METADATA_FILE: &str = "metadata.json";

/// How an action label maps to a class index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelDerivation {
    /// Discrete labels are their own class.
    Identity,
    /// Class = channel with the largest of `|a0|, a1, a2, ...` (first wins).
    DominantChannel,
}

/// Class of a continuous action under `DominantChannel`.
pub fn dominant_channel(action: ArrayView1<f64>) -> usize {
    let mut best = 0;
    let mut best_val = f64::NEG_INFINITY;
    for (k, &v) in action.iter().enumerate() {
        let m = if k == 0 { v.abs() } else { v };
        if m > best_val {
            best = k;
            best_val = m;
        }
    }
    best
}

/// Action labels for a set of examples.
#[derive(Debug, Clone, PartialEq)]
pub enum Labels {
    Discrete(Vec<usize>),
    Continuous(Array2<f64>),
}

impl Labels {
    pub fn len(&self) -> usize {
        match self {
            Labels::Discrete(v) => v.len(),
            Labels::Continuous(a) => a.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn select(&self, idx: &[usize]) -> Labels {
        match self {
            Labels::Discrete(v) => Labels::Discrete(idx.iter().map(|&i| v[i]).collect()),
            Labels::Continuous(a) => Labels::Continuous(a.select(Axis(0), idx)),
        }
    }

    pub fn action(&self, i: usize) -> Action {
        match self {
            Labels::Discrete(v) => Action::Discrete(v[i]),
            Labels::Continuous(a) => Action::Continuous(a.row(i).to_vec()),
        }
    }

    /// Class index per example.
    pub fn classes(&self, derivation: LabelDerivation) -> Result<Vec<usize>> {
        match (self, derivation) {
            (Labels::Discrete(v), _) => Ok(v.clone()),
            (Labels::Continuous(a), LabelDerivation::DominantChannel) => {
                Ok(a.rows().into_iter().map(dominant_channel).collect())
            }
            (Labels::Continuous(_), LabelDerivation::Identity) => {
                bail!("continuous labels need a class derivation rule")
            }
        }
    }
}

/// A fixed, read-only training set.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    embeddings: Array2<f64>,
    labels: Labels,
    frames: Option<Vec<Frame>>,
}

impl TrainingSet {
    pub fn new(embeddings: Array2<f64>, labels: Labels, frames: Option<Vec<Frame>>) -> Result<Self> {
        if embeddings.nrows() != labels.len() {
            bail!(
                "{} embeddings but {} action labels",
                embeddings.nrows(),
                labels.len()
            );
        }
        if let Some(frames) = &frames {
            if frames.len() != embeddings.nrows() {
                bail!("{} embeddings but {} frames", embeddings.nrows(), frames.len());
            }
            for (i, frame) in frames.iter().enumerate() {
                frame.check().with_context(|| format!("frame {i}"))?;
            }
            if let Some(first) = frames.first() {
                if frames
                    .iter()
                    .any(|f| f.width != first.width || f.height != first.height)
                {
                    bail!("frames must all share one size");
                }
            }
        }
        Ok(Self {
            embeddings,
            labels,
            frames,
        })
    }

    /// Build from per-step policy outputs.
    pub fn from_steps(
        latents: &[Vec<f64>],
        actions: &[Action],
        kind: ActionKind,
        frames: Option<Vec<Frame>>,
    ) -> Result<Self> {
        let n = latents.len();
        let width = latents.first().map(|l| l.len()).unwrap_or(0);
        if latents.iter().any(|l| l.len() != width) {
            bail!("latent vectors have inconsistent widths");
        }
        let flat: Vec<f64> = latents.iter().flatten().copied().collect();
        let embeddings = Array2::from_shape_vec((n, width), flat)?;

        if let Some(bad) = actions.iter().position(|a| !a.conforms_to(kind)) {
            bail!("action {bad} ({:?}) does not fit {kind:?}", actions[bad]);
        }
        let labels = match kind {
            ActionKind::Discrete { .. } => {
                Labels::Discrete(actions.iter().filter_map(Action::as_discrete).collect())
            }
            ActionKind::Continuous { dim } => {
                let flat: Vec<f64> = actions
                    .iter()
                    .filter_map(Action::as_continuous)
                    .flatten()
                    .copied()
                    .collect();
                Labels::Continuous(Array2::from_shape_vec((actions.len(), dim), flat)?)
            }
        };
        Self::new(embeddings, labels, frames)
    }

    pub fn len(&self) -> usize {
        self.embeddings.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latent_size(&self) -> usize {
        self.embeddings.ncols()
    }

    pub fn embeddings(&self) -> &Array2<f64> {
        &self.embeddings
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn frames(&self) -> Option<&[Frame]> {
        self.frames.as_deref()
    }

    pub fn frame(&self, i: usize) -> Option<&Frame> {
        self.frames.as_ref().and_then(|f| f.get(i))
    }

    /// Keep only the first `n` examples.
    pub fn truncated(&self, n: usize) -> TrainingSet {
        if n >= self.len() {
            return self.clone();
        }
        let idx: Vec<usize> = (0..n).collect();
        TrainingSet {
            embeddings: self.embeddings.select(Axis(0), &idx),
            labels: self.labels.select(&idx),
            frames: self.frames.as_ref().map(|f| f[..n].to_vec()),
        }
    }

    /// Embeddings and labels for the given rows.
    pub fn batch(&self, idx: &[usize]) -> (Array2<f64>, Labels) {
        (self.embeddings.select(Axis(0), idx), self.labels.select(idx))
    }
}

/// Shuffle `0..len` and split into mini-batches (the last one may be short).
pub fn shuffled_batches<R: Rng>(len: usize, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let mut idx: Vec<usize> = (0..len).collect();
    idx.shuffle(rng);
    idx.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect()
}

/// Provenance recorded next to a collected dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub policy_version: String,
    pub episodes: usize,
    pub mean_episode_reward: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub format_version: String,
    pub num_examples: usize,
    pub latent_size: usize,
    pub action_kind: ActionKind,
    /// (height, width) of stored frames, if any.
    pub frame_shape: Option<(usize, usize)>,
    pub collection: CollectionInfo,
    /// File name -> `sha256:<hex>`.
    pub files: BTreeMap<String, String>,
}

/// A dataset directory.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    dir: PathBuf,
}

impl DatasetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether a complete dataset (metadata included) is present.
    pub fn exists(&self) -> bool {
        self.dir.join(METADATA_FILE).is_file()
    }

    pub fn write(
        &self,
        set: &TrainingSet,
        kind: ActionKind,
        info: &CollectionInfo,
    ) -> Result<DatasetMetadata> {
        let mut files = BTreeMap::new();
        let digest = persist_npy(&self.dir.join(EMBEDDINGS_FILE), &set.embeddings)?;
        files.insert(EMBEDDINGS_FILE.to_string(), digest);

        let digest = match (&set.labels, kind) {
            (Labels::Discrete(v), ActionKind::Discrete { .. }) => {
                let actions = v
                    .iter()
                    .map(|&a| i64::try_from(a).context("discrete action does not fit in i64"))
                    .collect::<Result<Array1<i64>>>()?;
                persist_npy(&self.dir.join(ACTIONS_FILE), &actions)?
            }
            (Labels::Continuous(a), ActionKind::Continuous { dim }) if a.ncols() == dim => {
                persist_npy(&self.dir.join(ACTIONS_FILE), a)?
            }
            _ => bail!("labels do not match action kind {kind:?}"),
        };
        files.insert(ACTIONS_FILE.to_string(), digest);

        let mut frame_shape = None;
        if let Some(frames) = set.frames() {
            let (h, w) = frames.first().map(|f| (f.height, f.width)).unwrap_or((0, 0));
            let pixels: Vec<u8> = frames.iter().flat_map(|f| f.rgb.iter().copied()).collect();
            let obs = Array4::from_shape_vec((set.len(), h, w, 3), pixels)
                .context("frames do not form an [N, H, W, 3] array")?;
            files.insert(
                FRAMES_FILE.to_string(),
                persist_npy(&self.dir.join(FRAMES_FILE), &obs)?,
            );
            frame_shape = Some((h, w));
        } else {
            let stale = self.dir.join(FRAMES_FILE);
            if stale.exists() {
                std::fs::remove_file(&stale)
                    .with_context(|| format!("Failed to remove stale {}", stale.display()))?;
            }
        }

        let metadata = DatasetMetadata {
            format_version: DATASET_FORMAT_VERSION.to_string(),
            num_examples: set.len(),
            latent_size: set.latent_size(),
            action_kind: kind,
            frame_shape,
            collection: info.clone(),
            files,
        };
        let json = serde_json::to_vec_pretty(&metadata).context("Failed to serialize dataset metadata")?;
        persist(&self.dir.join(METADATA_FILE), &json)?;
        Ok(metadata)
    }

    pub fn load_metadata(&self) -> Result<DatasetMetadata> {
        let path = self.dir.join(METADATA_FILE);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read dataset metadata: {}", path.display()))?;
        let metadata: DatasetMetadata = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse dataset metadata: {}", path.display()))?;
        if metadata.format_version != DATASET_FORMAT_VERSION {
            bail!(
                "dataset {} has format {}, expected {}",
                self.dir.display(),
                metadata.format_version,
                DATASET_FORMAT_VERSION
            );
        }
        Ok(metadata)
    }

    /// Read one array listed in the manifest, checking its digest.
    fn array<T: ndarray_npy::ReadNpyExt>(&self, metadata: &DatasetMetadata, name: &str) -> Result<T> {
        let digest = metadata
            .files
            .get(name)
            .with_context(|| format!("dataset {} lists no digest for {name}", self.dir.display()))?;
        load_npy_verified(&self.dir.join(name), digest)
    }

    pub fn load(&self) -> Result<(TrainingSet, DatasetMetadata)> {
        let metadata = self.load_metadata()?;
        let n = metadata.num_examples;

        let embeddings: Array2<f64> = self.array(&metadata, EMBEDDINGS_FILE)?;
        if embeddings.dim() != (n, metadata.latent_size) {
            bail!(
                "embeddings have shape {:?}, metadata says [{n}, {}]",
                embeddings.shape(),
                metadata.latent_size
            );
        }

        let labels = match metadata.action_kind {
            ActionKind::Discrete { num_actions } => {
                let stored: Array1<i64> = self.array(&metadata, ACTIONS_FILE)?;
                if stored.len() != n {
                    bail!("{} discrete actions stored, expected {n}", stored.len());
                }
                let labels = stored
                    .iter()
                    .map(|&a| match usize::try_from(a) {
                        Ok(a) if a < num_actions => Ok(a),
                        _ => bail!("stored action {a} out of range for {num_actions} actions"),
                    })
                    .collect::<Result<Vec<usize>>>()?;
                Labels::Discrete(labels)
            }
            ActionKind::Continuous { dim } => {
                let stored: Array2<f64> = self.array(&metadata, ACTIONS_FILE)?;
                if stored.dim() != (n, dim) {
                    bail!(
                        "continuous actions have shape {:?}, expected [{n}, {dim}]",
                        stored.shape()
                    );
                }
                Labels::Continuous(stored)
            }
        };

        let frames = match metadata.frame_shape {
            Some((h, w)) => {
                let obs: Array4<u8> = self.array(&metadata, FRAMES_FILE)?;
                if obs.dim() != (n, h, w, 3) {
                    bail!("frames have shape {:?}, expected [{n}, {h}, {w}, 3]", obs.shape());
                }
                let frames = obs
                    .outer_iter()
                    .map(|pixels| Frame::new(w, h, pixels.iter().copied().collect()))
                    .collect::<Result<Vec<_>>>()?;
                Some(frames)
            }
            None => None,
        };

        let set = TrainingSet::new(embeddings, labels, frames)?;
        Ok((set, metadata))
    }
}
