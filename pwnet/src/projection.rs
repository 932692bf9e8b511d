// src/projection.rs
//
// Prototype projection: replace every prototype with its nearest real
// training example, found by exact brute-force Euclidean search in the
// comparison space (first index wins ties).
//
// - Comparison-space prototypes become the comparison-space embedding of the
//   matched example.
// - Raw-space prototypes become the raw embedding of the matched example.
//
// Either way the prototype is a bit-for-bit copy of a stored vector and the
// model moves to the `Projected` phase. Exemplar frames for the matches can be
// exported as `p<k>.ppm` (1-based).

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use ndarray::{Array2, ArrayView1, Zip};
use serde::{Deserialize, Serialize};

use crate::config::PrototypeSpace;
use crate::dataset::TrainingSet;
use crate::io::persist;
use crate::model::SurrogateModel;

/// The training example a prototype was projected onto.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrototypeMatch {
    pub prototype: usize,
    pub example: usize,
    /// Euclidean distance in comparison space before replacement.
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionReport {
    pub matches: Vec<PrototypeMatch>,
}

impl ProjectionReport {
    pub fn sources(&self) -> Vec<usize> {
        self.matches.iter().map(|m| m.example).collect()
    }

    pub fn mean_distance(&self) -> f64 {
        if self.matches.is_empty() {
            return 0.0;
        }
        self.matches.iter().map(|m| m.distance).sum::<f64>() / self.matches.len() as f64
    }
}

/// Index and Euclidean distance of the row of `candidates` nearest to `target`.
///
/// Returns None for an empty candidate set.
pub fn nearest_neighbor(candidates: &Array2<f64>, target: ArrayView1<f64>) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, row) in candidates.rows().into_iter().enumerate() {
        let d2 = Zip::from(&row).and(&target).fold(0.0, |acc, &a, &b| {
            let diff = a - b;
            acc + diff * diff
        });
        match best {
            Some((_, best_d2)) if best_d2 <= d2 => {}
            _ => best = Some((i, d2)),
        }
    }
    best.map(|(i, d2)| (i, d2.sqrt()))
}

/// Project every prototype of `model` onto its nearest training example.
pub fn project_prototypes(model: &mut SurrogateModel, dataset: &TrainingSet) -> Result<ProjectionReport> {
    if dataset.is_empty() {
        bail!("cannot project prototypes onto an empty training set");
    }
    let embedded = model.embed(dataset.embeddings())?;
    let targets = model.comparison_prototypes();

    let mut matches = Vec::with_capacity(targets.nrows());
    let mut replacement = model.prototypes().clone();
    for (k, target) in targets.rows().into_iter().enumerate() {
        let Some((nn, distance)) = nearest_neighbor(&embedded, target) else {
            bail!("no nearest neighbour for prototype {k}");
        };
        let source = match model.config().prototype_space {
            PrototypeSpace::Comparison => embedded.row(nn),
            PrototypeSpace::Raw => dataset.embeddings().row(nn),
        };
        replacement.row_mut(k).assign(&source);
        matches.push(PrototypeMatch {
            prototype: k,
            example: nn,
            distance,
        });
    }

    let report = ProjectionReport { matches };
    model.replace_prototypes(replacement, report.sources())?;
    Ok(report)
}

/// Write the frame behind each match as `dir/p<k>.ppm`. Returns the written
/// paths; a dataset without frames writes nothing.
pub fn export_exemplars(report: &ProjectionReport, dataset: &TrainingSet, dir: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    if dataset.frames().is_none() {
        return Ok(written);
    }
    for m in &report.matches {
        let Some(frame) = dataset.frame(m.example) else {
            bail!("no frame stored for training example {}", m.example);
        };
        let path = dir.join(format!("p{}.ppm", m.prototype + 1));
        persist(&path, &frame.to_ppm())?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn nearest_neighbor_first_index_wins_ties() {
        let c = array![[1.0, 0.0], [0.0, 1.0], [1.0, 0.0]];
        let (i, d) = nearest_neighbor(&c, array![1.0, 0.0].view()).unwrap();
        assert_eq!(i, 0);
        assert_eq!(d, 0.0);
        let (i, _) = nearest_neighbor(&c, array![0.5, 0.5].view()).unwrap();
        assert_eq!(i, 0);
    }

    #[test]
    fn nearest_neighbor_of_empty_set() {
        let c = Array2::<f64>::zeros((0, 2));
        assert!(nearest_neighbor(&c, array![0.0, 0.0].view()).is_none());
    }
}
