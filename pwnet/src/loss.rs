// src/loss.rs
//
// Composite training loss for the surrogate and its analytic gradients.
//
//     total = w_imit * imitation
//           + w_clst * clustering
//           - w_sep  * separation
//           + w_orth * orthogonality
//           + w_l1   * sparsity
//
// Every term reports its unweighted value in `LossBreakdown`. Gradients are
// returned against the pieces of the forward pass they touch (logits,
// distances, comparison-space prototypes) plus direct parameter gradients for
// the soft-slot regularizers. Clustering and separation read the same
// distance matrix the forward pass produced.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use crate::dataset::Labels;
use crate::model::assignment::SoftSlotAssignment;
use crate::model::output::{logsumexp_rows, softmax_rows};
use crate::model::{ForwardPass, Gradients, SurrogateModel};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    pub imitation: f64,
    pub clustering: f64,
    /// Positive; the separation term is subtracted.
    pub separation: f64,
    pub orthogonality: f64,
    pub sparsity: f64,
}

impl LossWeights {
    /// Imitation only.
    pub fn imitation_only() -> Self {
        Self {
            imitation: 1.0,
            clustering: 0.0,
            separation: 0.0,
            orthogonality: 0.0,
            sparsity: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterMode {
    /// Every prototype is pulled toward every example.
    AllPrototypes,
    /// Each present class is pulled toward its nearest own prototype.
    OwnClass,
    /// Each example is pulled toward the nearest of its class's top-S prototypes.
    TopSlots,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeparationMode {
    /// Mean pairwise Euclidean distance between prototypes.
    PrototypePairs,
    /// Distance of each present class to the other present classes' prototypes.
    OtherClasses,
    /// Distance of each example to the prototypes its class does not use.
    UnassignedSlots,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    pub weights: LossWeights,
    pub clustering: ClusterMode,
    pub separation: SeparationMode,
}

/// Unweighted loss terms and the weighted total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    pub imitation: f64,
    pub clustering: f64,
    pub separation: f64,
    pub orthogonality: f64,
    pub sparsity: f64,
    pub total: f64,
}

impl LossBreakdown {
    fn with_total(mut self, w: &LossWeights) -> Self {
        self.total = w.imitation * self.imitation + w.clustering * self.clustering
            - w.separation * self.separation
            + w.orthogonality * self.orthogonality
            + w.sparsity * self.sparsity;
        self
    }

    /// Element-wise running mean helper: `self += other / n`.
    pub fn accumulate_mean(&mut self, other: &LossBreakdown, n: usize) {
        let k = 1.0 / n.max(1) as f64;
        self.imitation += other.imitation * k;
        self.clustering += other.clustering * k;
        self.separation += other.separation * k;
        self.orthogonality += other.orthogonality * k;
        self.sparsity += other.sparsity * k;
        self.total += other.total * k;
    }
}

/// Loss value and gradients for one forward pass.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub breakdown: LossBreakdown,
    pub d_logits: Array2<f64>,
    pub d_distances: Array2<f64>,
    pub d_prototypes: Array2<f64>,
    /// Direct gradients of parameters that bypass the forward graph.
    pub param_grads: Gradients,
}

/// Class owning each prototype: the fixed layout in the strict regime, the
/// class drawing the most assignment mass in the soft-slot regime.
pub fn prototype_owners(model: &SurrogateModel, pass: &ForwardPass) -> Vec<usize> {
    let p = model.num_prototypes();
    if let Some(strict) = model.strict_assignment() {
        return (0..p).map(|j| strict.prototype_class(j)).collect();
    }
    match &pass.assignment {
        Some(a) => {
            let per_class: Vec<Array1<f64>> = (0..a.dim().0)
                .map(|c| SoftSlotAssignment::class_weights(a, c))
                .collect();
            (0..p)
                .map(|j| {
                    let mut best = 0;
                    for (c, w) in per_class.iter().enumerate() {
                        if w[j] > per_class[best][j] {
                            best = c;
                        }
                    }
                    best
                })
                .collect()
        }
        None => vec![0; p],
    }
}

/// Indices of the `k` largest (or smallest) weights; lower index wins ties.
fn select_k(weights: &Array1<f64>, k: usize, largest: bool) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..weights.len()).collect();
    idx.sort_by(|&a, &b| {
        let ord = weights[a].total_cmp(&weights[b]);
        if largest {
            ord.reverse()
        } else {
            ord
        }
    });
    idx.truncate(k);
    idx
}

/// Nearest prototype (by squared distance) among `candidates` for row `b`.
fn nearest_in(distances: &Array2<f64>, b: usize, candidates: &[usize]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for &p in candidates {
        match best {
            Some(q) if distances[[b, q]] <= distances[[b, p]] => {}
            _ => best = Some(p),
        }
    }
    best
}

pub fn composite_loss(
    model: &SurrogateModel,
    pass: &ForwardPass,
    targets: &Labels,
    classes: &[usize],
    config: &LossConfig,
) -> Result<LossOutput> {
    let batch = pass.logits.nrows();
    if targets.len() != batch || classes.len() != batch {
        bail!(
            "batch has {batch} rows but {} labels and {} classes",
            targets.len(),
            classes.len()
        );
    }
    let w = config.weights;
    let mut out = LossOutput {
        breakdown: LossBreakdown::default(),
        d_logits: Array2::zeros(pass.logits.raw_dim()),
        d_distances: Array2::zeros(pass.activations.distances.raw_dim()),
        d_prototypes: Array2::zeros(pass.prototypes.raw_dim()),
        param_grads: Gradients::default(),
    };

    out.breakdown.imitation = imitation(model, pass, targets, w.imitation, &mut out.d_logits)?;

    let owners = prototype_owners(model, pass);
    out.breakdown.clustering = clustering(
        config.clustering,
        model,
        pass,
        classes,
        &owners,
        w.clustering,
        &mut out.d_distances,
    )?;
    out.breakdown.separation = separation(
        config.separation,
        model,
        pass,
        classes,
        &owners,
        -w.separation,
        &mut out.d_distances,
        &mut out.d_prototypes,
    )?;

    if let Some(soft) = model.soft_assignment() {
        let (orth, d_presence) = orthogonality(&soft.presence);
        out.breakdown.orthogonality = orth;
        if w.orthogonality != 0.0 {
            out.param_grads.accumulate("presence", &(d_presence * w.orthogonality));
        }

        let mask = soft.incorrect_mask();
        let masked = &soft.class_identity * &mask;
        out.breakdown.sparsity = masked.mapv(f64::abs).sum();
        if w.sparsity != 0.0 {
            let d = masked.mapv(|v| {
                if v > 0.0 {
                    w.sparsity
                } else if v < 0.0 {
                    -w.sparsity
                } else {
                    0.0
                }
            });
            out.param_grads.accumulate("class_identity", &d);
        }
    }

    out.breakdown = out.breakdown.with_total(&w);
    Ok(out)
}

fn imitation(
    model: &SurrogateModel,
    pass: &ForwardPass,
    targets: &Labels,
    weight: f64,
    d_logits: &mut Array2<f64>,
) -> Result<f64> {
    let (batch, channels) = pass.logits.dim();
    let n = batch.max(1) as f64;
    match targets {
        Labels::Discrete(labels) => {
            if let Some(&bad) = labels.iter().find(|&&y| y >= channels) {
                bail!("action label {bad} out of range for {channels} actions");
            }
            // Cross-entropy on the raw logits.
            let lse = logsumexp_rows(&pass.logits);
            let loss: f64 = labels
                .iter()
                .enumerate()
                .map(|(b, &y)| lse[b] - pass.logits[[b, y]])
                .sum::<f64>()
                / n;
            if weight != 0.0 {
                let mut d = softmax_rows(&pass.logits);
                for (b, &y) in labels.iter().enumerate() {
                    d[[b, y]] -= 1.0;
                }
                *d_logits += &(d * (weight / n));
            }
            Ok(loss)
        }
        Labels::Continuous(y) => {
            if y.dim() != pass.outputs.dim() {
                bail!(
                    "action targets have shape {:?}, surrogate outputs {:?}",
                    y.shape(),
                    pass.outputs.shape()
                );
            }
            let diff = &pass.outputs - y;
            let count = (batch * channels).max(1) as f64;
            let loss = diff.mapv(|v| v * v).sum() / count;
            if weight != 0.0 {
                let d_out = diff * (2.0 * weight / count);
                *d_logits += &model
                    .config()
                    .output
                    .backward(&pass.logits, &pass.outputs, &d_out)?;
            }
            Ok(loss)
        }
    }
}

fn present_classes(classes: &[usize]) -> BTreeSet<usize> {
    classes.iter().copied().collect()
}

fn members(classes: &[usize], c: usize) -> Vec<usize> {
    classes
        .iter()
        .enumerate()
        .filter_map(|(b, &k)| (k == c).then_some(b))
        .collect()
}

fn owned_by(owners: &[usize], c: usize) -> Vec<usize> {
    members(owners, c)
}

fn soft_assignment(pass: &ForwardPass) -> Result<&Array3<f64>> {
    pass.assignment
        .as_ref()
        .context("slot-based loss terms need the soft-slot regime")
}

fn clustering(
    mode: ClusterMode,
    model: &SurrogateModel,
    pass: &ForwardPass,
    classes: &[usize],
    owners: &[usize],
    weight: f64,
    d_dist: &mut Array2<f64>,
) -> Result<f64> {
    let dist = &pass.activations.distances;
    let (batch, _) = dist.dim();
    let dim = pass.comparison.ncols().max(1) as f64;
    if batch == 0 {
        return Ok(0.0);
    }
    match mode {
        ClusterMode::AllPrototypes => {
            let scale = 1.0 / (batch as f64 * dim);
            if weight != 0.0 {
                d_dist.mapv_inplace(|g| g + weight * scale);
            }
            Ok(dist.sum() * scale)
        }
        ClusterMode::OwnClass => {
            let mut total = 0.0;
            for c in present_classes(classes) {
                let protos = owned_by(owners, c);
                let rows = members(classes, c);
                if protos.is_empty() || rows.is_empty() {
                    continue;
                }
                let scale = 1.0 / (rows.len() as f64 * dim);
                for &b in &rows {
                    if let Some(p) = nearest_in(dist, b, &protos) {
                        total += dist[[b, p]] * scale;
                        d_dist[[b, p]] += weight * scale;
                    }
                }
            }
            Ok(total)
        }
        ClusterMode::TopSlots => {
            let a = soft_assignment(pass)?;
            let k = model.config().slots_per_class().unwrap_or(1);
            let mut total = 0.0;
            for (b, &c) in classes.iter().enumerate() {
                let kept = select_k(&SoftSlotAssignment::class_weights(a, c), k, true);
                if let Some(p) = nearest_in(dist, b, &kept) {
                    total += dist[[b, p]] / batch as f64;
                    d_dist[[b, p]] += weight / batch as f64;
                }
            }
            Ok(total)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn separation(
    mode: SeparationMode,
    model: &SurrogateModel,
    pass: &ForwardPass,
    classes: &[usize],
    owners: &[usize],
    coef: f64,
    d_dist: &mut Array2<f64>,
    d_protos: &mut Array2<f64>,
) -> Result<f64> {
    let dist = &pass.activations.distances;
    let (batch, num_protos) = dist.dim();
    let dim = pass.comparison.ncols().max(1) as f64;
    match mode {
        SeparationMode::PrototypePairs => {
            if num_protos < 2 {
                return Ok(0.0);
            }
            let q = &pass.prototypes;
            let pairs = (num_protos * num_protos - num_protos) as f64 / 2.0;
            let mut total = 0.0;
            for i in 0..num_protos {
                for j in 0..num_protos {
                    if i == j {
                        continue;
                    }
                    let diff = &q.row(i) - &q.row(j);
                    let norm = diff.dot(&diff).sqrt();
                    total += norm;
                    if coef != 0.0 && norm > 0.0 {
                        // Both (i, j) and (j, i) depend on row i.
                        let g = diff * (2.0 * coef / (pairs * norm));
                        let mut row = d_protos.row_mut(i);
                        row += &g;
                    }
                }
            }
            Ok(total / pairs)
        }
        SeparationMode::OtherClasses => {
            let present: Vec<usize> = present_classes(classes).into_iter().collect();
            if present.is_empty() {
                return Ok(0.0);
            }
            let norm = (present.len() * present.len()) as f64;
            let mut total = 0.0;
            for &i in &present {
                let rows = members(classes, i);
                for &j in &present {
                    if i == j {
                        continue;
                    }
                    let protos = owned_by(owners, j);
                    if protos.is_empty() || rows.is_empty() {
                        continue;
                    }
                    let scale = 1.0 / (rows.len() as f64 * dim * norm);
                    for &b in &rows {
                        if let Some(p) = nearest_in(dist, b, &protos) {
                            total += dist[[b, p]] * scale;
                            d_dist[[b, p]] += coef * scale;
                        }
                    }
                }
            }
            Ok(total)
        }
        SeparationMode::UnassignedSlots => {
            let a = soft_assignment(pass)?;
            let slots = model.config().slots_per_class().unwrap_or(num_protos);
            let k = num_protos.saturating_sub(slots);
            if k == 0 || batch == 0 {
                return Ok(0.0);
            }
            let mut total = 0.0;
            for (b, &c) in classes.iter().enumerate() {
                let kept = select_k(&SoftSlotAssignment::class_weights(a, c), k, false);
                if let Some(p) = nearest_in(dist, b, &kept) {
                    total += dist[[b, p]] / batch as f64;
                    d_dist[[b, p]] += coef / batch as f64;
                }
            }
            Ok(total)
        }
    }
}

const COSINE_EPS: f64 = 1e-8;

/// Sum over classes of the cosine similarities between every ordered pair of
/// distinct slot vectors `presence[c, :, s]` of that class, divided by the
/// total number of slot vectors. Slots of different classes do not interact.
///
/// Returns the value and its gradient w.r.t. the presence tensor.
pub fn orthogonality(presence: &Array3<f64>) -> (f64, Array3<f64>) {
    let (nc, np, ns) = presence.dim();
    let mut grad = Array3::zeros((nc, np, ns));
    if ns < 2 {
        return (0.0, grad);
    }
    let scale = 1.0 / (nc * ns) as f64;

    let mut total = 0.0;
    for c in 0..nc {
        let slots = presence.index_axis(Axis(0), c);
        let norms: Vec<f64> = slots.columns().into_iter().map(|v| v.dot(&v).sqrt()).collect();
        let mut class_grad = grad.index_axis_mut(Axis(0), c);
        for i in 0..ns {
            for j in 0..ns {
                if i == j {
                    continue;
                }
                let (vi, vj) = (slots.column(i), slots.column(j));
                let denom = (norms[i] * norms[j]).max(COSINE_EPS);
                let cos = vi.dot(&vj) / denom;
                total += cos;
                // d cos_ij / d v_i; cos_ji contributes the same amount.
                let mut g = &vj / denom;
                if norms[i] > 0.0 && norms[i] * norms[j] > COSINE_EPS {
                    g = g - &vi * (cos / (norms[i] * norms[i]));
                }
                class_grad.column_mut(i).scaled_add(2.0 * scale, &g);
            }
        }
    }
    (total * scale, grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn select_k_orders_and_breaks_ties_by_index() {
        let w = array![0.2, 0.5, 0.5, 0.1];
        assert_eq!(select_k(&w, 2, true), vec![1, 2]);
        assert_eq!(select_k(&w, 2, false), vec![3, 0]);
        assert!(select_k(&w, 0, true).is_empty());
    }

    #[test]
    fn orthogonal_slots_have_zero_penalty() {
        let mut p = Array3::zeros((2, 4, 2));
        p[[0, 0, 0]] = 1.0;
        p[[0, 1, 1]] = 2.0;
        p[[1, 2, 0]] = 1.0;
        p[[1, 3, 1]] = 0.5;
        let (v, _) = orthogonality(&p);
        assert!(v.abs() < 1e-12);
    }

    #[test]
    fn slots_of_different_classes_do_not_interact() {
        // Each class has orthogonal slots, and class 1 repeats class 0 exactly.
        let mut p = Array3::zeros((2, 3, 2));
        for c in 0..2 {
            p[[c, 0, 0]] = 1.0;
            p[[c, 1, 1]] = 1.0;
        }
        let (v, g) = orthogonality(&p);
        assert!(v.abs() < 1e-12);
        assert!(g.iter().all(|x| x.abs() < 1e-12));
    }

    #[test]
    fn identical_slots_have_maximal_penalty() {
        let p = Array3::from_elem((1, 3, 2), 1.0);
        let (v, _) = orthogonality(&p);
        // Two ordered pairs with cosine 1, divided by 2 slot vectors.
        assert!((v - 1.0).abs() < 1e-12);
    }

    #[test]
    fn orthogonality_gradient_matches_finite_difference() {
        let p = array![[[0.3, -0.2], [0.5, 0.1], [-0.4, 0.7]], [[0.2, 0.9], [-0.6, 0.3], [0.1, -0.5]]];
        let (_, g) = orthogonality(&p);
        let h = 1e-6;
        for idx in [(0, 0, 0), (1, 2, 1), (0, 1, 1)] {
            let mut plus = p.clone();
            plus[idx] += h;
            let mut minus = p.clone();
            minus[idx] -= h;
            let fd = (orthogonality(&plus).0 - orthogonality(&minus).0) / (2.0 * h);
            assert!((fd - g[idx]).abs() < 1e-5, "{idx:?}: fd {fd} vs {}", g[idx]);
        }
    }
}
