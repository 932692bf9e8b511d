// src/model/prototype.rs
//
// Prototype layer: squared-Euclidean distances between comparison-space
// embeddings and prototypes, and the log-ratio similarity transform
//
//     sim(d) = ln((d + 1) / (d + eps))
//
// which is strictly decreasing in d, equals ln(1/eps) at d = 0 and tends to 0
// as d grows. Distances are computed as explicit sums of squared differences
// so that a prototype copied from an embedding sits at distance exactly 0.

use ndarray::{Array2, Zip};

/// Default epsilon of the similarity transform.
pub const DEFAULT_EPSILON: f64 = 1e-5;

pub fn similarity(d: f64, eps: f64) -> f64 {
    ((d + 1.0) / (d + eps)).ln()
}

/// d sim / d d.
pub fn similarity_grad(d: f64, eps: f64) -> f64 {
    1.0 / (d + 1.0) - 1.0 / (d + eps)
}

/// Squared Euclidean distance between every row of `z` and every row of `q`.
pub fn squared_distances(z: &Array2<f64>, q: &Array2<f64>) -> Array2<f64> {
    let mut d = Array2::zeros((z.nrows(), q.nrows()));
    for (b, zr) in z.rows().into_iter().enumerate() {
        for (p, qr) in q.rows().into_iter().enumerate() {
            d[[b, p]] = Zip::from(&zr).and(&qr).fold(0.0, |acc, &x, &y| {
                let diff = x - y;
                acc + diff * diff
            });
        }
    }
    d
}

/// Distances and similarities for one batch.
#[derive(Debug, Clone)]
pub struct PrototypeActivations {
    /// batch × P squared distances.
    pub distances: Array2<f64>,
    /// batch × P similarities.
    pub similarities: Array2<f64>,
}

pub fn prototype_layer(z: &Array2<f64>, q: &Array2<f64>, eps: f64) -> PrototypeActivations {
    let distances = squared_distances(z, q);
    let similarities = distances.mapv(|d| similarity(d, eps));
    PrototypeActivations {
        distances,
        similarities,
    }
}

/// Backprop a gradient on the distance matrix to the embeddings and prototypes.
///
/// Returns `(d_z, d_q)` using `dd/dz = 2(z - q)` and `dd/dq = -2(z - q)`.
pub fn distance_backward(
    z: &Array2<f64>,
    q: &Array2<f64>,
    d_dist: &Array2<f64>,
) -> (Array2<f64>, Array2<f64>) {
    let mut d_z = Array2::zeros(z.raw_dim());
    let mut d_q = Array2::zeros(q.raw_dim());
    for b in 0..z.nrows() {
        for p in 0..q.nrows() {
            let g = d_dist[[b, p]];
            if g == 0.0 {
                continue;
            }
            for k in 0..z.ncols() {
                let diff = 2.0 * g * (z[[b, k]] - q[[p, k]]);
                d_z[[b, k]] += diff;
                d_q[[p, k]] -= diff;
            }
        }
    }
    (d_z, d_q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn similarity_is_log_inverse_eps_at_zero() {
        let s0 = similarity(0.0, DEFAULT_EPSILON);
        assert!((s0 - (1.0 / DEFAULT_EPSILON).ln()).abs() < 1e-9);
    }

    #[test]
    fn similarity_strictly_decreasing_and_finite() {
        let ds = [0.0, 1e-6, 1e-3, 0.1, 1.0, 10.0, 1e3, 1e6];
        for w in ds.windows(2) {
            let a = similarity(w[0], DEFAULT_EPSILON);
            let b = similarity(w[1], DEFAULT_EPSILON);
            assert!(a.is_finite() && b.is_finite());
            assert!(a > b, "sim({}) = {a} not > sim({}) = {b}", w[0], w[1]);
        }
        assert!(similarity(1e12, DEFAULT_EPSILON) < 1e-6);
        assert!(similarity(1e12, DEFAULT_EPSILON) >= 0.0);
    }

    #[test]
    fn similarity_grad_matches_finite_difference() {
        for &d in &[0.01, 0.5, 3.0] {
            let h = 1e-6;
            let fd = (similarity(d + h, DEFAULT_EPSILON) - similarity(d - h, DEFAULT_EPSILON)) / (2.0 * h);
            assert!((fd - similarity_grad(d, DEFAULT_EPSILON)).abs() < 1e-5);
        }
    }

    #[test]
    fn distances_are_exact_for_copied_rows() {
        let z = array![[0.1, 0.7, -3.3], [1.0, 2.0, 3.0]];
        let q = z.row(0).to_owned().insert_axis(ndarray::Axis(0));
        let d = squared_distances(&z, &q);
        assert_eq!(d[[0, 0]], 0.0);
        assert!((d[[1, 0]] - (0.81 + 1.69 + 39.69)).abs() < 1e-9);
    }

    #[test]
    fn distance_backward_signs() {
        let z = array![[1.0, 0.0]];
        let q = array![[0.0, 0.0]];
        let (dz, dq) = distance_backward(&z, &q, &array![[1.0]]);
        assert_eq!(dz, array![[2.0, 0.0]]);
        assert_eq!(dq, array![[-2.0, 0.0]]);
    }
}
