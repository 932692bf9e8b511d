// src/metrics.rs
//
// Aggregates reported across iterations and collected episodes.
// - OnlineStats: Welford running mean/variance. Rejects non-finite samples.
// - MeanStdErr: the mean ± standard-error pair written to the results log.
//
// Standard error uses the population standard deviation over sqrt(n), which
// is how results across iterations are reported.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default)]
pub struct OnlineStats {
    n: u64,
    mean: f64,
    m2: f64,
}

impl OnlineStats {
    /// Adds a sample. A NaN or infinite sample is an error and leaves the
    /// statistics untouched.
    pub fn add(&mut self, x: f64) -> Result<()> {
        if !x.is_finite() {
            bail!("non-finite sample {x} after {} finite ones", self.n);
        }
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / (self.n as f64);
        self.m2 += delta * (x - self.mean);
        Ok(())
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance (divide by n).
    pub fn variance_population(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.m2 / (self.n as f64)
        }
    }

    pub fn standard_error(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            (self.variance_population() / (self.n as f64)).sqrt()
        }
    }

    pub fn summary(&self) -> MeanStdErr {
        MeanStdErr {
            mean: self.mean(),
            standard_error: self.standard_error(),
            n: self.n,
        }
    }
}

/// Mean and standard error of a set of per-iteration results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanStdErr {
    pub mean: f64,
    pub standard_error: f64,
    pub n: u64,
}

impl MeanStdErr {
    /// Summarize `samples`. The first non-finite sample fails the whole
    /// summary, naming `what` and its index.
    pub fn of(what: &str, samples: &[f64]) -> Result<Self> {
        let mut stats = OnlineStats::default();
        for (i, &x) in samples.iter().enumerate() {
            stats
                .add(x)
                .with_context(|| format!("{what} sample {i} cannot be aggregated"))?;
        }
        Ok(stats.summary())
    }
}

impl std::fmt::Display for MeanStdErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6} ± {:.6}", self.mean, self.standard_error)
    }
}
