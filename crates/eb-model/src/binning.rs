//! Kinematic binning: ordered, gap-free partitions of an observable range.

use eb_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Upper limit on the number of bins [`Binning::uniform`] will create.
pub const MAX_BINS: usize = 1_000_000;

/// Bin edges `e_0 < e_1 < … < e_n`; bin `i` is `[e_i, e_{i+1})`, the last bin is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Binning {
    edges: Vec<f64>,
}

impl TryFrom<Vec<f64>> for Binning {
    type Error = Error;

    fn try_from(edges: Vec<f64>) -> Result<Self> {
        Self::from_edges(edges)
    }
}

impl From<Binning> for Vec<f64> {
    fn from(b: Binning) -> Self {
        b.edges
    }
}

impl Binning {
    /// Binning from explicit edges (strictly ascending, at least two).
    pub fn from_edges(edges: Vec<f64>) -> Result<Self> {
        if edges.len() < 2 {
            return Err(Error::Validation(format!(
                "binning requires >= 2 edges, got {}",
                edges.len()
            )));
        }
        if edges.iter().any(|e| !e.is_finite()) {
            return Err(Error::Validation("bin edges must be finite".into()));
        }
        if edges.windows(2).any(|w| w[1] <= w[0]) {
            return Err(Error::Validation("bin edges must be strictly ascending".into()));
        }
        Ok(Self { edges })
    }

    /// Uniform bins of `width` over `[lo, hi]`.
    ///
    /// When `width` does not divide the range, the last bin is narrower so that the final
    /// edge is exactly `hi`.
    pub fn uniform(lo: f64, hi: f64, width: f64) -> Result<Self> {
        if !(width.is_finite() && width > 0.0) {
            return Err(Error::Validation(format!("bin width must be > 0, got {width}")));
        }
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(Error::Validation(format!("invalid binning range [{lo}, {hi}]")));
        }
        let n = ((hi - lo) / width - 1e-9).ceil().max(1.0);
        if !(n <= MAX_BINS as f64) {
            return Err(Error::Validation(format!(
                "bin width {width} over [{lo}, {hi}] gives {n} bins (limit {MAX_BINS})"
            )));
        }
        let n = n as usize;
        let mut edges: Vec<f64> = (0..n).map(|k| lo + k as f64 * width).collect();
        edges.push(hi);
        Self::from_edges(edges)
    }

    /// Bin edges.
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    /// Covered range `(first edge, last edge)`.
    pub fn range(&self) -> (f64, f64) {
        (self.edges[0], self.edges[self.edges.len() - 1])
    }

    /// Interval of bin `i`.
    pub fn bin(&self, i: usize) -> (f64, f64) {
        (self.edges[i], self.edges[i + 1])
    }

    /// Iterate over `(lower, upper)` intervals in order.
    pub fn intervals(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.edges.windows(2).map(|w| (w[0], w[1]))
    }

    /// Index of the bin containing `x`; the upper edge of the last bin is included.
    pub fn find(&self, x: f64) -> Option<usize> {
        let (lo, hi) = self.range();
        if !(x >= lo && x <= hi) {
            return None;
        }
        let idx = self.edges.partition_point(|e| *e <= x);
        Some(idx.saturating_sub(1).min(self.n_bins() - 1))
    }

    /// Histogram of `values`; values outside the range are dropped.
    pub fn histogram(&self, values: impl IntoIterator<Item = f64>) -> Vec<f64> {
        let mut counts = vec![0.0; self.n_bins()];
        for x in values {
            if let Some(i) = self.find(x) {
                counts[i] += 1.0;
            }
        }
        counts
    }
}
