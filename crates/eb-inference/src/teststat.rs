//! Likelihood-ratio test statistic `t_c = -2 ln [L(c) / L(0)]`.
//!
//! Binned:   `t_c = -2 Σ_i [ n_i ln(λ1_i/λ0_i) - (λ1_i - λ0_i) ]`
//! Unbinned: `t_c = -2 Σ_i w_i ln r_i + 2 (N1 - N0)`
//!
//! # Numerical policy
//!
//! A term whose null expectation `λ0_i` is not positive, or whose ratio `λ1_i/λ0_i` (resp.
//! `r_i`) is non-finite or non-positive, contributes zero to the sum. This is a measure-zero
//! approximation, not exact physics; the number of such terms is reported as `n_skipped`.
//! Expectations are clipped at zero *before* the normalisation term `N1 - N0` is formed.

use crate::dataset::AnalysisData;
use crate::yields::YieldEstimator;
use eb_core::{CouplingPoint, Error, LikelihoodRatio, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Test-statistic value for one (null, alternative) comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStatisticResult {
    /// `t_c`.
    pub value: f64,
    /// Null hypothesis (SM point).
    pub null: CouplingPoint,
    /// Alternative hypothesis.
    pub alternative: CouplingPoint,
    /// Dataset size: number of bins or events.
    pub n_entries: usize,
    /// Terms that contributed zero under the numerical policy.
    pub n_skipped: usize,
    /// Expectations clipped at zero.
    pub n_clipped: usize,
    /// Null expectation `N0`; sets the scale for the negative-value tolerance.
    pub scale: f64,
}

/// Binned `t_c`; returns `(value, n_skipped)`.
pub fn binned_t_c(observed: &[f64], lambda0: &[f64], lambda1: &[f64]) -> (f64, usize) {
    let mut sum = 0.0;
    let mut n_skipped = 0usize;
    for ((&n, &l0), &l1) in observed.iter().zip(lambda0).zip(lambda1) {
        if l0 == l1 {
            continue;
        }
        if !(l0 > 0.0) {
            n_skipped += 1;
            continue;
        }
        let r = l1 / l0;
        if !(r.is_finite() && r > 0.0) {
            n_skipped += 1;
            continue;
        }
        sum += n * r.ln() - (l1 - l0);
    }
    (-2.0 * sum, n_skipped)
}

/// Unbinned `t_c`; returns `(value, n_skipped)`.
pub fn unbinned_t_c(weights: &[f64], ratios: &[f64], n0: f64, n1: f64) -> (f64, usize) {
    let mut sum = 0.0;
    let mut n_skipped = 0usize;
    for (&w, &r) in weights.iter().zip(ratios) {
        if !(r.is_finite() && r > 0.0) {
            n_skipped += 1;
            continue;
        }
        sum += w * r.ln();
    }
    (-2.0 * sum + 2.0 * (n1 - n0), n_skipped)
}

/// Where per-event likelihood ratios come from in unbinned mode.
#[derive(Clone, Default)]
pub enum RatioSource {
    /// `dσ(x; c) / dσ(x; 0)` from the cross-section model.
    #[default]
    Analytic,
    /// A learned (classifier-based) ratio.
    Learned(Arc<dyn LikelihoodRatio>),
}

impl std::fmt::Debug for RatioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RatioSource::Analytic => write!(f, "Analytic"),
            RatioSource::Learned(_) => write!(f, "Learned(..)"),
        }
    }
}

/// Per-entry inputs of the test statistic, ready to be summed or fluctuated.
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    /// Binned counts and expectations.
    Binned {
        /// Observed counts `n_i`.
        observed: Vec<f64>,
        /// Null expectations `λ0_i`.
        lambda0: Vec<f64>,
        /// Alternative expectations `λ1_i`.
        lambda1: Vec<f64>,
    },
    /// Event weights, per-event ratios and total expectations.
    Unbinned {
        /// Event weights `w_i`.
        weights: Vec<f64>,
        /// Likelihood ratios `r_i`.
        ratios: Vec<f64>,
        /// Null total expectation.
        n0: f64,
        /// Alternative total expectation.
        n1: f64,
    },
}

impl Comparison {
    /// `(t_c, n_skipped)` for these inputs.
    pub fn t_c(&self) -> (f64, usize) {
        match self {
            Comparison::Binned { observed, lambda0, lambda1 } => {
                binned_t_c(observed, lambda0, lambda1)
            }
            Comparison::Unbinned { weights, ratios, n0, n1 } => {
                unbinned_t_c(weights, ratios, *n0, *n1)
            }
        }
    }

    /// Number of bins or events.
    pub fn n_entries(&self) -> usize {
        match self {
            Comparison::Binned { observed, .. } => observed.len(),
            Comparison::Unbinned { weights, .. } => weights.len(),
        }
    }

    /// Null total expectation.
    pub fn null_total(&self) -> f64 {
        match self {
            Comparison::Binned { lambda0, .. } => lambda0.iter().sum(),
            Comparison::Unbinned { n0, .. } => *n0,
        }
    }
}

/// A dataset compared against one alternative point; reused by pseudo-experiments.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedComparison {
    /// Null point.
    pub null: CouplingPoint,
    /// Alternative point.
    pub alternative: CouplingPoint,
    /// Per-entry inputs.
    pub comparison: Comparison,
    /// Expectations clipped at zero while preparing.
    pub n_clipped: usize,
}

impl PreparedComparison {
    /// Observed test statistic.
    pub fn statistic(&self) -> TestStatisticResult {
        let (value, n_skipped) = self.comparison.t_c();
        if n_skipped > 0 {
            log::debug!("{n_skipped} terms skipped for t_c at {}", self.alternative);
        }
        TestStatisticResult {
            value,
            null: self.null.clone(),
            alternative: self.alternative.clone(),
            n_entries: self.comparison.n_entries(),
            n_skipped,
            n_clipped: self.n_clipped,
            scale: self.comparison.null_total(),
        }
    }
}

/// Computes `t_c` for binned or unbinned data against the SM null.
#[derive(Debug, Clone)]
pub struct TestStatisticEngine {
    estimator: YieldEstimator,
    ratio: RatioSource,
}

impl TestStatisticEngine {
    /// Engine using analytic per-event ratios.
    pub fn new(estimator: YieldEstimator) -> Self {
        Self { estimator, ratio: RatioSource::Analytic }
    }

    /// Use a learned likelihood ratio for unbinned data.
    pub fn with_ratio(mut self, ratio: Arc<dyn LikelihoodRatio>) -> Self {
        self.ratio = RatioSource::Learned(ratio);
        self
    }

    /// Yield estimator.
    pub fn estimator(&self) -> &YieldEstimator {
        &self.estimator
    }

    /// Ratio source used in unbinned mode.
    pub fn ratio_source(&self) -> &RatioSource {
        &self.ratio
    }

    /// Number of couplings.
    pub fn n_couplings(&self) -> usize {
        self.estimator.model().n_couplings()
    }

    /// Gather the per-entry inputs comparing `data` under `alternative` against the SM.
    pub fn compare(
        &self,
        data: &AnalysisData,
        alternative: &CouplingPoint,
    ) -> Result<PreparedComparison> {
        let n_c = self.n_couplings();
        if alternative.dim() != n_c {
            return Err(Error::Validation(format!(
                "coupling point {alternative} has dimension {}, model has {n_c} couplings",
                alternative.dim()
            )));
        }
        let null = CouplingPoint::zero(n_c);
        let (comparison, n_clipped) = match data {
            AnalysisData::Binned(d) => {
                let y0 = self.estimator.expected_counts(d, &null)?;
                let y1 = self.estimator.expected_counts(d, alternative)?;
                let cmp = Comparison::Binned {
                    observed: d.observed(),
                    lambda0: y0.counts,
                    lambda1: y1.counts,
                };
                (cmp, y0.n_clipped + y1.n_clipped)
            }
            AnalysisData::Unbinned(d) => {
                let ratios = d
                    .events()
                    .iter()
                    .map(|ev| match &self.ratio {
                        RatioSource::Analytic => self.estimator.model().ratio(ev, alternative),
                        RatioSource::Learned(r) => r.ratio(ev, alternative),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let weights = (0..d.n_events()).map(|i| d.weight(i)).collect();
                let n0 = self.estimator.total_yield(&null)?;
                let n1 = self.estimator.total_yield(alternative)?;
                let n_clipped = usize::from(n0.clipped) + usize::from(n1.clipped);
                let cmp = Comparison::Unbinned { weights, ratios, n0: n0.value, n1: n1.value };
                (cmp, n_clipped)
            }
        };
        Ok(PreparedComparison { null, alternative: alternative.clone(), comparison, n_clipped })
    }

    /// Test statistic of `data` for `alternative` vs the SM.
    pub fn evaluate(
        &self,
        data: &AnalysisData,
        alternative: &CouplingPoint,
    ) -> Result<TestStatisticResult> {
        Ok(self.compare(data, alternative)?.statistic())
    }
}
