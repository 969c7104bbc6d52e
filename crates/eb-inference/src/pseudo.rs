//! Pseudo-experiment ensembles for Monte-Carlo p-values.
//!
//! Notes:
//! - Binned toys fluctuate each bin count `n_i ~ Pois(λ_i)` under the chosen hypothesis.
//! - Unbinned toys keep the events fixed and fluctuate their weights, `w'_i ~ Pois(μ_i)`
//!   with `μ_i ∝ w_i` (null) or `μ_i ∝ w_i · r_i` (alternative), scaled so that `Σ μ_i`
//!   equals the hypothesis' total expectation.
//! - Randomness is deterministic via per-toy seeding (`seed + toy_idx`), independent of threading.

use crate::asymptotics::{AsimovPValueCalculator, PValueResult};
use crate::teststat::{binned_t_c, unbinned_t_c, Comparison, PreparedComparison};
use crate::yields::poisson_from_expected;
use eb_core::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Hypothesis pseudo-data are generated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hypothesis {
    /// SM point.
    Null,
    /// Tested coupling point.
    Alternative,
}

/// Per-entry Poisson means of a toy under `hypothesis`.
fn toy_means(cmp: &Comparison, hypothesis: Hypothesis) -> Vec<f64> {
    match cmp {
        Comparison::Binned { lambda0, lambda1, .. } => match hypothesis {
            Hypothesis::Null => lambda0.clone(),
            Hypothesis::Alternative => lambda1.clone(),
        },
        Comparison::Unbinned { weights, ratios, n0, n1 } => {
            let raw: Vec<f64> = match hypothesis {
                Hypothesis::Null => weights.clone(),
                Hypothesis::Alternative => weights
                    .iter()
                    .zip(ratios)
                    .map(|(&w, &r)| if r.is_finite() && r > 0.0 { w * r } else { 0.0 })
                    .collect(),
            };
            let target = match hypothesis {
                Hypothesis::Null => *n0,
                Hypothesis::Alternative => *n1,
            };
            let sum: f64 = raw.iter().sum();
            if !(sum > 0.0) {
                return vec![0.0; raw.len()];
            }
            let k = target / sum;
            raw.into_iter().map(|m| m * k).collect()
        }
    }
}

fn toy_t_c(cmp: &Comparison, means: &[f64], seed: u64) -> f64 {
    let toy = poisson_from_expected(means, seed);
    match cmp {
        Comparison::Binned { lambda0, lambda1, .. } => binned_t_c(&toy, lambda0, lambda1).0,
        Comparison::Unbinned { ratios, n0, n1, .. } => unbinned_t_c(&toy, ratios, *n0, *n1).0,
    }
}

/// Test statistic of one pseudo-experiment drawn under `hypothesis`.
pub fn toy_statistic(prepared: &PreparedComparison, hypothesis: Hypothesis, seed: u64) -> f64 {
    let means = toy_means(&prepared.comparison, hypothesis);
    toy_t_c(&prepared.comparison, &means, seed)
}

/// `n_toys` test statistics under `hypothesis`; toy `i` uses seed `seed + i`.
pub fn ensemble(
    prepared: &PreparedComparison,
    hypothesis: Hypothesis,
    n_toys: usize,
    seed: u64,
) -> Vec<f64> {
    let means = toy_means(&prepared.comparison, hypothesis);
    (0..n_toys)
        .into_par_iter()
        .with_min_len(16)
        .map(|toy_idx| toy_t_c(&prepared.comparison, &means, seed.wrapping_add(toy_idx as u64)))
        .collect()
}

/// Monte-Carlo p-value of the observed statistic against toys drawn under the alternative.
pub fn monte_carlo_p_value(
    calc: &AsimovPValueCalculator,
    prepared: &PreparedComparison,
    n_toys: usize,
    seed: u64,
) -> Result<PValueResult> {
    let observed = prepared.statistic();
    let t_obs = calc.check_statistic(observed.value, observed.scale)?;
    let toys = ensemble(prepared, Hypothesis::Alternative, n_toys, seed);
    calc.monte_carlo(t_obs, &toys)
}
