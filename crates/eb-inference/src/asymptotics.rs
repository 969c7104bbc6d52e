//! p-values from the test statistic.
//!
//! Asymptotically (Wilks / Asimov) `t_c` is χ²-like with one degree of freedom on the side of
//! interest, so `p = 1 - Φ(√t_c)` and `Z = √t_c`. When the asymptotic regime is doubtful the
//! p-value is estimated from an ensemble of pseudo-experiments instead (see [`crate::pseudo`]).

use eb_core::{ConvergenceWarning, Error, Result};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Absolute tolerance below zero for `t_c` before it is considered invalid.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

/// Relative MC uncertainty above which a [`ConvergenceWarning`] is attached.
pub const DEFAULT_MAX_RELATIVE_UNCERTAINTY: f64 = 0.1;

/// Standard normal CDF.
pub fn normal_cdf(x: f64) -> f64 {
    // Φ(x) = 0.5 * erfc(-x / sqrt(2)) keeps precision in the tails.
    0.5 * statrs::function::erf::erfc(-x / std::f64::consts::SQRT_2)
}

/// How p-values are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PValueMethod {
    /// Closed-form `Φ(-√t_c)`.
    #[default]
    Asymptotic,
    /// Empirical tail fraction over pseudo-experiments.
    MonteCarlo,
}

impl std::fmt::Display for PValueMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PValueMethod::Asymptotic => write!(f, "asymptotic"),
            PValueMethod::MonteCarlo => write!(f, "monte_carlo"),
        }
    }
}

/// p-value and significance of one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PValueResult {
    /// p-value in `[0, 1]`.
    pub p_value: f64,
    /// Significance `Z = Φ^{-1}(1 - p)`; infinite when no pseudo-experiment exceeded.
    pub significance: f64,
    /// Method used.
    pub method: PValueMethod,
    /// Binomial standard error (Monte-Carlo only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std_error: Option<f64>,
    /// Number of valid pseudo-experiments (Monte-Carlo only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_pseudo: Option<usize>,
    /// Set when the Monte-Carlo estimate is poorly determined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<ConvergenceWarning>,
}

/// Converts test statistics into p-values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AsimovPValueCalculator {
    /// Allowed negative excursion of `t_c`, per unit of `max(1, scale)`.
    pub tolerance: f64,
    /// Relative MC uncertainty that triggers a [`ConvergenceWarning`].
    pub max_relative_uncertainty: f64,
}

impl Default for AsimovPValueCalculator {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            max_relative_uncertainty: DEFAULT_MAX_RELATIVE_UNCERTAINTY,
        }
    }
}

impl AsimovPValueCalculator {
    /// Calculator with a custom negative-value tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Calculator with a custom MC convergence limit.
    pub fn with_max_relative_uncertainty(mut self, limit: f64) -> Self {
        self.max_relative_uncertainty = limit;
        self
    }

    /// Validate `t_c`: small negative values (rounding) clamp to zero, anything below
    /// `-tolerance · max(1, scale)` or non-finite is [`Error::InvalidStatistic`].
    pub fn check_statistic(&self, t_c: f64, scale: f64) -> Result<f64> {
        let tol = self.tolerance * scale.abs().max(1.0);
        if !t_c.is_finite() || t_c < -tol {
            return Err(Error::InvalidStatistic { value: t_c, tolerance: tol });
        }
        Ok(t_c.max(0.0))
    }

    /// Asymptotic p-value `Φ(-√t_c)`.
    pub fn asymptotic(&self, t_c: f64, scale: f64) -> Result<PValueResult> {
        let t = self.check_statistic(t_c, scale)?;
        let z = t.sqrt();
        Ok(PValueResult {
            p_value: normal_cdf(-z),
            significance: z,
            method: PValueMethod::Asymptotic,
            std_error: None,
            n_pseudo: None,
            warning: None,
        })
    }

    /// Empirical p-value: fraction of `ensemble` values `>= t_obs`.
    ///
    /// Non-finite ensemble entries are ignored.
    pub fn monte_carlo(&self, t_obs: f64, ensemble: &[f64]) -> Result<PValueResult> {
        let valid: Vec<f64> = ensemble.iter().copied().filter(|t| t.is_finite()).collect();
        let n = valid.len();
        if n == 0 {
            return Err(Error::Computation("empty pseudo-experiment ensemble".into()));
        }
        if n < ensemble.len() {
            log::warn!("{} non-finite pseudo-experiments ignored", ensemble.len() - n);
        }
        let k = valid.iter().filter(|&&t| t >= t_obs).count();
        let p = k as f64 / n as f64;
        let std_error = (p * (1.0 - p) / n as f64).sqrt();
        let relative_uncertainty = (k > 0).then(|| std_error / p);

        let warning = match relative_uncertainty {
            Some(r) if r <= self.max_relative_uncertainty => None,
            _ => Some(ConvergenceWarning { n_pseudo: n, n_exceeding: k, relative_uncertainty }),
        };
        if let Some(w) = &warning {
            log::warn!("{w}");
        }

        Ok(PValueResult {
            p_value: p,
            significance: significance(p)?,
            method: PValueMethod::MonteCarlo,
            std_error: Some(std_error),
            n_pseudo: Some(n),
            warning,
        })
    }
}

/// `Z = Φ^{-1}(1 - p)`.
pub fn significance(p: f64) -> Result<f64> {
    if p <= 0.0 {
        return Ok(f64::INFINITY);
    }
    if p >= 1.0 {
        return Ok(f64::NEG_INFINITY);
    }
    let normal = Normal::new(0.0, 1.0).map_err(|e| Error::Computation(e.to_string()))?;
    Ok(normal.inverse_cdf(1.0 - p))
}

/// Asymptotic p-value with the default tolerance.
pub fn asymptotic_p_value(t_c: f64) -> Result<f64> {
    Ok(AsimovPValueCalculator::default().asymptotic(t_c, 1.0)?.p_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_asymptotic_reference_values() {
        assert_relative_eq!(asymptotic_p_value(0.0).unwrap(), 0.5, epsilon = 1e-15);
        // 95% one-sided: √t = 1.6448536
        let t95 = 1.6448536269514722f64.powi(2);
        assert_relative_eq!(asymptotic_p_value(t95).unwrap(), 0.05, max_relative = 1e-9);
        assert_relative_eq!(asymptotic_p_value(3.84).unwrap(), 0.025_021_8, max_relative = 1e-4);
        // Deep tail stays positive.
        let p = asymptotic_p_value(900.0).unwrap();
        assert!(p > 0.0 && p < 1e-100);
    }

    #[test]
    fn test_negative_statistic() {
        let calc = AsimovPValueCalculator::default();
        assert_eq!(calc.asymptotic(-1e-12, 1.0).unwrap().p_value, 0.5);
        assert!(matches!(
            calc.asymptotic(-0.5, 1.0),
            Err(Error::InvalidStatistic { value, .. }) if value == -0.5
        ));
        assert!(calc.asymptotic(f64::NAN, 1.0).is_err());
        // Tolerance scales with the size of the summed terms.
        assert!(calc.check_statistic(-1e-6, 1e4).is_ok());
        assert!(calc.check_statistic(-1e-4, 1e4).is_err());
    }

    #[test]
    fn test_monte_carlo_fraction_and_error() {
        let calc = AsimovPValueCalculator::default();
        let ens: Vec<f64> = (0..1000).map(|i| i as f64 / 100.0).collect();
        let r = calc.monte_carlo(9.0, &ens).unwrap();
        assert_relative_eq!(r.p_value, 0.1);
        assert_relative_eq!(r.std_error.unwrap(), (0.1 * 0.9 / 1000.0f64).sqrt());
        assert!(r.warning.is_none());
        assert_relative_eq!(r.significance, 1.2815515655446004, max_relative = 1e-6);
    }

    #[test]
    fn test_monte_carlo_warns_when_nothing_exceeds() {
        let calc = AsimovPValueCalculator::default();
        let r = calc.monte_carlo(100.0, &[1.0, 2.0, f64::NAN]).unwrap();
        assert_eq!(r.p_value, 0.0);
        assert_eq!(r.n_pseudo, Some(2));
        let w = r.warning.unwrap();
        assert_eq!(w.n_exceeding, 0);
        assert!(w.relative_uncertainty.is_none());
        assert!(calc.monte_carlo(1.0, &[]).is_err());
    }

    #[test]
    fn test_monte_carlo_warns_on_large_uncertainty() {
        let calc = AsimovPValueCalculator::default();
        // 3 / 100 exceed: relative uncertainty ≈ 0.57.
        let ens: Vec<f64> = (0..100).map(|i| if i < 3 { 10.0 } else { 0.0 }).collect();
        let r = calc.monte_carlo(5.0, &ens).unwrap();
        assert_relative_eq!(r.p_value, 0.03);
        assert!(r.warning.unwrap().relative_uncertainty.unwrap() > 0.1);
    }

    #[test]
    fn test_method_serde_names() {
        assert_eq!(serde_json::to_string(&PValueMethod::MonteCarlo).unwrap(), "\"monte_carlo\"");
        assert_eq!(PValueMethod::default(), PValueMethod::Asymptotic);
    }
}
