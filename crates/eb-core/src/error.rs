//! Error types for eftbound

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// eftbound error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Kinematic value outside the tabulated cross-section range.
    #[error("kinematic value {value} outside tabulated range [{low}, {high}]")]
    OutOfRange {
        /// Offending value.
        value: f64,
        /// Lower edge of the tabulated range.
        low: f64,
        /// Upper edge of the tabulated range (inclusive).
        high: f64,
    },

    /// Negative test statistic beyond the numerical tolerance (upstream bug).
    #[error("invalid test statistic {value} (negative beyond tolerance {tolerance})")]
    InvalidStatistic {
        /// Offending test-statistic value.
        value: f64,
        /// Tolerance that was exceeded.
        tolerance: f64,
    },

    /// Binned and unbinned expectations disagree beyond tolerance.
    #[error(
        "binned total {binned} and unbinned total {unbinned} disagree \
         (relative difference {rel_diff:.3e})"
    )]
    DataInconsistency {
        /// Sum of binned expected counts.
        binned: f64,
        /// Unbinned total expectation.
        unbinned: f64,
        /// Relative difference `|binned - unbinned| / max(|unbinned|, tiny)`.
        rel_diff: f64,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Non-fatal warning: a Monte-Carlo p-value estimate is statistically poorly determined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceWarning {
    /// Number of pseudo-experiments used.
    pub n_pseudo: usize,
    /// Number of pseudo-experiments at or above the observed statistic.
    pub n_exceeding: usize,
    /// Relative statistical uncertainty of the estimate (`None` when nothing exceeded).
    pub relative_uncertainty: Option<f64>,
}

impl std::fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Monte-Carlo p-value poorly determined: {}/{} pseudo-experiments exceed",
            self.n_exceeding, self.n_pseudo
        )?;
        match self.relative_uncertainty {
            Some(r) => write!(f, ", relative uncertainty {r:.3}"),
            None => write!(f, ", relative uncertainty unbounded"),
        }
    }
}
