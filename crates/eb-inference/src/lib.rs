//! # eb-inference
//!
//! Statistical bound setting on EFT couplings.
//!
//! This crate provides:
//! - Expected event yields per bin / per event ([`YieldEstimator`]), Asimov and Poisson modes
//! - Binned and unbinned likelihood-ratio test statistics ([`TestStatisticEngine`])
//! - Asymptotic p-values with a Monte-Carlo pseudo-experiment fallback
//!   ([`AsimovPValueCalculator`])
//! - Grid scans and exclusion-boundary extraction ([`BoundScanner`])
//! - A stable JSON artifact for scan results ([`ScanArtifact`])
//!
//! ## Architecture
//!
//! Data flows strictly downward: scanner → yields → test statistic → p-value. Coefficient
//! tables are shared read-only; randomness is seeded per task.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Persisted scan artifact (JSON).
pub mod artifacts;
/// Asymptotic and Monte-Carlo p-values.
pub mod asymptotics;
/// Binned / unbinned datasets.
pub mod dataset;
/// Coupling grids.
pub mod grid;
/// Pseudo-experiment ensembles.
pub mod pseudo;
/// Grid scans and exclusion bounds.
pub mod scan;
/// Likelihood-ratio test statistics.
pub mod teststat;
/// Expected event yields.
pub mod yields;

pub use artifacts::ScanArtifact;
pub use asymptotics::{AsimovPValueCalculator, PValueMethod, PValueResult};
pub use dataset::{AnalysisData, AnalysisMode, Bin, BinnedDataset, UnbinnedDataset};
pub use grid::{AxisRange, GridSpec};
pub use pseudo::Hypothesis;
pub use scan::{
    BoundScanner, BoundValue, CancelToken, PointOutcome, PointRecord, PointStatus, RayBound,
    ScanConfig, ScanPhase, ScanProgress, ScanResult, SliceBound, MIN_RAY_SAMPLES,
};
pub use teststat::{
    Comparison, PreparedComparison, RatioSource, TestStatisticEngine, TestStatisticResult,
};
pub use yields::{AsimovCells, TotalYield, YieldEstimator, YieldMode, YieldVector};
