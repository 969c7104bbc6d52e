//! Grid scans over coupling space and exclusion-bound extraction.
//!
//! Every grid point is evaluated independently (expected yields → `t_c` → p-value) in
//! parallel with rayon. Per-point errors are recorded as failed outcomes and never abort the
//! scan; a shared [`CancelToken`] stops the scan between points and leaves a valid partial
//! result.
//!
//! Bounds are derived per ray through the origin: along each direction, ordered by |c|, the
//! bound is the first magnitude where `p` drops from `>= α` to `< α`, linearly interpolated
//! between the two straddling grid points. Rays holding fewer than [`MIN_RAY_SAMPLES`] grid
//! points besides the origin are reported as [`BoundValue::InsufficientSamples`].
//!
//! Axis-aligned slices complement the rays on multi-dimensional grids: every grid line along
//! one coupling, with the others held fixed, is bounded on both sides of its p-value maximum.

use crate::asymptotics::{AsimovPValueCalculator, PValueMethod};
use crate::dataset::{AnalysisData, AnalysisMode};
use crate::pseudo::monte_carlo_p_value;
use crate::teststat::TestStatisticEngine;
use eb_core::{ConvergenceWarning, CouplingPoint, Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Directions closer than this (per component) belong to the same ray.
const DIRECTION_TOL: f64 = 1e-9;

/// Grid points (origin excluded) a ray needs before a bound is interpolated on it.
pub const MIN_RAY_SAMPLES: usize = 2;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Scan configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Confidence level; `α = 1 - confidence_level`.
    pub confidence_level: f64,
    /// p-value method.
    pub pvalue_method: PValueMethod,
    /// Pseudo-experiments per point (Monte-Carlo method only).
    pub n_pseudo: usize,
    /// Base RNG seed.
    pub seed: u64,
    /// Treat binned/unbinned normalisation mismatches as errors.
    pub strict: bool,
    /// Relative tolerance of the binned/unbinned consistency check.
    pub consistency_tolerance: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            pvalue_method: PValueMethod::Asymptotic,
            n_pseudo: 10_000,
            seed: 42,
            strict: false,
            consistency_tolerance: 1e-6,
        }
    }
}

impl ScanConfig {
    fn validate(&self) -> Result<()> {
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(Error::Validation(format!(
                "confidence level must be in (0, 1), got {}",
                self.confidence_level
            )));
        }
        if self.pvalue_method == PValueMethod::MonteCarlo && self.n_pseudo == 0 {
            return Err(Error::Validation("Monte-Carlo p-values need n_pseudo > 0".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cancellation and progress
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared between the caller and a running scan.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; points not yet started are skipped.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Lifecycle of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    /// Not started.
    Pending,
    /// Points are being evaluated.
    Evaluating,
    /// Every point was recorded.
    Complete,
    /// Stopped early; the result is partial.
    Cancelled,
}

impl ScanPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ScanPhase::Evaluating,
            2 => ScanPhase::Complete,
            3 => ScanPhase::Cancelled,
            _ => ScanPhase::Pending,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ScanPhase::Pending => 0,
            ScanPhase::Evaluating => 1,
            ScanPhase::Complete => 2,
            ScanPhase::Cancelled => 3,
        }
    }
}

/// Snapshot of a scan's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanProgress {
    /// Current phase.
    pub phase: ScanPhase,
    /// Points recorded so far.
    pub n_done: usize,
    /// Points requested.
    pub n_total: usize,
}

#[derive(Debug, Default)]
struct ProgressState {
    phase: AtomicU8,
    n_done: AtomicUsize,
    n_total: AtomicUsize,
}

impl ProgressState {
    fn set_phase(&self, phase: ScanPhase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
    }

    fn snapshot(&self) -> ScanProgress {
        ScanProgress {
            phase: ScanPhase::from_u8(self.phase.load(Ordering::Acquire)),
            n_done: self.n_done.load(Ordering::Relaxed),
            n_total: self.n_total.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of evaluating one grid point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PointOutcome {
    /// Test statistic and p-value were computed.
    Evaluated {
        /// Test statistic `t_c`.
        t_c: f64,
        /// p-value.
        p_value: f64,
        /// Monte-Carlo standard error of the p-value.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        std_error: Option<f64>,
        /// Expectations clipped at zero.
        #[serde(default)]
        n_clipped: usize,
        /// Terms skipped by the zero-term policy.
        #[serde(default)]
        n_skipped: usize,
        /// Monte-Carlo convergence warning.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<ConvergenceWarning>,
    },
    /// Evaluation failed; the scan continued.
    Failed {
        /// Error message.
        error: String,
    },
}

impl PointOutcome {
    /// p-value when evaluated.
    pub fn p_value(&self) -> Option<f64> {
        match self {
            PointOutcome::Evaluated { p_value, .. } => Some(*p_value),
            PointOutcome::Failed { .. } => None,
        }
    }
}

/// Classification of a recorded point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointStatus {
    /// `p < α`.
    Excluded,
    /// `p >= α`.
    Allowed,
    /// Evaluation failed.
    Failed,
}

/// One grid point and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    /// Coupling point.
    pub point: CouplingPoint,
    /// Outcome.
    #[serde(flatten)]
    pub outcome: PointOutcome,
}

impl PointRecord {
    /// Status at significance level `alpha`.
    pub fn status(&self, alpha: f64) -> PointStatus {
        match self.outcome.p_value() {
            Some(p) if p < alpha => PointStatus::Excluded,
            Some(_) => PointStatus::Allowed,
            None => PointStatus::Failed,
        }
    }
}

/// Exclusion bound along one ray.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoundValue {
    /// `p` crosses `α` between two grid points; `magnitude` is the linear interpolation.
    Crossing {
        /// Interpolated |c| of the bound.
        magnitude: f64,
        /// Last allowed point `(|c|, p)`.
        lower: (f64, f64),
        /// First excluded point `(|c|, p)`.
        upper: (f64, f64),
    },
    /// No exclusion within the scanned range.
    Unconstrained {
        /// Largest |c| scanned on the ray.
        max_scanned: f64,
    },
    /// The smallest scanned |c| on the ray is already excluded.
    ExcludedFromStart {
        /// That smallest |c|.
        magnitude: f64,
    },
    /// Too few grid points on the ray to place a bound.
    InsufficientSamples {
        /// Evaluated points on the ray, origin excluded.
        n_samples: usize,
    },
}

impl BoundValue {
    /// Interpolated magnitude of a crossing.
    pub fn crossing(&self) -> Option<f64> {
        match self {
            BoundValue::Crossing { magnitude, .. } => Some(*magnitude),
            _ => None,
        }
    }
}

/// Bound along the ray with unit `direction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RayBound {
    /// Unit direction of the ray.
    pub direction: Vec<f64>,
    /// Bound along it.
    pub bound: BoundValue,
}

impl RayBound {
    /// Coupling-space point of the interpolated bound (crossings only).
    pub fn bound_point(&self) -> Option<Vec<f64>> {
        match self.bound {
            BoundValue::Crossing { magnitude, .. } => {
                Some(self.direction.iter().map(|d| d * magnitude).collect())
            }
            _ => None,
        }
    }

    /// Signed bound for one-dimensional rays (`direction = [±1]`).
    pub fn signed_bound(&self) -> Option<f64> {
        match (self.direction.as_slice(), &self.bound) {
            ([d], BoundValue::Crossing { magnitude, .. }) => Some(d * magnitude),
            _ => None,
        }
    }
}

/// Bounds along one axis-aligned grid line.
///
/// Magnitudes inside `lower` and `upper` are distances from `center` along `axis`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceBound {
    /// Index of the coupling that varies along the slice.
    pub axis: usize,
    /// The fixed coordinates, with the varying one set to zero.
    pub anchor: Vec<f64>,
    /// Axis coordinate of the largest p-value on the slice.
    pub center: f64,
    /// Bound towards smaller axis values.
    pub lower: BoundValue,
    /// Bound towards larger axis values.
    pub upper: BoundValue,
}

impl SliceBound {
    /// Allowed interval `[low, high]` of the axis coordinate; `None` where no crossing exists.
    pub fn interval(&self) -> (Option<f64>, Option<f64>) {
        (
            self.lower.crossing().map(|m| self.center - m),
            self.upper.crossing().map(|m| self.center + m),
        )
    }
}

/// Result of a grid scan; immutable once returned.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    /// Coupling names.
    pub coupling_names: Vec<String>,
    /// Confidence level.
    pub confidence_level: f64,
    /// p-value method.
    pub pvalue_method: PValueMethod,
    /// Binned or unbinned.
    pub mode: AnalysisMode,
    /// Per-point records in grid order.
    pub records: Vec<PointRecord>,
    /// Bounds per ray.
    pub bounds: Vec<RayBound>,
    /// Bounds per axis-aligned slice.
    pub slices: Vec<SliceBound>,
    /// `false` when cancelled before all points were recorded.
    pub complete: bool,
}

impl ScanResult {
    /// `α = 1 - confidence_level`.
    pub fn alpha(&self) -> f64 {
        1.0 - self.confidence_level
    }

    /// Number of failed points.
    pub fn n_failed(&self) -> usize {
        self.count(PointStatus::Failed)
    }

    /// Number of excluded points.
    pub fn n_excluded(&self) -> usize {
        self.count(PointStatus::Excluded)
    }

    /// Number of allowed points.
    pub fn n_allowed(&self) -> usize {
        self.count(PointStatus::Allowed)
    }

    fn count(&self, status: PointStatus) -> usize {
        let alpha = self.alpha();
        self.records.iter().filter(|r| r.status(alpha) == status).count()
    }

    /// p-value recorded for `point`, if evaluated.
    pub fn p_value(&self, point: &CouplingPoint) -> Option<f64> {
        self.records.iter().find(|r| &r.point == point).and_then(|r| r.outcome.p_value())
    }

    /// Status recorded for `point`.
    pub fn status(&self, point: &CouplingPoint) -> Option<PointStatus> {
        let alpha = self.alpha();
        self.records.iter().find(|r| &r.point == point).map(|r| r.status(alpha))
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Evaluates a coupling grid and derives exclusion bounds.
#[derive(Debug)]
pub struct BoundScanner {
    engine: TestStatisticEngine,
    calculator: AsimovPValueCalculator,
    config: ScanConfig,
    progress: Arc<ProgressState>,
}

impl BoundScanner {
    /// Scanner with the default p-value calculator.
    pub fn new(engine: TestStatisticEngine, config: ScanConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            calculator: AsimovPValueCalculator::default(),
            config,
            progress: Arc::new(ProgressState::default()),
        })
    }

    /// Replace the p-value calculator.
    pub fn with_calculator(mut self, calculator: AsimovPValueCalculator) -> Self {
        self.calculator = calculator;
        self
    }

    /// Configuration.
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Test-statistic engine.
    pub fn engine(&self) -> &TestStatisticEngine {
        &self.engine
    }

    /// Current progress (safe to poll from another thread while [`BoundScanner::run`] runs).
    pub fn progress(&self) -> ScanProgress {
        self.progress.snapshot()
    }

    /// Scan `points`. Points not started before cancellation are omitted.
    pub fn run(
        &self,
        data: &AnalysisData,
        points: &[CouplingPoint],
        cancel: &CancelToken,
    ) -> Result<ScanResult> {
        let n_c = self.engine.n_couplings();
        if let Some(p) = points.iter().find(|p| p.dim() != n_c) {
            return Err(Error::Validation(format!(
                "grid point {p} has dimension {}, model has {n_c} couplings",
                p.dim()
            )));
        }
        self.check_consistency(data)?;

        self.progress.n_total.store(points.len(), Ordering::Relaxed);
        self.progress.n_done.store(0, Ordering::Relaxed);
        self.progress.set_phase(ScanPhase::Evaluating);
        log::info!(
            "scanning {} points ({} mode, {} p-values)",
            points.len(),
            data.mode(),
            self.config.pvalue_method
        );

        let evaluated: Vec<Option<PointRecord>> = points
            .par_iter()
            .enumerate()
            .map(|(idx, point)| {
                if cancel.is_cancelled() {
                    return None;
                }
                let outcome = self.evaluate_point(data, point, idx);
                self.progress.n_done.fetch_add(1, Ordering::Relaxed);
                Some(PointRecord { point: point.clone(), outcome })
            })
            .collect();

        let records: Vec<PointRecord> = evaluated.into_iter().flatten().collect();
        let complete = records.len() == points.len();
        self.progress.set_phase(if complete { ScanPhase::Complete } else { ScanPhase::Cancelled });
        if !complete {
            log::warn!("scan cancelled after {}/{} points", records.len(), points.len());
        }

        let alpha = 1.0 - self.config.confidence_level;
        let bounds = derive_bounds(&records, alpha);
        let slices = derive_slices(&records, alpha);
        let result = ScanResult {
            coupling_names: self.engine.estimator().model().coupling_names().to_vec(),
            confidence_level: self.config.confidence_level,
            pvalue_method: self.config.pvalue_method,
            mode: data.mode(),
            records,
            bounds,
            slices,
            complete,
        };
        if result.n_failed() > 0 {
            log::warn!("{} of {} points failed", result.n_failed(), result.records.len());
        }
        Ok(result)
    }

    fn check_consistency(&self, data: &AnalysisData) -> Result<()> {
        let AnalysisData::Binned(d) = data else {
            return Ok(());
        };
        let null = CouplingPoint::zero(self.engine.n_couplings());
        match self.engine.estimator().check_consistency(
            d,
            &null,
            self.config.consistency_tolerance,
        ) {
            Ok(_) => Ok(()),
            Err(e @ Error::DataInconsistency { .. }) if !self.config.strict => {
                log::warn!("{e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn evaluate_point(
        &self,
        data: &AnalysisData,
        point: &CouplingPoint,
        idx: usize,
    ) -> PointOutcome {
        match self.try_evaluate_point(data, point, idx) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::debug!("point {point} failed: {e}");
                PointOutcome::Failed { error: e.to_string() }
            }
        }
    }

    fn try_evaluate_point(
        &self,
        data: &AnalysisData,
        point: &CouplingPoint,
        idx: usize,
    ) -> Result<PointOutcome> {
        let prepared = self.engine.compare(data, point)?;
        let stat = prepared.statistic();
        let pv = match self.config.pvalue_method {
            PValueMethod::Asymptotic => self.calculator.asymptotic(stat.value, stat.scale)?,
            PValueMethod::MonteCarlo => {
                // Disjoint toy seed streams per point.
                let seed = self
                    .config
                    .seed
                    .wrapping_add((idx as u64).wrapping_mul(self.config.n_pseudo as u64));
                monte_carlo_p_value(&self.calculator, &prepared, self.config.n_pseudo, seed)?
            }
        };
        log::debug!("point {point}: t_c = {:.6}, p = {:.6e}", stat.value, pv.p_value);
        Ok(PointOutcome::Evaluated {
            t_c: stat.value,
            p_value: pv.p_value,
            std_error: pv.std_error,
            n_clipped: stat.n_clipped,
            n_skipped: stat.n_skipped,
            warning: pv.warning,
        })
    }
}

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

fn direction_key(direction: &[f64]) -> Vec<i64> {
    direction.iter().map(|d| (d / DIRECTION_TOL).round() as i64).collect()
}

/// Group evaluated points into rays through the origin and locate the first `α` crossing on
/// each. Failed points are skipped; the origin (if evaluated) starts every ray. Rays with
/// fewer than [`MIN_RAY_SAMPLES`] other points get [`BoundValue::InsufficientSamples`].
pub fn derive_bounds(records: &[PointRecord], alpha: f64) -> Vec<RayBound> {
    let origin_p = records
        .iter()
        .find(|r| r.point.is_null())
        .and_then(|r| r.outcome.p_value());

    let mut rays: BTreeMap<Vec<i64>, (Vec<f64>, Vec<(f64, f64)>)> = BTreeMap::new();
    for r in records {
        let (Some(dir), Some(p)) = (r.point.direction(), r.outcome.p_value()) else {
            continue;
        };
        rays.entry(direction_key(&dir))
            .or_insert_with(|| (dir, Vec::new()))
            .1
            .push((r.point.norm(), p));
    }

    rays.into_values()
        .map(|(direction, mut samples)| {
            if samples.len() < MIN_RAY_SAMPLES {
                let bound = BoundValue::InsufficientSamples { n_samples: samples.len() };
                return RayBound { direction, bound };
            }
            if let Some(p0) = origin_p {
                samples.push((0.0, p0));
            }
            samples.sort_by(|a, b| a.0.total_cmp(&b.0));
            if samples.windows(2).any(|w| w[1].1 > w[0].1 + 1e-12) {
                log::warn!("p-value is not monotonic along ray {direction:?}");
            }
            RayBound { bound: ray_bound(&samples, alpha), direction }
        })
        .collect()
}

/// Bound every axis-aligned grid line holding at least two evaluated points.
///
/// Slices are ordered by axis, then by anchor. On each slice the bound search starts at the
/// largest p-value and walks outward in both directions.
pub fn derive_slices(records: &[PointRecord], alpha: f64) -> Vec<SliceBound> {
    let Some(dim) = records.first().map(|r| r.point.dim()) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for axis in 0..dim {
        let mut lines: BTreeMap<Vec<i64>, (Vec<f64>, Vec<(f64, f64)>)> = BTreeMap::new();
        for r in records {
            let Some(p) = r.outcome.p_value() else {
                continue;
            };
            if r.point.dim() != dim {
                continue;
            }
            let mut anchor = r.point.coords().to_vec();
            anchor[axis] = 0.0;
            lines
                .entry(direction_key(&anchor))
                .or_insert_with(|| (anchor, Vec::new()))
                .1
                .push((r.point.get(axis), p));
        }
        for (anchor, mut samples) in lines.into_values() {
            if samples.len() < 2 {
                continue;
            }
            samples.sort_by(|a, b| a.0.total_cmp(&b.0));
            out.push(slice_bound(axis, anchor, &samples, alpha));
        }
    }
    out
}

fn slice_bound(axis: usize, anchor: Vec<f64>, samples: &[(f64, f64)], alpha: f64) -> SliceBound {
    let mut k = 0;
    for (i, s) in samples.iter().enumerate() {
        if s.1 > samples[k].1 {
            k = i;
        }
    }
    let (center, p_center) = samples[k];
    let side = |pts: Vec<(f64, f64)>| {
        if pts.len() < 2 {
            BoundValue::InsufficientSamples { n_samples: pts.len().saturating_sub(1) }
        } else {
            ray_bound(&pts, alpha)
        }
    };
    let upper = std::iter::once((0.0, p_center))
        .chain(samples[k + 1..].iter().map(|&(x, p)| (x - center, p)))
        .collect();
    let lower = std::iter::once((0.0, p_center))
        .chain(samples[..k].iter().rev().map(|&(x, p)| (center - x, p)))
        .collect();
    SliceBound { axis, anchor, center, lower: side(lower), upper: side(upper) }
}

/// Bound along one ray from `(|c|, p)` samples sorted by magnitude.
fn ray_bound(samples: &[(f64, f64)], alpha: f64) -> BoundValue {
    let Some(&(m_first, p_first)) = samples.first() else {
        return BoundValue::Unconstrained { max_scanned: 0.0 };
    };
    if p_first < alpha {
        return BoundValue::ExcludedFromStart { magnitude: m_first };
    }
    for w in samples.windows(2) {
        let (m0, p0) = w[0];
        let (m1, p1) = w[1];
        if p0 >= alpha && p1 < alpha {
            let t = (alpha - p0) / (p1 - p0);
            return BoundValue::Crossing { magnitude: m0 + t * (m1 - m0), lower: w[0], upper: w[1] };
        }
    }
    BoundValue::Unconstrained { max_scanned: samples[samples.len() - 1].0 }
}
