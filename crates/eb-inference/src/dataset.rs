//! Binned and unbinned datasets, and the tagged [`AnalysisData`] variant over them.

use eb_core::{CouplingPoint, Error, EventSource, KinematicEvent, Result, RunMetadata};
use eb_model::{Binning, CrossSectionModel, XsecTerms};
use serde::{Deserialize, Serialize};

/// Relative tolerance for adjacent bin edges to count as touching.
const EDGE_TOL: f64 = 1e-12;

/// Analysis mode tag (reporting / artifacts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// Histogram of counts per kinematic interval.
    Binned,
    /// Per-event likelihood contributions.
    Unbinned,
}

impl std::fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisMode::Binned => write!(f, "binned"),
            AnalysisMode::Unbinned => write!(f, "unbinned"),
        }
    }
}

/// One kinematic interval with its integrated cross-section terms and an observed count.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    /// Lower edge.
    pub lower: f64,
    /// Upper edge.
    pub upper: f64,
    /// Cross-section decomposition integrated over `[lower, upper]`.
    pub terms: XsecTerms,
    /// Observed (or Asimov / pseudo) count.
    pub observed: f64,
}

impl Bin {
    /// Signed cross-section in this bin at `point`.
    pub fn sigma(&self, point: &CouplingPoint) -> Result<f64> {
        self.terms.evaluate(point)
    }

    /// Bin width.
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Ordered, gap-free bins plus run metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct BinnedDataset {
    bins: Vec<Bin>,
    meta: RunMetadata,
}

impl BinnedDataset {
    /// Build and validate a binned dataset.
    pub fn new(bins: Vec<Bin>, meta: RunMetadata) -> Result<Self> {
        if bins.is_empty() {
            return Err(Error::Validation("binned dataset requires >= 1 bin".into()));
        }
        for (i, b) in bins.iter().enumerate() {
            if !(b.lower.is_finite() && b.upper.is_finite() && b.lower < b.upper) {
                return Err(Error::Validation(format!(
                    "bin {i} has invalid interval [{}, {}]",
                    b.lower, b.upper
                )));
            }
            if !(b.observed.is_finite() && b.observed >= 0.0) {
                return Err(Error::Validation(format!(
                    "bin {i} has invalid observed count {}",
                    b.observed
                )));
            }
        }
        for (i, w) in bins.windows(2).enumerate() {
            let gap = w[1].lower - w[0].upper;
            let scale = w[0].upper.abs().max(1.0);
            if gap.abs() > EDGE_TOL * scale {
                return Err(Error::Validation(format!(
                    "bins {i} and {} {} (upper {} vs lower {})",
                    i + 1,
                    if gap > 0.0 { "leave a gap" } else { "overlap" },
                    w[0].upper,
                    w[1].lower
                )));
            }
        }
        let n_c = bins[0].terms.n_couplings();
        if bins.iter().any(|b| b.terms.n_couplings() != n_c) {
            return Err(Error::Validation("bins disagree on the number of couplings".into()));
        }
        Ok(Self { bins, meta })
    }

    /// Integrate `model` over every bin of `binning`, attaching `observed` counts.
    pub fn from_model(
        model: &CrossSectionModel,
        binning: &Binning,
        observed: Vec<f64>,
        meta: RunMetadata,
    ) -> Result<Self> {
        if observed.len() != binning.n_bins() {
            return Err(Error::Validation(format!(
                "expected {} observed counts, got {}",
                binning.n_bins(),
                observed.len()
            )));
        }
        let bins = binning
            .intervals()
            .zip(observed)
            .map(|((lo, hi), n)| {
                Ok(Bin { lower: lo, upper: hi, terms: model.integrate_terms(lo, hi)?, observed: n })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(bins, meta)
    }

    /// Replace the observed counts.
    pub fn with_observed(&self, observed: &[f64]) -> Result<Self> {
        if observed.len() != self.bins.len() {
            return Err(Error::Validation(format!(
                "expected {} observed counts, got {}",
                self.bins.len(),
                observed.len()
            )));
        }
        let bins = self
            .bins
            .iter()
            .zip(observed)
            .map(|(b, &n)| Bin { observed: n, ..b.clone() })
            .collect();
        Self::new(bins, self.meta.clone())
    }

    /// Replace the run metadata.
    pub fn with_meta(mut self, meta: RunMetadata) -> Self {
        self.meta = meta;
        self
    }

    /// Bins in ascending order.
    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.bins.len()
    }

    /// Observed counts in bin order.
    pub fn observed(&self) -> Vec<f64> {
        self.bins.iter().map(|b| b.observed).collect()
    }

    /// Covered kinematic range.
    pub fn range(&self) -> (f64, f64) {
        (self.bins[0].lower, self.bins[self.bins.len() - 1].upper)
    }

    /// Run metadata.
    pub fn meta(&self) -> &RunMetadata {
        &self.meta
    }

    /// Number of couplings the bin terms are expanded in.
    pub fn n_couplings(&self) -> usize {
        self.bins[0].terms.n_couplings()
    }
}

/// Ordered event sample with optional non-negative weights plus run metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct UnbinnedDataset {
    events: Vec<KinematicEvent>,
    weights: Option<Vec<f64>>,
    meta: RunMetadata,
}

impl UnbinnedDataset {
    /// Build and validate an unbinned dataset.
    pub fn new(
        events: Vec<KinematicEvent>,
        weights: Option<Vec<f64>>,
        meta: RunMetadata,
    ) -> Result<Self> {
        if let Some(w) = &weights {
            if w.len() != events.len() {
                return Err(Error::Validation(format!(
                    "weights length mismatch: expected {}, got {}",
                    events.len(),
                    w.len()
                )));
            }
            if w.iter().any(|x| !x.is_finite() || *x < 0.0) {
                return Err(Error::Validation("event weights must be finite and >= 0".into()));
            }
        }
        if events.iter().any(|e| !(e.mass.is_finite() && e.rapidity.is_finite())) {
            return Err(Error::Validation("events contain non-finite observables".into()));
        }
        Ok(Self { events, weights, meta })
    }

    /// Read (at most `max`) events from an external source.
    pub fn from_source(
        source: &dyn EventSource,
        max: Option<usize>,
        meta: RunMetadata,
    ) -> Result<Self> {
        let events = source.collect_events(max)?;
        log::debug!("read {} events from {}", events.len(), source.id());
        Self::new(events, None, meta)
    }

    /// Events in order.
    pub fn events(&self) -> &[KinematicEvent] {
        &self.events
    }

    /// Optional per-event weights.
    pub fn weights(&self) -> Option<&[f64]> {
        self.weights.as_deref()
    }

    /// Weight of event `i` (`1` when unweighted).
    pub fn weight(&self, i: usize) -> f64 {
        self.weights.as_ref().map_or(1.0, |w| w[i])
    }

    /// Number of events.
    pub fn n_events(&self) -> usize {
        self.events.len()
    }

    /// Sum of weights (event count when unweighted).
    pub fn total_weight(&self) -> f64 {
        match &self.weights {
            Some(w) => w.iter().sum(),
            None => self.events.len() as f64,
        }
    }

    /// Run metadata.
    pub fn meta(&self) -> &RunMetadata {
        &self.meta
    }
}

/// Analysis input: binned histogram or unbinned event sample.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisData {
    /// Binned counts.
    Binned(BinnedDataset),
    /// Event-level sample.
    Unbinned(UnbinnedDataset),
}

impl AnalysisData {
    /// Mode tag.
    pub fn mode(&self) -> AnalysisMode {
        match self {
            AnalysisData::Binned(_) => AnalysisMode::Binned,
            AnalysisData::Unbinned(_) => AnalysisMode::Unbinned,
        }
    }

    /// Run metadata.
    pub fn meta(&self) -> &RunMetadata {
        match self {
            AnalysisData::Binned(d) => d.meta(),
            AnalysisData::Unbinned(d) => d.meta(),
        }
    }

    /// Dataset size: number of bins or number of events.
    pub fn size(&self) -> usize {
        match self {
            AnalysisData::Binned(d) => d.n_bins(),
            AnalysisData::Unbinned(d) => d.n_events(),
        }
    }
}

impl From<BinnedDataset> for AnalysisData {
    fn from(d: BinnedDataset) -> Self {
        AnalysisData::Binned(d)
    }
}

impl From<UnbinnedDataset> for AnalysisData {
    fn from(d: UnbinnedDataset) -> Self {
        AnalysisData::Unbinned(d)
    }
}
