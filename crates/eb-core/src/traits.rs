//! Capability traits for external collaborators.
//!
//! The bound-setting engine never sees a classifier's architecture or an event file's layout:
//! it only consumes these narrow interfaces.

use crate::types::{CouplingPoint, KinematicEvent};
use crate::Result;

/// Externally trained classifier: kinematic features → score.
///
/// The score must be monotonically related to the likelihood ratio it was trained for.
pub trait Classifier: Send + Sync {
    /// Evaluate the classifier on one feature vector.
    fn score(&self, features: &[f64]) -> Result<f64>;
}

/// Per-event likelihood ratio `r(x, c) = p_c(x) / p_SM(x)`.
///
/// Implemented by the analytic cross-section model and by classifier adapters.
pub trait LikelihoodRatio: Send + Sync {
    /// Likelihood ratio of `event` under `point` relative to the SM.
    fn ratio(&self, event: &KinematicEvent, point: &CouplingPoint) -> Result<f64>;
}

/// Lazy, finite, restartable source of [`KinematicEvent`]s.
///
/// Every call to [`EventSource::events`] starts again from the first event.
pub trait EventSource: Send + Sync {
    /// Dataset identifier (path or label).
    fn id(&self) -> &str;

    /// Iterate over at most `max` events (all events when `None`).
    fn events(
        &self,
        max: Option<usize>,
    ) -> Result<Box<dyn Iterator<Item = Result<KinematicEvent>> + '_>>;

    /// Collect all (or at most `max`) events, failing on the first bad record.
    fn collect_events(&self, max: Option<usize>) -> Result<Vec<KinematicEvent>> {
        self.events(max)?.collect()
    }
}
