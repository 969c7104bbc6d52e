//! # eb-core
//!
//! Shared building blocks for eftbound:
//! - the error taxonomy ([`Error`], [`Result`])
//! - value types ([`CouplingPoint`], [`KinematicEvent`], [`RunMetadata`])
//! - capability traits for external collaborators ([`Classifier`], [`EventSource`],
//!   [`LikelihoodRatio`])
//!
//! Higher-level crates (`eb-model`, `eb-inference`) depend on these traits rather than on
//! concrete classifier or event-file implementations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{ConvergenceWarning, Error, Result};
pub use traits::{Classifier, EventSource, LikelihoodRatio};
pub use types::{CouplingPoint, KinematicEvent, Observable, RunMetadata};
