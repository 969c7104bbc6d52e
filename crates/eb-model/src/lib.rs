//! # eb-model
//!
//! Physics-facing models for eftbound.
//!
//! This crate provides:
//! - [`CoefficientTable`]: precomputed SM / linear / quadratic partial cross-sections on a
//!   kinematic grid, shared read-only behind an `Arc`.
//! - [`JointCoefficientTable`]: the same decomposition double-differential in mass and
//!   rapidity.
//! - [`CrossSectionModel`]: `σ(c) = σ_SM + Σ c_i σ_i + Σ c_i c_j σ_ij`, differential and
//!   integrated, plus the analytic likelihood ratio to the SM.
//! - [`Binning`]: gap-free kinematic partitions.
//! - Four-momentum kinematics and [`eb_core::EventSource`] implementations.
//! - Classifier adapters turning external scores into likelihood ratios.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binning;
pub mod classifier;
pub mod event_source;
pub mod joint;
pub mod kinematics;
pub mod table;
pub mod xsec;

pub use binning::Binning;
pub use classifier::{
    FeatureScaling, FixedPointRatio, LearnedRatioSpec, LinearScore, QuadraticRatioModel,
    QuadraticScore, ReplicaEnsemble, ReplicaSpec, ScoreLink, ScoreRatio,
};
pub use event_source::{ChainedEventSource, JsonlEventSource, MemoryEventSource};
pub use joint::JointCoefficientTable;
pub use kinematics::FourMomentum;
pub use table::{CoefficientTable, QuadraticColumn, XsecTerms};
pub use xsec::{CrossSectionModel, EftOrder};
