//! Common data types for eftbound

use serde::{Deserialize, Serialize};

/// A point in Wilson-coefficient space (one hypothesis).
///
/// Equality is coordinate-wise. Serialized as a plain JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CouplingPoint(Vec<f64>);

impl CouplingPoint {
    /// Create a point from its coordinates.
    pub fn new(coords: Vec<f64>) -> Self {
        Self(coords)
    }

    /// The Standard-Model point (all couplings zero) in `dim` dimensions.
    pub fn zero(dim: usize) -> Self {
        Self(vec![0.0; dim])
    }

    /// Number of couplings.
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// Coordinates as a slice.
    pub fn coords(&self) -> &[f64] {
        &self.0
    }

    /// Coupling value along axis `i`.
    pub fn get(&self, i: usize) -> f64 {
        self.0[i]
    }

    /// `true` if every coupling is exactly zero (the SM hypothesis).
    pub fn is_null(&self) -> bool {
        self.0.iter().all(|c| *c == 0.0)
    }

    /// Euclidean magnitude `|c|`.
    pub fn norm(&self) -> f64 {
        self.0.iter().map(|c| c * c).sum::<f64>().sqrt()
    }

    /// Unit direction `c / |c|`, or `None` at the origin.
    pub fn direction(&self) -> Option<Vec<f64>> {
        let n = self.norm();
        if n == 0.0 || !n.is_finite() {
            return None;
        }
        Some(self.0.iter().map(|c| c / n).collect())
    }
}

impl From<Vec<f64>> for CouplingPoint {
    fn from(coords: Vec<f64>) -> Self {
        Self(coords)
    }
}

impl std::fmt::Display for CouplingPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, ")")
    }
}

/// Kinematic observable a cross-section table is tabulated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Observable {
    /// Invariant mass of the final-state pair.
    Mass,
    /// Rapidity of the final-state pair.
    Rapidity,
}

impl Observable {
    /// Lower-case name, as used in tables and cards.
    pub fn name(self) -> &'static str {
        match self {
            Observable::Mass => "mass",
            Observable::Rapidity => "rapidity",
        }
    }
}

/// One collision event reduced to its kinematic observables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KinematicEvent {
    /// Invariant mass of the pair.
    pub mass: f64,
    /// Rapidity of the pair.
    pub rapidity: f64,
    /// Optional precomputed classifier score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl KinematicEvent {
    /// Event without a classifier score.
    pub fn new(mass: f64, rapidity: f64) -> Self {
        Self { mass, rapidity, score: None }
    }

    /// Attach a classifier score.
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Value of the given observable.
    pub fn observable(&self, obs: Observable) -> f64 {
        match obs {
            Observable::Mass => self.mass,
            Observable::Rapidity => self.rapidity,
        }
    }

    /// Feature vector `[mass, rapidity]` fed to classifiers.
    pub fn features(&self) -> [f64; 2] {
        [self.mass, self.rapidity]
    }
}

/// Run metadata carried by datasets and scan artifacts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Integrated luminosity (inverse cross-section units of the coefficient table).
    pub luminosity: f64,
    /// Monte-Carlo run identifiers combined into this dataset.
    #[serde(default)]
    pub mc_runs: Vec<String>,
    /// Cross-section normalisation of the generated sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xsec_norm: Option<f64>,
    /// Number of generated Monte-Carlo events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_generated: Option<u64>,
}

impl RunMetadata {
    /// Metadata with only the luminosity set.
    pub fn with_luminosity(luminosity: f64) -> Self {
        Self { luminosity, ..Default::default() }
    }
}
