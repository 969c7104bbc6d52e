//! Relativistic kinematics: four-momenta, invariant mass and rapidity.

use eb_core::{Error, KinematicEvent, Result};
use nalgebra::{Vector3, Vector4};
use serde::{Deserialize, Serialize};
use std::ops::Add;

/// Relative tolerance below which a negative `m^2` is treated as rounding noise.
const MASS2_TOL: f64 = 1e-9;

/// Four-momentum `(E, px, py, pz)` backed by a `nalgebra` vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct FourMomentum(Vector4<f64>);

impl From<[f64; 4]> for FourMomentum {
    fn from(v: [f64; 4]) -> Self {
        Self(Vector4::from(v))
    }
}

impl From<FourMomentum> for [f64; 4] {
    fn from(p: FourMomentum) -> Self {
        p.0.into()
    }
}

impl From<Vector4<f64>> for FourMomentum {
    fn from(v: Vector4<f64>) -> Self {
        Self(v)
    }
}

impl From<FourMomentum> for Vector4<f64> {
    fn from(p: FourMomentum) -> Self {
        p.0
    }
}

impl Add for FourMomentum {
    type Output = FourMomentum;

    fn add(self, o: FourMomentum) -> FourMomentum {
        FourMomentum(self.0 + o.0)
    }
}

impl FourMomentum {
    /// Construct from components.
    pub fn new(e: f64, px: f64, py: f64, pz: f64) -> Self {
        Self(Vector4::new(e, px, py, pz))
    }

    /// Energy.
    pub fn e(&self) -> f64 {
        self.0[0]
    }

    /// Momentum along the beam axis.
    pub fn pz(&self) -> f64 {
        self.0[3]
    }

    /// Three-momentum `(px, py, pz)`.
    pub fn momentum(&self) -> Vector3<f64> {
        self.0.fixed_rows::<3>(1).into_owned()
    }

    /// Transverse momentum.
    pub fn pt(&self) -> f64 {
        self.0.fixed_rows::<2>(1).norm()
    }

    /// Minkowski square `E^2 - |p|^2`.
    pub fn mass2(&self) -> f64 {
        self.e() * self.e() - self.momentum().norm_squared()
    }

    /// Invariant mass `sqrt(E^2 - |p|^2)`.
    pub fn mass(&self) -> Result<f64> {
        let m2 = self.mass2();
        if m2 >= 0.0 {
            return Ok(m2.sqrt());
        }
        if -m2 <= MASS2_TOL * self.e() * self.e() {
            return Ok(0.0);
        }
        Err(Error::Validation(format!("space-like four-momentum (m^2 = {m2})")))
    }

    /// Rapidity `½ ln((E + pz) / (E − pz))`.
    pub fn rapidity(&self) -> Result<f64> {
        let plus = self.e() + self.pz();
        let minus = self.e() - self.pz();
        if !(plus > 0.0 && minus > 0.0) {
            return Err(Error::Validation(format!(
                "rapidity undefined for E={}, pz={}",
                self.e(),
                self.pz()
            )));
        }
        Ok(0.5 * (plus / minus).ln())
    }
}

/// Reduce a two-particle final state to its pair invariant mass and rapidity.
pub fn pair_event(p1: FourMomentum, p2: FourMomentum) -> Result<KinematicEvent> {
    let p = p1 + p2;
    Ok(KinematicEvent::new(p.mass()?, p.rapidity()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_back_to_back_pair_at_rest() {
        // Two massless particles back to back: m = 2E, y = 0.
        let p1 = FourMomentum::new(0.5, 0.3, 0.4, 0.0);
        let p2 = FourMomentum::new(0.5, -0.3, -0.4, 0.0);
        assert_relative_eq!(p1.pt(), 0.5, epsilon = 1e-12);
        let ev = pair_event(p1, p2).unwrap();
        assert_relative_eq!(ev.mass, 1.0, epsilon = 1e-12);
        assert_relative_eq!(ev.rapidity, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_boosted_pair_rapidity() {
        // Mass 1 system with E = cosh(y), pz = sinh(y).
        let y: f64 = 0.7;
        let p1 = FourMomentum::new(0.5 * y.cosh(), 0.0, 0.0, 0.5 * y.sinh());
        let p = p1 + p1;
        assert_relative_eq!(p.mass().unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(p.rapidity().unwrap(), y, epsilon = 1e-12);
        assert_relative_eq!(p.momentum().z, y.sinh(), epsilon = 1e-12);
    }

    #[test]
    fn test_space_like_rejected() {
        let p = FourMomentum::new(1.0, 2.0, 0.0, 0.0);
        assert!(p.mass().is_err());
        let lightlike = FourMomentum::new(1.0, 0.0, 0.0, 1.0);
        assert_eq!(lightlike.mass().unwrap(), 0.0);
        assert!(lightlike.rapidity().is_err());
    }

    #[test]
    fn test_nalgebra_conversions() {
        let v = Vector4::new(2.0, 0.5, -0.5, 1.0);
        let p = FourMomentum::from(v);
        assert_eq!(p, FourMomentum::new(2.0, 0.5, -0.5, 1.0));
        assert_eq!(Vector4::from(p + p), v * 2.0);
        assert_relative_eq!(p.mass2(), 4.0 - 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_four_momentum_serde_as_array() {
        let p: FourMomentum = serde_json::from_str("[1.0, 0.1, 0.2, 0.3]").unwrap();
        assert_eq!(p, FourMomentum::new(1.0, 0.1, 0.2, 0.3));
        assert_eq!(serde_json::to_string(&p).unwrap(), "[1.0,0.1,0.2,0.3]");
    }
}
