//! Coupling grids: explicit point lists or per-axis inclusive ranges.

use eb_core::{CouplingPoint, Error, Result};
use serde::{Deserialize, Serialize};

/// Upper limit on the number of points a grid may expand to, per axis and in total.
pub const MAX_GRID_POINTS: usize = 10_000_000;

/// Inclusive lattice `start, start + step, …, stop` along one coupling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    /// First value.
    pub start: f64,
    /// Last value (included when it lies on the lattice).
    pub stop: f64,
    /// Spacing (> 0).
    pub step: f64,
}

impl AxisRange {
    /// Construct and validate.
    pub fn new(start: f64, stop: f64, step: f64) -> Result<Self> {
        let r = Self { start, stop, step };
        r.validate()?;
        Ok(r)
    }

    fn validate(&self) -> Result<()> {
        if !(self.start.is_finite() && self.stop.is_finite()) || self.stop < self.start {
            return Err(Error::Validation(format!(
                "invalid axis range [{}, {}]",
                self.start, self.stop
            )));
        }
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(Error::Validation(format!("axis step must be > 0, got {}", self.step)));
        }
        Ok(())
    }

    /// Lattice values. Values within `1e-9 · step` of zero snap to exactly zero so that the
    /// SM point is hit despite accumulated rounding.
    pub fn values(&self) -> Result<Vec<f64>> {
        self.validate()?;
        let n = ((self.stop - self.start) / self.step + 1e-9).floor() + 1.0;
        if !(n <= MAX_GRID_POINTS as f64) {
            return Err(Error::Validation(format!(
                "axis [{}, {}] with step {} has {n} points (limit {MAX_GRID_POINTS})",
                self.start, self.stop, self.step
            )));
        }
        let n = n as usize;
        let snap = 1e-9 * self.step;
        Ok((0..n)
            .map(|k| {
                let v = self.start + k as f64 * self.step;
                if v.abs() < snap {
                    0.0
                } else {
                    v
                }
            })
            .collect())
    }
}

/// Set of coupling points to scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridSpec {
    /// Explicit points.
    Points(Vec<Vec<f64>>),
    /// Cartesian product of per-axis ranges (first axis varies slowest).
    Ranges(Vec<AxisRange>),
}

impl GridSpec {
    /// Expand into coupling points of dimension `dim`.
    pub fn points(&self, dim: usize) -> Result<Vec<CouplingPoint>> {
        match self {
            GridSpec::Points(pts) => pts
                .iter()
                .map(|p| {
                    if p.len() != dim {
                        return Err(Error::Validation(format!(
                            "grid point has {} coordinates, expected {dim}",
                            p.len()
                        )));
                    }
                    if p.iter().any(|c| !c.is_finite()) {
                        let msg = "grid point has non-finite coordinate";
                        return Err(Error::Validation(msg.into()));
                    }
                    Ok(CouplingPoint::new(p.clone()))
                })
                .collect(),
            GridSpec::Ranges(axes) => {
                if axes.len() != dim {
                    return Err(Error::Validation(format!(
                        "grid has {} axes, expected {dim}",
                        axes.len()
                    )));
                }
                let values = axes.iter().map(AxisRange::values).collect::<Result<Vec<_>>>()?;
                let total = values
                    .iter()
                    .try_fold(1usize, |acc, v| acc.checked_mul(v.len()))
                    .filter(|&n| n <= MAX_GRID_POINTS);
                if total.is_none() {
                    return Err(Error::Validation(format!(
                        "grid expands to more than {MAX_GRID_POINTS} points"
                    )));
                }
                let mut out: Vec<Vec<f64>> = vec![Vec::with_capacity(dim)];
                for values in values {
                    out = out
                        .into_iter()
                        .flat_map(|prefix| {
                            values.iter().map(move |&v| {
                                let mut p = prefix.clone();
                                p.push(v);
                                p
                            })
                        })
                        .collect();
                }
                Ok(out.into_iter().map(CouplingPoint::new).collect())
            }
        }
    }
}
