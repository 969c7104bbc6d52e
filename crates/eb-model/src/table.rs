//! Precomputed partial cross-section coefficients on a kinematic grid.
//!
//! A table stores, for every node `x_k` of a one-dimensional kinematic grid, the SM
//! differential cross-section, the linear interference terms `σ_i(x_k)` and the quadratic
//! terms `σ_ij(x_k)` (`i <= j`). Values between nodes are linearly interpolated, so every
//! query (differential or integrated) is a linear functional of the stored columns and the
//! SM / linear / quadratic decomposition is preserved exactly.

use eb_core::{CouplingPoint, Error, Observable, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Quadratic coefficient column `σ_ij(x)` for the coupling pair `(i, j)` with `i <= j`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuadraticColumn {
    /// First coupling index.
    pub i: usize,
    /// Second coupling index (`>= i`).
    pub j: usize,
    /// Values at the table nodes.
    pub values: Vec<f64>,
}

/// Cross-section decomposition at a point or over an interval.
///
/// `σ(c) = sm + Σ_i c_i linear[i] + Σ_(i,j,v) c_i c_j v`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XsecTerms {
    /// Standard-Model term.
    pub sm: f64,
    /// Linear (interference) terms, one per coupling.
    pub linear: Vec<f64>,
    /// Quadratic terms `(i, j, σ_ij)`.
    pub quadratic: Vec<(usize, usize, f64)>,
}

impl XsecTerms {
    /// Combine the terms with coupling values. The result may be negative.
    pub fn evaluate(&self, point: &CouplingPoint) -> Result<f64> {
        if point.dim() != self.linear.len() {
            return Err(Error::Validation(format!(
                "coupling point has {} coordinates, model has {} couplings",
                point.dim(),
                self.linear.len()
            )));
        }
        let c = point.coords();
        let mut sigma = self.sm;
        for (ci, si) in c.iter().zip(&self.linear) {
            sigma += ci * si;
        }
        for &(i, j, sij) in &self.quadratic {
            sigma += c[i] * c[j] * sij;
        }
        Ok(sigma)
    }

    /// Number of couplings.
    pub fn n_couplings(&self) -> usize {
        self.linear.len()
    }
}

/// Immutable table of partial cross-section coefficients.
///
/// Construct with [`CoefficientTable::new`], [`CoefficientTable::tabulate`] or by deserializing
/// (JSON); all paths validate the table. Files are loaded through
/// [`crate::CrossSectionModel::from_json_path`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CoefficientTableRepr")]
pub struct CoefficientTable {
    observable: Observable,
    couplings: Vec<String>,
    nodes: Vec<f64>,
    sm: Vec<f64>,
    linear: Vec<Vec<f64>>,
    quadratic: Vec<QuadraticColumn>,
}

#[derive(Deserialize)]
struct CoefficientTableRepr {
    observable: Observable,
    couplings: Vec<String>,
    nodes: Vec<f64>,
    sm: Vec<f64>,
    linear: Vec<Vec<f64>>,
    #[serde(default)]
    quadratic: Vec<QuadraticColumn>,
}

impl TryFrom<CoefficientTableRepr> for CoefficientTable {
    type Error = Error;

    fn try_from(r: CoefficientTableRepr) -> Result<Self> {
        Self::new(r.observable, r.couplings, r.nodes, r.sm, r.linear, r.quadratic)
    }
}

pub(crate) fn check_column(name: &str, values: &[f64], n: usize) -> Result<()> {
    if values.len() != n {
        return Err(Error::Validation(format!(
            "column '{name}' has {} values, expected {n}",
            values.len()
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(Error::Validation(format!("column '{name}' contains non-finite values")));
    }
    Ok(())
}

pub(crate) fn check_couplings(couplings: &[String]) -> Result<()> {
    if couplings.is_empty() {
        return Err(Error::Validation("table requires at least one coupling".into()));
    }
    let mut seen = HashSet::new();
    for name in couplings {
        if !seen.insert(name.as_str()) {
            return Err(Error::Validation(format!("duplicate coupling name '{name}'")));
        }
    }
    Ok(())
}

pub(crate) fn check_nodes(axis: &str, nodes: &[f64]) -> Result<()> {
    let n = nodes.len();
    if n < 2 {
        return Err(Error::Validation(format!("{axis} axis requires >= 2 nodes, got {n}")));
    }
    if nodes.iter().any(|x| !x.is_finite()) {
        return Err(Error::Validation(format!("{axis} nodes must be finite")));
    }
    if nodes.windows(2).any(|w| w[1] <= w[0]) {
        return Err(Error::Validation(format!("{axis} nodes must be strictly ascending")));
    }
    Ok(())
}

/// Checks `i <= j < n_couplings` and uniqueness for every `(i, j)` pair.
pub(crate) fn check_pairs(
    pairs: impl IntoIterator<Item = (usize, usize)>,
    couplings: &[String],
) -> Result<()> {
    let mut seen = HashSet::new();
    for (i, j) in pairs {
        if i > j || j >= couplings.len() {
            return Err(Error::Validation(format!(
                "invalid quadratic pair ({i}, {j}) for {} couplings",
                couplings.len()
            )));
        }
        if !seen.insert((i, j)) {
            return Err(Error::Validation(format!("duplicate quadratic pair ({i}, {j})")));
        }
    }
    Ok(())
}

/// Segment index `k` and weight `t` such that `f(x) = (1-t) f_k + t f_{k+1}`.
pub(crate) fn locate(nodes: &[f64], x: f64) -> Result<(usize, f64)> {
    let n = nodes.len();
    let (low, high) = (nodes[0], nodes[n - 1]);
    if !(x >= low && x <= high) {
        return Err(Error::OutOfRange { value: x, low, high });
    }
    let k = nodes.partition_point(|v| *v <= x).saturating_sub(1).min(n - 2);
    let t = (x - nodes[k]) / (nodes[k + 1] - nodes[k]);
    Ok((k, t))
}

/// Sparse node weights `w_k` such that `∫_lo^hi f = Σ w_k f_k` for the interpolant.
pub(crate) fn integration_weights(nodes: &[f64], lo: f64, hi: f64) -> Result<Vec<(usize, f64)>> {
    locate(nodes, lo)?;
    locate(nodes, hi)?;
    if lo > hi {
        return Err(Error::Validation(format!("invalid integration range [{lo}, {hi}]")));
    }

    let mut weights: Vec<(usize, f64)> = Vec::new();
    let mut push = |k: usize, w: f64| match weights.last_mut() {
        Some((last, acc)) if *last == k => *acc += w,
        _ => weights.push((k, w)),
    };
    for k in 0..nodes.len() - 1 {
        let (xk, xk1) = (nodes[k], nodes[k + 1]);
        let a = lo.max(xk);
        let b = hi.min(xk1);
        if b <= a {
            continue;
        }
        let h = xk1 - xk;
        let ta = (a - xk) / h;
        let tb = (b - xk) / h;
        let half = 0.5 * (b - a);
        push(k, half * (2.0 - ta - tb));
        push(k + 1, half * (ta + tb));
    }
    Ok(weights)
}

impl CoefficientTable {
    /// Build and validate a table.
    pub fn new(
        observable: Observable,
        couplings: Vec<String>,
        nodes: Vec<f64>,
        sm: Vec<f64>,
        linear: Vec<Vec<f64>>,
        quadratic: Vec<QuadraticColumn>,
    ) -> Result<Self> {
        check_couplings(&couplings)?;
        check_nodes(observable.name(), &nodes)?;
        let n = nodes.len();

        check_column("sm", &sm, n)?;
        if linear.len() != couplings.len() {
            return Err(Error::Validation(format!(
                "expected {} linear columns, got {}",
                couplings.len(),
                linear.len()
            )));
        }
        for (name, col) in couplings.iter().zip(&linear) {
            check_column(name, col, n)?;
        }

        check_pairs(quadratic.iter().map(|q| (q.i, q.j)), &couplings)?;
        for q in &quadratic {
            check_column(&format!("{}*{}", couplings[q.i], couplings[q.j]), &q.values, n)?;
        }

        Ok(Self { observable, couplings, nodes, sm, linear, quadratic })
    }

    /// Tabulate a decomposition function on the given nodes.
    ///
    /// The quadratic pairs are taken from the first node and must be the same at every node.
    pub fn tabulate<F>(
        observable: Observable,
        couplings: Vec<String>,
        nodes: Vec<f64>,
        f: F,
    ) -> Result<Self>
    where
        F: Fn(f64) -> XsecTerms,
    {
        let n_c = couplings.len();
        let mut sm = Vec::with_capacity(nodes.len());
        let mut linear = vec![Vec::with_capacity(nodes.len()); n_c];
        let mut quadratic: Vec<QuadraticColumn> = Vec::new();

        for (k, &x) in nodes.iter().enumerate() {
            let t = f(x);
            if t.linear.len() != n_c {
                return Err(Error::Validation(format!(
                    "tabulated function returned {} linear terms at x={x}, expected {n_c}",
                    t.linear.len()
                )));
            }
            sm.push(t.sm);
            for (col, v) in linear.iter_mut().zip(&t.linear) {
                col.push(*v);
            }
            if k == 0 {
                quadratic = t
                    .quadratic
                    .iter()
                    .map(|&(i, j, v)| QuadraticColumn { i, j, values: vec![v] })
                    .collect();
            } else {
                if t.quadratic.len() != quadratic.len() {
                    return Err(Error::Validation(format!(
                        "tabulated function changed its quadratic terms at x={x}"
                    )));
                }
                for (col, &(i, j, v)) in quadratic.iter_mut().zip(&t.quadratic) {
                    if (col.i, col.j) != (i, j) {
                        return Err(Error::Validation(format!(
                            "tabulated function changed its quadratic terms at x={x}"
                        )));
                    }
                    col.values.push(v);
                }
            }
        }

        Self::new(observable, couplings, nodes, sm, linear, quadratic)
    }

    /// Observable the table is tabulated in.
    pub fn observable(&self) -> Observable {
        self.observable
    }

    /// Coupling (Wilson-coefficient) names, in coordinate order.
    pub fn couplings(&self) -> &[String] {
        &self.couplings
    }

    /// Number of couplings.
    pub fn n_couplings(&self) -> usize {
        self.couplings.len()
    }

    /// Grid nodes.
    pub fn nodes(&self) -> &[f64] {
        &self.nodes
    }

    /// Tabulated range `(low, high)`, both edges inclusive.
    pub fn range(&self) -> (f64, f64) {
        (self.nodes[0], self.nodes[self.nodes.len() - 1])
    }

    /// Interpolated decomposition at `x`.
    pub fn terms_at(&self, x: f64) -> Result<XsecTerms> {
        let (k, t) = locate(&self.nodes, x)?;
        let interp = |col: &[f64]| (1.0 - t) * col[k] + t * col[k + 1];
        Ok(XsecTerms {
            sm: interp(&self.sm),
            linear: self.linear.iter().map(|c| interp(c)).collect(),
            quadratic: self.quadratic.iter().map(|q| (q.i, q.j, interp(&q.values))).collect(),
        })
    }

    /// Decomposition integrated over `[lo, hi]` (exact for the piecewise-linear interpolant).
    pub fn integrate_terms(&self, lo: f64, hi: f64) -> Result<XsecTerms> {
        let w = integration_weights(&self.nodes, lo, hi)?;
        let apply = |col: &[f64]| w.iter().map(|&(k, wk)| wk * col[k]).sum::<f64>();
        Ok(XsecTerms {
            sm: apply(&self.sm),
            linear: self.linear.iter().map(|c| apply(c)).collect(),
            quadratic: self.quadratic.iter().map(|q| (q.i, q.j, apply(&q.values))).collect(),
        })
    }
}
