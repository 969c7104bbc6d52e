//! Double-differential coefficient tables in pair mass and rapidity.
//!
//! Values are stored on a rectangular `(mass, rapidity)` node grid and interpolated
//! bilinearly. Integrating the interpolant over rapidity node by node gives a mass table
//! whose own piecewise-linear interpolant is the exact marginal, so binned counts and totals
//! can keep using [`CoefficientTable`].

use crate::table::{
    check_column, check_couplings, check_nodes, check_pairs, integration_weights, locate,
    CoefficientTable, QuadraticColumn, XsecTerms,
};
use eb_core::{Error, Observable, Result};
use serde::{Deserialize, Serialize};

/// Immutable `d²σ/dm dy` coefficient table.
///
/// Grids are row-major: one row per mass node, one entry per rapidity node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JointTableRepr", into = "JointTableRepr")]
pub struct JointCoefficientTable {
    couplings: Vec<String>,
    mass_nodes: Vec<f64>,
    rapidity_nodes: Vec<f64>,
    sm: Vec<f64>,
    linear: Vec<Vec<f64>>,
    quadratic: Vec<QuadraticColumn>,
}

#[derive(Serialize, Deserialize)]
struct JointTableRepr {
    couplings: Vec<String>,
    mass_nodes: Vec<f64>,
    rapidity_nodes: Vec<f64>,
    sm: Vec<Vec<f64>>,
    linear: Vec<Vec<Vec<f64>>>,
    #[serde(default)]
    quadratic: Vec<JointQuadratic>,
}

#[derive(Serialize, Deserialize)]
struct JointQuadratic {
    i: usize,
    j: usize,
    values: Vec<Vec<f64>>,
}

fn flatten(name: &str, rows: Vec<Vec<f64>>, n_mass: usize, n_rap: usize) -> Result<Vec<f64>> {
    if rows.len() != n_mass {
        return Err(Error::Validation(format!(
            "grid '{name}' has {} rows, expected one per mass node ({n_mass})",
            rows.len()
        )));
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    check_column(name, &flat, n_mass * n_rap)?;
    Ok(flat)
}

fn unflatten(flat: &[f64], n_rap: usize) -> Vec<Vec<f64>> {
    flat.chunks(n_rap).map(<[f64]>::to_vec).collect()
}

impl TryFrom<JointTableRepr> for JointCoefficientTable {
    type Error = Error;

    fn try_from(r: JointTableRepr) -> Result<Self> {
        check_couplings(&r.couplings)?;
        check_nodes("mass", &r.mass_nodes)?;
        check_nodes("rapidity", &r.rapidity_nodes)?;
        let (n_m, n_y) = (r.mass_nodes.len(), r.rapidity_nodes.len());

        let sm = flatten("sm", r.sm, n_m, n_y)?;
        if r.linear.len() != r.couplings.len() {
            return Err(Error::Validation(format!(
                "expected {} linear grids, got {}",
                r.couplings.len(),
                r.linear.len()
            )));
        }
        let linear = r
            .couplings
            .iter()
            .zip(r.linear)
            .map(|(name, rows)| flatten(name, rows, n_m, n_y))
            .collect::<Result<Vec<_>>>()?;

        check_pairs(r.quadratic.iter().map(|q| (q.i, q.j)), &r.couplings)?;
        let quadratic = r
            .quadratic
            .into_iter()
            .map(|q| {
                let name = format!("{}*{}", r.couplings[q.i], r.couplings[q.j]);
                let values = flatten(&name, q.values, n_m, n_y)?;
                Ok(QuadraticColumn { i: q.i, j: q.j, values })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            couplings: r.couplings,
            mass_nodes: r.mass_nodes,
            rapidity_nodes: r.rapidity_nodes,
            sm,
            linear,
            quadratic,
        })
    }
}

impl From<JointCoefficientTable> for JointTableRepr {
    fn from(t: JointCoefficientTable) -> Self {
        let n_y = t.rapidity_nodes.len();
        Self {
            sm: unflatten(&t.sm, n_y),
            linear: t.linear.iter().map(|c| unflatten(c, n_y)).collect(),
            quadratic: t
                .quadratic
                .iter()
                .map(|q| JointQuadratic { i: q.i, j: q.j, values: unflatten(&q.values, n_y) })
                .collect(),
            couplings: t.couplings,
            mass_nodes: t.mass_nodes,
            rapidity_nodes: t.rapidity_nodes,
        }
    }
}

impl JointCoefficientTable {
    /// Tabulate `f(mass, rapidity)` on the node grid.
    ///
    /// The quadratic pairs are taken from the first node and must be the same everywhere.
    pub fn tabulate<F>(
        couplings: Vec<String>,
        mass_nodes: Vec<f64>,
        rapidity_nodes: Vec<f64>,
        f: F,
    ) -> Result<Self>
    where
        F: Fn(f64, f64) -> XsecTerms,
    {
        let n_c = couplings.len();
        let mut sm = Vec::with_capacity(mass_nodes.len());
        let mut linear = vec![Vec::with_capacity(mass_nodes.len()); n_c];
        let mut quadratic: Vec<JointQuadratic> = Vec::new();

        for &m in &mass_nodes {
            let mut sm_row = Vec::with_capacity(rapidity_nodes.len());
            let mut lin_rows = vec![Vec::with_capacity(rapidity_nodes.len()); n_c];
            let mut quad_rows: Vec<Vec<f64>> = vec![Vec::new(); quadratic.len()];
            for &y in &rapidity_nodes {
                let t = f(m, y);
                if t.linear.len() != n_c {
                    return Err(Error::Validation(format!(
                        "tabulated function returned {} linear terms at ({m}, {y}), \
                         expected {n_c}",
                        t.linear.len()
                    )));
                }
                sm_row.push(t.sm);
                for (row, v) in lin_rows.iter_mut().zip(&t.linear) {
                    row.push(*v);
                }
                if quadratic.is_empty() && quad_rows.is_empty() {
                    quadratic = t
                        .quadratic
                        .iter()
                        .map(|&(i, j, _)| JointQuadratic { i, j, values: Vec::new() })
                        .collect();
                    quad_rows = vec![Vec::new(); quadratic.len()];
                }
                let same = t.quadratic.len() == quadratic.len()
                    && quadratic
                        .iter()
                        .zip(&t.quadratic)
                        .all(|(q, &(i, j, _))| (q.i, q.j) == (i, j));
                if !same {
                    return Err(Error::Validation(format!(
                        "tabulated function changed its quadratic terms at ({m}, {y})"
                    )));
                }
                for (row, &(_, _, v)) in quad_rows.iter_mut().zip(&t.quadratic) {
                    row.push(v);
                }
            }
            sm.push(sm_row);
            for (grid, row) in linear.iter_mut().zip(lin_rows) {
                grid.push(row);
            }
            for (q, row) in quadratic.iter_mut().zip(quad_rows) {
                q.values.push(row);
            }
        }

        Self::try_from(JointTableRepr {
            couplings,
            mass_nodes,
            rapidity_nodes,
            sm,
            linear,
            quadratic,
        })
    }

    /// Coupling names, in coordinate order.
    pub fn couplings(&self) -> &[String] {
        &self.couplings
    }

    /// Number of couplings.
    pub fn n_couplings(&self) -> usize {
        self.couplings.len()
    }

    /// Mass nodes.
    pub fn mass_nodes(&self) -> &[f64] {
        &self.mass_nodes
    }

    /// Rapidity nodes.
    pub fn rapidity_nodes(&self) -> &[f64] {
        &self.rapidity_nodes
    }

    /// Tabulated rapidity range, both edges inclusive.
    pub fn rapidity_range(&self) -> (f64, f64) {
        (self.rapidity_nodes[0], self.rapidity_nodes[self.rapidity_nodes.len() - 1])
    }

    /// Bilinearly interpolated decomposition of `d²σ/dm dy`.
    pub fn terms_at(&self, mass: f64, rapidity: f64) -> Result<XsecTerms> {
        let (k, t) = locate(&self.mass_nodes, mass)?;
        let (l, u) = locate(&self.rapidity_nodes, rapidity)?;
        let n_y = self.rapidity_nodes.len();
        let interp = |g: &[f64]| {
            let (a, b) = (k * n_y + l, (k + 1) * n_y + l);
            (1.0 - t) * ((1.0 - u) * g[a] + u * g[a + 1]) + t * ((1.0 - u) * g[b] + u * g[b + 1])
        };
        Ok(self.map_grids(interp))
    }

    /// Decomposition integrated over the rectangle `[m_lo, m_hi] × [y_lo, y_hi]`.
    ///
    /// Exact for the bilinear interpolant.
    pub fn integrate_terms(&self, mass: (f64, f64), rapidity: (f64, f64)) -> Result<XsecTerms> {
        let wm = integration_weights(&self.mass_nodes, mass.0, mass.1)?;
        let wy = integration_weights(&self.rapidity_nodes, rapidity.0, rapidity.1)?;
        let n_y = self.rapidity_nodes.len();
        let apply = |g: &[f64]| {
            wm.iter()
                .map(|&(k, a)| a * wy.iter().map(|&(l, b)| b * g[k * n_y + l]).sum::<f64>())
                .sum::<f64>()
        };
        Ok(self.map_grids(apply))
    }

    /// Rapidity-integrated mass table `dσ/dm`.
    pub fn marginal(&self) -> Result<CoefficientTable> {
        let (y_lo, y_hi) = self.rapidity_range();
        let wy = integration_weights(&self.rapidity_nodes, y_lo, y_hi)?;
        let n_y = self.rapidity_nodes.len();
        let reduce = |g: &[f64]| -> Vec<f64> {
            (0..self.mass_nodes.len())
                .map(|k| wy.iter().map(|&(l, w)| w * g[k * n_y + l]).sum())
                .collect()
        };
        CoefficientTable::new(
            Observable::Mass,
            self.couplings.clone(),
            self.mass_nodes.clone(),
            reduce(&self.sm),
            self.linear.iter().map(|g| reduce(g)).collect(),
            self.quadratic
                .iter()
                .map(|q| QuadraticColumn { i: q.i, j: q.j, values: reduce(&q.values) })
                .collect(),
        )
    }

    fn map_grids(&self, f: impl Fn(&[f64]) -> f64) -> XsecTerms {
        XsecTerms {
            sm: f(&self.sm),
            linear: self.linear.iter().map(|g| f(g)).collect(),
            quadratic: self.quadratic.iter().map(|q| (q.i, q.j, f(&q.values))).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use eb_core::CouplingPoint;

    /// Bilinear in (m, y), so interpolation and integration are exact.
    fn bilinear_table() -> JointCoefficientTable {
        JointCoefficientTable::tabulate(
            vec!["c".into()],
            vec![1.0, 2.0, 3.0],
            vec![-1.0, 0.0, 1.0],
            |m, y| XsecTerms {
                sm: 4.0 + m + y,
                linear: vec![m * y],
                quadratic: vec![(0, 0, 2.0 * m)],
            },
        )
        .unwrap()
    }

    #[test]
    fn test_bilinear_interpolation_is_exact_for_bilinear_input() {
        let t = bilinear_table();
        let terms = t.terms_at(1.5, 0.25).unwrap();
        assert_relative_eq!(terms.sm, 5.75, epsilon = 1e-12);
        assert_relative_eq!(terms.linear[0], 0.375, epsilon = 1e-12);
        assert_relative_eq!(terms.quadratic[0].2, 3.0, epsilon = 1e-12);
        assert!(matches!(t.terms_at(1.5, 1.5), Err(Error::OutOfRange { .. })));
        assert!(matches!(t.terms_at(0.5, 0.0), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn test_marginal_integrates_out_rapidity() {
        let t = bilinear_table();
        let m = t.marginal().unwrap();
        assert_eq!(m.observable(), Observable::Mass);
        // ∫_{-1}^{1} (4 + m + y) dy = 2 (4 + m); the odd m·y term vanishes.
        let terms = m.terms_at(2.5).unwrap();
        assert_relative_eq!(terms.sm, 13.0, epsilon = 1e-12);
        assert_relative_eq!(terms.linear[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(terms.quadratic[0].2, 10.0, epsilon = 1e-12);

        let c = CouplingPoint::new(vec![0.3]);
        let full = t.integrate_terms((1.0, 3.0), t.rapidity_range()).unwrap();
        let marg = m.integrate_terms(1.0, 3.0).unwrap();
        assert_relative_eq!(
            full.evaluate(&c).unwrap(),
            marg.evaluate(&c).unwrap(),
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_json_uses_nested_rows_and_validates() {
        let t = bilinear_table();
        let s = serde_json::to_string(&t).unwrap();
        assert!(s.contains("\"sm\":[[4.0,5.0,6.0],[5.0,6.0,7.0],[6.0,7.0,8.0]]"), "{s}");
        let back: JointCoefficientTable = serde_json::from_str(&s).unwrap();
        assert_eq!(back, t);

        let ragged = s.replace("[[4.0,5.0,6.0],", "[[4.0,5.0],");
        assert!(serde_json::from_str::<JointCoefficientTable>(&ragged).is_err());
    }
}
