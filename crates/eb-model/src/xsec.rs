//! EFT cross-section model built on a shared [`CoefficientTable`].

use crate::joint::JointCoefficientTable;
use crate::table::{CoefficientTable, XsecTerms};
use eb_core::{CouplingPoint, Error, KinematicEvent, LikelihoodRatio, Observable, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Order of the EFT expansion kept when evaluating cross-sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EftOrder {
    /// SM plus interference terms only (`O(1/Λ²)`).
    Linear,
    /// Interference plus squared dimension-6 terms (`O(1/Λ⁴)`).
    #[default]
    Quadratic,
}

/// Analytic differential / integrated cross-section as a function of EFT couplings.
///
/// Evaluation sums precomputed coefficients weighted by coupling products; the tables are
/// shared read-only, so cloning the model is cheap and safe across threads.
///
/// A model built from a [`JointCoefficientTable`] evaluates per-event quantities in
/// `(mass, rapidity)` and everything integrated (bins, totals) on the rapidity marginal.
#[derive(Debug, Clone)]
pub struct CrossSectionModel {
    table: Arc<CoefficientTable>,
    joint: Option<Arc<JointCoefficientTable>>,
    order: EftOrder,
}

impl CrossSectionModel {
    /// Wrap a (validated) coefficient table.
    pub fn new(table: Arc<CoefficientTable>) -> Self {
        Self { table, joint: None, order: EftOrder::default() }
    }

    /// Model over a double-differential table; bins and totals use its mass marginal.
    pub fn from_joint(joint: Arc<JointCoefficientTable>) -> Result<Self> {
        let table = Arc::new(joint.marginal()?);
        Ok(Self { table, joint: Some(joint), order: EftOrder::default() })
    }

    /// Load either table layout from JSON. Files with `rapidity_nodes` are double-differential.
    pub fn from_json_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        if value.get("rapidity_nodes").is_some() {
            let joint: JointCoefficientTable = serde_json::from_value(value)?;
            log::debug!(
                "loaded joint coefficient table {}: {}x{} nodes, {} couplings",
                path.display(),
                joint.mass_nodes().len(),
                joint.rapidity_nodes().len(),
                joint.n_couplings()
            );
            Self::from_joint(Arc::new(joint))
        } else {
            let table: CoefficientTable = serde_json::from_value(value)?;
            log::debug!(
                "loaded coefficient table {}: {} nodes, {} couplings",
                path.display(),
                table.nodes().len(),
                table.n_couplings()
            );
            Ok(Self::new(Arc::new(table)))
        }
    }

    /// Keep only the terms of `order` in every evaluation.
    pub fn with_order(mut self, order: EftOrder) -> Self {
        self.order = order;
        self
    }

    /// Expansion order in use.
    pub fn order(&self) -> EftOrder {
        self.order
    }

    /// Underlying one-dimensional coefficient table (the marginal for joint models).
    pub fn table(&self) -> &Arc<CoefficientTable> {
        &self.table
    }

    /// Double-differential table, when the model has one.
    pub fn joint(&self) -> Option<&Arc<JointCoefficientTable>> {
        self.joint.as_ref()
    }

    /// Observable the model is differential in.
    pub fn observable(&self) -> Observable {
        self.table.observable()
    }

    /// Number of couplings.
    pub fn n_couplings(&self) -> usize {
        self.table.n_couplings()
    }

    /// Coupling names.
    pub fn coupling_names(&self) -> &[String] {
        self.table.couplings()
    }

    /// Tabulated kinematic range (inclusive).
    pub fn range(&self) -> (f64, f64) {
        self.table.range()
    }

    fn truncate(&self, mut terms: XsecTerms) -> XsecTerms {
        if self.order == EftOrder::Linear {
            terms.quadratic.clear();
        }
        terms
    }

    /// SM / linear / quadratic decomposition of `dσ/dx` at `x`.
    pub fn terms_at(&self, x: f64) -> Result<XsecTerms> {
        Ok(self.truncate(self.table.terms_at(x)?))
    }

    /// Decomposition of `σ` integrated over `[lo, hi]`.
    pub fn integrate_terms(&self, lo: f64, hi: f64) -> Result<XsecTerms> {
        Ok(self.truncate(self.table.integrate_terms(lo, hi)?))
    }

    /// Decomposition at an event: `d²σ/dm dy` for joint models, `dσ/dx` otherwise.
    pub fn event_terms(&self, event: &KinematicEvent) -> Result<XsecTerms> {
        match &self.joint {
            Some(joint) => Ok(self.truncate(joint.terms_at(event.mass, event.rapidity)?)),
            None => self.terms_at(event.observable(self.observable())),
        }
    }

    /// Signed differential cross-section `dσ/dx(x; c)`.
    ///
    /// Interference terms can drive this negative at extreme couplings; consumers that need a
    /// density use [`CrossSectionModel::differential_clipped`].
    pub fn differential(&self, x: f64, point: &CouplingPoint) -> Result<f64> {
        self.terms_at(x)?.evaluate(point)
    }

    /// Differential cross-section clipped at zero.
    pub fn differential_clipped(&self, x: f64, point: &CouplingPoint) -> Result<f64> {
        Ok(self.differential(x, point)?.max(0.0))
    }

    /// Signed per-event differential cross-section (see [`CrossSectionModel::event_terms`]).
    pub fn event_differential(&self, event: &KinematicEvent, point: &CouplingPoint) -> Result<f64> {
        self.event_terms(event)?.evaluate(point)
    }

    /// Signed cross-section integrated over `[lo, hi]`.
    pub fn integrated_over(&self, lo: f64, hi: f64, point: &CouplingPoint) -> Result<f64> {
        self.integrate_terms(lo, hi)?.evaluate(point)
    }

    /// Signed cross-section integrated over the full tabulated range.
    pub fn integrated(&self, point: &CouplingPoint) -> Result<f64> {
        let (lo, hi) = self.range();
        self.integrated_over(lo, hi, point)
    }

    /// Signed cross-section over a `mass × rapidity` cell of a joint model.
    pub fn integrated_cell(
        &self,
        mass: (f64, f64),
        rapidity: (f64, f64),
        point: &CouplingPoint,
    ) -> Result<f64> {
        let joint = self.joint.as_ref().ok_or_else(|| {
            Error::Validation("cell integrals need a mass x rapidity table".into())
        })?;
        self.truncate(joint.integrate_terms(mass, rapidity)?).evaluate(point)
    }

    /// Analytic likelihood ratio `dσ(x; c) / dσ(x; 0)`.
    ///
    /// Returns `0` where the SM density vanishes.
    pub fn ratio_to_sm(&self, x: f64, point: &CouplingPoint) -> Result<f64> {
        ratio_of(&self.terms_at(x)?, point)
    }

    /// Per-event likelihood ratio, using rapidity as well when the model is joint.
    pub fn event_ratio(&self, event: &KinematicEvent, point: &CouplingPoint) -> Result<f64> {
        ratio_of(&self.event_terms(event)?, point)
    }

    /// Decision function `f(x, c) = 1 / (1 + r(x, c))` of the ideal classifier.
    pub fn decision_function(&self, x: f64, point: &CouplingPoint) -> Result<f64> {
        let r = self.ratio_to_sm(x, point)?;
        if r <= -1.0 {
            return Err(Error::Computation(format!(
                "decision function undefined for likelihood ratio {r} at x={x}"
            )));
        }
        Ok(1.0 / (1.0 + r))
    }
}

fn ratio_of(terms: &XsecTerms, point: &CouplingPoint) -> Result<f64> {
    let eft = terms.evaluate(point)?;
    if terms.sm == 0.0 {
        return Ok(0.0);
    }
    Ok(eft / terms.sm)
}

impl LikelihoodRatio for CrossSectionModel {
    fn ratio(&self, event: &KinematicEvent, point: &CouplingPoint) -> Result<f64> {
        self.event_ratio(event, point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Toy table on `m ∈ [0.5, 2.0]`: falling SM spectrum, interference and quadratic
    /// terms growing with mass.
    fn toy_model() -> CrossSectionModel {
        let nodes: Vec<f64> = (0..=30).map(|k| 0.5 + 0.05 * k as f64).collect();
        let table = CoefficientTable::tabulate(
            Observable::Mass,
            vec!["cHW".into(), "cHq3".into()],
            nodes,
            |m| XsecTerms {
                sm: 10.0 / (m * m),
                linear: vec![0.5 * m, -0.2 * m],
                quadratic: vec![(0, 0, 0.1 * m * m), (0, 1, 0.05 * m), (1, 1, 0.3 * m * m)],
            },
        )
        .unwrap();
        CrossSectionModel::new(Arc::new(table))
    }

    #[test]
    fn test_decomposition_is_additive() {
        let model = toy_model();
        let x = 1.0;
        let c = CouplingPoint::new(vec![0.7, -1.3]);
        let terms = model.terms_at(x).unwrap();
        let expected = terms.sm
            + 0.7 * terms.linear[0]
            + (-1.3) * terms.linear[1]
            + 0.7 * 0.7 * terms.quadratic[0].2
            + 0.7 * (-1.3) * terms.quadratic[1].2
            + (-1.3) * (-1.3) * terms.quadratic[2].2;
        assert_relative_eq!(model.differential(x, &c).unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_sm_ratio_is_one() {
        let model = toy_model();
        let sm = CouplingPoint::zero(2);
        for x in [0.5, 0.8, 1.33, 2.0] {
            assert_relative_eq!(model.ratio_to_sm(x, &sm).unwrap(), 1.0, epsilon = 1e-12);
            assert_relative_eq!(model.decision_function(x, &sm).unwrap(), 0.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_range_edges() {
        let model = toy_model();
        let c = CouplingPoint::new(vec![0.1, 0.1]);
        assert!(model.differential(2.0, &c).is_ok());
        assert!(model.differential(0.5, &c).is_ok());
        assert!(matches!(
            model.differential(3.0, &c),
            Err(Error::OutOfRange { value, .. }) if value == 3.0
        ));
        assert!(matches!(model.differential(-0.5, &c), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn test_integrated_splits_additively() {
        let model = toy_model();
        let c = CouplingPoint::new(vec![1.0, 2.0]);
        let total = model.integrated(&c).unwrap();
        let parts = model.integrated_over(0.5, 1.1, &c).unwrap()
            + model.integrated_over(1.1, 2.0, &c).unwrap();
        assert_relative_eq!(total, parts, max_relative = 1e-12);
    }

    #[test]
    fn test_negative_interference_is_clipped_on_request() {
        let table = CoefficientTable::tabulate(
            Observable::Mass,
            vec!["c".into()],
            vec![0.0, 1.0],
            |_| XsecTerms { sm: 1.0, linear: vec![1.0], quadratic: vec![] },
        )
        .unwrap();
        let m = CrossSectionModel::new(Arc::new(table));
        let c = CouplingPoint::new(vec![-3.0]);
        assert_relative_eq!(m.differential(0.5, &c).unwrap(), -2.0);
        assert_eq!(m.differential_clipped(0.5, &c).unwrap(), 0.0);
    }

    #[test]
    fn test_likelihood_ratio_trait_uses_observable() {
        let model = toy_model();
        let ev = KinematicEvent::new(1.2, 0.3);
        let c = CouplingPoint::new(vec![0.5, 0.0]);
        let r = LikelihoodRatio::ratio(&model, &ev, &c).unwrap();
        assert_relative_eq!(r, model.ratio_to_sm(1.2, &c).unwrap());
        assert!(r > 1.0);
    }

    #[test]
    fn test_linear_order_drops_quadratic_terms_everywhere() {
        let full = toy_model();
        let lin = toy_model().with_order(EftOrder::Linear);
        assert_eq!(lin.order(), EftOrder::Linear);
        let c = CouplingPoint::new(vec![1.5, -0.5]);
        let x = 1.4;

        let terms = full.terms_at(x).unwrap();
        let expected = terms.sm + 1.5 * terms.linear[0] - 0.5 * terms.linear[1];
        assert!(lin.terms_at(x).unwrap().quadratic.is_empty());
        assert_relative_eq!(lin.differential(x, &c).unwrap(), expected, epsilon = 1e-12);
        assert_relative_eq!(lin.ratio_to_sm(x, &c).unwrap(), expected / terms.sm, epsilon = 1e-12);
        assert!(full.differential(x, &c).unwrap() > expected);

        let t = full.integrate_terms(0.5, 2.0).unwrap();
        let expected = t.sm + 1.5 * t.linear[0] - 0.5 * t.linear[1];
        assert_relative_eq!(lin.integrated(&c).unwrap(), expected, max_relative = 1e-12);
        let ev = KinematicEvent::new(x, 0.0);
        assert_relative_eq!(
            LikelihoodRatio::ratio(&lin, &ev, &c).unwrap(),
            lin.ratio_to_sm(x, &c).unwrap()
        );
    }

    #[test]
    fn test_joint_model_uses_rapidity_per_event_and_marginal_for_totals() {
        // Interference only at forward rapidity: σ_1(m, y) = m·y on y ∈ [-1, 1].
        let joint = JointCoefficientTable::tabulate(
            vec!["c".into()],
            vec![1.0, 2.0],
            vec![-1.0, 0.0, 1.0],
            |m, y| XsecTerms { sm: 1.0, linear: vec![m * y], quadratic: vec![] },
        )
        .unwrap();
        let model = CrossSectionModel::from_joint(Arc::new(joint)).unwrap();
        assert!(model.joint().is_some());
        assert_eq!(model.observable(), Observable::Mass);
        let c = CouplingPoint::new(vec![0.5]);

        let forward = KinematicEvent::new(1.0, 1.0);
        let backward = KinematicEvent::new(1.0, -1.0);
        assert_relative_eq!(model.event_ratio(&forward, &c).unwrap(), 1.5, epsilon = 1e-12);
        assert_relative_eq!(model.event_ratio(&backward, &c).unwrap(), 0.5, epsilon = 1e-12);
        // The odd interference integrates out of the marginal.
        assert_relative_eq!(model.ratio_to_sm(1.0, &c).unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(model.integrated(&c).unwrap(), 2.0, epsilon = 1e-12);
        assert!(model.event_ratio(&KinematicEvent::new(1.0, 2.0), &c).is_err());
        let upper = model.integrated_cell((1.0, 2.0), (0.0, 1.0), &c).unwrap();
        // ∫∫ (1 + 0.5 m y) over [1, 2] x [0, 1] = 1 + 0.5 * 1.5 * 0.5.
        assert_relative_eq!(upper, 1.375, epsilon = 1e-12);
        assert!(toy_model().integrated_cell((1.0, 2.0), (0.0, 1.0), &c).is_err());
    }

    #[test]
    fn test_from_json_path_detects_layout() {
        let dir = tempfile::tempdir().unwrap();
        let flat = dir.path().join("flat.json");
        std::fs::write(&flat, serde_json::to_string(toy_model().table().as_ref()).unwrap())
            .unwrap();
        let m = CrossSectionModel::from_json_path(&flat).unwrap();
        assert!(m.joint().is_none());
        assert_eq!(m.n_couplings(), 2);

        let joint = dir.path().join("joint.json");
        std::fs::write(
            &joint,
            r#"{"couplings": ["c"], "mass_nodes": [1.0, 2.0], "rapidity_nodes": [0.0, 1.0],
                "sm": [[1.0, 1.0], [1.0, 1.0]], "linear": [[[0.0, 1.0], [0.0, 1.0]]]}"#,
        )
        .unwrap();
        let m = CrossSectionModel::from_json_path(&joint).unwrap();
        assert!(m.joint().is_some());
        assert_eq!(m.range(), (1.0, 2.0));
        assert_relative_eq!(m.integrated(&CouplingPoint::zero(1)).unwrap(), 1.0);
    }
}
