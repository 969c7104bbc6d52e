//! Expected event yields per bin and per event.
//!
//! Counts are `L · ε · σ`, with negative cross-sections (interference at extreme couplings)
//! clipped to zero. Realisations are either the expectation itself (Asimov) or one Poisson
//! draw per bin from a seeded `StdRng`.

use crate::dataset::{Bin, BinnedDataset, UnbinnedDataset};
use eb_core::{CouplingPoint, Error, KinematicEvent, Observable, Result, RunMetadata};
use eb_model::{Binning, CrossSectionModel};
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};

/// How expected counts are turned into a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum YieldMode {
    /// The expectation itself (median-expected dataset).
    Asimov,
    /// One Poisson realisation per bin.
    MonteCarlo {
        /// RNG seed.
        seed: u64,
    },
}

/// Binned expectation plus the number of bins clipped at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct YieldVector {
    /// Expected count per bin (all `>= 0`).
    pub counts: Vec<f64>,
    /// Bins whose signed cross-section was negative.
    pub n_clipped: usize,
}

impl YieldVector {
    /// Total expected count.
    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }
}

/// Unbinned total expectation, clipped at zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TotalYield {
    /// Expected count (`>= 0`).
    pub value: f64,
    /// Whether the signed total cross-section was negative.
    pub clipped: bool,
}

/// Weighted pseudo-events of an unbinned Asimov dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsimovCells {
    /// One event per cell, at the cell midpoint.
    pub events: Vec<KinematicEvent>,
    /// Expected count per cell (all `>= 0`).
    pub weights: Vec<f64>,
    /// Cells whose signed cross-section was negative.
    pub n_clipped: usize,
}

impl AsimovCells {
    fn push(&mut self, event: KinematicEvent, sigma: f64, scale: f64) {
        if sigma < 0.0 {
            self.n_clipped += 1;
        }
        self.events.push(event);
        self.weights.push(scale * sigma.max(0.0));
    }
}

/// Maps cross-sections to expected counts for a given luminosity and efficiency.
#[derive(Debug, Clone)]
pub struct YieldEstimator {
    model: CrossSectionModel,
    luminosity: f64,
    efficiency: f64,
}

impl YieldEstimator {
    /// Estimator with unit efficiency.
    pub fn new(model: CrossSectionModel, luminosity: f64) -> Result<Self> {
        if !(luminosity.is_finite() && luminosity > 0.0) {
            return Err(Error::Validation(format!("luminosity must be > 0, got {luminosity}")));
        }
        Ok(Self { model, luminosity, efficiency: 1.0 })
    }

    /// Set the selection efficiency (`0 < ε <= 1`).
    pub fn with_efficiency(mut self, efficiency: f64) -> Result<Self> {
        if !(efficiency > 0.0 && efficiency <= 1.0) {
            return Err(Error::Validation(format!(
                "efficiency must be in (0, 1], got {efficiency}"
            )));
        }
        self.efficiency = efficiency;
        Ok(self)
    }

    /// Underlying cross-section model.
    pub fn model(&self) -> &CrossSectionModel {
        &self.model
    }

    /// Integrated luminosity.
    pub fn luminosity(&self) -> f64 {
        self.luminosity
    }

    /// Selection efficiency.
    pub fn efficiency(&self) -> f64 {
        self.efficiency
    }

    /// Count per unit cross-section, `L · ε`.
    pub fn scale(&self) -> f64 {
        self.luminosity * self.efficiency
    }

    /// Expected count in one bin, clipped at zero.
    pub fn expected_count(&self, bin: &Bin, point: &CouplingPoint) -> Result<f64> {
        Ok(self.scale() * bin.sigma(point)?.max(0.0))
    }

    /// Expected counts for every bin of `data` at `point`.
    pub fn expected_counts(
        &self,
        data: &BinnedDataset,
        point: &CouplingPoint,
    ) -> Result<YieldVector> {
        let mut counts = Vec::with_capacity(data.n_bins());
        let mut n_clipped = 0usize;
        for bin in data.bins() {
            let sigma = bin.sigma(point)?;
            if sigma < 0.0 {
                n_clipped += 1;
            }
            counts.push(self.scale() * sigma.max(0.0));
        }
        if n_clipped > 0 {
            log::warn!(
                "{n_clipped}/{} bins have negative cross-section at {point}; clipped to zero",
                data.n_bins()
            );
        }
        Ok(YieldVector { counts, n_clipped })
    }

    /// Unbinned total expectation over the full tabulated range, clipped at zero.
    pub fn expected_total(&self, point: &CouplingPoint) -> Result<f64> {
        Ok(self.total_yield(point)?.value)
    }

    /// Unbinned total expectation with its clipping flag.
    pub fn total_yield(&self, point: &CouplingPoint) -> Result<TotalYield> {
        let sigma = self.model.integrated(point)?;
        let clipped = sigma < 0.0;
        if clipped {
            log::warn!("total cross-section {sigma} is negative at {point}; clipped to zero");
        }
        Ok(TotalYield { value: self.scale() * sigma.max(0.0), clipped })
    }

    /// Expected event density `L · ε · dσ` at the event, clipped at zero.
    ///
    /// Joint models return the double-differential density in mass and rapidity.
    pub fn event_density(&self, event: &KinematicEvent, point: &CouplingPoint) -> Result<f64> {
        Ok(self.scale() * self.model.event_differential(event, point)?.max(0.0))
    }

    /// Asimov dataset over `binning` at `point`.
    pub fn asimov_binned(
        &self,
        binning: &Binning,
        point: &CouplingPoint,
        meta: RunMetadata,
    ) -> Result<BinnedDataset> {
        self.realize_binned(binning, point, YieldMode::Asimov, meta)
    }

    /// Poisson-fluctuated dataset over `binning` at `point`.
    pub fn pseudo_binned(
        &self,
        binning: &Binning,
        point: &CouplingPoint,
        seed: u64,
        meta: RunMetadata,
    ) -> Result<BinnedDataset> {
        self.realize_binned(binning, point, YieldMode::MonteCarlo { seed }, meta)
    }

    fn realize_binned(
        &self,
        binning: &Binning,
        point: &CouplingPoint,
        mode: YieldMode,
        meta: RunMetadata,
    ) -> Result<BinnedDataset> {
        let zeros = vec![0.0; binning.n_bins()];
        let empty = BinnedDataset::from_model(&self.model, binning, zeros, meta)?;
        let expected = self.expected_counts(&empty, point)?;
        empty.with_observed(&realize(&expected.counts, mode))
    }

    /// Asimov representation of the unbinned sample: one weighted pseudo-event per cell of
    /// width `cell_width`, placed at the cell midpoint with weight equal to the expected count
    /// in the cell.
    pub fn asimov_unbinned(
        &self,
        cell_width: f64,
        point: &CouplingPoint,
        meta: RunMetadata,
    ) -> Result<UnbinnedDataset> {
        let cells = self.asimov_cells(cell_width, point)?;
        UnbinnedDataset::new(cells.events, Some(cells.weights), meta)
    }

    /// Midpoints and expected counts of the Asimov cells.
    ///
    /// Cells span `cell_width` in the model observable. Joint models further split every cell
    /// along the rapidity nodes, so the per-event ratio sees the rapidity dependence.
    pub fn asimov_cells(&self, cell_width: f64, point: &CouplingPoint) -> Result<AsimovCells> {
        let (lo, hi) = self.model.range();
        let cells = Binning::uniform(lo, hi, cell_width)?;
        let obs = self.model.observable();
        let mut out = AsimovCells::default();
        for (a, b) in cells.intervals() {
            let mid = 0.5 * (a + b);
            match self.model.joint() {
                Some(joint) => {
                    for y in joint.rapidity_nodes().windows(2) {
                        let sigma = self.model.integrated_cell((a, b), (y[0], y[1]), point)?;
                        let event = KinematicEvent::new(mid, 0.5 * (y[0] + y[1]));
                        out.push(event, sigma, self.scale());
                    }
                }
                None => {
                    let sigma = self.model.integrated_over(a, b, point)?;
                    out.push(event_at(obs, mid), sigma, self.scale());
                }
            }
        }
        if out.n_clipped > 0 {
            log::warn!(
                "{}/{} Asimov cells have negative cross-section at {point}; clipped to zero",
                out.n_clipped,
                out.events.len()
            );
        }
        Ok(out)
    }

    /// SM-like observed sample: a Poisson total `N ~ Pois(L·ε·σ_SM)` of events drawn without
    /// replacement from `events`, keeping their original order.
    pub fn observed_sm_sample(
        &self,
        events: &[KinematicEvent],
        seed: u64,
    ) -> Result<Vec<KinematicEvent>> {
        let null = CouplingPoint::zero(self.model.n_couplings());
        let expected = self.expected_total(&null)?;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let n = poisson_draw(expected, &mut rng) as usize;
        if n > events.len() {
            return Err(Error::Validation(format!(
                "observed sample needs {n} events but only {} are available",
                events.len()
            )));
        }
        let mut idx = rand::seq::index::sample(&mut rng, events.len(), n).into_vec();
        idx.sort_unstable();
        Ok(idx.into_iter().map(|i| events[i]).collect())
    }

    /// Compare the summed binned expectation with the unbinned total over the same range.
    ///
    /// Returns the relative difference, or [`Error::DataInconsistency`] beyond `tolerance`.
    pub fn check_consistency(
        &self,
        data: &BinnedDataset,
        point: &CouplingPoint,
        tolerance: f64,
    ) -> Result<f64> {
        let binned = self.expected_counts(data, point)?.total();
        let (lo, hi) = data.range();
        let unbinned = self.scale() * self.model.integrated_over(lo, hi, point)?.max(0.0);
        let rel_diff = (binned - unbinned).abs() / unbinned.abs().max(f64::MIN_POSITIVE);
        if rel_diff > tolerance {
            return Err(Error::DataInconsistency { binned, unbinned, rel_diff });
        }
        Ok(rel_diff)
    }
}

/// Turn expected counts into a dataset: the expectation itself, or one Poisson draw per bin.
///
/// Non-finite or non-positive expectations realise as exactly zero.
pub fn realize(expected: &[f64], mode: YieldMode) -> Vec<f64> {
    match mode {
        YieldMode::Asimov => expected.to_vec(),
        YieldMode::MonteCarlo { seed } => poisson_from_expected(expected, seed),
    }
}

/// One Poisson realisation of `expected`, deterministic in `seed`.
pub fn poisson_from_expected(expected: &[f64], seed: u64) -> Vec<f64> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    expected.iter().map(|&lam| poisson_draw(lam, &mut rng)).collect()
}

pub(crate) fn poisson_draw<R: rand::Rng + ?Sized>(lam: f64, rng: &mut R) -> f64 {
    if !lam.is_finite() || lam <= 0.0 {
        // Poisson(0) is deterministically 0.
        return 0.0;
    }
    match Poisson::new(lam) {
        Ok(p) => p.sample(rng),
        Err(_) => 0.0,
    }
}

fn event_at(obs: Observable, x: f64) -> KinematicEvent {
    match obs {
        Observable::Mass => KinematicEvent::new(x, 0.0),
        Observable::Rapidity => KinematicEvent::new(0.0, x),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use eb_model::{CoefficientTable, JointCoefficientTable, XsecTerms};
    use std::sync::Arc;

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

    fn estimator() -> YieldEstimator {
        YieldEstimator::new(toy_model(), 20.0).unwrap().with_efficiency(0.5).unwrap()
    }

    #[test]
    fn test_binned_sum_matches_unbinned_total() {
        let est = estimator();
        let binning = Binning::uniform(0.5, 2.0, 0.1).unwrap();
        for c in [vec![0.0, 0.0], vec![0.4, -0.7], vec![2.0, 1.0]] {
            let c = CouplingPoint::new(c);
            let data = est.asimov_binned(&binning, &c, RunMetadata::with_luminosity(20.0)).unwrap();
            let total: f64 = data.observed().iter().sum();
            assert_relative_eq!(total, est.expected_total(&c).unwrap(), max_relative = 1e-6);
            assert!(est.check_consistency(&data, &c, 1e-6).is_ok());
        }
    }

    #[test]
    fn test_expected_count_scales_with_lumi_and_efficiency() {
        let est = estimator();
        let sm = CouplingPoint::zero(2);
        let sigma = est.model().integrated(&sm).unwrap();
        assert_relative_eq!(est.expected_total(&sm).unwrap(), 10.0 * sigma, max_relative = 1e-12);
        let ev = KinematicEvent::new(1.0, 0.0);
        let density = est.event_density(&ev, &sm).unwrap();
        assert_relative_eq!(density, 10.0 * 10.0, max_relative = 1e-12);
    }

    #[test]
    fn test_negative_yields_are_clipped_and_counted() {
        let table = CoefficientTable::tabulate(
            Observable::Mass,
            vec!["c".into()],
            vec![0.0, 1.0, 2.0],
            |m| XsecTerms { sm: 1.0, linear: vec![m], quadratic: vec![] },
        )
        .unwrap();
        let est = YieldEstimator::new(CrossSectionModel::new(Arc::new(table)), 1.0).unwrap();
        let binning = Binning::from_edges(vec![0.0, 0.5, 1.5, 2.0]).unwrap();
        let data =
            est.asimov_binned(&binning, &CouplingPoint::zero(1), RunMetadata::default()).unwrap();
        // sigma_bin(c) = w + c * ∫m; with c = -2 the upper two bins go negative.
        let y = est.expected_counts(&data, &CouplingPoint::new(vec![-2.0])).unwrap();
        assert_eq!(y.n_clipped, 2);
        assert_eq!(y.counts[1], 0.0);
        assert_eq!(y.counts[2], 0.0);
        assert_relative_eq!(y.counts[0], 0.5 - 2.0 * 0.125, epsilon = 1e-12);
    }

    #[test]
    fn test_poisson_realisation_reproducible() {
        let lam = vec![3.0, 0.0, 12.5, -1.0, f64::NAN];
        let a = realize(&lam, YieldMode::MonteCarlo { seed: 7 });
        let b = realize(&lam, YieldMode::MonteCarlo { seed: 7 });
        assert_eq!(a, b);
        assert_eq!(a[1], 0.0);
        assert_eq!(a[3], 0.0);
        assert_eq!(a[4], 0.0);
        assert_eq!(realize(&lam[..3], YieldMode::Asimov), vec![3.0, 0.0, 12.5]);
    }

    #[test]
    fn test_asimov_unbinned_weights_sum_to_total() {
        let est = estimator();
        let c = CouplingPoint::new(vec![0.3, 0.3]);
        let d = est.asimov_unbinned(0.05, &c, RunMetadata::default()).unwrap();
        assert_eq!(d.n_events(), 30);
        assert_relative_eq!(d.total_weight(), est.expected_total(&c).unwrap(), max_relative = 1e-9);
        assert_relative_eq!(d.events()[0].mass, 0.525, epsilon = 1e-12);
    }

    #[test]
    fn test_negative_totals_and_cells_are_counted() {
        let table = CoefficientTable::tabulate(
            Observable::Mass,
            vec!["c".into()],
            vec![0.0, 1.0, 2.0],
            |m| XsecTerms { sm: 1.0, linear: vec![m], quadratic: vec![] },
        )
        .unwrap();
        let est = YieldEstimator::new(CrossSectionModel::new(Arc::new(table)), 1.0).unwrap();
        // σ(c) = 2 + 2c over [0, 2]; per cell [a, b]: (b - a)(1 + c (a + b) / 2).
        let total = est.total_yield(&CouplingPoint::new(vec![-1.5])).unwrap();
        assert!(total.clipped);
        assert_eq!(total.value, 0.0);
        assert!(!est.total_yield(&CouplingPoint::new(vec![-0.5])).unwrap().clipped);

        let cells = est.asimov_cells(0.5, &CouplingPoint::new(vec![-1.0])).unwrap();
        assert_eq!(cells.events.len(), 4);
        // Midpoints 0.25, 0.75, 1.25, 1.75: the last two cells go negative.
        assert_eq!(cells.n_clipped, 2);
        assert_eq!(&cells.weights[2..], &[0.0, 0.0]);
        assert_relative_eq!(cells.weights[0], 0.375, epsilon = 1e-12);
    }

    #[test]
    fn test_joint_asimov_cells_split_rapidity() {
        let joint = JointCoefficientTable::tabulate(
            vec!["c".into()],
            vec![0.5, 2.0],
            vec![-1.0, 0.0, 1.0],
            |_, y| XsecTerms { sm: 1.0, linear: vec![y], quadratic: vec![] },
        )
        .unwrap();
        let model = CrossSectionModel::from_joint(Arc::new(joint)).unwrap();
        let est = YieldEstimator::new(model, 2.0).unwrap();
        let c = CouplingPoint::new(vec![0.5]);
        let cells = est.asimov_cells(0.5, &c).unwrap();
        assert_eq!(cells.events.len(), 3 * 2);
        assert_eq!(cells.events[0], KinematicEvent::new(0.75, -0.5));
        assert_eq!(cells.events[1], KinematicEvent::new(0.75, 0.5));
        // 2 · 0.5 · (1 ± 0.5 · 0.5)
        assert_relative_eq!(cells.weights[0], 0.75, epsilon = 1e-12);
        assert_relative_eq!(cells.weights[1], 1.25, epsilon = 1e-12);
        let total: f64 = cells.weights.iter().sum();
        assert_relative_eq!(total, est.expected_total(&c).unwrap(), max_relative = 1e-12);
        let density = est.event_density(&KinematicEvent::new(1.0, 1.0), &c).unwrap();
        assert_relative_eq!(density, 2.0 * 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_observed_sm_sample() {
        let est = YieldEstimator::new(toy_model(), 1.0).unwrap();
        let pool: Vec<KinematicEvent> =
            (0..200).map(|i| KinematicEvent::new(0.5 + 0.0075 * i as f64, 0.0)).collect();
        let a = est.observed_sm_sample(&pool, 3).unwrap();
        let b = est.observed_sm_sample(&pool, 3).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty() && a.len() < pool.len());
        assert!(a.windows(2).all(|w| w[0].mass < w[1].mass));
        assert!(est.observed_sm_sample(&pool[..2], 3).is_err());
    }

    #[test]
    fn test_rejects_bad_luminosity_and_efficiency() {
        assert!(YieldEstimator::new(toy_model(), 0.0).is_err());
        assert!(YieldEstimator::new(toy_model(), 1.0).unwrap().with_efficiency(1.5).is_err());
    }
}
