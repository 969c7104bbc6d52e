//! Adapters turning external classifier scores into per-event likelihood ratios.
//!
//! A trained model is only ever seen through [`Classifier::score`]. The adapters here encode
//! how that score relates to `r(x, c) = p_c(x) / p_SM(x)`:
//!
//! - [`FixedPointRatio`]: one classifier trained at a single coupling point, with a
//!   [`ScoreLink`] describing its output.
//! - [`QuadraticRatioModel`]: per-term coefficient networks,
//!   `r(x, c) = 1 + Σ c_i n_i(x) + Σ_{i<=j} c_i c_j n_ij(x)`.
//! - [`ReplicaEnsemble`]: median over Monte-Carlo replicas in `ln r`.
//! - [`ScoreRatio`]: scores precomputed per event and stored on [`KinematicEvent::score`].
//!
//! [`LearnedRatioSpec`] describes an ensemble of [`LinearScore`] classifiers in JSON and
//! assembles the adapters above from it.

use eb_core::{Classifier, CouplingPoint, Error, KinematicEvent, LikelihoodRatio, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// How a classifier score maps onto the likelihood ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreLink {
    /// The score is `r` itself.
    Ratio,
    /// The score is `ln r`.
    LogRatio,
    /// The score is the decision function `f = 1 / (1 + r)`, so `r = (1 - f) / f`.
    Decision,
}

impl ScoreLink {
    /// Convert a score to a likelihood ratio.
    pub fn to_ratio(self, score: f64) -> Result<f64> {
        if !score.is_finite() {
            return Err(Error::Computation(format!("non-finite classifier score {score}")));
        }
        match self {
            ScoreLink::Ratio => Ok(score),
            ScoreLink::LogRatio => Ok(score.exp()),
            ScoreLink::Decision => {
                if !(score > 0.0 && score <= 1.0) {
                    return Err(Error::Computation(format!(
                        "decision score must be in (0, 1], got {score}"
                    )));
                }
                Ok((1.0 - score) / score)
            }
        }
    }
}

/// Feature standardisation `(x - mean) / std` applied before scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ScalingRepr")]
pub struct FeatureScaling {
    mean: Vec<f64>,
    std: Vec<f64>,
}

#[derive(Deserialize)]
struct ScalingRepr {
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl TryFrom<ScalingRepr> for FeatureScaling {
    type Error = Error;

    fn try_from(r: ScalingRepr) -> Result<Self> {
        Self::new(r.mean, r.std)
    }
}

impl FeatureScaling {
    /// Build from per-feature mean and standard deviation.
    pub fn new(mean: Vec<f64>, std: Vec<f64>) -> Result<Self> {
        if mean.len() != std.len() || mean.is_empty() {
            return Err(Error::Validation(format!(
                "scaling mean/std length mismatch: {} vs {}",
                mean.len(),
                std.len()
            )));
        }
        if std.iter().any(|s| !(s.is_finite() && *s > 0.0)) || mean.iter().any(|m| !m.is_finite())
        {
            return Err(Error::Validation("scaling requires finite mean and std > 0".into()));
        }
        Ok(Self { mean, std })
    }

    /// Parse the two-row text format: first row means, second row standard deviations.
    pub fn parse(text: &str) -> Result<Self> {
        let mut rows = text.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#'));
        let mut parse_row = |what: &str| -> Result<Vec<f64>> {
            let row = rows
                .next()
                .ok_or_else(|| Error::Validation(format!("scaling file missing {what} row")))?;
            row.split_whitespace()
                .map(|v| {
                    v.parse::<f64>()
                        .map_err(|e| Error::Validation(format!("bad {what} value '{v}': {e}")))
                })
                .collect()
        };
        let mean = parse_row("mean")?;
        let std = parse_row("std")?;
        Self::new(mean, std)
    }

    /// Standardise a feature vector.
    pub fn apply(&self, features: &[f64]) -> Result<Vec<f64>> {
        if features.len() != self.mean.len() {
            return Err(Error::Validation(format!(
                "expected {} features, got {}",
                self.mean.len(),
                features.len()
            )));
        }
        Ok(features
            .iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(x, (m, s))| (x - m) / s)
            .collect())
    }
}

fn score_event(
    classifier: &dyn Classifier,
    scaling: Option<&FeatureScaling>,
    event: &KinematicEvent,
) -> Result<f64> {
    let raw = event.features();
    match scaling {
        Some(s) => classifier.score(&s.apply(&raw)?),
        None => classifier.score(&raw),
    }
}

/// Classifier trained at a single coupling point.
pub struct FixedPointRatio {
    classifier: Arc<dyn Classifier>,
    link: ScoreLink,
    scaling: Option<FeatureScaling>,
    point: CouplingPoint,
}

impl FixedPointRatio {
    /// Wrap a classifier trained to separate `point` from the SM.
    pub fn new(classifier: Arc<dyn Classifier>, link: ScoreLink, point: CouplingPoint) -> Self {
        Self { classifier, link, scaling: None, point }
    }

    /// Standardise features before scoring.
    pub fn with_scaling(mut self, scaling: FeatureScaling) -> Self {
        self.scaling = Some(scaling);
        self
    }

    /// The coupling point this classifier is valid for.
    pub fn point(&self) -> &CouplingPoint {
        &self.point
    }
}

/// `Ok(true)` at the SM point, `Ok(false)` at `trained`, an error anywhere else.
fn at_sm_or_trained(trained: &CouplingPoint, point: &CouplingPoint) -> Result<bool> {
    if point.is_null() {
        return Ok(true);
    }
    if point != trained {
        return Err(Error::Validation(format!(
            "classifier trained at {trained} cannot evaluate {point}"
        )));
    }
    Ok(false)
}

impl LikelihoodRatio for FixedPointRatio {
    fn ratio(&self, event: &KinematicEvent, point: &CouplingPoint) -> Result<f64> {
        if at_sm_or_trained(&self.point, point)? {
            return Ok(1.0);
        }
        self.link.to_ratio(score_event(self.classifier.as_ref(), self.scaling.as_ref(), event)?)
    }
}

/// Ratio from scores already stored on the events, for a classifier trained at one point.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRatio {
    link: ScoreLink,
    point: CouplingPoint,
}

impl ScoreRatio {
    /// Scores on the events separate `point` from the SM and follow `link`.
    pub fn new(link: ScoreLink, point: CouplingPoint) -> Self {
        Self { link, point }
    }

    /// The coupling point the scores refer to.
    pub fn point(&self) -> &CouplingPoint {
        &self.point
    }
}

impl LikelihoodRatio for ScoreRatio {
    fn ratio(&self, event: &KinematicEvent, point: &CouplingPoint) -> Result<f64> {
        if at_sm_or_trained(&self.point, point)? {
            return Ok(1.0);
        }
        let score = event.score.ok_or_else(|| {
            Error::Validation(format!("event at mass {} has no classifier score", event.mass))
        })?;
        self.link.to_ratio(score)
    }
}

/// Quadratic ratio model assembled from per-term coefficient classifiers.
pub struct QuadraticRatioModel {
    linear: Vec<Arc<dyn Classifier>>,
    quadratic: Vec<((usize, usize), Arc<dyn Classifier>)>,
    scaling: Option<FeatureScaling>,
}

impl QuadraticRatioModel {
    /// Linear-only model: one coefficient classifier `n_i(x)` per coupling.
    pub fn linear(linear: Vec<Arc<dyn Classifier>>) -> Self {
        Self { linear, quadratic: Vec::new(), scaling: None }
    }

    /// Add a quadratic coefficient classifier `n_ij(x)` (`i <= j`).
    pub fn with_quadratic(mut self, i: usize, j: usize, c: Arc<dyn Classifier>) -> Result<Self> {
        if i > j || j >= self.linear.len() {
            return Err(Error::Validation(format!(
                "invalid quadratic pair ({i}, {j}) for {} couplings",
                self.linear.len()
            )));
        }
        self.quadratic.push(((i, j), c));
        Ok(self)
    }

    /// Standardise features before scoring.
    pub fn with_scaling(mut self, scaling: FeatureScaling) -> Self {
        self.scaling = Some(scaling);
        self
    }

    /// Number of couplings.
    pub fn n_couplings(&self) -> usize {
        self.linear.len()
    }
}

impl LikelihoodRatio for QuadraticRatioModel {
    fn ratio(&self, event: &KinematicEvent, point: &CouplingPoint) -> Result<f64> {
        if point.dim() != self.linear.len() {
            return Err(Error::Validation(format!(
                "coupling point has {} coordinates, ratio model has {} couplings",
                point.dim(),
                self.linear.len()
            )));
        }
        let c = point.coords();
        let mut r = 1.0;
        for (ci, n_i) in c.iter().zip(&self.linear) {
            if *ci != 0.0 {
                r += ci * score_event(n_i.as_ref(), self.scaling.as_ref(), event)?;
            }
        }
        for ((i, j), n_ij) in &self.quadratic {
            let w = c[*i] * c[*j];
            if w != 0.0 {
                r += w * score_event(n_ij.as_ref(), self.scaling.as_ref(), event)?;
            }
        }
        Ok(r)
    }
}

/// Median-of-replicas likelihood ratio.
///
/// The median is taken in `ln r`; replicas returning a non-positive ratio are ignored for
/// that event. If no replica yields a positive ratio the result is `0`.
pub struct ReplicaEnsemble {
    replicas: Vec<Arc<dyn LikelihoodRatio>>,
}

impl ReplicaEnsemble {
    /// Ensemble over Monte-Carlo replicas (at least one).
    pub fn new(replicas: Vec<Arc<dyn LikelihoodRatio>>) -> Result<Self> {
        if replicas.is_empty() {
            return Err(Error::Validation("replica ensemble requires >= 1 replica".into()));
        }
        Ok(Self { replicas })
    }

    /// Number of replicas.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Always `false`: construction requires at least one replica.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

fn median_in_place(v: &mut [f64]) -> f64 {
    v.sort_by(|a, b| a.total_cmp(b));
    let n = v.len();
    if n % 2 == 1 {
        v[n / 2]
    } else {
        0.5 * (v[n / 2 - 1] + v[n / 2])
    }
}

impl LikelihoodRatio for ReplicaEnsemble {
    fn ratio(&self, event: &KinematicEvent, point: &CouplingPoint) -> Result<f64> {
        let mut logs = Vec::with_capacity(self.replicas.len());
        for rep in &self.replicas {
            let r = rep.ratio(event, point)?;
            if r > 0.0 && r.is_finite() {
                logs.push(r.ln());
            }
        }
        if logs.is_empty() {
            return Ok(0.0);
        }
        Ok(median_in_place(&mut logs).exp())
    }
}

/// Affine score `w · x + b` over the (optionally standardised) event features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearScore {
    /// One weight per feature (`[mass, rapidity]`).
    pub weights: Vec<f64>,
    /// Constant term.
    #[serde(default)]
    pub bias: f64,
}

impl Classifier for LinearScore {
    fn score(&self, features: &[f64]) -> Result<f64> {
        if features.len() != self.weights.len() {
            return Err(Error::Validation(format!(
                "linear score has {} weights, got {} features",
                self.weights.len(),
                features.len()
            )));
        }
        Ok(self.bias + self.weights.iter().zip(features).map(|(w, x)| w * x).sum::<f64>())
    }
}

/// Quadratic coefficient classifier `n_ij` in a [`ReplicaSpec::Quadratic`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuadraticScore {
    /// First coupling index.
    pub i: usize,
    /// Second coupling index (`>= i`).
    pub j: usize,
    /// The classifier.
    #[serde(flatten)]
    pub score: LinearScore,
}

/// One Monte-Carlo replica of a learned ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaSpec {
    /// A single classifier trained at `point`.
    FixedPoint {
        /// Training point.
        point: CouplingPoint,
        /// Meaning of the score.
        link: ScoreLink,
        /// The classifier.
        classifier: LinearScore,
    },
    /// Per-term coefficient classifiers.
    Quadratic {
        /// `n_i`, one per coupling.
        linear: Vec<LinearScore>,
        /// `n_ij` terms.
        #[serde(default)]
        quadratic: Vec<QuadraticScore>,
    },
}

/// JSON description of a learned likelihood ratio: optional scaling plus replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LearnedRatioSpec {
    /// Standardisation shared by every replica.
    #[serde(default)]
    pub scaling: Option<FeatureScaling>,
    /// Replicas; more than one is combined with [`ReplicaEnsemble`].
    pub replicas: Vec<ReplicaSpec>,
}

impl LearnedRatioSpec {
    /// Read a ratio description from a JSON file.
    pub fn from_json_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let spec: Self = serde_json::from_str(&text)?;
        log::debug!("loaded {} ratio replicas from {}", spec.replicas.len(), path.display());
        Ok(spec)
    }

    /// Replace the scaling (e.g. with one parsed by [`FeatureScaling::parse`]).
    pub fn with_scaling(mut self, scaling: FeatureScaling) -> Self {
        self.scaling = Some(scaling);
        self
    }

    /// Assemble the ratio for a model with `n_couplings` couplings.
    pub fn build(&self, n_couplings: usize) -> Result<Arc<dyn LikelihoodRatio>> {
        let mut replicas: Vec<Arc<dyn LikelihoodRatio>> = Vec::with_capacity(self.replicas.len());
        for rep in &self.replicas {
            replicas.push(self.build_replica(rep, n_couplings)?);
        }
        match replicas.len() {
            1 => Ok(replicas.remove(0)),
            _ => Ok(Arc::new(ReplicaEnsemble::new(replicas)?)),
        }
    }

    fn build_replica(
        &self,
        rep: &ReplicaSpec,
        n_couplings: usize,
    ) -> Result<Arc<dyn LikelihoodRatio>> {
        match rep {
            ReplicaSpec::FixedPoint { point, link, classifier } => {
                if point.dim() != n_couplings {
                    return Err(Error::Validation(format!(
                        "replica trained at {point}, model has {n_couplings} couplings"
                    )));
                }
                let clf = Arc::new(classifier.clone());
                let mut r = FixedPointRatio::new(clf, *link, point.clone());
                if let Some(s) = &self.scaling {
                    r = r.with_scaling(s.clone());
                }
                Ok(Arc::new(r))
            }
            ReplicaSpec::Quadratic { linear, quadratic } => {
                if linear.len() != n_couplings {
                    return Err(Error::Validation(format!(
                        "replica has {} linear classifiers, model has {n_couplings} couplings",
                        linear.len()
                    )));
                }
                let linear = linear
                    .iter()
                    .map(|c| Arc::new(c.clone()) as Arc<dyn Classifier>)
                    .collect();
                let mut model = QuadraticRatioModel::linear(linear);
                for q in quadratic {
                    model = model.with_quadratic(q.i, q.j, Arc::new(q.score.clone()))?;
                }
                if let Some(s) = &self.scaling {
                    model = model.with_scaling(s.clone());
                }
                Ok(Arc::new(model))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Affine {
        slope: f64,
        offset: f64,
    }

    impl Classifier for Affine {
        fn score(&self, features: &[f64]) -> Result<f64> {
            Ok(self.slope * features[0] + self.offset)
        }
    }

    struct ConstRatio(f64);

    impl LikelihoodRatio for ConstRatio {
        fn ratio(&self, _event: &KinematicEvent, _point: &CouplingPoint) -> Result<f64> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_score_links() {
        assert_relative_eq!(ScoreLink::Ratio.to_ratio(2.0).unwrap(), 2.0);
        assert_relative_eq!(ScoreLink::LogRatio.to_ratio(0.0).unwrap(), 1.0);
        assert_relative_eq!(ScoreLink::Decision.to_ratio(0.5).unwrap(), 1.0);
        assert_relative_eq!(ScoreLink::Decision.to_ratio(0.25).unwrap(), 3.0);
        assert!(ScoreLink::Decision.to_ratio(0.0).is_err());
        assert!(ScoreLink::Ratio.to_ratio(f64::NAN).is_err());
    }

    #[test]
    fn test_scaling_parse_and_apply() {
        let s = FeatureScaling::parse("1.0 0.0\n0.5 2.0\n").unwrap();
        let x = s.apply(&[2.0, 4.0]).unwrap();
        assert_relative_eq!(x[0], 2.0);
        assert_relative_eq!(x[1], 2.0);
        assert!(FeatureScaling::parse("1.0\n0.0\n").is_err());
        assert!(s.apply(&[1.0]).is_err());
    }

    #[test]
    fn test_quadratic_ratio_model_structure() {
        let n1: Arc<dyn Classifier> = Arc::new(Affine { slope: 1.0, offset: 0.0 });
        let n2: Arc<dyn Classifier> = Arc::new(Affine { slope: 0.0, offset: 0.5 });
        let n11: Arc<dyn Classifier> = Arc::new(Affine { slope: 0.0, offset: 0.1 });
        let model = QuadraticRatioModel::linear(vec![n1, n2]).with_quadratic(0, 0, n11).unwrap();
        let ev = KinematicEvent::new(2.0, 0.0);
        let c = CouplingPoint::new(vec![1.5, -1.0]);
        // 1 + 1.5*2 - 1*0.5 + 1.5^2*0.1
        let expected = 1.0 + 3.0 - 0.5 + 0.225;
        assert_relative_eq!(model.ratio(&ev, &c).unwrap(), expected, epsilon = 1e-12);
        assert_relative_eq!(model.ratio(&ev, &CouplingPoint::zero(2)).unwrap(), 1.0);
        assert!(model.ratio(&ev, &CouplingPoint::zero(3)).is_err());
    }

    #[test]
    fn test_fixed_point_ratio_only_valid_at_its_point() {
        let clf: Arc<dyn Classifier> = Arc::new(Affine { slope: 0.0, offset: 0.25 });
        let p = CouplingPoint::new(vec![1.0]);
        let fr = FixedPointRatio::new(clf, ScoreLink::Decision, p.clone());
        let ev = KinematicEvent::new(1.0, 0.0);
        assert_relative_eq!(fr.ratio(&ev, &p).unwrap(), 3.0);
        assert_relative_eq!(fr.ratio(&ev, &CouplingPoint::zero(1)).unwrap(), 1.0);
        assert!(fr.ratio(&ev, &CouplingPoint::new(vec![2.0])).is_err());
    }

    #[test]
    fn test_replica_median_in_log_space() {
        let reps: Vec<Arc<dyn LikelihoodRatio>> = vec![
            Arc::new(ConstRatio(1.0)),
            Arc::new(ConstRatio(4.0)),
            Arc::new(ConstRatio(100.0)),
            Arc::new(ConstRatio(-1.0)),
        ];
        let ens = ReplicaEnsemble::new(reps).unwrap();
        let r = ens.ratio(&KinematicEvent::new(1.0, 0.0), &CouplingPoint::new(vec![1.0])).unwrap();
        assert_relative_eq!(r, 4.0, epsilon = 1e-12);
        assert!(ReplicaEnsemble::new(vec![]).is_err());
    }

    #[test]
    fn test_score_ratio_reads_event_scores() {
        let p = CouplingPoint::new(vec![0.5]);
        let sr = ScoreRatio::new(ScoreLink::Decision, p.clone());
        let low = KinematicEvent::new(1.0, 0.0).with_score(0.01);
        let high = KinematicEvent::new(1.0, 0.0).with_score(0.99);
        assert_relative_eq!(sr.ratio(&low, &p).unwrap(), 99.0, epsilon = 1e-9);
        assert_relative_eq!(sr.ratio(&high, &p).unwrap(), 1.0 / 99.0, epsilon = 1e-9);
        assert_relative_eq!(sr.ratio(&low, &CouplingPoint::zero(1)).unwrap(), 1.0);
        assert!(sr.ratio(&KinematicEvent::new(1.0, 0.0), &p).is_err());
        assert!(sr.ratio(&low, &CouplingPoint::new(vec![1.0])).is_err());
    }

    #[test]
    fn test_learned_spec_builds_replica_median() {
        let json = r#"{
            "scaling": {"mean": [1.0, 0.0], "std": [0.5, 1.0]},
            "replicas": [
                {"quadratic": {
                    "linear": [{"weights": [1.0, 0.0], "bias": 0.0}],
                    "quadratic": [{"i": 0, "j": 0, "weights": [0.0, 0.0], "bias": 0.3}]
                }},
                {"quadratic": {"linear": [{"weights": [2.0, 0.0]}]}},
                {"quadratic": {"linear": [{"weights": [4.0, 0.0]}]}}
            ]
        }"#;
        let spec: LearnedRatioSpec = serde_json::from_str(json).unwrap();
        let ratio = spec.build(1).unwrap();
        // Scaled mass (2 - 1) / 0.5 = 2, so replicas give 1 + 2c + 0.3c², 1 + 4c, 1 + 8c.
        let ev = KinematicEvent::new(2.0, 0.0);
        let c = CouplingPoint::new(vec![0.5]);
        assert_relative_eq!(ratio.ratio(&ev, &c).unwrap(), 3.0, epsilon = 1e-12);
        assert!(spec.build(2).is_err());

        let unscaled = LearnedRatioSpec { scaling: None, ..spec }
            .with_scaling(FeatureScaling::parse("0 0\n1 1\n").unwrap());
        assert_relative_eq!(unscaled.build(1).unwrap().ratio(&ev, &c).unwrap(), 3.0);
    }

    #[test]
    fn test_learned_spec_fixed_point_and_validation() {
        let json = r#"{"replicas": [{"fixed_point": {"point": [1.0], "link": "decision",
            "classifier": {"weights": [0.0, 0.0], "bias": 0.25}}}]}"#;
        let spec: LearnedRatioSpec = serde_json::from_str(json).unwrap();
        let ratio = spec.build(1).unwrap();
        let ev = KinematicEvent::new(1.0, 0.3);
        assert_relative_eq!(ratio.ratio(&ev, &CouplingPoint::new(vec![1.0])).unwrap(), 3.0);
        assert!(ratio.ratio(&ev, &CouplingPoint::new(vec![0.5])).is_err());

        let bad_scaling = r#"{"scaling": {"mean": [0.0], "std": [0.0]}, "replicas": []}"#;
        assert!(serde_json::from_str::<LearnedRatioSpec>(bad_scaling).is_err());
        let empty: LearnedRatioSpec = serde_json::from_str(r#"{"replicas": []}"#).unwrap();
        assert!(empty.build(1).is_err());
        assert!(LinearScore { weights: vec![1.0], bias: 0.0 }.score(&[1.0, 2.0]).is_err());
    }
}
