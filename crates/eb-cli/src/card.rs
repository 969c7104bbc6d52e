//! Analysis card v0 (YAML or JSON) parsing + semantic validation.
//!
//! A single card drives a scan: theory table, EFT order, luminosity, data mode, coupling grid
//! and p-value method.
//!
//! Event files may name Monte-Carlo runs through a `{run}` placeholder. Each entry of
//! `mc_runs` is then substituted in turn and the files are read back to back.

use anyhow::{Context, Result};
use eb_core::{CouplingPoint, EventSource, LikelihoodRatio, RunMetadata};
use eb_inference::{
    AnalysisData, BinnedDataset, GridSpec, PValueMethod, ScanConfig, TestStatisticEngine,
    UnbinnedDataset, YieldEstimator,
};
use eb_model::{
    Binning, ChainedEventSource, CrossSectionModel, EftOrder, FeatureScaling, JsonlEventSource,
    LearnedRatioSpec, ScoreLink, ScoreRatio,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CARD_V0: &str = "eftbound_card_v0";

/// Placeholder in event paths replaced by each `mc_runs` entry.
pub const RUN_PLACEHOLDER: &str = "{run}";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisCard {
    pub schema_version: String,
    /// Coefficient-table JSON, relative to the card's directory.
    pub theory: PathBuf,
    /// Truncation of the EFT expansion.
    #[serde(default)]
    pub order: EftOrder,
    pub luminosity: f64,
    #[serde(default = "default_efficiency")]
    pub efficiency: f64,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    pub grid: GridSpec,
    /// Monte-Carlo run identifiers substituted into the `{run}` event path.
    #[serde(default)]
    pub mc_runs: Vec<String>,
    pub mode: ModeCard,
    #[serde(default)]
    pub pvalue_method: PValueMethod,
    #[serde(default = "default_pseudo_experiments")]
    pub mc_pseudo_experiments: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub max_events: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeCard {
    Binned(BinnedCard),
    Unbinned(UnbinnedCard),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinnedCard {
    /// Explicit bin edges.
    #[serde(default)]
    pub edges: Option<Vec<f64>>,
    /// Uniform bin width over the theory range.
    #[serde(default)]
    pub width: Option<f64>,
    /// Observed counts; SM Asimov counts when omitted.
    #[serde(default)]
    pub observed: Option<Vec<f64>>,
    /// JSON-lines event file histogrammed into the observed counts.
    #[serde(default)]
    pub events: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnbinnedCard {
    /// JSON-lines event file, relative to the card's directory.
    #[serde(default)]
    pub events: Option<PathBuf>,
    /// Draw a Poisson-sized SM sample from the event file instead of using every event.
    #[serde(default)]
    pub sm_subsample: bool,
    /// Asimov cell width when no event file is given.
    #[serde(default)]
    pub cell_width: Option<f64>,
    /// Learned likelihood ratio replacing the analytic one.
    #[serde(default)]
    pub ratio: Option<RatioCard>,
}

/// Source of a learned per-event likelihood ratio.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum RatioCard {
    /// Classifier scores stored on the events, trained at `point`.
    Score { link: ScoreLink, point: Vec<f64> },
    /// Classifier replicas described in a JSON file.
    Model {
        path: PathBuf,
        /// Two-row text scaling file overriding the one in `path`.
        #[serde(default)]
        scaling: Option<PathBuf>,
    },
}

fn default_efficiency() -> f64 {
    1.0
}

fn default_confidence_level() -> f64 {
    0.95
}

fn default_pseudo_experiments() -> usize {
    10_000
}

fn default_seed() -> u64 {
    42
}

pub fn read_card(path: &Path) -> Result<AnalysisCard> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read card {}", path.display()))?;
    // YAML is a superset of JSON, so one parser covers both.
    let card: AnalysisCard = serde_yaml_ng::from_slice(&bytes)
        .with_context(|| format!("failed to parse card {}", path.display()))?;
    card.validate()?;
    Ok(card)
}

fn resolve_path(base_dir: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() { p.to_path_buf() } else { base_dir.join(p) }
}

fn is_templated(p: &Path) -> bool {
    p.to_string_lossy().contains(RUN_PLACEHOLDER)
}

/// Event source for a card path: one file, or one file per run when templated.
///
/// Returns the source with the identifiers of its inputs.
fn event_source(
    card: &AnalysisCard,
    base_dir: &Path,
    events: &Path,
) -> Result<(Box<dyn EventSource>, Vec<String>)> {
    if !is_templated(events) {
        let source = JsonlEventSource::new(resolve_path(base_dir, events));
        return Ok((Box::new(source), vec![events.display().to_string()]));
    }
    let template = events.to_string_lossy();
    let sources = card
        .mc_runs
        .iter()
        .map(|run| {
            let path = resolve_path(base_dir, Path::new(&template.replace(RUN_PLACEHOLDER, run)));
            Box::new(JsonlEventSource::new(path).with_id(run.as_str())) as Box<dyn EventSource>
        })
        .collect();
    let chain = ChainedEventSource::new(sources)?;
    let ids = chain.source_ids();
    Ok((Box::new(chain), ids))
}

fn learned_ratio(
    ratio: &RatioCard,
    base_dir: &Path,
    n_couplings: usize,
) -> Result<Arc<dyn LikelihoodRatio>> {
    match ratio {
        RatioCard::Score { link, point } => {
            if point.len() != n_couplings {
                anyhow::bail!(
                    "ratio.score point has {} coordinates, model has {n_couplings} couplings",
                    point.len()
                );
            }
            Ok(Arc::new(ScoreRatio::new(*link, CouplingPoint::new(point.clone()))))
        }
        RatioCard::Model { path, scaling } => {
            let path = resolve_path(base_dir, path);
            let mut spec = LearnedRatioSpec::from_json_path(&path)
                .with_context(|| format!("failed to load ratio model {}", path.display()))?;
            if let Some(scaling) = scaling {
                let scaling = resolve_path(base_dir, scaling);
                let text = std::fs::read_to_string(&scaling)
                    .with_context(|| format!("failed to read scaling {}", scaling.display()))?;
                spec = spec.with_scaling(FeatureScaling::parse(&text)?);
            }
            tracing::info!(replicas = spec.replicas.len(), "learned ratio loaded");
            Ok(spec.build(n_couplings)?)
        }
    }
}

impl AnalysisCard {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != CARD_V0 {
            anyhow::bail!(
                "unsupported card schema_version '{}' (expected '{CARD_V0}')",
                self.schema_version
            );
        }
        if !(self.luminosity.is_finite() && self.luminosity > 0.0) {
            anyhow::bail!("luminosity must be > 0, got {}", self.luminosity);
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            anyhow::bail!("confidence_level must be in (0, 1), got {}", self.confidence_level);
        }
        let events = match &self.mode {
            ModeCard::Binned(b) => {
                match (&b.edges, b.width) {
                    (Some(_), Some(_)) => anyhow::bail!("mode.binned: give either edges or width"),
                    (None, None) => anyhow::bail!("mode.binned requires edges or width"),
                    _ => {}
                }
                if b.observed.is_some() && b.events.is_some() {
                    anyhow::bail!("mode.binned: give either observed or events");
                }
                &b.events
            }
            ModeCard::Unbinned(u) => {
                if u.events.is_none() && u.cell_width.is_none() {
                    anyhow::bail!("mode.unbinned requires events or cell_width");
                }
                if u.sm_subsample && u.events.is_none() {
                    anyhow::bail!("mode.unbinned.sm_subsample requires an events file");
                }
                if matches!(u.ratio, Some(RatioCard::Score { .. })) && u.events.is_none() {
                    anyhow::bail!("mode.unbinned.ratio.score requires an events file");
                }
                &u.events
            }
        };
        let templated = events.as_ref().is_some_and(|p| is_templated(p));
        if templated && self.mc_runs.is_empty() {
            anyhow::bail!("event path uses {RUN_PLACEHOLDER} but mc_runs is empty");
        }
        if !templated && !self.mc_runs.is_empty() {
            anyhow::bail!("mc_runs requires an event path containing {RUN_PLACEHOLDER}");
        }
        if let Some(dup) = self.mc_runs.iter().enumerate().find_map(|(i, r)| {
            self.mc_runs[..i].contains(r).then_some(r)
        }) {
            anyhow::bail!("mc_runs lists '{dup}' twice");
        }
        Ok(())
    }

    /// Run metadata; `mc_runs` holds the identifiers of the event inputs actually read.
    pub fn meta(&self, mc_runs: Vec<String>) -> RunMetadata {
        RunMetadata { mc_runs, ..RunMetadata::with_luminosity(self.luminosity) }
    }

    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            confidence_level: self.confidence_level,
            pvalue_method: self.pvalue_method,
            n_pseudo: self.mc_pseudo_experiments,
            seed: self.seed,
            strict: self.strict,
            ..ScanConfig::default()
        }
    }
}

/// Everything a scan needs, resolved from a card.
pub struct Prepared {
    pub engine: TestStatisticEngine,
    pub data: AnalysisData,
    pub points: Vec<CouplingPoint>,
    pub meta: RunMetadata,
}

pub fn prepare(card: &AnalysisCard, card_path: &Path) -> Result<Prepared> {
    let base_dir = card_path.parent().unwrap_or_else(|| Path::new("."));
    let theory = resolve_path(base_dir, &card.theory);
    tracing::info!(path = %theory.display(), "loading coefficient table");
    let model = CrossSectionModel::from_json_path(&theory)
        .with_context(|| format!("failed to load theory table {}", theory.display()))?
        .with_order(card.order);
    tracing::info!(
        couplings = ?model.coupling_names(),
        range = ?model.range(),
        joint = model.joint().is_some(),
        order = ?model.order(),
        "theory loaded"
    );

    let estimator =
        YieldEstimator::new(model.clone(), card.luminosity)?.with_efficiency(card.efficiency)?;
    let null = CouplingPoint::zero(model.n_couplings());
    let mut engine = TestStatisticEngine::new(estimator.clone());

    let (data, meta): (AnalysisData, RunMetadata) = match &card.mode {
        ModeCard::Binned(b) => {
            let binning = match (&b.edges, b.width) {
                (Some(edges), _) => Binning::from_edges(edges.clone())?,
                (None, Some(w)) => {
                    let (lo, hi) = model.range();
                    Binning::uniform(lo, hi, w)?
                }
                (None, None) => anyhow::bail!("mode.binned requires edges or width"),
            };
            let (observed, meta) = match (&b.observed, &b.events) {
                (Some(counts), _) => (Some(counts.clone()), card.meta(Vec::new())),
                (None, Some(events)) => {
                    let (source, ids) = event_source(card, base_dir, events)?;
                    let all = source
                        .collect_events(card.max_events)
                        .with_context(|| format!("failed to read events {}", source.id()))?;
                    let obs = model.observable();
                    let counts = binning.histogram(all.iter().map(|ev| ev.observable(obs)));
                    tracing::info!(events = all.len(), bins = counts.len(), "events binned");
                    (Some(counts), card.meta(ids))
                }
                (None, None) => (None, card.meta(Vec::new())),
            };
            let asimov = estimator.asimov_binned(&binning, &null, meta.clone())?;
            let data: BinnedDataset = match observed {
                Some(counts) => asimov.with_observed(&counts)?,
                None => asimov,
            };
            (data.into(), meta)
        }
        ModeCard::Unbinned(u) => {
            if let Some(ratio) = &u.ratio {
                engine = engine.with_ratio(learned_ratio(ratio, base_dir, model.n_couplings())?);
            }
            match &u.events {
                Some(events) => {
                    let (source, ids) = event_source(card, base_dir, events)?;
                    let meta = card.meta(ids);
                    let all =
                        UnbinnedDataset::from_source(source.as_ref(), card.max_events, meta.clone())
                            .with_context(|| format!("failed to read events {}", source.id()))?;
                    tracing::info!(events = all.n_events(), source = source.id(), "events loaded");
                    let data: AnalysisData = if u.sm_subsample {
                        let sample = estimator.observed_sm_sample(all.events(), card.seed)?;
                        tracing::info!(events = sample.len(), "SM sample drawn");
                        UnbinnedDataset::new(sample, None, meta.clone())?.into()
                    } else {
                        all.into()
                    };
                    (data, meta)
                }
                None => {
                    let width = u.cell_width.unwrap_or(0.0);
                    let meta = card.meta(Vec::new());
                    (estimator.asimov_unbinned(width, &null, meta.clone())?.into(), meta)
                }
            }
        }
    };

    let points = card.grid.points(model.n_couplings())?;
    Ok(Prepared { engine, data, points, meta })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_card_with_defaults() {
        let yaml = r#"
schema_version: eftbound_card_v0
theory: theory.json
luminosity: 10.0
grid:
  ranges:
    - {start: -1.0, stop: 1.0, step: 0.5}
mode:
  binned:
    width: 0.25
"#;
        let card: AnalysisCard = serde_yaml_ng::from_str(yaml).unwrap();
        card.validate().unwrap();
        assert_eq!(card.confidence_level, 0.95);
        assert_eq!(card.pvalue_method, PValueMethod::Asymptotic);
        assert_eq!(card.scan_config().n_pseudo, 10_000);
        assert_eq!(card.order, EftOrder::Quadratic);
        assert!(card.mc_runs.is_empty());
        assert!(matches!(card.mode, ModeCard::Binned(BinnedCard { width: Some(_), .. })));
    }

    #[test]
    fn parses_order_ratio_and_run_template() {
        let yaml = r#"
schema_version: eftbound_card_v0
theory: theory.json
order: linear
luminosity: 10.0
mc_runs: [run_a, run_b]
grid: {points: [[0.5]]}
mode:
  unbinned:
    events: "events_{run}.jsonl"
    ratio: {score: {link: decision, point: [0.5]}}
"#;
        let card: AnalysisCard = serde_yaml_ng::from_str(yaml).unwrap();
        card.validate().unwrap();
        assert_eq!(card.order, EftOrder::Linear);
        let ModeCard::Unbinned(u) = &card.mode else {
            panic!("expected unbinned mode");
        };
        assert!(matches!(
            u.ratio,
            Some(RatioCard::Score { link: ScoreLink::Decision, ref point }) if point == &[0.5]
        ));

        let dir = tempfile::tempdir().unwrap();
        for (run, mass) in [("run_a", 0.2), ("run_b", 0.7)] {
            let line = format!("{{\"mass\": {mass}, \"rapidity\": 0.0, \"score\": 0.4}}\n");
            std::fs::write(dir.path().join(format!("events_{run}.jsonl")), line).unwrap();
        }
        let (source, ids) =
            event_source(&card, dir.path(), u.events.as_deref().unwrap()).unwrap();
        assert_eq!(ids, vec!["run_a".to_string(), "run_b".to_string()]);
        assert_eq!(source.id(), "run_a+run_b");
        let events = source.collect_events(None).unwrap();
        assert_eq!(events.iter().map(|e| e.mass).collect::<Vec<_>>(), vec![0.2, 0.7]);
        assert_eq!(card.meta(ids).mc_runs, vec!["run_a", "run_b"]);
    }

    #[test]
    fn parses_json_card() {
        let json = r#"{
            "schema_version": "eftbound_card_v0",
            "theory": "/abs/theory.json",
            "luminosity": 3.0,
            "grid": {"points": [[0.1], [0.2]]},
            "mode": {"unbinned": {"cell_width": 0.1}},
            "pvalue_method": "monte_carlo",
            "mc_pseudo_experiments": 500
        }"#;
        let card: AnalysisCard = serde_yaml_ng::from_str(json).unwrap();
        card.validate().unwrap();
        assert_eq!(card.scan_config().pvalue_method, PValueMethod::MonteCarlo);
        let theory = resolve_path(Path::new("/cards"), &card.theory);
        assert_eq!(theory, PathBuf::from("/abs/theory.json"));
        assert_eq!(
            resolve_path(Path::new("/cards"), Path::new("t.json")),
            PathBuf::from("/cards/t.json")
        );
    }

    #[test]
    fn rejects_bad_cards() {
        let base = r#"
schema_version: eftbound_card_v0
theory: t.json
luminosity: 1.0
grid: {points: [[0.0]]}
"#;
        let both = format!("{base}mode: {{binned: {{width: 0.1, edges: [0.0, 1.0]}}}}\n");
        let card: AnalysisCard = serde_yaml_ng::from_str(&both).unwrap();
        assert!(card.validate().is_err());

        let sub = format!("{base}mode: {{unbinned: {{cell_width: 0.1, sm_subsample: true}}}}\n");
        let card: AnalysisCard = serde_yaml_ng::from_str(&sub).unwrap();
        assert!(card.validate().is_err());

        let unknown = format!("{base}mode: {{binned: {{width: 0.1}}}}\nextra: 1\n");
        assert!(serde_yaml_ng::from_str::<AnalysisCard>(&unknown).is_err());

        let runs_only = format!("{base}mc_runs: [r1]\nmode: {{binned: {{width: 0.1}}}}\n");
        let card: AnalysisCard = serde_yaml_ng::from_str(&runs_only).unwrap();
        assert!(card.validate().is_err());

        let template = format!("{base}mode: {{unbinned: {{events: \"e_{{run}}.jsonl\"}}}}\n");
        let card: AnalysisCard = serde_yaml_ng::from_str(&template).unwrap();
        assert!(card.validate().is_err());

        let dup = format!(
            "{base}mc_runs: [r1, r1]\nmode: {{unbinned: {{events: \"e_{{run}}.jsonl\"}}}}\n"
        );
        let card: AnalysisCard = serde_yaml_ng::from_str(&dup).unwrap();
        assert!(card.validate().is_err());

        let score = format!(
            "{base}mode: {{unbinned: {{cell_width: 0.1, \
             ratio: {{score: {{link: ratio, point: [1.0]}}}}}}}}\n"
        );
        let card: AnalysisCard = serde_yaml_ng::from_str(&score).unwrap();
        assert!(card.validate().is_err());

        let order = format!("{base}order: cubic\nmode: {{binned: {{width: 0.1}}}}\n");
        assert!(serde_yaml_ng::from_str::<AnalysisCard>(&order).is_err());

        let wrong = base.replace("eftbound_card_v0", "eftbound_card_v9");
        let wrong = format!("{wrong}mode: {{binned: {{width: 0.1}}}}\n");
        let card: AnalysisCard = serde_yaml_ng::from_str(&wrong).unwrap();
        assert!(card.validate().is_err());
    }
}
