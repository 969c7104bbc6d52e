//! Persisted scan artifact.
//!
//! [`ScanArtifact`] is the stable on-disk form of a [`ScanResult`]: coupling names, every
//! per-point record (coordinates, status, `t_c`, p-value or error), derived ray and slice
//! bounds, and the run metadata needed to interpret them. JSON export is authoritative; floats
//! round-trip exactly, so reloading reproduces the identical point → p-value mapping. CSV views
//! are provided for report tooling.
//!
//! # Schema versioning
//!
//! The `schema_version` field tracks breaking changes. Current: `"eftbound_scan_v1"`.

use crate::asymptotics::PValueMethod;
use crate::dataset::AnalysisMode;
use crate::scan::{BoundValue, PointOutcome, PointRecord, RayBound, ScanResult, SliceBound};
use eb_core::{Error, Result, RunMetadata};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Current schema version for scan artifacts.
pub const SCHEMA_VERSION: &str = "eftbound_scan_v1";

/// Serializable record of a completed (or cancelled) scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanArtifact {
    /// Schema version for forward compatibility.
    pub schema_version: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_unix_ms: u64,
    /// Coupling names, in coordinate order.
    pub coupling_names: Vec<String>,
    /// Integrated luminosity of the analysed data.
    pub luminosity: f64,
    /// Confidence level of the bounds.
    pub confidence_level: f64,
    /// Monte-Carlo run identifiers.
    #[serde(default)]
    pub mc_runs: Vec<String>,
    /// Binned or unbinned analysis.
    pub mode: AnalysisMode,
    /// p-value method.
    pub pvalue_method: PValueMethod,
    /// Number of failed points.
    pub n_failed: usize,
    /// Number of excluded points.
    pub n_excluded: usize,
    /// Number of allowed points.
    pub n_allowed: usize,
    /// Whether every requested point was evaluated.
    pub complete: bool,
    /// Per-point records in grid order.
    pub points: Vec<PointRecord>,
    /// Bounds per ray.
    pub bounds: Vec<RayBound>,
    /// Bounds per axis-aligned slice.
    #[serde(default)]
    pub slices: Vec<SliceBound>,
}

impl ScanArtifact {
    /// Build from a scan result and the run metadata of the analysed data.
    pub fn from_scan(scan: &ScanResult, meta: &RunMetadata) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            created_unix_ms: unix_now_ms(),
            coupling_names: scan.coupling_names.clone(),
            luminosity: meta.luminosity,
            confidence_level: scan.confidence_level,
            mc_runs: meta.mc_runs.clone(),
            mode: scan.mode,
            pvalue_method: scan.pvalue_method,
            n_failed: scan.n_failed(),
            n_excluded: scan.n_excluded(),
            n_allowed: scan.n_allowed(),
            complete: scan.complete,
            points: scan.records.clone(),
            bounds: scan.bounds.clone(),
            slices: scan.slices.clone(),
        }
    }

    /// Rebuild the in-memory scan result.
    pub fn to_scan_result(&self) -> ScanResult {
        ScanResult {
            coupling_names: self.coupling_names.clone(),
            confidence_level: self.confidence_level,
            pvalue_method: self.pvalue_method,
            mode: self.mode,
            records: self.points.clone(),
            bounds: self.bounds.clone(),
            slices: self.slices.clone(),
            complete: self.complete,
        }
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON, rejecting unknown schema versions.
    pub fn from_json(json: &str) -> Result<Self> {
        let art: Self = serde_json::from_str(json)?;
        if art.schema_version != SCHEMA_VERSION {
            return Err(Error::Validation(format!(
                "unsupported scan artifact schema '{}' (expected '{SCHEMA_VERSION}')",
                art.schema_version
            )));
        }
        Ok(art)
    }

    /// Write JSON to `path`.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read JSON from `path`.
    pub fn load_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// One row per point: coordinates, status, `t_c`, p-value, error.
    pub fn points_csv(&self) -> String {
        let alpha = 1.0 - self.confidence_level;
        let mut out = String::new();
        for name in &self.coupling_names {
            out.push_str(name);
            out.push(',');
        }
        out.push_str("status,t_c,p_value,error\n");
        for rec in &self.points {
            for c in rec.point.coords() {
                out.push_str(&format!("{c},"));
            }
            let status = serde_json::to_value(rec.status(alpha))
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            match &rec.outcome {
                PointOutcome::Evaluated { t_c, p_value, .. } => {
                    out.push_str(&format!("{status},{t_c},{p_value},\n"));
                }
                PointOutcome::Failed { error } => {
                    out.push_str(&format!("{status},,,\"{}\"\n", error.replace('"', "\"\"")));
                }
            }
        }
        out
    }

    /// One row per ray: direction, bound kind, magnitude.
    pub fn bounds_csv(&self) -> String {
        let mut out = String::from("direction,kind,magnitude\n");
        for b in &self.bounds {
            let dir =
                b.direction.iter().map(|d| format!("{d}")).collect::<Vec<_>>().join(" ");
            let (kind, magnitude) = bound_cells(&b.bound);
            out.push_str(&format!("{dir},{kind},{magnitude}\n"));
        }
        out
    }

    /// One row per axis-aligned slice: varying coupling, fixed coordinates, allowed interval.
    pub fn slices_csv(&self) -> String {
        let mut out = String::from("axis,anchor,center,lower_kind,low,upper_kind,high\n");
        for s in &self.slices {
            let axis =
                self.coupling_names.get(s.axis).cloned().unwrap_or_else(|| s.axis.to_string());
            let anchor = s.anchor.iter().map(|a| format!("{a}")).collect::<Vec<_>>().join(" ");
            let (low, high) = s.interval();
            let cell = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
            out.push_str(&format!(
                "{axis},{anchor},{},{},{},{},{}\n",
                s.center,
                bound_cells(&s.lower).0,
                cell(low),
                bound_cells(&s.upper).0,
                cell(high)
            ));
        }
        out
    }
}

/// CSV kind tag and magnitude cell of a bound.
fn bound_cells(bound: &BoundValue) -> (&'static str, String) {
    match bound {
        BoundValue::Crossing { magnitude, .. } => ("crossing", magnitude.to_string()),
        BoundValue::Unconstrained { max_scanned } => ("unconstrained", max_scanned.to_string()),
        BoundValue::ExcludedFromStart { magnitude } => {
            ("excluded_from_start", magnitude.to_string())
        }
        BoundValue::InsufficientSamples { .. } => ("insufficient_samples", String::new()),
    }
}

fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eb_core::{ConvergenceWarning, CouplingPoint};

    fn make_sample_scan() -> ScanResult {
        let records = vec![
            PointRecord {
                point: CouplingPoint::new(vec![0.0]),
                outcome: PointOutcome::Evaluated {
                    t_c: 0.0,
                    p_value: 0.5,
                    std_error: None,
                    n_clipped: 0,
                    n_skipped: 0,
                    warning: None,
                },
            },
            PointRecord {
                point: CouplingPoint::new(vec![0.1]),
                outcome: PointOutcome::Evaluated {
                    t_c: 1.234_567_89,
                    p_value: 0.133_071_574,
                    std_error: Some(3.3e-3),
                    n_clipped: 1,
                    n_skipped: 0,
                    warning: Some(ConvergenceWarning {
                        n_pseudo: 100,
                        n_exceeding: 13,
                        relative_uncertainty: Some(0.258_7),
                    }),
                },
            },
            PointRecord {
                point: CouplingPoint::new(vec![0.2]),
                outcome: PointOutcome::Evaluated {
                    t_c: 7.1,
                    p_value: 0.003_854_96,
                    std_error: None,
                    n_clipped: 0,
                    n_skipped: 2,
                    warning: None,
                },
            },
            PointRecord {
                point: CouplingPoint::new(vec![-0.1]),
                outcome: PointOutcome::Failed {
                    error: "kinematic value 3 outside tabulated range [0, 2]".into(),
                },
            },
        ];
        let bounds = crate::scan::derive_bounds(&records, 0.05);
        let slices = crate::scan::derive_slices(&records, 0.05);
        ScanResult {
            coupling_names: vec!["cW".into()],
            confidence_level: 0.95,
            pvalue_method: PValueMethod::Asymptotic,
            mode: AnalysisMode::Binned,
            records,
            bounds,
            slices,
            complete: true,
        }
    }

    #[test]
    fn json_roundtrip_reproduces_mapping() {
        let scan = make_sample_scan();
        let meta =
            RunMetadata { mc_runs: vec!["run_01".into()], ..RunMetadata::with_luminosity(300.0) };
        let art = ScanArtifact::from_scan(&scan, &meta);
        assert_eq!(art.n_failed, 1);
        assert_eq!(art.n_excluded, 1);
        assert_eq!(art.n_allowed, 2);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.json");
        art.save_json(&path).unwrap();
        let back = ScanArtifact::load_json(&path).unwrap();
        assert_eq!(back, art);
        let rescan = back.to_scan_result();
        for rec in &scan.records {
            assert_eq!(rescan.p_value(&rec.point), scan.p_value(&rec.point));
        }
        assert_eq!(rescan, scan);
    }

    #[test]
    fn schema_version_present_and_checked() {
        let art = ScanArtifact::from_scan(&make_sample_scan(), &RunMetadata::with_luminosity(1.0));
        let json = art.to_json().unwrap();
        assert!(json.contains("\"schema_version\": \"eftbound_scan_v1\""));
        assert!(json.contains("\"status\": \"failed\""));
        let bad = json.replace("eftbound_scan_v1", "eftbound_scan_v0");
        assert!(ScanArtifact::from_json(&bad).is_err());
    }

    #[test]
    fn csv_views() {
        let art = ScanArtifact::from_scan(&make_sample_scan(), &RunMetadata::with_luminosity(1.0));
        let points = art.points_csv();
        let lines: Vec<&str> = points.lines().collect();
        assert_eq!(lines[0], "cW,status,t_c,p_value,error");
        assert_eq!(lines.len(), 5);
        assert!(lines[3].starts_with("0.2,excluded,7.1,"));
        assert!(lines[4].starts_with("-0.1,failed,,,\""));
        let bounds = art.bounds_csv();
        assert!(bounds.lines().nth(1).unwrap().starts_with("1,crossing,"));
        // The negative ray holds a single failed point.
        assert_eq!(art.bounds.len(), 1);

        let slices = art.slices_csv();
        let lines: Vec<&str> = slices.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("cW,0,0,insufficient_samples,,crossing,0.1"), "{slices}");
    }

    #[test]
    fn insufficient_rays_export_without_magnitude() {
        let mut art =
            ScanArtifact::from_scan(&make_sample_scan(), &RunMetadata::with_luminosity(1.0));
        art.bounds.push(RayBound {
            direction: vec![-1.0],
            bound: BoundValue::InsufficientSamples { n_samples: 1 },
        });
        let json = art.to_json().unwrap();
        assert!(json.contains("\"kind\": \"insufficient_samples\""));
        assert_eq!(ScanArtifact::from_json(&json).unwrap(), art);
        assert_eq!(art.bounds_csv().lines().last(), Some("-1,insufficient_samples,"));
    }
}
