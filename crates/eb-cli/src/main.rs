//! eftbound CLI

mod card;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use eb_core::CouplingPoint;
use eb_inference::pseudo::monte_carlo_p_value;
use eb_inference::{
    AsimovPValueCalculator, BoundScanner, BoundValue, CancelToken, PValueMethod, ScanArtifact,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "eftbound")]
#[command(about = "eftbound - EFT coupling bounds from likelihood-ratio scans")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the coupling grid of an analysis card and derive exclusion bounds
    Scan {
        /// Analysis card (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Output file for the scan artifact (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto).
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Test a single coupling point against the SM
    Hypotest {
        /// Analysis card (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Coupling values, comma-separated in card coupling order (e.g. `0.5,-1`)
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
        point: Vec<f64>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Threads (0 = auto).
        #[arg(long, default_value = "0")]
        threads: usize,
    },

    /// Convert a test statistic into a p-value
    Pvalue {
        /// Observed test statistic
        #[arg(long, allow_hyphen_values = true)]
        tc: f64,

        /// Null expected total, scales the tolerance for slightly negative statistics
        #[arg(long, default_value = "1.0")]
        scale: f64,

        /// JSON array of pseudo-experiment statistics; switches to the Monte-Carlo method
        #[arg(long)]
        ensemble: Option<PathBuf>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Export a scan artifact as CSV
    Export {
        /// Scan artifact JSON
        #[arg(short, long)]
        input: PathBuf,

        /// Table to export
        #[arg(long, value_enum, default_value = "points")]
        what: ExportTable,

        /// Output CSV file. Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportTable {
    Points,
    Bounds,
    Slices,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Scan { config, output, threads } => cmd_scan(&config, output.as_ref(), threads),
        Commands::Hypotest { config, point, output, threads } => {
            cmd_hypotest(&config, point, output.as_ref(), threads)
        }
        Commands::Pvalue { tc, scale, ensemble, output } => {
            cmd_pvalue(tc, scale, ensemble.as_deref(), output.as_ref())
        }
        Commands::Export { input, what, output } => cmd_export(&input, what, output.as_ref()),
    }
}

fn setup_threads(threads: usize) {
    if threads > 0 {
        // Best-effort; the global pool can only be built once per process.
        let _ = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global();
    }
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

fn write_text(output: Option<&PathBuf>, text: &str) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, text)?;
    } else {
        print!("{text}");
    }
    Ok(())
}

fn cmd_scan(config: &Path, output: Option<&PathBuf>, threads: usize) -> Result<()> {
    setup_threads(threads);
    let card = card::read_card(config)?;
    let prepared = card::prepare(&card, config)?;
    let scanner = BoundScanner::new(prepared.engine, card.scan_config())?;

    let scan = scanner.run(&prepared.data, &prepared.points, &CancelToken::new())?;
    let artifact = ScanArtifact::from_scan(&scan, &prepared.meta);

    eprintln!(
        "scanned {} points: {} excluded, {} allowed, {} failed",
        scan.records.len(),
        artifact.n_excluded,
        artifact.n_allowed,
        artifact.n_failed
    );
    for b in &scan.bounds {
        let summary = match b.bound {
            BoundValue::Crossing { magnitude, .. } => format!("bound at |c| = {magnitude:.6}"),
            BoundValue::Unconstrained { max_scanned } => {
                format!("unconstrained up to |c| = {max_scanned}")
            }
            BoundValue::ExcludedFromStart { magnitude } => {
                format!("excluded from |c| = {magnitude}")
            }
            BoundValue::InsufficientSamples { n_samples } => {
                format!("{n_samples} grid point(s), no bound")
            }
        };
        eprintln!("  direction {:?}: {summary}", b.direction);
    }
    for s in scan.slices.iter().filter(|s| s.anchor.iter().all(|a| *a == 0.0)) {
        let name = scan.coupling_names.get(s.axis).map_or("?", String::as_str);
        let (low, high) = s.interval();
        eprintln!("  {name} with others at 0: allowed [{low:?}, {high:?}]");
    }

    write_json(output, serde_json::to_value(&artifact)?)
}

fn cmd_hypotest(
    config: &Path,
    point: Vec<f64>,
    output: Option<&PathBuf>,
    threads: usize,
) -> Result<()> {
    setup_threads(threads);
    let card = card::read_card(config)?;
    let prepared = card::prepare(&card, config)?;
    let point = CouplingPoint::new(point);

    let cmp = prepared.engine.compare(&prepared.data, &point)?;
    let stat = cmp.statistic();
    let calc = AsimovPValueCalculator::default();
    let p = match card.pvalue_method {
        PValueMethod::Asymptotic => calc.asymptotic(stat.value, stat.scale)?,
        PValueMethod::MonteCarlo => {
            monte_carlo_p_value(&calc, &cmp, card.mc_pseudo_experiments, card.seed)?
        }
    };
    tracing::debug!(t_c = stat.value, p_value = p.p_value, "hypotest result");

    let excluded = p.p_value < 1.0 - card.confidence_level;
    let output_json = serde_json::json!({
        "coupling_names": prepared.engine.estimator().model().coupling_names(),
        "point": point.coords(),
        "test_statistic": stat,
        "p_value": p,
        "confidence_level": card.confidence_level,
        "excluded": excluded,
    });
    write_json(output, output_json)
}

fn cmd_pvalue(
    tc: f64,
    scale: f64,
    ensemble: Option<&Path>,
    output: Option<&PathBuf>,
) -> Result<()> {
    let calc = AsimovPValueCalculator::default();
    let p = match ensemble {
        None => calc.asymptotic(tc, scale)?,
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read ensemble {}", path.display()))?;
            let toys: Vec<f64> = serde_json::from_str(&text)
                .with_context(|| format!("ensemble {} is not a JSON array", path.display()))?;
            let t_obs = calc.check_statistic(tc, scale)?;
            calc.monte_carlo(t_obs, &toys)?
        }
    };
    write_json(output, serde_json::to_value(&p)?)
}

fn cmd_export(input: &Path, what: ExportTable, output: Option<&PathBuf>) -> Result<()> {
    let artifact = ScanArtifact::load_json(input)
        .with_context(|| format!("failed to load scan artifact {}", input.display()))?;
    let csv = match what {
        ExportTable::Points => artifact.points_csv(),
        ExportTable::Bounds => artifact.bounds_csv(),
        ExportTable::Slices => artifact.slices_csv(),
    };
    write_text(output, &csv)
}
