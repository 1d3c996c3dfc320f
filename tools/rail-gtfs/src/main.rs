use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rail_gtfs_transit::prelude::*;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod loader;
mod output;

use loader::{load_records, load_tables, read_json};
use output::{write_diagnostics, write_json, BuildSummary};

#[derive(Parser, Debug)]
#[command(
    name = "rail-gtfs",
    author,
    version,
    about = "Consolidate operator train timetables into through-service trips",
    long_about = "Normalizes per-operator timetable records (ODPT JSON or scraped \
                  station-by-train table columns), follows through-service rules across \
                  operators and writes one trip per physical train run.\n\n\
                  The realtime subcommand matches delay reports onto a previous build's \
                  trips and writes per-stop delay projections."
)]
struct Cli {
    /// Verbose output (show debug messages)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build consolidated trips from timetable records
    Build(BuildArgs),
    /// Match realtime delay updates against built trips
    Realtime(RealtimeArgs),
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Directory holding the lookup table CSV files
    #[arg(short, long)]
    tables: PathBuf,

    /// ODPT-style timetable record JSON files
    #[arg(short, long = "records", num_args = 1..)]
    records: Vec<PathBuf>,

    /// Scraped table column JSON files
    #[arg(long = "columns", num_args = 1..)]
    columns: Vec<PathBuf>,

    /// Output JSON file for trips and services
    #[arg(short, long)]
    output: PathBuf,

    /// Write diagnostics here, one per line
    #[arg(long)]
    diagnostics: Option<PathBuf>,

    /// Build configuration JSON; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// First service date of the build window (defaults to today)
    #[arg(long)]
    start_date: Option<chrono::NaiveDate>,

    /// Number of service dates to build
    #[arg(long)]
    window_days: Option<u32>,

    /// Longest accepted through-service wait in seconds
    #[arg(long)]
    lookahead: Option<u32>,

    /// Same-name station merge radius in meters
    #[arg(long)]
    merge_radius: Option<f64>,

    /// Treat every fragment as its own trip (bus timetables)
    #[arg(long)]
    standalone: bool,
}

#[derive(Args, Debug)]
struct RealtimeArgs {
    /// Directory holding the lookup table CSV files
    #[arg(short, long)]
    tables: PathBuf,

    /// Output of a previous `build`
    #[arg(long)]
    trips: PathBuf,

    /// Same-name station merge radius in meters (defaults to the build's)
    #[arg(long)]
    merge_radius: Option<f64>,

    /// Realtime update JSON file
    #[arg(short, long)]
    updates: PathBuf,

    /// Output JSON file for delay projections
    #[arg(short, long)]
    output: PathBuf,
}

/// The parts of a `build` output a realtime run needs.
#[derive(Deserialize)]
struct SavedBuild {
    #[serde(default)]
    config: Option<BuildConfig>,
    trips: Vec<Trip>,
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(fmt::layer().without_time().with_target(false))
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Build(args) => run_build(args),
        Command::Realtime(args) => run_realtime(args),
    }
}

fn build_config(args: &BuildArgs) -> Result<BuildConfig> {
    let mut config = match &args.config {
        Some(path) => read_json::<BuildConfig>(path).context("Failed to read build configuration")?,
        None => BuildConfig::default(),
    };

    if let Some(start_date) = args.start_date {
        config.start_date = Some(start_date);
    }
    if let Some(window_days) = args.window_days {
        config.window_days = window_days;
    }
    if let Some(lookahead) = args.lookahead {
        config.lookahead_secs = lookahead;
    }
    if let Some(radius) = args.merge_radius {
        config.merge_radius_m = check_radius(radius)?;
    }
    if config.window_days == 0 {
        bail!("Build window must cover at least one day");
    }

    Ok(config)
}

fn check_radius(radius: f64) -> Result<f64> {
    if !radius.is_finite() || radius < 0.0 {
        bail!("Merge radius must be a non-negative number of meters, got {}", radius);
    }
    Ok(radius)
}

fn run_build(args: BuildArgs) -> Result<()> {
    tracing::info!("=== rail-gtfs build ===");

    if args.records.is_empty() && args.columns.is_empty() {
        bail!("No input: pass --records and/or --columns");
    }
    for path in args.records.iter().chain(&args.columns) {
        if !path.exists() {
            bail!("Input file does not exist: {}", path.display());
        }
    }

    let mut config = build_config(&args)?;
    let tables = load_tables(&args.tables).context("Failed to load lookup tables")?;

    tracing::info!("Loading records...");
    let records = load_records(&args.records, &args.columns)?;
    if config.start_date.is_none() && records.iter().all(|r| r.service_date.is_none()) {
        config.start_date = Some(chrono::Local::now().date_naive());
    }

    let ctx = BuildContext::new(tables, config).context("Failed to prepare build")?;
    let built = if args.standalone {
        build_standalone(&records, &ctx)
    } else {
        build(&records, &ctx)
    }
    .context("Build failed")?;

    let summary = BuildSummary::new(&ctx, &built);
    write_json(&summary, &args.output)?;
    tracing::info!(
        "Wrote {} trips, {} services and {} stations to {}",
        built.trips.len(),
        summary.services.len(),
        summary.stations.len(),
        args.output.display()
    );

    report_diagnostics(&built.diagnostics, args.diagnostics.as_deref())
}

fn report_diagnostics(diagnostics: &Diagnostics, path: Option<&Path>) -> Result<()> {
    if diagnostics.is_empty() {
        return Ok(());
    }
    tracing::warn!("{} diagnostics recorded", diagnostics.len());

    match path {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_diagnostics(diagnostics, std::io::BufWriter::new(file))?;
            tracing::info!("Wrote diagnostics to {}", path.display());
        }
        None => write_diagnostics(diagnostics, std::io::stderr().lock())?,
    }
    Ok(())
}

/// Station merging must match the build the trips came from.
fn realtime_config(saved: Option<BuildConfig>, merge_radius: Option<f64>) -> Result<BuildConfig> {
    let mut config = match saved {
        Some(config) => config,
        None => {
            tracing::warn!("Build output carries no configuration, assuming defaults");
            BuildConfig::default()
        }
    };
    if let Some(radius) = merge_radius {
        config.merge_radius_m = check_radius(radius)?;
    }
    Ok(config)
}

fn run_realtime(args: RealtimeArgs) -> Result<()> {
    tracing::info!("=== rail-gtfs realtime ===");

    let saved: SavedBuild = read_json(&args.trips).context("Failed to read trips")?;
    let config = realtime_config(saved.config, args.merge_radius)?;
    let tables = load_tables(&args.tables).context("Failed to load lookup tables")?;
    let stations = StationResolver::new(&tables, &config).context("Failed to prepare stations")?;
    let updates: Vec<RealtimeUpdate> = read_json(&args.updates).context("Failed to read updates")?;

    let matcher = RealtimeMatcher::new(TripIndex::from_data(saved.trips, Arc::new(stations)));

    let mut projections = Vec::with_capacity(updates.len());
    for update in &updates {
        match matcher.try_match(update) {
            Ok(projection) => projections.push(projection),
            Err(e) => tracing::warn!("Unmatched update: {}", e),
        }
    }

    write_json(&projections, &args.output)?;
    tracing::info!(
        "Matched {} of {} updates, wrote {}",
        projections.len(),
        updates.len(),
        args.output.display()
    );
    Ok(())
}
