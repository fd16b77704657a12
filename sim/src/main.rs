//! ROADTRACK SIM: replay and simulation front end for the roadtrack inference engine.
//!
//! This program can operate in three modes:
//!
//! - Replay: feeds recorded GPS fixes (CSV) for any number of vehicles through an instance
//!   registry and writes each vehicle's inferred results to CSV.
//!
//! - Simulate: drives a single vehicle along a route of the road network at constant speed,
//!   generates noisy fixes, runs inference next to the ground truth and reports the error.
//!
//! - Config: writes a template inference configuration file.
//!
//! Every mode takes the road network as a JSON file and optionally an inference configuration
//! file (TOML/JSON/YAML) through `--config`.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use common::{get_csv_files, init_logger, validate_input_path, validate_output_path, write_results};
use log::{error, info, warn};
use roadtrack::road::{EdgeId, RoadEdge};
use roadtrack::sim::{DriveParameters, FixRecord, simulate_drive};
use roadtrack::{
    FilterKind, InMemoryRoadNetwork, InferenceConfig, InferenceInstance, InfoLevel,
    InstanceRegistry, RoadNetwork, UpdateOutcome,
};

const LONG_ABOUT: &str = "ROADTRACK SIM: replay and simulation front end for the roadtrack inference engine.

- replay: feed recorded GPS fixes (CSV with columns vehicle_id,time,latitude,longitude,
  velocity,heading,accuracy) through the inference engine and write per-vehicle results.

- simulate: drive a route of the road network at constant speed, generate noisy fixes and
  compare the inferred positions with the ground truth.

- config: write a template inference configuration file.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Replay and simulation front end for the roadtrack inference engine.", long_about = LONG_ABOUT)]
struct Cli {
    /// Inference configuration file (TOML/JSON/YAML); defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Command to execute
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

/// Top-level commands
#[derive(Subcommand, Clone)]
enum Command {
    #[command(name = "replay", about = "Replay recorded GPS fixes through the inference engine")]
    Replay(ReplayArgs),
    #[command(name = "simulate", about = "Simulate a drive and run inference against ground truth")]
    Simulate(SimulateArgs),
    #[command(name = "config", about = "Generate a template configuration file")]
    CreateConfig(CreateConfigArgs),
}

/// Overrides applied on top of the configuration file
#[derive(Args, Clone, Debug, Default)]
struct FilterOverrides {
    /// Filter variant (bootstrap, particle-learning)
    #[arg(long)]
    filter: Option<FilterKind>,
    /// Random seed
    #[arg(long)]
    seed: Option<u64>,
    /// Number of particles
    #[arg(long)]
    particles: Option<usize>,
}

impl FilterOverrides {
    fn apply(&self, config: &mut InferenceConfig) {
        if let Some(filter) = self.filter {
            config.filter = filter;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(particles) = self.particles {
            config.parameters.num_particles = particles;
        }
    }
}

#[derive(Args, Clone, Debug)]
struct ReplayArgs {
    /// Road network JSON file
    #[arg(short, long, value_parser)]
    network: PathBuf,
    /// Input CSV file or directory containing CSV files
    #[arg(short, long, value_parser)]
    input: PathBuf,
    /// Output directory for per-vehicle result files
    #[arg(short, long, value_parser)]
    output: PathBuf,
    #[command(flatten)]
    overrides: FilterOverrides,
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Road network JSON file
    #[arg(short, long, value_parser)]
    network: PathBuf,
    /// Comma separated edge ids of the route, in driving order
    #[arg(long, value_delimiter = ',', required = true)]
    route: Vec<u32>,
    /// Output directory for the result file
    #[arg(short, long, value_parser)]
    output: PathBuf,
    /// Vehicle id used for the simulated fixes
    #[arg(long, default_value = "sim-vehicle")]
    vehicle_id: String,
    /// Constant speed along the route (m/s)
    #[arg(long, default_value_t = 10.0)]
    speed: f64,
    /// Time between fixes (s)
    #[arg(long, default_value_t = 5.0)]
    interval: f64,
    /// Horizontal GPS noise, one sigma (m)
    #[arg(long, default_value_t = 5.0)]
    gps_std: f64,
    /// Reported speed noise, one sigma (m/s)
    #[arg(long, default_value_t = 0.5)]
    speed_std: f64,
    /// Start time of the drive (RFC 3339); the current time when omitted
    #[arg(long)]
    start: Option<DateTime<Utc>>,
    /// Record ground truth only, without running the filter
    #[arg(long)]
    truth_only: bool,
    #[command(flatten)]
    overrides: FilterOverrides,
}

#[derive(Args, Clone, Debug)]
struct CreateConfigArgs {
    /// Output path of the configuration file; the extension picks the format
    #[arg(short, long, value_parser, default_value = "roadtrack.toml")]
    output: PathBuf,
}

fn load_config(path: Option<&PathBuf>) -> Result<InferenceConfig> {
    let config = match path {
        Some(path) => InferenceConfig::from_file(path)
            .with_context(|| format!("cannot read configuration '{}'", path.display()))?,
        None => InferenceConfig::default(),
    };
    Ok(config)
}

fn load_network(path: &PathBuf) -> Result<Arc<dyn RoadNetwork>> {
    validate_input_path(path)?;
    let network = InMemoryRoadNetwork::from_json(path)
        .with_context(|| format!("cannot load road network '{}'", path.display()))?;
    info!(
        "Loaded road network with {} edges from {}",
        network.len(),
        path.display()
    );
    Ok(Arc::new(network))
}

/// Replays keep the whole result history so it can be written out.
fn keep_history(config: &mut InferenceConfig) {
    if config.info_level == InfoLevel::SingleResult {
        config.info_level = InfoLevel::AllResults;
    }
}

fn run_replay(args: &ReplayArgs, mut config: InferenceConfig) -> Result<()> {
    args.overrides.apply(&mut config);
    keep_history(&mut config);
    config.parameters.validate()?;
    validate_output_path(&args.output)?;
    let network = load_network(&args.network)?;
    let registry = InstanceRegistry::new(Arc::new(config), network);

    for input_file in get_csv_files(&args.input)? {
        info!("Processing file: {}", input_file.display());
        let records = FixRecord::from_csv(&input_file)
            .with_context(|| format!("cannot read fixes from '{}'", input_file.display()))?;
        let mut observations = Vec::with_capacity(records.len());
        for (row, record) in records.iter().enumerate() {
            match record.to_observation() {
                Ok(observation) => observations.push(observation),
                Err(e) => warn!("{} row {}: {}, skipped", input_file.display(), row + 1, e),
            }
        }
        info!("Read {} fixes from {}", observations.len(), input_file.display());

        for (vehicle_id, outcomes) in registry.process_records(observations) {
            let accepted = outcomes
                .iter()
                .filter(|o| o.as_ref().is_ok_and(UpdateOutcome::is_accepted))
                .count();
            for e in outcomes.iter().filter_map(|o| o.as_ref().err()) {
                error!("vehicle {}: {}", vehicle_id, e);
            }
            info!(
                "vehicle {}: {} of {} fixes accepted",
                vehicle_id,
                accepted,
                outcomes.len()
            );
        }
    }

    for vehicle_id in registry.vehicle_ids() {
        if let Some(instance) = registry.get(&vehicle_id) {
            let file = write_results(&args.output, &instance)?;
            info!("Results for {} written to {}", vehicle_id, file.display());
        }
    }
    Ok(())
}

fn run_simulate(args: &SimulateArgs, mut config: InferenceConfig) -> Result<()> {
    args.overrides.apply(&mut config);
    keep_history(&mut config);
    config.parameters.validate()?;
    validate_output_path(&args.output)?;
    let network = load_network(&args.network)?;
    let route: Vec<Arc<RoadEdge>> = args
        .route
        .iter()
        .map(|id| {
            network
                .edge_info(EdgeId(*id))
                .with_context(|| format!("edge {id} is not part of the road network"))
        })
        .collect::<Result<_>>()?;

    let params = DriveParameters {
        speed_mps: args.speed,
        interval_s: args.interval,
        gps_std_m: args.gps_std,
        speed_std_mps: args.speed_std,
    };
    let seed = config.seed;
    let start = args.start.unwrap_or_else(Utc::now);
    let fixes = simulate_drive(&args.vehicle_id, &route, network.projection(), start, &params, seed)?;
    info!(
        "Simulated {} fixes for {} along {} edges",
        fixes.len(),
        args.vehicle_id,
        route.len()
    );

    let instance = InferenceInstance::new(&args.vehicle_id, Arc::new(config), network);
    for fix in fixes {
        instance.update_with_truth(&fix.truth, fix.observation, !args.truth_only)?;
    }

    let file = write_results(&args.output, &instance)?;
    info!("Results written to {}", file.display());
    let errors: Vec<f64> = instance
        .result_records()
        .iter()
        .filter_map(|record| {
            roadtrack::sim::ResultRow::from_record(instance.vehicle_id(), record).error_m
        })
        .collect();
    if !errors.is_empty() {
        let mean = errors.iter().sum::<f64>() / errors.len() as f64;
        let max = errors.iter().cloned().fold(0.0, f64::max);
        info!("Position error: mean {:.2} m, max {:.2} m", mean, max);
    }
    Ok(())
}

fn create_config_file(args: &CreateConfigArgs) -> Result<()> {
    if args.output.exists() {
        bail!("'{}' already exists", args.output.display());
    }
    InferenceConfig::default()
        .to_file(&args.output)
        .with_context(|| format!("cannot write configuration '{}'", args.output.display()))?;
    info!("Template configuration written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;
    let config = load_config(cli.config.as_ref())?;

    match &cli.command {
        Command::Replay(args) => run_replay(args, config),
        Command::Simulate(args) => run_simulate(args, config),
        Command::CreateConfig(args) => create_config_file(args),
    }
}
