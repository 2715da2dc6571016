//! # loadramp
//!
//! Command-line runner for arrival-rate load tests against a publish/fetch
//! message broker.
//!
//! ## Usage
//!
//! ```bash
//! # Run the default ramp against a local broker
//! loadramp --target localhost:50043
//!
//! # Dry run against the in-process broker with a custom profile
//! loadramp --config loadramp.toml --target memory --output results.json
//!
//! # Show the effective configuration
//! loadramp --config loadramp.toml print-config
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use loadramp_core::{LoadTestRunner, RunConfig, RunSummary};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "loadramp")]
#[command(version)]
#[command(about = "Arrival-rate load generator for publish/fetch brokers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path; built-in defaults are used when it does not exist
    #[arg(short, long, default_value = "loadramp.toml", env = "LOADRAMP_CONFIG")]
    config: PathBuf,

    /// Broker endpoint (`host:port`, URI, or `memory`)
    #[arg(short, long)]
    target: Option<String>,

    /// Worker pool ceiling
    #[arg(long)]
    max_workers: Option<usize>,

    /// Scheduler tick resolution, e.g. `10ms`
    #[arg(long, value_parser = humantime::parse_duration)]
    tick: Option<Duration>,

    /// Base seed for per-worker random streams
    #[arg(long)]
    seed: Option<u64>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Output results to JSON file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write final aggregates in Prometheus text format
    #[arg(long)]
    prometheus_out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured profile (default)
    Run,

    /// Print the effective configuration as TOML and exit
    PrintConfig,

    /// Validate the configuration and exit
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let config = match load_config(&cli.config).and_then(|c| apply_overrides(c, &cli)) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return Err(e);
        }
    };

    match cli.command.as_ref().unwrap_or(&Commands::Run) {
        Commands::PrintConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Validate => {
            config.validate()?;
            info!("Configuration is valid");
            Ok(())
        }
        Commands::Run => {
            let summary = run(config).await?;
            summary.print_report();
            write_outputs(&summary, cli.output.as_deref(), cli.prometheus_out.as_deref())?;

            if summary.passed() {
                Ok(())
            } else {
                for t in summary.failed_thresholds() {
                    warn!("Threshold failed: {}: {} ({:?})", t.metric, t.threshold, t.status);
                }
                std::process::exit(1);
            }
        }
    }
}

async fn run(config: RunConfig) -> anyhow::Result<RunSummary> {
    let connector = loadramp_broker::connector_for(&config.broker)
        .with_context(|| format!("invalid broker target `{}`", config.broker.target))?;

    // an endpoint that is down before the first tick is a setup error, not a sample
    let mut channel = connector
        .connect()
        .await
        .with_context(|| format!("broker {} is unreachable", connector.endpoint()))?;
    channel.close().await;

    let runner = LoadTestRunner::new(config, connector)?;
    info!("loadramp v{}", env!("CARGO_PKG_VERSION"));
    Ok(runner.run().await?)
}

fn init_logging(verbose: bool, json: bool) {
    let env_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(false).with_file(false))
            .init();
    }
}

/// Read a TOML run configuration, falling back to defaults when the file is absent
fn load_config(path: &Path) -> anyhow::Result<RunConfig> {
    if !path.exists() {
        info!("No config at {}, using defaults", path.display());
        return Ok(RunConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: RunConfig =
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

fn apply_overrides(mut config: RunConfig, cli: &Cli) -> anyhow::Result<RunConfig> {
    if let Some(target) = &cli.target {
        config.broker.target = target.clone();
    }
    if let Some(max) = cli.max_workers {
        config.profile.max_workers = max;
        config.profile.preallocated_workers = config.profile.preallocated_workers.min(max);
    }
    if let Some(tick) = cli.tick {
        config.tick = tick;
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }
    config.validate()?;
    Ok(config)
}

fn write_outputs(
    summary: &RunSummary,
    json_path: Option<&Path>,
    prometheus_path: Option<&Path>,
) -> anyhow::Result<()> {
    if let Some(path) = json_path {
        let json = serde_json::to_string_pretty(summary)?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Results saved to {}", path.display());
    }
    if let Some(path) = prometheus_path {
        let text = summary.to_prometheus()?;
        std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Prometheus metrics saved to {}", path.display());
    }
    Ok(())
}
