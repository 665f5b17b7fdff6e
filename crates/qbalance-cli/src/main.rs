//! # qbalance CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run the default workload against three in-memory replicas
//! qbalance simulate
//!
//! # Knock replica 1 offline 100ms in, for half a second
//! qbalance simulate --replicas 3 --outage 1 --outage-after-ms 100 --outage-ms 500
//!
//! # Fail fast instead of waiting out outages, with latency-based routing
//! qbalance simulate --mode dont-wait --routing lowest_latency
//!
//! # Validate a config file and print it with defaults filled in
//! qbalance check-config balancer.json
//! ```

use anyhow::Result;
use argh::FromArgs;
use qbalance_cli::simulate::{self, Outage, SimulationOptions};
use qbalance_common::SubmitMode;
use qbalance_router::{BalancerConfig, RoutingStrategy};
use std::path::Path;
use std::time::Duration;

#[derive(FromArgs)]
/// qbalance - read routing and write fan-out over database replicas
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Simulate(SimulateArgs),
    CheckConfig(CheckConfigArgs),
}

/// Arguments for a simulated workload.
///
/// Every replica is an in-memory table. Writes go to every replica, reads to
/// one. The report (JSON on stdout) includes per-replica metrics and status.
#[derive(FromArgs)]
#[argh(subcommand, name = "simulate")]
/// run a workload against in-memory replicas
struct SimulateArgs {
    /// path to a JSON balancer config; defaults are used if omitted
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// number of replicas
    #[argh(option, short = 'r', default = "3")]
    replicas: usize,

    /// number of read commands
    #[argh(option, default = "100")]
    reads: usize,

    /// number of write commands
    #[argh(option, default = "10")]
    writes: usize,

    /// commands in flight at once
    #[argh(option, default = "8")]
    concurrency: usize,

    /// submission mode: wait or dont-wait
    #[argh(option, short = 'm', default = "\"wait\".into()")]
    mode: String,

    /// latency added to every backend call, in milliseconds
    #[argh(option, default = "1")]
    latency_ms: u64,

    /// routing strategy, overriding the config file
    ///
    /// One of round_robin, lowest_latency, fewest_connections.
    #[argh(option)]
    routing: Option<String>,

    /// index of a replica to take offline during the run
    #[argh(option)]
    outage: Option<usize>,

    /// how long after the start the outage begins, in milliseconds
    #[argh(option, default = "100")]
    outage_after_ms: u64,

    /// how long the outage lasts, in milliseconds
    #[argh(option, default = "500")]
    outage_ms: u64,
}

/// Arguments for validating a config file.
#[derive(FromArgs)]
#[argh(subcommand, name = "check-config")]
/// validate a balancer config file
struct CheckConfigArgs {
    /// path to the JSON config file; prints the defaults if omitted
    #[argh(positional)]
    path: Option<String>,
}

fn parse_mode(mode: &str) -> Result<SubmitMode> {
    match mode {
        "wait" => Ok(SubmitMode::Wait),
        "dont-wait" | "dont_wait" => Ok(SubmitMode::DontWait),
        other => Err(anyhow::anyhow!(
            "Invalid mode '{}': expected wait or dont-wait",
            other
        )),
    }
}

fn parse_routing(routing: &str) -> Result<RoutingStrategy> {
    serde_json::from_value(serde_json::Value::String(routing.to_string())).map_err(|_| {
        anyhow::anyhow!(
            "Invalid routing '{}': expected round_robin, lowest_latency or fewest_connections",
            routing
        )
    })
}

fn load_config(path: Option<&str>) -> Result<BalancerConfig> {
    match path {
        Some(path) => BalancerConfig::from_path(Path::new(path))
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path, e)),
        None => Ok(BalancerConfig::default()),
    }
}

/// Turns the parsed arguments into a config and simulation options.
fn simulation_setup(args: &SimulateArgs) -> Result<(BalancerConfig, SimulationOptions)> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(routing) = &args.routing {
        config.routing = parse_routing(routing)?;
        config.validate()?;
    }

    let options = SimulationOptions {
        replicas: args.replicas,
        reads: args.reads,
        writes: args.writes,
        concurrency: args.concurrency,
        mode: parse_mode(&args.mode)?,
        latency: Duration::from_millis(args.latency_ms),
        outage: args.outage.map(|replica| Outage {
            replica,
            after: Duration::from_millis(args.outage_after_ms),
            duration: Duration::from_millis(args.outage_ms),
        }),
    };
    Ok((config, options))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Set default log level to INFO, but allow RUST_LOG env var to override.
    // Logs go to stderr so stdout stays pipeable JSON.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate(args) => {
            let (config, options) = simulation_setup(&args)?;
            tracing::info!(
                "Simulating {} reads and {} writes over {} replicas ({:?} routing)",
                options.reads,
                options.writes,
                options.replicas,
                config.routing
            );
            let report = simulate::run(config, &options).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::CheckConfig(args) => {
            let config = load_config(args.path.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
