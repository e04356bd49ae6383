//! D2D Data Plane Scenario Simulator
//!
//! Loads a scenario, wires one connection multiplexer per node to a shared
//! registry and event queue, runs it and prints a JSON report.

mod config;
mod harness;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use config::ScenarioConfig;
use harness::Harness;

/// D2D flow multiplexing scenario simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the scenario file (.yml, .yaml or .toml)
    #[arg(short, long, default_value = "scenarios/highway.yml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the scenario
    #[arg(short, long)]
    log_level: Option<String>,

    /// Seed override for the flow start offsets
    #[arg(long)]
    seed: Option<u64>,

    /// Simulated duration override in milliseconds
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Write the JSON report here instead of stdout
    #[arg(short, long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut scenario = ScenarioConfig::from_file(&args.config)?;

    // Initialize logging
    let level = args
        .log_level
        .clone()
        .or_else(|| scenario.log.level.clone())
        .unwrap_or_else(|| "info".to_string());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting D2D scenario simulator");
    info!("Scenario file: {}", args.config.display());

    if let Some(seed) = args.seed {
        scenario.simulation.seed = seed;
    }
    if let Some(duration_ms) = args.duration_ms {
        scenario.simulation.duration_ms = duration_ms;
    }

    info!("Scenario configuration:");
    info!("  Name: {}", scenario.name);
    info!("  Nodes: {}", scenario.nodes.len());
    info!("  Flows: {}", scenario.flows.len());
    info!("  Mode switches: {}", scenario.mode_switches.len());
    info!("  Duration: {} ms, seed {}", scenario.simulation.duration_ms, scenario.simulation.seed);

    let run = tokio::task::spawn_blocking(move || Harness::build(scenario)?.run());

    // The run is pure computation; Ctrl-C abandons it
    let report = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, abandoning the run");
            return Ok(());
        }
        result = run => match result? {
            Ok(report) => report,
            Err(e) => {
                error!("Scenario failed: {:#}", e);
                return Err(e);
            }
        },
    };

    let json = serde_json::to_string_pretty(&report)?;
    match &args.report {
        Some(path) => {
            tokio::fs::write(path, json).await?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }

    for node in &report.nodes {
        info!(
            "Node {}: submitted={} sent={} delivered={} drops(routing={}, overflow={}, rx={})",
            node.id,
            node.stats.submitted,
            node.stats.pdus_sent,
            node.stats.delivered,
            node.stats.routing_drops,
            node.stats.overflow_drops,
            node.stats.rx_dropped
        );
    }
    info!("Simulation complete at {}", chrono::Utc::now().to_rfc3339());
    Ok(())
}
