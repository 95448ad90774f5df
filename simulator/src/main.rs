//! Penny Simulator
//!
//! Drives the settlement engine through contention and failure scenarios and
//! prints a JSON report.

use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use penny_settlement::EngineConfig;

mod controller;
mod metrics;
mod scenario;

use controller::SimulationController;
use scenario::ScenarioOptions;

/// Penny Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Penny ledger contention and failure simulator")]
struct Args {
    /// Scenario to run (contention, round-trip, failure-recovery, random)
    #[arg(short, long, default_value = "contention")]
    scenario: String,

    /// Accounts touched by the random scenario
    #[arg(short, long, default_value = "5")]
    accounts: usize,

    /// Operations in the random scenario
    #[arg(short, long, default_value = "200")]
    operations: usize,

    /// Concurrent withdrawals in the contention scenario
    #[arg(long, default_value = "50")]
    burst: usize,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Verification delay before each withdrawal settles, in milliseconds
    #[arg(long, default_value = "0")]
    verification_delay_ms: u64,

    /// Use Postgres instead of in-memory storage
    #[arg(long)]
    database_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = EngineConfig::from_env();
    config.settlement.verification_delay = Duration::from_millis(args.verification_delay_ms);
    if let Some(url) = args.database_url.clone() {
        config.storage.database_url = Some(url);
    }

    // Logs go to stderr, the report to stdout.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(
            args.json_logs
                .then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)),
        )
        .with(
            (!args.json_logs)
                .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
        )
        .init();

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    info!(scenario = %args.scenario, seed = ?args.seed, "Starting Penny Simulator");

    let mut controller = SimulationController::new(&config, args.seed).await?;

    let options = ScenarioOptions {
        accounts: args.accounts,
        operations: args.operations,
        burst: args.burst,
    };
    let scenario = controller.scenario(&args.scenario, &options)?;
    let report = controller.run_scenario(scenario).await?;

    controller.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    info!(
        accepted = report.requests.accepted,
        rejected = report.requests.rejected,
        withdrawals_confirmed = report.engine.withdrawals_confirmed,
        withdrawals_aborted = report.engine.withdrawals_aborted,
        "Simulation complete"
    );

    if !report.passed() {
        anyhow::bail!("{} assertion(s) failed", report.failed_assertions.len());
    }

    Ok(())
}
