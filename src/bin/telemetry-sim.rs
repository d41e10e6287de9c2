//! Simulated fridges for local testing.
//!
//! Usage:
//!   cargo run --bin telemetry-sim -- 1 2 3
//!   cargo run --bin telemetry-sim -- --stall 2 --stall-after 30 1 2 3
//!
//! Each fridge publishes an incrementing heartbeat to the configured
//! telemetry backend and logs door commands written for it.

use clap::Parser;
use fridge_monitor::config::{self, Config, TelemetryBackend};
use fridge_monitor::telemetry::{self, simulation};
use log::{error, info, warn};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "telemetry-sim")]
#[command(about = "Simulate fridges publishing heartbeat telemetry")]
struct Cli {
    /// Telemetry backend to publish to
    #[arg(long, env = "TELEMETRY_BACKEND")]
    backend: Option<TelemetryBackend>,

    /// Heartbeat period in seconds
    #[arg(long, default_value_t = 4)]
    tick_secs: u64,

    /// Fridge account that stops ticking
    #[arg(long)]
    stall: Option<String>,

    /// Seconds before the stalled fridge stops
    #[arg(long, default_value_t = 30)]
    stall_after: u64,

    /// Fridge accounts to simulate
    #[arg(required = true)]
    fridges: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    config::load_dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(backend) = cli.backend {
        config.telemetry.backend = backend;
    }
    if config.telemetry.backend == TelemetryBackend::Memory {
        warn!("Memory backend is process-local; no monitor will see these fridges");
    }

    let store = match telemetry::connect(&config) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to connect telemetry store: {}", e);
            std::process::exit(1);
        }
    };

    let tick = Duration::from_secs(cli.tick_secs);
    let mut tasks = Vec::new();
    for id in &cli.fridges {
        let stall_after = (cli.stall.as_deref() == Some(id.as_str()))
            .then(|| Duration::from_secs(cli.stall_after));
        info!(
            "Simulating fridge {} (tick {:?}, stall after {:?})",
            id, tick, stall_after
        );
        tasks.push(simulation::run_heartbeat_simulation(
            store.clone(),
            id.clone(),
            simulation::SimulatedFridge { tick, stall_after },
        ));
        tasks.push(simulation::run_door_listener(store.clone(), id.clone()));
    }

    info!("Press Ctrl+C to exit");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down...");
    for task in tasks {
        task.abort();
    }
}
