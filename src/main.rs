//! CLI entry point for textile-gateway
//!
//! # Usage
//!
//! Run against the built-in simulated controller, feeding defect events as
//! JSON lines on stdin:
//! ```bash
//! echo '{"detection_id": "cam1-0042", "count": 1, "confidence": 0.93}' \
//!     | textile-gateway run --config config/gateway.toml --simulate
//! ```
//!
//! Check a configuration file:
//! ```bash
//! textile-gateway check-config --config config/gateway.toml
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use textile_gateway::config::GatewayConfig;
use textile_gateway::defects::{DefectEvent, DefectFunnel};
use textile_gateway::error::GatewayError;
use textile_gateway::gateway::Gateway;
use textile_gateway::hardware::{MachineSimulation, RegisterMap, SimulatedController};
use textile_gateway::storage::JsonLinesSink;
use textile_gateway::tracing_setup;

#[derive(Parser)]
#[command(name = "textile-gateway")]
#[command(about = "Machine data-acquisition gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Run {
        /// Configuration file (TOML)
        #[arg(long, default_value = "config/gateway.toml")]
        config: PathBuf,

        /// Use the built-in simulated controller instead of real hardware
        #[arg(long)]
        simulate: bool,
    },

    /// Load, validate and print the effective configuration
    CheckConfig {
        /// Configuration file (TOML)
        #[arg(long, default_value = "config/gateway.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, simulate } => run(config, simulate).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn load(path: &Path) -> Result<GatewayConfig> {
    let config = GatewayConfig::load_from(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!("Configuration OK");
    Ok(())
}

async fn run(path: PathBuf, simulate: bool) -> Result<()> {
    let config = load(&path)?;
    tracing_setup::init_from_config(&config)?;

    if !simulate {
        bail!(
            "no register transport for '{}' is built in; run with --simulate",
            config.link.target
        );
    }

    let (stop, stop_rx) = watch::channel(false);

    let map = RegisterMap::new(config.registers.clone());
    let controller = SimulatedController::new(usize::from(map.block_start() + map.block_len()))
        .with_identity(config.link.target.clone(), config.link.unit_id);
    let simulation = MachineSimulation::new(controller.clone(), map, 5, 30);
    let simulation_task = tokio::spawn(simulation.run(config.poller.interval, stop_rx));
    info!("Simulated controller running");

    let sink = Arc::new(JsonLinesSink::open(&config.storage.path).await?);
    let gateway = Gateway::start(config, Box::new(controller), sink).await?;

    spawn_defect_reader(gateway.defect_funnel());

    signal::ctrl_c().await?;
    info!("Ctrl-C received");
    stop.send_replace(true);

    let metrics = gateway.shutdown().await;
    let _ = simulation_task.await;

    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

/// Feed JSON-lines defect events from stdin into the funnel.
///
/// Runs on a detached thread: a blocking stdin read must not hold up runtime
/// shutdown.
fn spawn_defect_reader(funnel: DefectFunnel) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Reading defect events failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DefectEvent>(&line) {
                // Rejections are logged and counted by the funnel.
                Ok(event) => match funnel.submit(event) {
                    Ok(()) | Err(GatewayError::GateRejection(_)) => {}
                    Err(e) => warn!(error = %e, "Defect event not submitted"),
                },
                Err(e) => warn!(error = %e, "Ignoring malformed defect event"),
            }
        }
    });
}
