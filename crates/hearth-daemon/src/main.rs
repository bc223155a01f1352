//! Hearth Daemon
//!
//! Runs the gardener tick loop and scheduled-item delivery against one
//! memory store:
//! - Light tick every `gardener.tick_secs` (default 300 s)
//! - Sleep tick once a day inside quiet hours
//! - Due nudges and tasks claimed and delivered after every tick

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

use hearth_core::HearthConfig;
use hearth_daemon::{init_logging, Runtime};

/// Hearth background daemon
#[derive(Parser)]
#[command(name = "hearth-daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tick loop and scheduled-item delivery for the Hearth memory store")]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory, overrides config and HEARTH_DATA_DIR
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Run a single tick and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_json);

    info!("Hearth daemon v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = match HearthConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(dir) = args.data_dir {
        config.store.data_dir = Some(dir);
    }

    let runtime = match Runtime::open(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start: {:#}", e);
            std::process::exit(1);
        }
    };

    if args.once {
        run_tick(&runtime).await;
        return;
    }

    let period = Duration::from_secs(runtime.config.gardener.tick_secs.max(1));
    info!(
        tick_secs = period.as_secs(),
        quiet_start = runtime.config.gardener.quiet_start,
        quiet_end = runtime.config.gardener.quiet_end,
        dial = %runtime.config.gaps.dial,
        "Tick loop running"
    );

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => run_tick(&runtime).await,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
        }
    }

    info!("Hearth daemon stopped");
}

/// Gardener tick, then delivery of whatever is due
async fn run_tick(runtime: &Runtime) {
    let now = Utc::now();
    let report = runtime.gardener.tick(now).await;
    if let Some(sleep) = &report.sleep {
        info!(
            fused = sleep.fused,
            insights = sleep.insights,
            gap_items = sleep.gap_items,
            "Sleep tick ran"
        );
    }

    let handler = runtime.handler();
    match runtime.gardener.scheduler().run_due(Utc::now(), &handler).await {
        Ok(run) if run.claimed > 0 => info!(
            claimed = run.claimed,
            fired = run.fired,
            released = run.released,
            recurring = run.recurring,
            stranded = run.stranded,
            "Delivered due items"
        ),
        Ok(_) => {}
        Err(e) => warn!("Delivery pass failed: {}", e),
    }
}
