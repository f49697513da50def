//! campx-daemon - marketplace expiry daemon
//!
//! Opens the marketplace store, wires the arbitration engine and the ticket
//! service over it, and runs the expiry sweep until SIGTERM or SIGINT.
//!
//! Configuration comes from a TOML file (see [`campx_core::MarketConfig`]);
//! command-line flags override the store path and sweep interval. With
//! `--once` the daemon runs a single sweep and exits, which suits cron-style
//! deployments.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use campx_core::{MarketConfig, SystemClock, TracingNotifier};
use campx_daemon::services::Services;
use campx_daemon::state::{DaemonStateHandle, SharedState};
use campx_daemon::sweeper;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// campx daemon - durable expiry for the campus marketplace
#[derive(Parser, Debug)]
#[command(name = "campx-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the marketplace database file (`SQLite`)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Seconds between expiry sweeps
    #[arg(long)]
    sweep_interval_secs: Option<u64>,

    /// Run one sweep and exit
    #[arg(long)]
    once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<MarketConfig> {
    let mut config = match &args.config {
        Some(path) => MarketConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => MarketConfig::default(),
    };
    if let Some(path) = &args.database {
        config.store.path.clone_from(path);
    }
    if let Some(secs) = args.sweep_interval_secs {
        config.expiry.interval_secs = secs;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn async_main(args: Args) -> Result<()> {
    init_logging(&args)?;

    let config = load_config(&args)?;
    info!(
        database = %config.store.path.display(),
        interval_secs = config.expiry.interval_secs,
        batch_limit = config.expiry.batch_limit,
        "starting campx-daemon"
    );

    let services = Services::open(&config, Arc::new(TracingNotifier), Arc::new(SystemClock))?;

    if args.once {
        let report = services.scheduler.sweep().await;
        info!(
            resources_expired = report.resources_expired,
            tickets_removed = report.tickets_removed,
            failures = report.failures,
            "single sweep finished"
        );
        return Ok(());
    }

    let state: SharedState = Arc::new(DaemonStateHandle::new());

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    let sweeper_task = tokio::spawn(sweeper::run(
        Arc::clone(&services.scheduler),
        Arc::clone(&state),
        services.scheduler.interval(),
    ));

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
    state.request_shutdown();

    // The loop notices the flag on its next tick; don't wait that long.
    sweeper_task.abort();
    if let Err(err) = sweeper_task.await {
        if !err.is_cancelled() {
            warn!(error = %err, "expiry sweeper ended abnormally");
        }
    }

    info!(
        uptime_secs = state.uptime_secs(),
        sweeps = state.sweeps(),
        resources_expired = state.resources_expired(),
        sweep_failures = state.sweep_failures(),
        "campx-daemon stopped"
    );
    Ok(())
}
