//! taskloomd -- runs the orchestrator loop over the configured task store.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tl_core::config::Config;
use tl_daemon::daemon::Daemon;
use tl_telemetry::logging::{self, LogFormat};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "taskloomd", version, about = "Autonomous task orchestrator daemon")]
struct Args {
    /// Config file (defaults to ~/.taskloom/config.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Exit once nothing is running and nothing is ready.
    #[arg(long)]
    drain_when_idle: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path.clone())
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let format = if args.json_logs || config.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Human
    };
    logging::init("taskloomd", &level, format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "taskloom daemon starting"
    );

    let daemon = Daemon::new(config).context("failed to start daemon")?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run(args.drain_when_idle).await;
    Ok(())
}
