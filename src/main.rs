//! Governor daemon entry point.
//!
//! Binds the IPC endpoint (which doubles as the single-instance mutex),
//! constructs the token pool from loaded configuration, and runs the
//! accept loop until shutdown. A second instance starting while one is
//! already running exits cleanly with status 0 — the spec treats the
//! existing instance as authoritative, not an error condition.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use build_governor::config::Settings;
use build_governor::error::GovernorError;
use build_governor::ipc;
use build_governor::logging::{self, OutputFormat, TracingConfig};
use build_governor::memory_probe::MemoryProbe;
use build_governor::pool::TokenPool;

/// Build-pressure-aware admission controller for parallel compiles/links.
#[derive(Parser, Debug)]
#[command(name = "build-governor", version)]
struct Cli {
    /// Run detached from a console, with compact log output and idle
    /// auto-shutdown. This is the mode shims auto-start.
    #[arg(long)]
    background: bool,

    /// Run as an OS-managed service (implies `--background`'s logging and
    /// idle behavior, distinguished only for service-manager integration).
    #[arg(long)]
    service: bool,

    /// Path to a TOML configuration file. Defaults to `build-governor.toml`
    /// in the current directory if present.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let quiet = cli.background || cli.service;

    let settings = match cli
        .config
        .clone()
        .map(Settings::load_from)
        .unwrap_or_else(Settings::load)
    {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("build-governor: configuration error: {e:#}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let format = if quiet {
        OutputFormat::Compact
    } else {
        OutputFormat::Pretty
    };
    logging::init(&TracingConfig::from_log_level(&settings.log_level, format));

    let listener = match ipc::bind().await {
        Ok(listener) => listener,
        Err(GovernorError::IpcUnavailable(reason)) => {
            tracing::info!(%reason, "another governor instance is authoritative, exiting");
            return std::process::ExitCode::SUCCESS;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to bind governor IPC endpoint");
            return std::process::ExitCode::FAILURE;
        }
    };

    let probe = Arc::new(MemoryProbe::new());
    let pool = Arc::new(TokenPool::new(
        probe,
        settings.budget.clone(),
        settings.classifier,
    ));

    let idle_shutdown = cli
        .background
        .then(|| Duration::from_secs(settings.idle_shutdown_minutes * 60));

    tracing::info!(
        background = cli.background,
        service = cli.service,
        idle_shutdown_minutes = settings.idle_shutdown_minutes,
        "governor started"
    );

    let maintenance_interval = Duration::from_millis(settings.maintenance_interval_ms);
    build_governor::server::run(pool, listener, idle_shutdown, maintenance_interval).await;

    tracing::info!("governor shut down");
    std::process::ExitCode::SUCCESS
}
