//! Tracing initialization.
//!
//! Mirrors `tracing_v4.rs`'s `TracingConfig`/`OutputFormat` shape: a small
//! config struct with a `Default`, a `from_log_level` constructor, and an
//! `init` that installs a global subscriber. The governor's quiet modes
//! (`--background`, `--service`) select `Compact` instead of `Pretty`;
//! verbosity itself is controlled separately via `RUST_LOG`.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Pretty,
    Compact,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
}

impl TracingConfig {
    pub fn from_log_level(log_level: &str, format: OutputFormat) -> Self {
        let level = Level::from_str(log_level).unwrap_or(Level::INFO);
        Self { level, format }
    }
}

/// Installs the global subscriber. Also bridges the legacy `log` facade
/// (used by dependencies that log through `log` rather than `tracing`) so
/// nothing is silently dropped.
pub fn init(config: &TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let _ = tracing_log::LogTracer::init();

    let subscriber = fmt().with_env_filter(filter);
    match config.format {
        OutputFormat::Pretty => subscriber.with_ansi(true).pretty().init(),
        OutputFormat::Compact => subscriber.with_ansi(false).compact().init(),
    }
}
