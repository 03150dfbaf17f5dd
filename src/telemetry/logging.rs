//! Logging configuration and initialization.
//!
//! Sources, highest priority first: `RUST_LOG`, the `[logging]` section of
//! the lock file, then `info`. Output goes to stderr so operator commands
//! can print JSON on stdout.

use crate::config::LoggingLock;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
        }
    }
}

impl From<&LoggingLock> for LogConfig {
    fn from(lock: &LoggingLock) -> Self {
        Self {
            level: parse_level(&lock.level),
            format: LogFormat::parse(&lock.format),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// One object per line, with span close events.
    Json,
}

impl LogFormat {
    /// Unknown names fall back to pretty.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "compact" => LogFormat::Compact,
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

fn parse_level(level: &str) -> Level {
    level.trim().parse().unwrap_or(Level::INFO)
}

/// This crate at `level`, dependencies at warn.
fn directives(level: Level) -> String {
    format!("warn,policyd={}", level.as_str().to_ascii_lowercase())
}

fn env_filter(config: &LogConfig) -> EnvFilter {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(directives(config.level)),
    }
}

/// Installs the global subscriber. Only the first call has any effect;
/// returns whether this call installed it.
///
/// ```ignore
/// let config = LogConfig { level: Level::DEBUG, format: LogFormat::Json };
/// init_logging(Some(&config));
/// ```
pub fn init_logging(config: Option<&LogConfig>) -> bool {
    let config = config.cloned().unwrap_or_default();
    let registry = tracing_subscriber::registry().with(env_filter(&config));

    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    installed.is_ok()
}
