//! Logging initialization using tracing.

use anyhow::{anyhow, Result};
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable, one event per line
    #[default]
    Pretty,
    /// One JSON object per line, for log shipping
    Json,
}

/// Build the level filter. `RUST_LOG` wins over the CLI level.
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the tracing subscriber with the specified log level.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
///
/// # Example
/// ```no_run
/// templar_common::init_logging("info").unwrap();
/// ```
pub fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(build_filter(level))
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

/// Initialize logging with JSON output format.
/// Suitable for runs driven by automation with log aggregation.
pub fn init_logging_json(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(build_filter(level))
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_writer(std::io::stderr)
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

impl LogFormat {
    /// Initialize the global subscriber in this format.
    pub fn init(self, level: &str) -> Result<()> {
        match self {
            LogFormat::Pretty => init_logging(level),
            LogFormat::Json => init_logging_json(level),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let _ = init_logging("debug");
        assert!(init_logging("debug").is_err());
    }
}
