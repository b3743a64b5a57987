//! Tracing subscriber setup.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// The global subscriber could not be installed.
#[derive(Error, Debug)]
#[error("failed to initialise tracing subscriber: {0}")]
pub struct TelemetryError(String);

/// Map a `LOG_LEVEL` value onto a filter directive.
pub fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
}

/// Install the global fmt subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str) -> Result<(), TelemetryError> {
    let directive = level_directive(level);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("torwatch={directive},{directive}")));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .try_init()
        .map_err(|err| TelemetryError(err.to_string()))
}
