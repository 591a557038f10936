//! Logging initialization.
//!
//! Library code only emits `tracing` events. Binaries and test harnesses call
//! [`init_logging`] once at startup to install a subscriber.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Initialize compact logging to stderr.
///
/// The filter comes from `RUST_LOG` when set, otherwise from `level`.
///
/// ```ignore
/// vault_config::init_logging("info");
/// tracing::info!("vault ready");
/// ```
pub fn init_logging(level: &str) {
    init_logging_with_format(level, LogFormat::Compact);
}

/// Initialize logging with an explicit line format.
///
/// Calling this more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init_logging_with_format(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(parse_level(level).as_str().to_ascii_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let result = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
