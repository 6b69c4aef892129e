//! Structured log sink for Sluice services.
//!
//! Middlewares never reach for a global logger themselves; they emit `tracing`
//! events, optionally under an injected [`Dispatch`]. This module builds those
//! dispatchers and installs the process-wide default.
//!
//! # Example
//!
//! ```rust,ignore
//! use sluice_telemetry::logging::{LogConfig, init_logging};
//!
//! init_logging(&LogConfig::default())?;
//! tracing::info!(method = "GET", path = "/", status = 200, "http request");
//! ```

use crate::error::TelemetryError;
use crate::TelemetryResult;
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Whether logging is enabled.
    pub enabled: bool,

    /// Minimum level: `DEBUG`, `INFO`, `WARN`/`WARNING` or `ERROR`.
    pub level: String,

    /// Whether to output JSON lines instead of the pretty format.
    pub json_format: bool,

    /// Whether to include file/line info.
    pub file_line_info: bool,

    /// Whether to include the event target (module path).
    pub include_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "INFO".to_string(),
            json_format: true,
            file_line_info: false,
            include_target: true,
        }
    }
}

impl LogConfig {
    /// Creates a development configuration with human-readable output.
    #[must_use]
    pub fn development() -> Self {
        Self {
            enabled: true,
            level: "DEBUG".to_string(),
            json_format: false,
            file_line_info: true,
            include_target: true,
        }
    }

    /// Creates a production configuration with JSON output.
    #[must_use]
    pub fn production() -> Self {
        Self::default()
    }
}

/// Maps a textual level to a filter.
///
/// Matching is case-insensitive; anything unrecognized falls back to `INFO`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_ascii_uppercase().as_str() {
        "DEBUG" => LevelFilter::DEBUG,
        "WARN" | "WARNING" => LevelFilter::WARN,
        "ERROR" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Builds a dispatcher that writes formatted events to `make_writer`.
///
/// The result can be installed globally or handed to a middleware logger so
/// its diagnostics land somewhere other than the process default.
pub fn dispatch<W>(config: &LogConfig, make_writer: W) -> Dispatch
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::default().add_directive(parse_level(&config.level).into());
    let builder = tracing_subscriber::fmt()
        .with_writer(make_writer)
        .with_env_filter(filter)
        .with_file(config.file_line_info)
        .with_line_number(config.file_line_info)
        .with_target(config.include_target);

    if config.json_format {
        Dispatch::new(builder.json().finish())
    } else {
        Dispatch::new(builder.pretty().finish())
    }
}

/// Installs the process-wide log sink on stdout.
///
/// # Errors
///
/// Returns `TelemetryError::LoggingInit` if a global default is already set.
pub fn init_logging(config: &LogConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    tracing::dispatcher::set_global_default(dispatch(config, std::io::stdout))
        .map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}
