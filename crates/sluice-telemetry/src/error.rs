//! Telemetry error types.

use thiserror::Error;

/// Errors that can occur while installing process-level telemetry sinks.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to install the metrics recorder.
    #[error("Failed to initialize metrics: {0}")]
    MetricsInit(String),

    /// Failed to install the log sink.
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    /// Failed to parse the metrics listener address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}
