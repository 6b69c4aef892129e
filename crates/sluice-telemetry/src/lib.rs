//! Process-level observability sinks for Sluice services.
//!
//! Sluice middlewares emit `tracing` events and `metrics` samples; this crate
//! decides where they go:
//!
//! - **Logging**: JSON (production) or pretty (development) lines via
//!   `tracing-subscriber`, filtered by a `DEBUG/INFO/WARN/ERROR` level
//! - **Metrics**: a Prometheus exporter via `metrics-exporter-prometheus`
//!
//! # Example
//!
//! ```rust,ignore
//! use sluice_telemetry::{TelemetryConfig, init_telemetry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TelemetryConfig::builder()
//!         .log_level("INFO")
//!         .metrics_addr("0.0.0.0:9090")
//!         .build();
//!
//!     init_telemetry(&config).expect("telemetry");
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::{TelemetryConfig, TelemetryConfigBuilder};
pub use error::TelemetryError;
pub use logging::{init_logging, parse_level, LogConfig};
pub use metrics::{init_metrics, render_metrics, MetricsConfig};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Installs the log sink, then the metrics exporter.
///
/// # Errors
///
/// Returns `TelemetryError` if either sink fails to install.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryResult<()> {
    init_logging(&config.logging)?;
    init_metrics(&config.metrics)?;
    Ok(())
}
