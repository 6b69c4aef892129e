//! Prometheus metrics for Sluice middlewares.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `sluice_requests_total` | Counter | `method`, `status` | Requests seen by the access log |
//! | `sluice_request_duration_seconds` | Histogram | `method` | Request latency |
//! | `sluice_rate_limited_total` | Counter | - | Requests rejected with 429 |
//! | `sluice_panics_recovered_total` | Counter | `after_write` | Handler panics caught by recovery |
//! | `sluice_compression_decisions_total` | Counter | `decision` | Compress/skip outcomes |
//!
//! Recording is a no-op until a recorder is installed, so middlewares call
//! these functions unconditionally.

use crate::error::TelemetryError;
use crate::TelemetryResult;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

/// Global metrics handle for rendering.
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names.
pub mod names {
    /// Requests seen by the access log.
    pub const REQUESTS_TOTAL: &str = "sluice_requests_total";
    /// Request latency histogram.
    pub const REQUEST_DURATION_SECONDS: &str = "sluice_request_duration_seconds";
    /// Requests rejected by the token bucket.
    pub const RATE_LIMITED_TOTAL: &str = "sluice_rate_limited_total";
    /// Handler panics caught by recovery.
    pub const PANICS_RECOVERED_TOTAL: &str = "sluice_panics_recovered_total";
    /// Compression writer decisions.
    pub const COMPRESSION_DECISIONS_TOTAL: &str = "sluice_compression_decisions_total";
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the Prometheus exporter is installed.
    pub enabled: bool,

    /// Address to expose metrics on (e.g., "0.0.0.0:9090").
    pub addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Installs the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns `TelemetryError::InvalidAddress` for an unparsable address and
/// `TelemetryError::MetricsInit` if a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .addr
        .parse()
        .map_err(|e| TelemetryError::InvalidAddress(format!("{}: {e}", config.addr)))?;

    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(addr)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    let handle = recorder.handle();

    metrics::set_global_recorder(recorder)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!(error = ?e, "metrics exporter stopped");
        }
    });

    let _ = METRICS_HANDLE.set(handle);
    register_metric_descriptions();

    Ok(())
}

/// Renders metrics in Prometheus format, or `None` before initialization.
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn register_metric_descriptions() {
    describe_counter!(
        names::REQUESTS_TOTAL,
        "Total number of HTTP requests processed"
    );
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Requests rejected by the rate limiter"
    );
    describe_counter!(
        names::PANICS_RECOVERED_TOTAL,
        "Handler panics recovered by the recovery middleware"
    );
    describe_counter!(
        names::COMPRESSION_DECISIONS_TOTAL,
        "Compression decisions by outcome"
    );
}

/// Records a completed request.
pub fn record_request(method: &str, status: u16, duration: Duration) {
    counter!(
        names::REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Records a request rejected by the rate limiter.
pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

/// Records a recovered handler panic.
pub fn record_panic_recovered(after_write: bool) {
    counter!(names::PANICS_RECOVERED_TOTAL, "after_write" => after_write.to_string())
        .increment(1);
}

/// Records a compression decision (`"compress"` or `"skip"`).
pub fn record_compression_decision(decision: &'static str) {
    counter!(names::COMPRESSION_DECISIONS_TOTAL, "decision" => decision).increment(1);
}
