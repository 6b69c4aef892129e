//! Access logging middleware.
//!
//! Emits one `http request` event per request after the handler returns,
//! with the method, path, effective status, duration and request id. The
//! level follows the status: `error` for 5xx, `warn` for 4xx, `info`
//! otherwise. Request counts and latencies are also recorded as metrics.

use crate::context::{RequestExt, REQUEST_ID_HEADER};
use crate::handler::{handler_fn, BoxHandler};
use crate::logger::Logger;
use crate::middleware::Middleware;
use crate::writer::{ResponseWriter, StatusWriter};
use std::time::Instant;

/// Logs every request with its outcome.
#[derive(Debug, Clone, Default)]
pub struct LoggingMiddleware {
    logger: Logger,
}

impl LoggingMiddleware {
    /// Creates the middleware.
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        let logger = self.logger.clone();

        handler_fn(move |w, req| {
            let start = Instant::now();
            let method = req.method().clone();
            let path = req.uri().path().to_owned();
            let inbound_id = req.request_id().map(str::to_owned);

            let mut sw = StatusWriter::new(w);
            next.serve(&mut sw, req);

            let duration = start.elapsed();
            let status = sw.effective_status();
            let request_id = inbound_id.or_else(|| {
                sw.headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            });

            sluice_telemetry::metrics::record_request(method.as_str(), status.as_u16(), duration);

            let duration_ms = duration.as_secs_f64() * 1000.0;
            let status = status.as_u16();
            let request_id = request_id.as_deref();
            logger.scope(|| {
                if status >= 500 {
                    tracing::error!(%method, %path, status, duration_ms, request_id, "http request");
                } else if status >= 400 {
                    tracing::warn!(%method, %path, status, duration_ms, request_id, "http request");
                } else {
                    tracing::info!(%method, %path, status, duration_ms, request_id, "http request");
                }
            });
        })
    }
}
