//! Gzip response compression.
//!
//! Compression is negotiated from `Accept-Encoding` and decided per response
//! by [`GzipResponseWriter`], which buffers the first bytes of the body before
//! committing to gzip or passthrough. Every response gets
//! `Vary: Accept-Encoding`, compressed or not.
//!
//! ## Example
//!
//! ```
//! use sluice_middleware::stages::CompressionMiddleware;
//!
//! let compression = CompressionMiddleware::builder()
//!     .min_size(512)
//!     .level(9)
//!     .build();
//! ```

mod pool;
mod sniff;
mod writer;

pub use pool::{EncoderPool, GzipStream, PooledEncoder};
pub use sniff::detect_content_type;
pub use writer::{is_compressed_type, Decision, GzipResponseWriter};

use crate::handler::{handler_fn, BoxHandler};
use crate::logger::Logger;
use crate::middleware::Middleware;
use http::header::{ACCEPT_ENCODING, VARY};
use http::{HeaderMap, HeaderValue};
use serde::Deserialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Whether an `Accept-Encoding` value admits gzip.
///
/// Tokens match case-insensitively. A `q` parameter that parses to zero
/// (`q=0`, `q=0.0`, `q=0.000`) rejects gzip even though the token is present.
#[allow(clippy::float_cmp)]
pub fn accepts_gzip(header: &str) -> bool {
    for part in header.split(',') {
        let mut pieces = part.trim().split(';');
        let encoding = pieces.next().unwrap_or_default().trim();
        if !encoding.eq_ignore_ascii_case("gzip") {
            continue;
        }

        for param in pieces {
            let (key, value) = param.split_once('=').unwrap_or((param, ""));
            if key.trim().eq_ignore_ascii_case("q")
                && value.trim().parse::<f64>().is_ok_and(|q| q == 0.0)
            {
                return false;
            }
        }
        return true;
    }
    false
}

fn request_accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(accepts_gzip)
}

/// Compression settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Bytes buffered before the compress-or-skip decision.
    pub min_size: usize,
    /// Gzip level, 0 (store) to 9 (best).
    pub level: u32,
    /// Idle encoders kept for reuse.
    pub max_idle_encoders: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            min_size: 256,
            level: 6,
            max_idle_encoders: 64,
        }
    }
}

/// Gzip-compresses responses for clients that accept it.
#[derive(Debug, Clone)]
pub struct CompressionMiddleware {
    min_size: usize,
    pool: Arc<EncoderPool>,
    logger: Logger,
}

impl Default for CompressionMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionMiddleware {
    /// Creates the middleware with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder.
    pub fn builder() -> CompressionBuilder {
        CompressionBuilder::default()
    }

    /// Creates the middleware from configuration.
    pub fn from_config(config: &CompressionConfig, logger: Logger) -> Self {
        CompressionBuilder {
            config: config.clone(),
            logger,
        }
        .build()
    }

    /// The shared encoder pool.
    pub fn pool(&self) -> &Arc<EncoderPool> {
        &self.pool
    }
}

impl Middleware for CompressionMiddleware {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        let pool = Arc::clone(&self.pool);
        let min_size = self.min_size;
        let logger = self.logger.clone();

        handler_fn(move |w, req| {
            w.headers_mut()
                .append(VARY, HeaderValue::from_static("Accept-Encoding"));

            if !request_accepts_gzip(req.headers()) {
                next.serve(w, req);
                return;
            }

            let mut gw = GzipResponseWriter::new(w, pool.acquire(), min_size);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| next.serve(&mut gw, req)));
            match outcome {
                Ok(()) => {
                    if let Err(err) = gw.close() {
                        logger.scope(|| {
                            tracing::debug!(error = %err, "failed to finish compressed response");
                        });
                    }
                }
                Err(payload) => {
                    gw.abandon();
                    drop(gw);
                    panic::resume_unwind(payload);
                }
            }
        })
    }
}

/// Builder for [`CompressionMiddleware`].
#[derive(Debug, Clone, Default)]
pub struct CompressionBuilder {
    config: CompressionConfig,
    logger: Logger,
}

impl CompressionBuilder {
    /// Sets the decision threshold in bytes.
    pub fn min_size(mut self, min_size: usize) -> Self {
        self.config.min_size = min_size;
        self
    }

    /// Sets the gzip level (clamped to 9).
    pub fn level(mut self, level: u32) -> Self {
        self.config.level = level;
        self
    }

    /// Sets how many idle encoders are kept.
    pub fn max_idle_encoders(mut self, max_idle: usize) -> Self {
        self.config.max_idle_encoders = max_idle;
        self
    }

    /// Sets the diagnostics logger.
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Builds the middleware.
    pub fn build(self) -> CompressionMiddleware {
        CompressionMiddleware {
            min_size: self.config.min_size,
            pool: EncoderPool::new(self.config.level, self.config.max_idle_encoders),
            logger: self.logger,
        }
    }
}
