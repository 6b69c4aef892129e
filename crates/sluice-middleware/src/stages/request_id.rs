//! Request ID middleware.
//!
//! Assigns every request an identifier, available to later stages through
//! [`RequestExt::request_id`](crate::context::RequestExt::request_id) and
//! echoed to the client in `X-Request-ID`.
//!
//! An inbound `X-Request-ID` is reused when it is non-empty, at most 256
//! bytes, and printable ASCII. Anything else is replaced with a fresh
//! snowflake identifier, so untrusted input never reaches logs unchecked.

use crate::context::{RequestExt, REQUEST_ID_HEADER};
use crate::handler::{handler_fn, BoxHandler};
use crate::logger::Logger;
use crate::middleware::Middleware;
use crate::snowflake::{SnowflakeConfig, SnowflakeGenerator};
use http::HeaderValue;
use std::sync::Arc;

/// Longest inbound identifier that is reused.
pub const MAX_REQUEST_ID_LEN: usize = 256;

/// Whether an inbound identifier may be reused as is.
pub fn is_acceptable_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id.bytes().all(|b| (0x20..=0x7E).contains(&b))
}

/// Propagates or generates the per-request identifier.
#[derive(Debug, Clone)]
pub struct RequestIdMiddleware {
    generator: Arc<SnowflakeGenerator>,
}

impl RequestIdMiddleware {
    /// Creates the middleware with its own generator.
    pub fn new(logger: Logger) -> Self {
        Self::with_generator(Arc::new(SnowflakeGenerator::new(logger)))
    }

    /// Creates the middleware from generator configuration.
    pub fn from_config(config: &SnowflakeConfig, logger: Logger) -> Self {
        Self::with_generator(Arc::new(SnowflakeGenerator::from_config(config, logger)))
    }

    /// Creates the middleware around a shared generator.
    pub fn with_generator(generator: Arc<SnowflakeGenerator>) -> Self {
        Self { generator }
    }
}

impl Middleware for RequestIdMiddleware {
    fn name(&self) -> &'static str {
        "request_id"
    }

    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        let generator = Arc::clone(&self.generator);

        handler_fn(move |w, mut req| {
            let inbound = req
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .filter(|id| is_acceptable_request_id(id))
                .map(str::to_owned);
            let id = inbound.unwrap_or_else(|| generator.generate());

            // Printable ASCII always forms a valid header value.
            if let Ok(value) = HeaderValue::from_str(&id) {
                w.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            req.set_request_id(id);

            next.serve(w, req);
        })
    }
}
