//! # Sluice Middleware
//!
//! Composable HTTP response-processing middleware.
//!
//! Handlers write responses through a [`ResponseWriter`]. Each middleware
//! may wrap that writer to observe or rewrite the response, and the
//! capability walk ([`writer::flush`], [`writer::hijack`]) keeps flushing
//! and connection takeover working however deeply writers are nested.
//!
//! ## Standard Chain
//!
//! ```text
//! Request → Recovery → RequestId → Logging → CORS → RateLimit → Compression → Handler
//! ```
//!
//! | Stage | Middleware | Purpose |
//! |-------|------------|---------|
//! | 1 | Recovery | Turn handler panics into `500` responses |
//! | 2 | Request ID | Propagate or generate `X-Request-ID` (snowflake) |
//! | 3 | Logging | Access log with the effective status |
//! | 4 | CORS | Hostname-based origin matching, preflight answers |
//! | 5 | Rate Limit | Global token bucket, `429` with `Retry-After` |
//! | 6 | Compression | Gzip with a deferred compress-or-skip decision |
//!
//! ## Example
//!
//! ```
//! use sluice_middleware::prelude::*;
//! use bytes::Bytes;
//!
//! let chain = MiddlewareConfig::default().chain(&Logger::current());
//! let app = chain.then(handler_fn(|w, _req| {
//!     let _ = w.write_all(&b"hello world".repeat(40));
//! }));
//!
//! let request = http::Request::builder()
//!     .header("accept-encoding", "gzip")
//!     .body(Bytes::new())
//!     .unwrap();
//! let mut recorder = ResponseRecorder::new();
//! app.serve(&mut recorder, request);
//!
//! assert_eq!(recorder.header("content-encoding"), Some("gzip"));
//! assert!(recorder.header("x-request-id").is_some());
//! ```

#![doc(html_root_url = "https://docs.rs/sluice-middleware/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod logger;
pub mod middleware;
pub mod pipeline;
pub mod snowflake;
pub mod stages;
pub mod transport;
pub mod writer;

pub use config::MiddlewareConfig;
pub use context::{RequestExt, RequestId, REQUEST_ID_HEADER};
pub use error::{OriginError, TransportError, WriterError};
pub use handler::{handler_fn, BoxHandler, Handler, Request};
pub use logger::Logger;
pub use middleware::{middleware_fn, FnMiddleware, Middleware};
pub use pipeline::Chain;
pub use snowflake::{SnowflakeConfig, SnowflakeGenerator, SnowflakeId};
pub use transport::{serve, serve_connection, HyperService};
pub use writer::{ResponseRecorder, ResponseWriter, StatusWriter};

/// Commonly used items.
pub mod prelude {
    pub use crate::config::MiddlewareConfig;
    pub use crate::context::RequestExt;
    pub use crate::handler::{handler_fn, BoxHandler, Handler};
    pub use crate::logger::Logger;
    pub use crate::middleware::Middleware;
    pub use crate::pipeline::Chain;
    pub use crate::writer::{flush, hijack, ResponseRecorder, ResponseWriter};
}
