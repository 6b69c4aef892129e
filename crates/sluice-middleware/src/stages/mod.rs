//! Built-in middleware stages.
//!
//! The standard chain built by
//! [`MiddlewareConfig::chain`](crate::config::MiddlewareConfig::chain) runs
//! them outermost first:
//!
//! 1. [`recovery`] - Convert handler panics into `500` responses
//! 2. [`request_id`] - Propagate or generate `X-Request-ID`
//! 3. [`logging`] - Access log and request metrics
//! 4. [`cors`] - Origin matching and preflight answers
//! 5. [`rate_limit`] - Global token bucket admission
//! 6. [`compression`] - Gzip with deferred decision
//!
//! Each stage is an ordinary [`Middleware`](crate::middleware::Middleware)
//! and can be composed in any order with [`Chain`](crate::pipeline::Chain).

pub mod compression;
pub mod cors;
pub mod logging;
pub mod rate_limit;
pub mod recovery;
pub mod request_id;

pub use compression::{CompressionConfig, CompressionMiddleware};
pub use cors::{CorsConfig, CorsMiddleware, OriginMatcher};
pub use logging::LoggingMiddleware;
pub use rate_limit::{RateLimitConfig, RateLimitMiddleware, TokenBucket};
pub use recovery::{AbortHandler, RecoveryMiddleware, RecoveryWriter};
pub use request_id::RequestIdMiddleware;
