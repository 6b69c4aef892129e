//! Global token-bucket rate limiting.
//!
//! One bucket is shared by every request that passes through a
//! [`RateLimitMiddleware`] instance. The bucket starts full, refills
//! continuously at the configured rate, and spends one token per admitted
//! request. A rejected request gets `429 Too Many Requests` with a
//! `Retry-After` header giving the whole seconds until a token is available
//! (never less than 1).
//!
//! ## Example
//!
//! ```
//! use sluice_middleware::stages::RateLimitMiddleware;
//!
//! let rate_limit = RateLimitMiddleware::builder()
//!     .requests_per_second(50.0)
//!     .burst(100)
//!     .build();
//! ```

use crate::handler::{handler_fn, BoxHandler};
use crate::logger::Logger;
use crate::middleware::Middleware;
use crate::writer::error_response;
use http::header::RETRY_AFTER;
use http::{HeaderValue, StatusCode};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Rate used when the configured one is not a positive finite number.
pub const DEFAULT_RATE: f64 = 1.0;

/// Burst used when the configured one is not positive.
pub const DEFAULT_BURST: u32 = 1;

/// Outcome of a token request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// A token was spent.
    Admitted,
    /// No token was available.
    Rejected {
        /// Time until one token will have accumulated.
        retry_after: Duration,
    },
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket with fractional refill.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    rate: f64,
}

impl TokenBucket {
    /// Creates a full bucket holding `burst` tokens and refilling at `rate`
    /// tokens per second. Both must be positive.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::new_at(rate, burst, Instant::now())
    }

    fn new_at(rate: f64, burst: u32, now: Instant) -> Self {
        let capacity = f64::from(burst);
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
            capacity,
            rate,
        }
    }

    /// Tries to spend one token now.
    pub fn try_acquire(&self) -> Admission {
        self.try_acquire_at(Instant::now())
    }

    /// Tries to spend one token at `now`.
    ///
    /// An instant earlier than the last refill adds nothing.
    pub fn try_acquire_at(&self, now: Instant) -> Admission {
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = elapsed.mul_add(self.rate, state.tokens).min(self.capacity);
        state.last_refill = state.last_refill.max(now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Admission::Admitted;
        }

        let deficit = 1.0 - state.tokens;
        let retry_after =
            Duration::try_from_secs_f64(deficit / self.rate).unwrap_or(Duration::MAX);
        Admission::Rejected { retry_after }
    }

    /// Tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum tokens held.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Whole seconds for a `Retry-After` header: rounded up, at least 1.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    let rounded = if retry_after.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    };
    rounded.max(1)
}

/// Rate limit settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained requests per second.
    pub requests_per_second: f64,
    /// Requests admitted back to back from a full bucket.
    pub burst: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10.0,
            burst: 20,
        }
    }
}

/// Rejects requests beyond a global rate with `429 Too Many Requests`.
#[derive(Debug, Clone)]
pub struct RateLimitMiddleware {
    bucket: Arc<TokenBucket>,
}

impl RateLimitMiddleware {
    /// Creates a builder.
    pub fn builder() -> RateLimitBuilder {
        RateLimitBuilder::default()
    }

    /// Creates the middleware from configuration.
    pub fn from_config(config: &RateLimitConfig, logger: Logger) -> Self {
        RateLimitBuilder {
            config: config.clone(),
            logger,
        }
        .build()
    }

    /// The shared bucket.
    pub fn bucket(&self) -> &Arc<TokenBucket> {
        &self.bucket
    }
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        let bucket = Arc::clone(&self.bucket);
        handler_fn(move |w, req| match bucket.try_acquire() {
            Admission::Admitted => next.serve(w, req),
            Admission::Rejected { retry_after } => {
                sluice_telemetry::metrics::record_rate_limited();
                w.headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(retry_after)));
                error_response(w, StatusCode::TOO_MANY_REQUESTS, "Too Many Requests");
            }
        })
    }
}

/// Builder for [`RateLimitMiddleware`].
#[derive(Debug, Clone, Default)]
pub struct RateLimitBuilder {
    config: RateLimitConfig,
    logger: Logger,
}

impl RateLimitBuilder {
    /// Sets the sustained rate.
    pub fn requests_per_second(mut self, rate: f64) -> Self {
        self.config.requests_per_second = rate;
        self
    }

    /// Sets the burst size.
    pub fn burst(mut self, burst: i64) -> Self {
        self.config.burst = burst;
        self
    }

    /// Sets the diagnostics logger.
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Builds the middleware, substituting defaults for invalid settings.
    pub fn build(self) -> RateLimitMiddleware {
        let RateLimitConfig {
            requests_per_second,
            burst,
        } = self.config;

        let rate = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            requests_per_second
        } else {
            self.logger.scope(|| {
                tracing::warn!(
                    provided = requests_per_second,
                    default = DEFAULT_RATE,
                    "requests_per_second must be positive, using default"
                );
            });
            DEFAULT_RATE
        };

        let burst = match u32::try_from(burst) {
            Ok(burst) if burst > 0 => burst,
            _ => {
                self.logger.scope(|| {
                    tracing::warn!(
                        provided = burst,
                        default = DEFAULT_BURST,
                        "burst must be positive, using default"
                    );
                });
                DEFAULT_BURST
            }
        };

        RateLimitMiddleware {
            bucket: Arc::new(TokenBucket::new(rate, burst)),
        }
    }
}
