//! CORS (Cross-Origin Resource Sharing) middleware.
//!
//! Allowed origins are configured as bare hostnames (`example.com`) or the
//! wildcard `*`. An incoming `Origin` is matched by its hostname alone, so
//! `https://example.com:8443` matches `example.com` and the full origin is
//! echoed back in `Access-Control-Allow-Origin`.
//!
//! ## Preflight Requests
//!
//! An `OPTIONS` request carrying `Access-Control-Request-Method` from a
//! matched origin is answered here with `204 No Content` and the allowed
//! methods, headers and max-age. The wrapped handler never sees it.
//!
//! ## Unmatched Origins
//!
//! Requests from origins that do not match pass through untouched apart
//! from `Vary: Origin`. Enforcement is the browser's job.
//!
//! ## Example
//!
//! ```
//! use sluice_middleware::stages::cors::{validators, CorsMiddleware};
//!
//! let cors = CorsMiddleware::builder()
//!     .allowed_origins(["example.com", "api.example.com"])
//!     .allow_credentials(true)
//!     .exposed_headers(["X-Request-ID"])
//!     .validators(validators::hostname())
//!     .build();
//! ```

use crate::error::OriginError;
use crate::handler::{handler_fn, BoxHandler};
use crate::logger::Logger;
use crate::middleware::Middleware;
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
};
use http::{HeaderValue, Method, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Checks one configured origin entry.
pub type OriginValidator = Arc<dyn Fn(&str) -> Result<(), OriginError> + Send + Sync>;

/// Stock origin validators.
pub mod validators {
    use super::{OriginError, OriginValidator};
    use std::sync::Arc;

    /// Rejects entries containing `://`.
    pub fn no_scheme() -> OriginValidator {
        Arc::new(|origin: &str| {
            if origin.contains("://") {
                return Err(OriginError::Scheme);
            }
            Ok(())
        })
    }

    /// Rejects entries containing `/`.
    pub fn no_path() -> OriginValidator {
        Arc::new(|origin: &str| {
            if origin.contains('/') {
                return Err(OriginError::Path);
            }
            Ok(())
        })
    }

    /// Rejects entries with a port.
    ///
    /// Bare IPv6 addresses (`::1`) have several colons and pass; a port
    /// after a bracketed address (`[::1]:8080`) is rejected.
    pub fn no_port() -> OriginValidator {
        Arc::new(|origin: &str| {
            if origin.matches(':').count() == 1 || origin.contains("]:") {
                return Err(OriginError::Port);
            }
            Ok(())
        })
    }

    /// Rejects the wildcard entry.
    pub fn no_wildcard() -> OriginValidator {
        Arc::new(|origin: &str| {
            if origin == "*" {
                return Err(OriginError::Wildcard);
            }
            Ok(())
        })
    }

    /// Rejects empty entries.
    pub fn not_empty() -> OriginValidator {
        Arc::new(|origin: &str| {
            if origin.is_empty() {
                return Err(OriginError::Empty);
            }
            Ok(())
        })
    }

    /// Every validator above, for configurations that must list plain
    /// hostnames only.
    pub fn hostname() -> Vec<OriginValidator> {
        vec![no_scheme(), no_path(), no_port(), no_wildcard(), not_empty()]
    }
}

/// The hostname of an `Origin` header value, lower-cased.
///
/// IPv6 brackets are removed. Anything that does not parse as an absolute
/// URL with a host yields an empty string.
pub fn extract_hostname(origin: &str) -> String {
    url::Url::parse(origin)
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned))
        .map(|host| {
            host.trim_start_matches('[')
                .trim_end_matches(']')
                .to_ascii_lowercase()
        })
        .unwrap_or_default()
}

/// The result of matching a request origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginMatch {
    /// The origin is not allowed.
    Denied,
    /// Allowed through the wildcard; reply with `*`.
    Wildcard,
    /// Allowed by hostname; echo the request origin.
    Exact,
}

/// Matches request origins against a validated set of hostnames.
///
/// Built once; read-only afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct OriginMatcher {
    hostnames: HashSet<String>,
    wildcard: bool,
    allow_credentials: bool,
}

impl fmt::Debug for OriginMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut hostnames: Vec<_> = self.hostnames.iter().collect();
        hostnames.sort();
        f.debug_struct("OriginMatcher")
            .field("hostnames", &hostnames)
            .field("wildcard", &self.wildcard)
            .field("allow_credentials", &self.allow_credentials)
            .finish()
    }
}

impl OriginMatcher {
    /// Builds a matcher from configured entries.
    ///
    /// Entries failing a validator are dropped with an error log. With
    /// credentials requested, a wildcard-only configuration loses its
    /// credentials (with a warning); otherwise the wildcard is ignored so
    /// only listed hosts ever get credentials.
    pub fn new<I, S>(
        origins: I,
        validators: &[OriginValidator],
        allow_credentials: bool,
        logger: &Logger,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hostnames = HashSet::new();
        let mut wildcard = false;

        for entry in origins {
            let entry = entry.as_ref();
            if let Some(err) = validators.iter().find_map(|v| v(entry).err()) {
                logger.scope(|| {
                    tracing::error!(origin = entry, error = %err, "CORS invalid origin, skipping");
                });
                continue;
            }
            match entry {
                "" => {}
                "*" => wildcard = true,
                host => {
                    hostnames.insert(host.to_ascii_lowercase());
                }
            }
        }

        let mut allow_credentials = allow_credentials;
        if allow_credentials {
            if wildcard && hostnames.is_empty() {
                logger.scope(|| {
                    tracing::warn!(
                        "CORS allow_credentials with only wildcard origin is invalid, disabling credentials"
                    );
                });
                allow_credentials = false;
            } else {
                wildcard = false;
            }
        }

        Self {
            hostnames,
            wildcard,
            allow_credentials,
        }
    }

    /// Matches an `Origin` header value.
    pub fn check(&self, origin: &str) -> OriginMatch {
        if self.wildcard {
            return OriginMatch::Wildcard;
        }
        if self.hostnames.contains(&extract_hostname(origin)) {
            OriginMatch::Exact
        } else {
            OriginMatch::Denied
        }
    }

    /// Whether `Access-Control-Allow-Credentials: true` is sent.
    pub fn allows_credentials(&self) -> bool {
        self.allow_credentials
    }

    /// Whether every origin is allowed.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }
}

/// CORS settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Bare hostnames or `*`.
    pub allowed_origins: Vec<String>,
    /// Methods advertised on preflight.
    pub allowed_methods: Vec<String>,
    /// Request headers advertised on preflight.
    pub allowed_headers: Vec<String>,
    /// Response headers exposed to scripts.
    pub exposed_headers: Vec<String>,
    /// Send `Access-Control-Allow-Credentials: true`.
    pub allow_credentials: bool,
    /// Preflight cache lifetime in seconds; omitted when not positive.
    pub max_age: i64,
    /// Reject entries that are not plain hostnames.
    pub validate_hostnames: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "HEAD", "POST"].map(String::from).to_vec(),
            allowed_headers: ["Origin", "Accept", "Content-Type", "X-Requested-With"]
                .map(String::from)
                .to_vec(),
            exposed_headers: Vec::new(),
            allow_credentials: false,
            max_age: 3600,
            validate_hostnames: false,
        }
    }
}

/// Header values computed once at build time.
#[derive(Debug, Clone, Default)]
struct PreparedHeaders {
    methods: Option<HeaderValue>,
    headers: Option<HeaderValue>,
    exposed: Option<HeaderValue>,
    max_age: Option<HeaderValue>,
}

/// Answers preflights and decorates responses for allowed origins.
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    matcher: Arc<OriginMatcher>,
    prepared: Arc<PreparedHeaders>,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CorsMiddleware {
    /// Creates a builder with the default configuration.
    pub fn builder() -> CorsBuilder {
        CorsBuilder::default()
    }

    /// Creates the middleware from configuration.
    pub fn from_config(config: &CorsConfig, logger: Logger) -> Self {
        let validators = if config.validate_hostnames {
            validators::hostname()
        } else {
            Vec::new()
        };
        CorsBuilder {
            config: config.clone(),
            validators,
            logger,
        }
        .build()
    }

    /// The origin matcher.
    pub fn matcher(&self) -> &OriginMatcher {
        &self.matcher
    }
}

impl Middleware for CorsMiddleware {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        let matcher = Arc::clone(&self.matcher);
        let prepared = Arc::clone(&self.prepared);

        handler_fn(move |w, req| {
            w.headers_mut().append(VARY, HeaderValue::from_static("Origin"));

            let Some(origin) = req.headers().get(ORIGIN).filter(|v| !v.is_empty()).cloned() else {
                next.serve(w, req);
                return;
            };
            let origin_str = origin.to_str().unwrap_or_default();

            let allow_origin = match matcher.check(origin_str) {
                OriginMatch::Denied => {
                    next.serve(w, req);
                    return;
                }
                OriginMatch::Wildcard => HeaderValue::from_static("*"),
                OriginMatch::Exact => origin,
            };

            let headers = w.headers_mut();
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
            if matcher.allows_credentials() {
                headers.insert(
                    ACCESS_CONTROL_ALLOW_CREDENTIALS,
                    HeaderValue::from_static("true"),
                );
            }
            if let Some(exposed) = &prepared.exposed {
                headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, exposed.clone());
            }

            let is_preflight = req.method() == Method::OPTIONS
                && req
                    .headers()
                    .get(ACCESS_CONTROL_REQUEST_METHOD)
                    .is_some_and(|v| !v.is_empty());
            if !is_preflight {
                next.serve(w, req);
                return;
            }

            headers.append(
                VARY,
                HeaderValue::from_static("Access-Control-Request-Method"),
            );
            headers.append(
                VARY,
                HeaderValue::from_static("Access-Control-Request-Headers"),
            );
            if let Some(methods) = &prepared.methods {
                headers.insert(ACCESS_CONTROL_ALLOW_METHODS, methods.clone());
            }
            if let Some(allowed) = &prepared.headers {
                headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, allowed.clone());
            }
            if let Some(max_age) = &prepared.max_age {
                headers.insert(ACCESS_CONTROL_MAX_AGE, max_age.clone());
            }
            w.write_header(StatusCode::NO_CONTENT);
        })
    }
}

/// Builder for [`CorsMiddleware`].
#[derive(Clone, Default)]
pub struct CorsBuilder {
    config: CorsConfig,
    validators: Vec<OriginValidator>,
    logger: Logger,
}

impl fmt::Debug for CorsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorsBuilder")
            .field("config", &self.config)
            .field("validators", &self.validators.len())
            .finish_non_exhaustive()
    }
}

impl CorsBuilder {
    /// Replaces the allowed origins.
    pub fn allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the allowed methods.
    pub fn allowed_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the allowed request headers.
    pub fn allowed_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the exposed response headers.
    pub fn exposed_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.exposed_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Enables or disables credentials.
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.config.allow_credentials = allow;
        self
    }

    /// Sets the preflight max-age in seconds; `0` omits the header.
    pub fn max_age(mut self, seconds: i64) -> Self {
        self.config.max_age = seconds;
        self
    }

    /// Sets the validators applied to each origin entry.
    pub fn validators(mut self, validators: Vec<OriginValidator>) -> Self {
        self.validators = validators;
        self
    }

    /// Sets the diagnostics logger.
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Builds the middleware.
    pub fn build(self) -> CorsMiddleware {
        let matcher = OriginMatcher::new(
            &self.config.allowed_origins,
            &self.validators,
            self.config.allow_credentials,
            &self.logger,
        );

        let prepared = PreparedHeaders {
            methods: self.join("allowed_methods", &self.config.allowed_methods),
            headers: self.join("allowed_headers", &self.config.allowed_headers),
            exposed: self.join("exposed_headers", &self.config.exposed_headers),
            max_age: (self.config.max_age > 0).then(|| HeaderValue::from(self.config.max_age)),
        };

        CorsMiddleware {
            matcher: Arc::new(matcher),
            prepared: Arc::new(prepared),
        }
    }

    fn join(&self, field: &'static str, values: &[String]) -> Option<HeaderValue> {
        if values.is_empty() {
            return None;
        }
        match HeaderValue::from_str(&values.join(", ")) {
            Ok(value) => Some(value),
            Err(err) => {
                self.logger.scope(|| {
                    tracing::error!(field, error = %err, "CORS header list is not a valid header value, omitting");
                });
                None
            }
        }
    }
}
