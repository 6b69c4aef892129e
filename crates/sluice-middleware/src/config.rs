//! Middleware configuration.
//!
//! [`MiddlewareConfig`] deserializes from any serde format and builds the
//! standard chain. Every field has a default, so an empty document yields
//! recovery, request ids, access logging and compression; CORS and rate
//! limiting are opt-in.
//!
//! ```
//! use sluice_middleware::config::MiddlewareConfig;
//! use sluice_middleware::logger::Logger;
//!
//! let config: MiddlewareConfig = serde_json::from_str(r#"{
//!     "rate_limit": { "requests_per_second": 100.0, "burst": 200 },
//!     "cors": { "allowed_origins": ["example.com"] }
//! }"#).unwrap();
//!
//! let chain = config.chain(&Logger::current());
//! assert_eq!(
//!     chain.names(),
//!     ["recovery", "request_id", "logging", "cors", "rate_limit", "compression"]
//! );
//! ```

use crate::logger::Logger;
use crate::pipeline::Chain;
use crate::snowflake::SnowflakeConfig;
use crate::stages::{
    CompressionConfig, CompressionMiddleware, CorsConfig, CorsMiddleware, LoggingMiddleware,
    RateLimitConfig, RateLimitMiddleware, RecoveryMiddleware, RequestIdMiddleware,
};
use serde::Deserialize;

/// Settings for the standard middleware chain.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Recover handler panics.
    pub recovery: bool,
    /// Assign request identifiers.
    pub request_id: bool,
    /// Emit access logs.
    pub logging: bool,
    /// CORS settings; disabled when absent.
    pub cors: Option<CorsConfig>,
    /// Rate limit settings; disabled when absent.
    pub rate_limit: Option<RateLimitConfig>,
    /// Compression settings; `null` disables compression.
    pub compression: Option<CompressionConfig>,
    /// Request identifier generator settings.
    pub snowflake: SnowflakeConfig,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            recovery: true,
            request_id: true,
            logging: true,
            cors: None,
            rate_limit: None,
            compression: Some(CompressionConfig::default()),
            snowflake: SnowflakeConfig::default(),
        }
    }
}

impl MiddlewareConfig {
    /// Builds the enabled middlewares, outermost first:
    /// recovery, request id, logging, CORS, rate limit, compression.
    pub fn chain(&self, logger: &Logger) -> Chain {
        let mut chain = Chain::new();
        if self.recovery {
            chain.push(RecoveryMiddleware::new(logger.clone()));
        }
        if self.request_id {
            chain.push(RequestIdMiddleware::from_config(
                &self.snowflake,
                logger.clone(),
            ));
        }
        if self.logging {
            chain.push(LoggingMiddleware::new(logger.clone()));
        }
        if let Some(cors) = &self.cors {
            chain.push(CorsMiddleware::from_config(cors, logger.clone()));
        }
        if let Some(rate_limit) = &self.rate_limit {
            chain.push(RateLimitMiddleware::from_config(rate_limit, logger.clone()));
        }
        if let Some(compression) = &self.compression {
            chain.push(CompressionMiddleware::from_config(compression, logger.clone()));
        }
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MiddlewareConfig::default();
        assert_eq!(
            config.chain(&Logger::current()).names(),
            ["recovery", "request_id", "logging", "compression"]
        );
    }

    #[test]
    fn test_empty_document_matches_default() {
        let config: MiddlewareConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, MiddlewareConfig::default());
    }

    #[test]
    fn test_toggles_and_null_compression() {
        let config: MiddlewareConfig = serde_json::from_str(
            r#"{"recovery": false, "logging": false, "compression": null, "rate_limit": {}}"#,
        )
        .unwrap();
        assert_eq!(
            config.chain(&Logger::current()).names(),
            ["request_id", "rate_limit"]
        );
        assert_eq!(config.rate_limit, Some(RateLimitConfig::default()));
    }

    #[test]
    fn test_snowflake_settings() {
        let config: MiddlewareConfig = serde_json::from_str(
            r#"{"snowflake": {"drift_tolerance_ms": 50, "machine_id": 7}}"#,
        )
        .unwrap();
        assert_eq!(config.snowflake.drift_tolerance_ms, 50);
        assert_eq!(config.snowflake.machine_id, Some(7));
    }
}
