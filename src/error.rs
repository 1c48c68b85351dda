//! Error types shared across the harvesting pipeline

use thiserror::Error;

use crate::storage::query_cache::CacheError;
use crate::storage::DatabaseError;

/// Failure of a single outbound request to an upstream service
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Upstream signalled throttling (HTTP 429 or an equivalent body)
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Timeout, connection failure or 5xx
    #[error("transient failure: {0}")]
    Transient(String),

    /// Definitive absence. The gateway turns this into `Ok(None)`.
    #[error("not found")]
    NotFound,

    /// Non-retryable HTTP status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The response arrived but could not be understood
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("gateway closed")]
    Closed,
}

impl GatewayError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GatewayError::RateLimited(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return GatewayError::Decode(err.to_string());
        }
        if let Some(status) = err.status() {
            return crate::utils::http::error_for_status(status, &err.to_string());
        }
        // timeouts, connect and body errors are all worth another attempt
        GatewayError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Decode(err.to_string())
    }
}

/// Top-level error for a harvesting run or CLI command
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("search failed: {0}")]
    Search(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        assert!(GatewayError::RateLimited("429".into()).is_rate_limited());
        assert!(!GatewayError::NotFound.is_rate_limited());
        assert!(GatewayError::Transient("timeout".into()).is_transient());
        assert!(!GatewayError::Http { status: 400, message: "bad".into() }.is_transient());
    }

    #[test]
    fn test_harvest_error_wraps_gateway() {
        let err: HarvestError = GatewayError::Closed.into();
        assert_eq!(err.to_string(), "gateway closed");
    }
}
