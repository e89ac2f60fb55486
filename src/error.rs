//! Error types for the tiered cache
//!
//! Tier failures, loader failures and invalidation failures each get their own
//! variant so callers can tell a degraded read from a hard failure.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::cache::Tier;
use crate::models::ErrorResponse;

// == Cache Error Enum ==
/// Unified error type for the cache engine.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Circuit open, timeout or transport failure on one tier
    #[error("Tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: Tier, reason: String },

    /// Loader failed and no servable stale entry existed
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Batched or propagated purge gave up after retries
    #[error("Invalidation of '{pattern}' failed after {attempts} attempts: {reason}")]
    InvalidationPropagationFailure {
        pattern: String,
        attempts: u32,
        reason: String,
    },

    /// Two distinct canonical queries produced the same key
    #[error("Key collision on '{key}': '{existing}' vs '{incoming}'")]
    KeyCollision {
        key: String,
        existing: String,
        incoming: String,
    },

    /// Ancestor chain too deep or cyclic
    #[error("Hierarchy traversal for '{entity_id}' exceeded depth {depth}")]
    HierarchyDepthExceeded { entity_id: String, depth: usize },

    /// No servable entry in any tier
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Fatal errors indicate a bug in key derivation or corrupted source data,
    /// never a transient fault.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CacheError::KeyCollision { .. } | CacheError::HierarchyDepthExceeded { .. }
        )
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::TierUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::SourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::InvalidationPropagationFailure { .. } => StatusCode::BAD_GATEWAY,
            CacheError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            CacheError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CacheError::KeyCollision { .. }
            | CacheError::HierarchyDepthExceeded { .. }
            | CacheError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let collision = CacheError::KeyCollision {
            key: "v1:cat:list:ab".to_string(),
            existing: "a".to_string(),
            incoming: "b".to_string(),
        };
        assert!(collision.is_fatal());
        assert!(!CacheError::SourceUnavailable("down".to_string()).is_fatal());
    }

    #[test]
    fn test_status_codes() {
        let response = CacheError::SourceUnavailable("db down".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = CacheError::InvalidRequest("empty".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
