//! Response DTOs for the operational HTTP surface
//!
//! Defines the structure of outgoing HTTP response bodies.

use serde::Serialize;

use crate::cache::EntryState;
use crate::gateway::{GatewayStats, Served, ServedBy};
use crate::invalidation::ExecutionReport;

/// Response body for a tier-only read (GET /cache/:key)
#[derive(Debug, Clone, Serialize)]
pub struct GetResponse {
    /// The requested key
    pub key: String,
    /// The cached value, decoded as UTF-8 where possible
    pub value: String,
    pub served_by: ServedBy,
    pub state: EntryState,
    pub version: u64,
}

impl GetResponse {
    pub fn new(key: impl Into<String>, served: &Served) -> Self {
        Self {
            key: key.into(),
            value: String::from_utf8_lossy(&served.value).into_owned(),
            served_by: served.served_by,
            state: served.state,
            version: served.version,
        }
    }
}

/// Response body for a manual invalidation (POST /invalidate)
#[derive(Debug, Clone, Serialize)]
pub struct InvalidateResponse {
    /// Success message
    pub message: String,
    #[serde(flatten)]
    pub report: ExecutionReport,
}

impl InvalidateResponse {
    pub fn new(patterns: usize, report: ExecutionReport) -> Self {
        Self {
            message: format!("{} pattern(s) invalidated", patterns),
            report,
        }
    }
}

/// Response body for an ingested change event (POST /events)
#[derive(Debug, Clone, Serialize)]
pub struct EventAcceptedResponse {
    pub message: String,
    pub entity_id: String,
}

impl EventAcceptedResponse {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            message: "Change event accepted".to_string(),
            entity_id: entity_id.into(),
        }
    }
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Tier hits over tier lookups, across all tiers
    pub hit_rate: f64,
    #[serde(flatten)]
    pub gateway: GatewayStats,
}

impl StatsResponse {
    /// Creates a new StatsResponse from gateway statistics
    pub fn new(gateway: GatewayStats) -> Self {
        let (hits, lookups) = gateway.tiers.iter().fold((0, 0), |(hits, lookups), tier| {
            let tier_hits = tier.stats.hits + tier.stats.stale_hits;
            (hits + tier_hits, lookups + tier_hits + tier.stats.misses)
        });
        let hit_rate = if lookups > 0 {
            hits as f64 / lookups as f64
        } else {
            0.0
        };
        Self { hit_rate, gateway }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// "healthy", or "degraded" while any tier's circuit is not closed
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self::with_status("healthy")
    }

    pub fn degraded() -> Self {
        Self::with_status("degraded")
    }

    fn with_status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
}

impl ErrorResponse {
    /// Creates a new ErrorResponse
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_get_response_serialize() {
        let served = Served {
            value: Arc::new(br#"{"id":"GRANITE"}"#.to_vec()),
            served_by: ServedBy::Regional,
            state: EntryState::Stale,
            version: 7,
        };
        let json = serde_json::to_string(&GetResponse::new("v1:cat:detail:ab", &served)).unwrap();
        assert!(json.contains("v1:cat:detail:ab"));
        assert!(json.contains(r#""served_by":"regional""#));
        assert!(json.contains(r#""state":"stale""#));
        assert!(json.contains("GRANITE"));
    }

    #[test]
    fn test_invalidate_response_flattens_report() {
        let report = ExecutionReport {
            version: 42,
            immediate_purged: 3,
            ..ExecutionReport::default()
        };
        let json = serde_json::to_value(InvalidateResponse::new(2, report)).unwrap();
        assert_eq!(json["version"], 42);
        assert_eq!(json["immediate_purged"], 3);
        assert!(json["message"].as_str().unwrap().contains("2 pattern"));
    }

    #[test]
    fn test_health_response_serialize() {
        let json = serde_json::to_string(&HealthResponse::healthy()).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("timestamp"));
        assert!(serde_json::to_string(&HealthResponse::degraded())
            .unwrap()
            .contains("degraded"));
    }

    #[test]
    fn test_error_response_serialize() {
        let resp = ErrorResponse::new("Something went wrong");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("error"));
        assert!(json.contains("Something went wrong"));
    }
}
