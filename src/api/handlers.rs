//! API Handlers
//!
//! HTTP request handlers for each operational endpoint.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::error::{CacheError, Result};
use crate::events::{ChangeEvent, ChangeEventPublisher};
use crate::gateway::CacheGateway;
use crate::models::{
    EventAcceptedResponse, GetResponse, HealthResponse, InvalidateRequest, InvalidateResponse,
    StatsResponse,
};
use crate::tiers::CircuitState;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: CacheGateway,
    /// Publisher side of the change-event bus the gateway consumes
    pub events: ChangeEventPublisher,
}

impl AppState {
    pub fn new(gateway: CacheGateway, events: ChangeEventPublisher) -> Self {
        Self { gateway, events }
    }
}

/// Handler for GET /cache/:key
///
/// Returns the entry from the fastest tier holding it, stale entries
/// included. Never calls a loader.
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>> {
    let served = state
        .gateway
        .get(&key)
        .await
        .ok_or_else(|| CacheError::KeyNotFound(key.clone()))?;

    Ok(Json(GetResponse::new(key, &served)))
}

/// Handler for POST /invalidate
pub async fn invalidate_handler(
    State(state): State<AppState>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    let patterns = req.into_patterns();
    let count = patterns.len();
    let report = state.gateway.invalidate(patterns).await?;

    Ok(Json(InvalidateResponse::new(count, report)))
}

/// Handler for POST /events
///
/// Queues the event on the bus; the invalidation itself runs on the consumer.
pub async fn events_handler(
    State(state): State<AppState>,
    Json(event): Json<ChangeEvent>,
) -> Result<(StatusCode, Json<EventAcceptedResponse>)> {
    if event.entity_id.is_empty() {
        return Err(CacheError::InvalidRequest(
            "entity_id cannot be empty".to_string(),
        ));
    }

    let entity_id = event.entity_id.clone();
    state.events.publish(event).await?;

    Ok((StatusCode::ACCEPTED, Json(EventAcceptedResponse::new(entity_id))))
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::new(state.gateway.stats().await))
}

/// Handler for GET /health
///
/// Reports "degraded" while any tier's circuit is open or half-open.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let degraded = state
        .gateway
        .chain()
        .tiers()
        .iter()
        .any(|tier| tier.breaker().state() != CircuitState::Closed);

    if degraded {
        Json(HealthResponse::degraded())
    } else {
        Json(HealthResponse::healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use crate::config::Config;
    use crate::events::change_event_bus;
    use crate::tiers::TierClient;
    use std::time::Duration;

    fn state() -> (AppState, crate::events::ChangeEventStream) {
        let gateway = CacheGateway::builder(Config::default()).build();
        let (publisher, stream) = change_event_bus(8);
        (AppState::new(gateway, publisher), stream)
    }

    #[tokio::test]
    async fn test_get_handler_hit_and_miss() {
        let (state, _stream) = state();
        let entry = CacheEntry::new(
            "v1:cat:detail:ab",
            b"granite".to_vec(),
            state.gateway.clock().next(),
            Duration::from_secs(60),
            Duration::from_secs(600),
            Default::default(),
        );
        state.gateway.regional().store(entry).await.unwrap();

        let Json(resp) = get_handler(State(state.clone()), Path("v1:cat:detail:ab".to_string()))
            .await
            .unwrap();
        assert_eq!(resp.value, "granite");

        let err = get_handler(State(state), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn test_invalidate_handler_rejects_empty() {
        let (state, _stream) = state();
        let result = invalidate_handler(State(state), Json(InvalidateRequest { patterns: vec![] })).await;
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_events_handler_publishes() {
        let (state, mut stream) = state();
        let event: ChangeEvent = serde_json::from_value(serde_json::json!({
            "entity_type": "category",
            "entity_id": "GRANITE",
            "operation": "create",
            "changed_fields": [],
            "timestamp": "2024-03-01T10:00:00Z"
        }))
        .unwrap();

        let (status, _) = events_handler(State(state), Json(event)).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(stream.next().await.unwrap().entity_id, "GRANITE");
    }

    #[tokio::test]
    async fn test_health_handler() {
        let (state, _stream) = state();
        let Json(resp) = health_handler(State(state)).await;
        assert_eq!(resp.status, "healthy");
    }
}
