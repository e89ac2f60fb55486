//! Change Event Consumer
//!
//! Drains the change-event bus in publish order and hands each event to the
//! gateway's invalidation engine.

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::events::ChangeEventStream;
use crate::gateway::CacheGateway;

/// Spawns the task that applies change events until every publisher is gone.
///
/// Events are handled one at a time so a structural change is fully planned
/// and its immediate phase applied before the next event is looked at.
pub fn spawn_event_consumer(mut events: ChangeEventStream, gateway: CacheGateway) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Change event consumer started");

        while let Some(event) = events.next().await {
            match gateway.handle_event(&event).await {
                Ok(report) => info!(
                    entity = %event.entity_id,
                    version = report.version,
                    purged = report.immediate_purged,
                    "change event applied"
                ),
                Err(err) if err.is_fatal() => error!(
                    entity = %event.entity_id,
                    error = %err,
                    "change event fell back to conservative invalidation"
                ),
                Err(err) => warn!(entity = %event.entity_id, error = %err, "change event failed"),
            }
        }

        info!("Change event bus closed, consumer stopping");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use crate::config::Config;
    use crate::events::{change_event_bus, ChangeEvent, EntityType, Operation};
    use crate::tiers::TierClient;
    use std::time::Duration;

    #[tokio::test]
    async fn test_consumer_applies_events_and_stops_on_close() {
        let gateway = CacheGateway::builder(Config::default()).build();
        let entry = CacheEntry::new(
            "v1:cat:detail:1",
            b"{}".to_vec(),
            gateway.clock().next(),
            Duration::from_secs(60),
            Duration::from_secs(600),
            ["cat:detail:X".to_string()].into_iter().collect(),
        );
        gateway.local().store(entry).await.unwrap();

        let (publisher, stream) = change_event_bus(8);
        let handle = spawn_event_consumer(stream, gateway.clone());
        publisher
            .publish(ChangeEvent::new(EntityType::Category, "X", Operation::Update).with_changed_fields(["name"]))
            .await
            .unwrap();
        drop(publisher);

        handle.await.unwrap();
        assert!(!gateway.local().contains("v1:cat:detail:1").await);
        assert_eq!(gateway.engine().stats().plans_executed, 1);
    }

    #[tokio::test]
    async fn test_cyclic_event_still_purges_hierarchy() {
        let gateway = CacheGateway::builder(Config::default()).build();
        let entry = CacheEntry::new(
            "v1:cat:hierarchy:1",
            b"{}".to_vec(),
            gateway.clock().next(),
            Duration::from_secs(60),
            Duration::from_secs(600),
            ["cat:hierarchy:ROOT".to_string()].into_iter().collect(),
        );
        gateway.local().store(entry).await.unwrap();

        let (publisher, stream) = change_event_bus(8);
        let handle = spawn_event_consumer(stream, gateway.clone());
        publisher
            .publish(
                ChangeEvent::new(EntityType::Category, "A", Operation::Update)
                    .with_changed_fields(["parent_category_id"])
                    .with_ancestors(["B", "A"]),
            )
            .await
            .unwrap();
        drop(publisher);

        handle.await.unwrap();
        assert!(!gateway.local().contains("v1:cat:hierarchy:1").await);
    }
}
