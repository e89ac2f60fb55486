//! Expiry Sweep Task
//!
//! Background task that periodically removes expired entries, old tombstones
//! and idle access counters from every tier of a gateway.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::gateway::CacheGateway;

/// Spawns a background task that periodically sweeps the gateway's tiers.
///
/// The task runs until aborted, sleeping for the specified interval between
/// sweeps.
///
/// # Arguments
/// * `gateway` - Gateway whose tiers are swept
/// * `cleanup_interval_secs` - Interval in seconds between sweeps
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let gateway = CacheGateway::builder(Config::default()).build();
/// let cleanup_handle = spawn_cleanup_task(gateway.clone(), 5);
/// // Later, during shutdown:
/// cleanup_handle.abort();
/// ```
pub fn spawn_cleanup_task(gateway: CacheGateway, cleanup_interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(cleanup_interval_secs.max(1));

    tokio::spawn(async move {
        info!(
            "Starting expiry sweep task with interval of {} seconds",
            interval.as_secs()
        );

        loop {
            tokio::time::sleep(interval).await;

            let removed = gateway.sweep().await;
            if removed > 0 {
                info!("Expiry sweep: removed {} expired entries", removed);
            } else {
                debug!("Expiry sweep: nothing to remove");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use crate::config::Config;
    use crate::tiers::TierClient;
    use std::collections::BTreeSet;

    fn entry(key: &str, fresh_ms: u64, stale_ms: u64) -> CacheEntry {
        CacheEntry::new(
            key,
            b"value".to_vec(),
            1,
            Duration::from_millis(fresh_ms),
            Duration::from_millis(stale_ms),
            BTreeSet::new(),
        )
    }

    #[tokio::test]
    async fn test_cleanup_task_removes_expired_entries() {
        let gateway = CacheGateway::builder(Config::default()).build();
        gateway.local().store(entry("expire_soon", 100, 200)).await.unwrap();

        let handle = spawn_cleanup_task(gateway.clone(), 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!gateway.local().contains("expire_soon").await);
        handle.abort();
    }

    #[tokio::test]
    async fn test_cleanup_task_preserves_servable_entries() {
        let gateway = CacheGateway::builder(Config::default()).build();
        // Stale but still inside its bound.
        gateway.local().store(entry("stale", 0, 3_600_000)).await.unwrap();
        gateway.local().store(entry("long_lived", 3_600_000, 3_600_000)).await.unwrap();

        let handle = spawn_cleanup_task(gateway.clone(), 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(gateway.local().contains("stale").await);
        assert!(gateway.local().contains("long_lived").await);
        handle.abort();
    }

    #[tokio::test]
    async fn test_cleanup_task_can_be_aborted() {
        let gateway = CacheGateway::builder(Config::default()).build();
        let handle = spawn_cleanup_task(gateway, 1);

        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}
