//! Regional tier: a distributed cache simulated as a primary node with one
//! asynchronously replicated read replica.
//!
//! Writes land on the primary and reach the replica after the configured
//! replication lag, so reads may trail writes by up to that lag. Purges hit
//! both nodes under both locks; a replicated write that arrives after a purge
//! is rejected by the replica's version tombstone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{rejected, FaultInjector, TierClient, TierError};
use crate::cache::{CacheEntry, CacheStats, KeyPattern, Tier, TierStore, WriteOutcome};

#[derive(Debug)]
struct RegionalNodes {
    primary: RwLock<TierStore>,
    replica: Arc<RwLock<TierStore>>,
    replication_lag: Duration,
    faults: Arc<FaultInjector>,
}

/// Cloning yields another client for the same cluster.
#[derive(Debug, Clone)]
pub struct RegionalTier {
    nodes: Arc<RegionalNodes>,
}

impl RegionalTier {
    pub fn new(max_entries: usize, replication_lag: Duration) -> Self {
        Self {
            nodes: Arc::new(RegionalNodes {
                primary: RwLock::new(TierStore::new(Tier::Regional, max_entries)),
                replica: Arc::new(RwLock::new(TierStore::new(Tier::Regional, max_entries))),
                replication_lag,
                faults: Arc::new(FaultInjector::new()),
            }),
        }
    }

    /// Network simulation handle shared by every clone.
    pub fn faults(&self) -> Arc<FaultInjector> {
        self.nodes.faults.clone()
    }

    /// True if the primary holds `key`, regardless of replication.
    pub async fn primary_contains(&self, key: &str) -> bool {
        self.nodes.primary.read().await.peek(key).is_some()
    }

    pub async fn replica_contains(&self, key: &str) -> bool {
        self.nodes.replica.read().await.peek(key).is_some()
    }

    fn replicate(&self, entry: CacheEntry) {
        let replica = self.nodes.replica.clone();
        let lag = self.nodes.replication_lag;
        tokio::spawn(async move {
            tokio::time::sleep(lag).await;
            let key = entry.key.clone();
            match replica.write().await.put(entry) {
                Ok(WriteOutcome::Stored) => {}
                Ok(outcome) => debug!(key = %key, ?outcome, "replicated write discarded"),
                Err(err) => debug!(key = %key, error = %err, "replication rejected"),
            }
        });
    }
}

#[async_trait]
impl TierClient for RegionalTier {
    fn tier(&self) -> Tier {
        Tier::Regional
    }

    async fn fetch(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        self.nodes.faults.before_call(Tier::Regional).await?;
        Ok(self.nodes.replica.write().await.get(key))
    }

    async fn store(&self, entry: CacheEntry) -> Result<WriteOutcome, TierError> {
        self.nodes.faults.before_call(Tier::Regional).await?;
        let outcome = self
            .nodes
            .primary
            .write()
            .await
            .put(entry.clone())
            .map_err(rejected)?;

        if outcome.is_stored() {
            if self.nodes.replication_lag.is_zero() {
                self.nodes.replica.write().await.put(entry).map_err(rejected)?;
            } else {
                self.replicate(entry);
            }
        }
        Ok(outcome)
    }

    async fn purge(&self, patterns: &[KeyPattern], version: u64) -> Result<usize, TierError> {
        self.nodes.faults.before_call(Tier::Regional).await?;
        let mut primary = self.nodes.primary.write().await;
        let mut replica = self.nodes.replica.write().await;
        let purged = primary.purge(patterns, version);
        replica.purge(patterns, version);
        Ok(purged)
    }

    async fn stats(&self) -> CacheStats {
        self.nodes.replica.read().await.stats()
    }

    async fn sweep(&self, tombstone_ttl_ms: u64) -> usize {
        let removed = self.nodes.primary.write().await.cleanup_expired(tombstone_ttl_ms);
        self.nodes.replica.write().await.cleanup_expired(tombstone_ttl_ms);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn entry(key: &str, version: u64) -> CacheEntry {
        CacheEntry::new(
            key,
            b"v".to_vec(),
            version,
            Duration::from_secs(60),
            Duration::from_secs(120),
            BTreeSet::from(["cat:hierarchy".to_string()]),
        )
    }

    #[tokio::test]
    async fn test_synchronous_replication_without_lag() {
        let tier = RegionalTier::new(10, Duration::ZERO);
        tier.store(entry("k", 1)).await.unwrap();
        let found = tier.fetch("k").await.unwrap().unwrap();
        assert_eq!(found.tier, Tier::Regional);
    }

    #[tokio::test]
    async fn test_replica_trails_primary_by_lag() {
        let tier = RegionalTier::new(10, Duration::from_millis(50));
        tier.store(entry("k", 1)).await.unwrap();

        assert!(tier.primary_contains("k").await);
        assert!(tier.fetch("k").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(tier.fetch("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_late_replication_cannot_resurrect_purged_key() {
        let tier = RegionalTier::new(10, Duration::from_millis(50));
        tier.store(entry("k", 1)).await.unwrap();
        tier.purge(&[KeyPattern::new("cat:hierarchy:*")], 5).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!tier.replica_contains("k").await);
        assert!(!tier.primary_contains("k").await);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let tier = RegionalTier::new(10, Duration::ZERO);
        tier.faults().set_failing(true);
        assert!(matches!(
            tier.fetch("k").await,
            Err(TierError::Transport(_))
        ));
        assert_eq!(tier.faults().calls(), 1);
    }
}
