//! Process-local tier: a bounded in-memory store behind an async RwLock.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{rejected, TierClient, TierError};
use crate::cache::{CacheEntry, CacheStats, KeyPattern, Tier, TierStore, WriteOutcome};

#[derive(Debug, Clone)]
pub struct LocalTier {
    store: Arc<RwLock<TierStore>>,
}

impl LocalTier {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(RwLock::new(TierStore::new(Tier::Local, max_entries))),
        }
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.is_empty()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.store.read().await.peek(key).is_some()
    }
}

#[async_trait]
impl TierClient for LocalTier {
    fn tier(&self) -> Tier {
        Tier::Local
    }

    async fn fetch(&self, key: &str) -> Result<Option<CacheEntry>, TierError> {
        // Write lock: reads update LRU order and stats.
        Ok(self.store.write().await.get(key))
    }

    async fn store(&self, entry: CacheEntry) -> Result<WriteOutcome, TierError> {
        self.store.write().await.put(entry).map_err(rejected)
    }

    async fn purge(&self, patterns: &[KeyPattern], version: u64) -> Result<usize, TierError> {
        Ok(self.store.write().await.purge(patterns, version))
    }

    async fn stats(&self) -> CacheStats {
        self.store.read().await.stats()
    }

    async fn sweep(&self, tombstone_ttl_ms: u64) -> usize {
        self.store.write().await.cleanup_expired(tombstone_ttl_ms)
    }
}
