//! Edge tier with stale-while-revalidate.
//!
//! `serve` is the pull-through handler an edge node runs per request: fresh
//! hits return directly, stale hits return immediately and schedule one
//! background revalidation per key on the bounded pool, misses load
//! synchronously and populate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{rejected, FaultInjector, TierClient, TierError};
use crate::cache::{
    CacheEntry, CacheStats, EntryState, KeyPattern, Tier, TierStore, VersionClock, WriteOutcome,
};
use crate::config::MIN_WORKERS;
use crate::error::{CacheError, Result};
use crate::keys::DerivedKey;
use crate::source::Loader;
use crate::tasks::BackgroundPool;

// == Fetch State ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Fresh,
    Stale,
    Miss,
}

// == Revalidation Locks ==
#[derive(Debug, Clone, Copy)]
struct LockSlot {
    token: u64,
    acquired: Instant,
}

/// Advisory per-key locks that keep at most one revalidation in flight per
/// key. A lock older than its TTL is treated as abandoned.
#[derive(Debug, Clone)]
pub struct RevalidationLocks {
    slots: Arc<DashMap<String, LockSlot>>,
    tokens: Arc<AtomicU64>,
    ttl: Duration,
}

impl RevalidationLocks {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            tokens: Arc::new(AtomicU64::new(0)),
            ttl,
        }
    }

    /// Takes the lock for `key`, or `None` if a live revalidation holds it.
    pub fn try_begin(&self, key: &str) -> Option<RevalidationTicket> {
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let slot = LockSlot {
            token,
            acquired: Instant::now(),
        };

        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().acquired.elapsed() < self.ttl {
                    return None;
                }
                held.insert(slot);
            }
            Entry::Vacant(free) => {
                free.insert(slot);
            }
        }

        Some(RevalidationTicket {
            slots: self.slots.clone(),
            key: key.to_string(),
            token,
        })
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| slot.acquired.elapsed() < self.ttl)
    }
}

/// Releases its key lock on drop, unless the lock has since been re-taken.
#[derive(Debug)]
pub struct RevalidationTicket {
    slots: Arc<DashMap<String, LockSlot>>,
    key: String,
    token: u64,
}

impl RevalidationTicket {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RevalidationTicket {
    fn drop(&mut self) {
        self.slots
            .remove_if(&self.key, |_, slot| slot.token == self.token);
    }
}

// == Edge Tier ==
#[derive(Debug, Clone)]
pub struct EdgeTier {
    store: Arc<RwLock<TierStore>>,
    faults: Arc<FaultInjector>,
    locks: RevalidationLocks,
    pool: BackgroundPool,
}

impl EdgeTier {
    pub fn new(max_entries: usize, lock_ttl: Duration) -> Self {
        Self {
            store: Arc::new(RwLock::new(TierStore::new(Tier::Edge, max_entries))),
            faults: Arc::new(FaultInjector::new()),
            locks: RevalidationLocks::new(lock_ttl),
            pool: BackgroundPool::new(MIN_WORKERS),
        }
    }

    /// Runs revalidations on `pool` instead of the tier's own.
    pub fn with_pool(mut self, pool: BackgroundPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn pool(&self) -> &BackgroundPool {
        &self.pool
    }

    pub fn faults(&self) -> Arc<FaultInjector> {
        self.faults.clone()
    }

    pub fn locks(&self) -> &RevalidationLocks {
        &self.locks
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.store.read().await.peek(key).is_some()
    }

    // == Serve ==
    /// Pull-through fetch for one request.
    pub async fn serve(
        &self,
        key: &DerivedKey,
        origin: Arc<dyn Loader>,
        ttl: (Duration, Duration),
        clock: Arc<VersionClock>,
    ) -> Result<(Arc<Vec<u8>>, FetchState)> {
        self.faults
            .before_call(Tier::Edge)
            .await
            .map_err(|err| CacheError::TierUnavailable {
                tier: Tier::Edge,
                reason: err.to_string(),
            })?;

        let cached = self.store.write().await.get(&key.key);
        match cached {
            Some(entry) if entry.state() == EntryState::Fresh => Ok((entry.value, FetchState::Fresh)),
            Some(entry) => {
                self.revalidate(key.clone(), origin, ttl, clock);
                Ok((entry.value, FetchState::Stale))
            }
            None => {
                let version = clock.next();
                let value = origin.load().await?;
                let entry = CacheEntry::new(&key.key, value, version, ttl.0, ttl.1, key.tags.clone());
                let value = entry.value.clone();
                self.store.write().await.put(entry)?;
                Ok((value, FetchState::Miss))
            }
        }
    }

    /// Schedules a refresh of `key` on the background pool unless one is
    /// already running. Returns whether a refresh was scheduled.
    pub fn revalidate(
        &self,
        key: DerivedKey,
        origin: Arc<dyn Loader>,
        ttl: (Duration, Duration),
        clock: Arc<VersionClock>,
    ) -> bool {
        let Some(ticket) = self.locks.try_begin(&key.key) else {
            debug!(key = %key.key, "revalidation already in flight");
            return false;
        };

        let store = self.store.clone();
        self.pool.spawn("edge-revalidate", async move {
            let _ticket = ticket;
            let version = clock.next();
            match origin.load().await {
                Ok(value) => {
                    let entry = CacheEntry::new(&key.key, value, version, ttl.0, ttl.1, key.tags);
                    match store.write().await.put(entry) {
                        Ok(outcome) => info!(key = %key.key, ?outcome, "edge revalidated"),
                        Err(err) => debug!(key = %key.key, error = %err, "revalidated value rejected"),
                    }
                }
                Err(err) => debug!(key = %key.key, error = %err, "edge revalidation failed"),
            }
        });
        true
    }
}

#[async_trait]
impl TierClient for EdgeTier {
    fn tier(&self) -> Tier {
        Tier::Edge
    }

    async fn fetch(&self, key: &str) -> std::result::Result<Option<CacheEntry>, TierError> {
        self.faults.before_call(Tier::Edge).await?;
        Ok(self.store.write().await.get(key))
    }

    async fn store(&self, entry: CacheEntry) -> std::result::Result<WriteOutcome, TierError> {
        self.faults.before_call(Tier::Edge).await?;
        self.store.write().await.put(entry).map_err(rejected)
    }

    /// Purge-by-pattern API of the edge platform.
    async fn purge(&self, patterns: &[KeyPattern], version: u64) -> std::result::Result<usize, TierError> {
        self.faults.before_call(Tier::Edge).await?;
        Ok(self.store.write().await.purge(patterns, version))
    }

    async fn stats(&self) -> CacheStats {
        self.store.read().await.stats()
    }

    async fn sweep(&self, tombstone_ttl_ms: u64) -> usize {
        self.store.write().await.cleanup_expired(tombstone_ttl_ms)
    }
}
