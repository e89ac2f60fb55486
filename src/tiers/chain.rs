//! Fallback Chain Module
//!
//! Orders the tiers for reads (fastest first) and wraps every call in the
//! tier's circuit breaker plus a per-call timeout. A skipped tier costs
//! latency, never correctness.
//!
//! A purge that does not land stays pending on its tier. Every later call to
//! that tier replays the pending purges first and skips the tier if they
//! still fail, so a recovering tier never serves what was invalidated while
//! it was down.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{CircuitBreaker, CircuitBreakerConfig, CircuitState, TierClient, TierError};
use crate::cache::{CacheEntry, CacheStats, EntryState, KeyPattern, Tier, WriteOutcome};

/// Pending purges kept per tier before they collapse into one full purge.
pub const MAX_PENDING_PURGES: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
struct PendingPurge {
    patterns: Vec<KeyPattern>,
    version: u64,
}

// == Guarded Tier ==
/// A tier client behind its own circuit breaker.
pub struct GuardedTier {
    client: Arc<dyn TierClient>,
    breaker: CircuitBreaker,
    pending: Mutex<Vec<PendingPurge>>,
}

impl GuardedTier {
    pub fn new(client: Arc<dyn TierClient>, config: CircuitBreakerConfig) -> Self {
        let breaker = CircuitBreaker::new(client.tier().to_string(), config);
        Self {
            client,
            breaker,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn tier(&self) -> Tier {
        self.client.tier()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn client(&self) -> &Arc<dyn TierClient> {
        &self.client
    }

    /// Purges recorded but not yet applied to this tier.
    pub fn pending_purges(&self) -> usize {
        self.lock_pending().len()
    }

    pub async fn fetch(&self, key: &str, timeout: Duration) -> Result<Option<CacheEntry>, TierError> {
        self.flush_pending(timeout).await?;
        self.breaker
            .call(|| with_timeout(timeout, self.client.fetch(key)))
            .await
    }

    pub async fn store(&self, entry: CacheEntry, timeout: Duration) -> Result<WriteOutcome, TierError> {
        self.flush_pending(timeout).await?;
        self.breaker
            .call(|| with_timeout(timeout, self.client.store(entry)))
            .await
    }

    /// Records the purge and applies everything pending, oldest first.
    /// On failure the purge stays pending. Returns entries removed.
    pub async fn purge(
        &self,
        patterns: &[KeyPattern],
        version: u64,
        timeout: Duration,
    ) -> Result<usize, TierError> {
        self.defer_purge(patterns, version);
        self.flush_pending(timeout).await
    }

    /// Applies pending purges in order, stopping at the first failure.
    pub async fn flush_pending(&self, timeout: Duration) -> Result<usize, TierError> {
        let queued = self.lock_pending().clone();
        if queued.is_empty() {
            return Ok(0);
        }

        let mut purged = 0;
        let mut applied = Vec::with_capacity(queued.len());
        let mut outcome = Ok(());
        for purge in queued {
            let result = self
                .breaker
                .call(|| with_timeout(timeout, self.client.purge(&purge.patterns, purge.version)))
                .await;
            match result {
                Ok(count) => {
                    purged += count;
                    applied.push(purge);
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        let remaining = {
            let mut pending = self.lock_pending();
            pending.retain(|purge| !applied.contains(purge));
            pending.len()
        };
        if !applied.is_empty() && remaining == 0 && outcome.is_ok() {
            debug!(tier = %self.tier(), purged, "pending purges applied");
        }
        outcome.map(|_| purged)
    }

    fn defer_purge(&self, patterns: &[KeyPattern], version: u64) {
        let purge = PendingPurge {
            patterns: patterns.to_vec(),
            version,
        };
        let mut pending = self.lock_pending();
        if pending.contains(&purge) {
            return;
        }
        if pending.len() >= MAX_PENDING_PURGES {
            let newest = pending.iter().map(|p| p.version).fold(version, u64::max);
            warn!(
                tier = %self.tier(),
                pending = pending.len(),
                "pending purges overflowed, tier will be purged in full"
            );
            pending.clear();
            pending.push(PendingPurge {
                patterns: vec![KeyPattern::new("*")],
                version: newest,
            });
            return;
        }
        pending.push(purge);
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<PendingPurge>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    call: impl std::future::Future<Output = Result<T, TierError>>,
) -> Result<T, TierError> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| TierError::Timeout(timeout))?
}

// == Lookup Result ==
#[derive(Debug, Clone)]
pub struct ChainHit {
    pub entry: CacheEntry,
    pub tier: Tier,
    /// Position in the chain, used to backfill the faster tiers
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct ChainLookup {
    /// First fresh hit, walking fastest to slowest
    pub fresh: Option<ChainHit>,
    /// Newest stale-but-servable hit seen on the way
    pub stale: Option<ChainHit>,
    /// Tiers that were open or failed during this lookup
    pub skipped: Vec<Tier>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierHealth {
    pub tier: Tier,
    pub circuit: CircuitState,
    pub error_rate: f64,
    /// Purges waiting to be replayed on this tier
    pub pending_purges: usize,
    pub stats: CacheStats,
}

// == Fallback Chain ==
pub struct FallbackChain {
    tiers: Vec<GuardedTier>,
    timeout: Duration,
}

impl FallbackChain {
    /// `clients` must be ordered fastest first.
    pub fn new(
        clients: Vec<Arc<dyn TierClient>>,
        breaker: CircuitBreakerConfig,
        timeout: Duration,
    ) -> Self {
        let tiers = clients
            .into_iter()
            .map(|client| GuardedTier::new(client, breaker.clone()))
            .collect();
        Self { tiers, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn tiers(&self) -> &[GuardedTier] {
        &self.tiers
    }

    pub fn get(&self, tier: Tier) -> Option<&GuardedTier> {
        self.tiers.iter().find(|guarded| guarded.tier() == tier)
    }

    // == Lookup ==
    /// Walks the tiers until a fresh hit. Stale hits are remembered as a
    /// fallback and the walk continues toward slower tiers.
    pub async fn lookup(&self, key: &str) -> ChainLookup {
        let mut lookup = ChainLookup::default();

        for (index, guarded) in self.tiers.iter().enumerate() {
            let tier = guarded.tier();
            match guarded.fetch(key, self.timeout).await {
                Ok(Some(entry)) => {
                    let hit = ChainHit { entry, tier, index };
                    match hit.entry.state() {
                        EntryState::Fresh => {
                            lookup.fresh = Some(hit);
                            return lookup;
                        }
                        EntryState::Stale => {
                            let newer = lookup
                                .stale
                                .as_ref()
                                .map_or(true, |seen| hit.entry.version > seen.entry.version);
                            if newer {
                                lookup.stale = Some(hit);
                            }
                        }
                        EntryState::Expired => {}
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(key = %key, tier = %tier, error = %err, "tier unavailable, skipping");
                    lookup.skipped.push(tier);
                }
            }
        }

        lookup
    }

    // == Store ==
    /// Writes `entry` into every tier before position `index`.
    pub async fn store_upto(&self, entry: &CacheEntry, index: usize) -> Vec<(Tier, Result<WriteOutcome, TierError>)> {
        let mut outcomes = Vec::with_capacity(index);
        for guarded in self.tiers.iter().take(index) {
            let outcome = guarded.store(entry.clone(), self.timeout).await;
            if let Err(err) = &outcome {
                debug!(key = %entry.key, tier = %guarded.tier(), error = %err, "backfill skipped");
            }
            outcomes.push((guarded.tier(), outcome));
        }
        outcomes
    }

    /// Writes `entry` into every tier whose circuit admits it.
    pub async fn store_all(&self, entry: &CacheEntry) -> Vec<(Tier, Result<WriteOutcome, TierError>)> {
        self.store_upto(entry, self.tiers.len()).await
    }

    // == Purge ==
    /// Purges the named tiers in the order given.
    pub async fn purge_tiers(
        &self,
        tiers: &[Tier],
        patterns: &[KeyPattern],
        version: u64,
    ) -> Vec<(Tier, Result<usize, TierError>)> {
        let mut results = Vec::with_capacity(tiers.len());
        for tier in tiers {
            if let Some(guarded) = self.get(*tier) {
                results.push((*tier, guarded.purge(patterns, version, self.timeout).await));
            }
        }
        results
    }

    // == Health ==
    pub async fn health(&self) -> Vec<TierHealth> {
        let mut health = Vec::with_capacity(self.tiers.len());
        for guarded in &self.tiers {
            health.push(TierHealth {
                tier: guarded.tier(),
                circuit: guarded.breaker.state(),
                error_rate: guarded.breaker.error_rate(),
                pending_purges: guarded.pending_purges(),
                stats: guarded.client.stats().await,
            });
        }
        health
    }

    /// Worst error rate across tiers, fed into TTL resolution.
    pub fn error_rate(&self) -> f64 {
        self.tiers
            .iter()
            .map(|guarded| guarded.breaker.error_rate())
            .fold(0.0, f64::max)
    }

    /// Replays pending purges on every tier whose circuit admits a call.
    /// Returns the number of purges still pending.
    pub async fn flush_pending(&self) -> usize {
        let mut remaining = 0;
        for guarded in &self.tiers {
            if guarded.pending_purges() == 0 {
                continue;
            }
            match guarded.flush_pending(self.timeout).await {
                Ok(purged) => info!(tier = %guarded.tier(), purged, "pending purges replayed"),
                Err(err) => debug!(tier = %guarded.tier(), error = %err, "pending purges still blocked"),
            }
            remaining += guarded.pending_purges();
        }
        remaining
    }

    /// Runs expiry cleanup on every tier. Returns entries removed.
    pub async fn sweep_all(&self, tombstone_ttl_ms: u64) -> usize {
        let mut removed = 0;
        for guarded in &self.tiers {
            removed += guarded.client.sweep(tombstone_ttl_ms).await;
        }
        removed
    }
}
