//! Tier Clients Module
//!
//! A uniform async client over one cache tier, the three implementations
//! (process-local, regional distributed, edge), and the circuit-breaking
//! fallback chain that orders them for reads.

mod breaker;
mod chain;
mod edge;
mod local;
mod regional;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cache::{CacheEntry, CacheStats, KeyPattern, Tier, WriteOutcome};

pub use breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use chain::{ChainHit, ChainLookup, FallbackChain, GuardedTier, TierHealth};
pub use edge::{EdgeTier, FetchState, RevalidationLocks, RevalidationTicket};
pub use local::LocalTier;
pub use regional::RegionalTier;

// == Tier Error ==
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TierError {
    #[error("circuit open")]
    CircuitOpen,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("rejected: {0}")]
    Rejected(String),
}

// == Tier Client ==
/// Client for one cache tier. Implementations are shared across tasks and
/// must be safe for concurrent use.
#[async_trait]
pub trait TierClient: Send + Sync + 'static {
    fn tier(&self) -> Tier;

    /// Returns the entry if it is still within its staleness bound.
    async fn fetch(&self, key: &str) -> Result<Option<CacheEntry>, TierError>;

    /// Writes an entry; lower-or-equal versions are a no-op.
    async fn store(&self, entry: CacheEntry) -> Result<WriteOutcome, TierError>;

    /// Removes every entry matching any pattern, as one unit.
    async fn purge(&self, patterns: &[KeyPattern], version: u64) -> Result<usize, TierError>;

    async fn stats(&self) -> CacheStats;

    /// Drops entries past their staleness bound. Tiers that expire entries
    /// themselves keep the default no-op.
    async fn sweep(&self, _tombstone_ttl_ms: u64) -> usize {
        0
    }
}

// == Fault Injector ==
/// Simulated network conditions for remote tiers: added latency, forced
/// failures and a call counter.
#[derive(Debug, Default)]
pub struct FaultInjector {
    failing: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicU64,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Calls that reached the tier (calls rejected by a breaker never do).
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Applies latency and failure to one call.
    pub async fn before_call(&self, tier: Tier) -> Result<(), TierError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(TierError::Transport(format!("{tier} unreachable")));
        }
        Ok(())
    }
}

/// Maps store validation errors onto the tier error space.
pub(crate) fn rejected(err: crate::error::CacheError) -> TierError {
    TierError::Rejected(err.to_string())
}
