//! Cache Entry Module
//!
//! Defines a versioned cache entry with a fresh deadline and an absolute
//! staleness bound.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// == Tier ==
/// Cache tier an entry was read from or written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Local,
    Regional,
    Edge,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Local => write!(f, "local"),
            Tier::Regional => write!(f, "regional"),
            Tier::Edge => write!(f, "edge"),
        }
    }
}

// == Entry State ==
/// Freshness of an entry relative to a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Before `fresh_until`
    Fresh,
    /// Past `fresh_until` but before `stale_until`; servable as a fallback
    Stale,
    /// Past `stale_until`; must never be served
    Expired,
}

// == Cache Entry ==
/// A single cached query result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Tier-agnostic key
    pub key: String,
    /// Serialized snapshot of the query result
    pub value: Arc<Vec<u8>>,
    /// Non-decreasing per key; lower versions are discarded on write
    pub version: u64,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Normal expiry (Unix milliseconds)
    pub fresh_until: u64,
    /// Absolute serving bound (Unix milliseconds), always >= `fresh_until`
    pub stale_until: u64,
    /// Invalidation tags this entry belongs to
    pub tags: BTreeSet<String>,
    /// Provenance, for diagnostics only
    pub tier: Tier,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an entry that is fresh for `fresh_ttl` and servable for
    /// `stale_ttl`, both measured from now.
    ///
    /// A `stale_ttl` shorter than `fresh_ttl` is raised to `fresh_ttl`.
    pub fn new(
        key: impl Into<String>,
        value: Vec<u8>,
        version: u64,
        fresh_ttl: Duration,
        stale_ttl: Duration,
        tags: BTreeSet<String>,
    ) -> Self {
        let now = current_timestamp_ms();
        let fresh_until = now.saturating_add(fresh_ttl.as_millis() as u64);
        let stale_until = now
            .saturating_add(stale_ttl.as_millis() as u64)
            .max(fresh_until);

        Self {
            key: key.into(),
            value: Arc::new(value),
            version,
            created_at: now,
            fresh_until,
            stale_until,
            tags,
            tier: Tier::Local,
        }
    }

    /// Returns a copy stamped with the tier it is being written to.
    pub fn for_tier(&self, tier: Tier) -> Self {
        Self {
            tier,
            ..self.clone()
        }
    }

    // == State ==
    /// Classifies the entry at `now_ms`.
    ///
    /// Both bounds are exclusive: at exactly `stale_until` the entry is expired.
    pub fn state_at(&self, now_ms: u64) -> EntryState {
        if now_ms < self.fresh_until {
            EntryState::Fresh
        } else if now_ms < self.stale_until {
            EntryState::Stale
        } else {
            EntryState::Expired
        }
    }

    /// Classifies the entry at the current time.
    pub fn state(&self) -> EntryState {
        self.state_at(current_timestamp_ms())
    }

    /// True while the entry may still be handed to a caller.
    pub fn is_servable(&self) -> bool {
        self.state() != EntryState::Expired
    }

    // == Time To Live ==
    /// Remaining fresh lifetime, zero once stale.
    pub fn fresh_remaining(&self) -> Duration {
        Duration::from_millis(self.fresh_until.saturating_sub(current_timestamp_ms()))
    }

    /// Total fresh lifetime the entry was created with.
    pub fn fresh_lifetime(&self) -> Duration {
        Duration::from_millis(self.fresh_until.saturating_sub(self.created_at))
    }

    /// Remaining lifetime in seconds until `stale_until`.
    pub fn ttl_remaining(&self) -> u64 {
        self.stale_until.saturating_sub(current_timestamp_ms()) / 1000
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
