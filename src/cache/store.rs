//! Tier Store Module
//!
//! In-memory storage shared by every tier implementation: version-gated writes,
//! tag-aware pattern purges, bounded staleness on reads and LRU eviction.

use std::collections::HashMap;

use crate::cache::entry::current_timestamp_ms;
use crate::cache::{
    CacheEntry, CacheStats, EntryState, KeyPattern, LruTracker, Tier, MAX_KEY_LENGTH,
    MAX_VALUE_SIZE,
};
use crate::error::{CacheError, Result};

// == Write Outcome ==
/// Result of a write against a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Entry replaced whatever was stored
    Stored,
    /// A version at least as new is already held (or was purged); no-op
    VersionConflict { current: u64 },
    /// Entry was past `stale_until` on arrival; no-op
    AlreadyExpired,
}

impl WriteOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, WriteOutcome::Stored)
    }
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    version: u64,
    at_ms: u64,
}

// == Tier Store ==
#[derive(Debug)]
pub struct TierStore {
    tier: Tier,
    entries: HashMap<String, CacheEntry>,
    /// Highest version ever purged per key, so deletes never let versions regress
    tombstones: HashMap<String, Tombstone>,
    /// Wildcard purges; an older write matching one is rejected even if the
    /// key was absent when the purge ran
    pattern_tombstones: HashMap<KeyPattern, Tombstone>,
    lru: LruTracker,
    stats: CacheStats,
    max_entries: usize,
}

impl TierStore {
    // == Constructor ==
    pub fn new(tier: Tier, max_entries: usize) -> Self {
        Self {
            tier,
            entries: HashMap::new(),
            tombstones: HashMap::new(),
            pattern_tombstones: HashMap::new(),
            lru: LruTracker::new(),
            stats: CacheStats::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    // == Put ==
    /// Stores an entry unless a version at least as new is already known.
    ///
    /// Evicts the least recently used entry when at capacity.
    pub fn put(&mut self, entry: CacheEntry) -> Result<WriteOutcome> {
        if entry.key.is_empty() || entry.key.len() > MAX_KEY_LENGTH {
            return Err(CacheError::InvalidRequest(format!(
                "Key must be 1..={} bytes",
                MAX_KEY_LENGTH
            )));
        }
        if entry.value.len() > MAX_VALUE_SIZE {
            return Err(CacheError::InvalidRequest(format!(
                "Value exceeds maximum size of {} bytes",
                MAX_VALUE_SIZE
            )));
        }

        let current = self.current_version(&entry.key).max(self.purged_floor(&entry));
        if let Some(current) = current {
            if entry.version <= current {
                self.stats.record_discarded_write();
                return Ok(WriteOutcome::VersionConflict { current });
            }
        }

        if entry.state() == EntryState::Expired {
            return Ok(WriteOutcome::AlreadyExpired);
        }

        let is_overwrite = self.entries.contains_key(&entry.key);
        if !is_overwrite && self.entries.len() >= self.max_entries {
            if let Some(evicted) = self.lru.evict_oldest() {
                if let Some(old) = self.entries.remove(&evicted) {
                    self.remember_version(&evicted, old.version);
                }
                self.stats.record_eviction();
            }
        }

        let key = entry.key.clone();
        self.tombstones.remove(&key);
        self.entries.insert(key.clone(), entry.for_tier(self.tier));
        self.lru.touch(&key);
        self.stats.set_total_entries(self.entries.len());

        Ok(WriteOutcome::Stored)
    }

    // == Get ==
    /// Returns the entry if it is still servable (fresh or stale).
    ///
    /// Entries past `stale_until` are removed and counted as misses.
    pub fn get(&mut self, key: &str) -> Option<CacheEntry> {
        let state = match self.entries.get(key) {
            Some(entry) => entry.state(),
            None => {
                self.stats.record_miss();
                return None;
            }
        };

        match state {
            EntryState::Expired => {
                self.remove_entry(key);
                self.stats.record_miss();
                None
            }
            EntryState::Fresh | EntryState::Stale => {
                if state == EntryState::Fresh {
                    self.stats.record_hit();
                } else {
                    self.stats.record_stale_hit();
                }
                self.lru.touch(key);
                self.entries.get(key).cloned()
            }
        }
    }

    /// Reads without touching LRU order or stats.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Highest version held or purged for `key`.
    pub fn current_version(&self, key: &str) -> Option<u64> {
        let live = self.entries.get(key).map(|e| e.version);
        let dead = self.tombstones.get(key).map(|t| t.version);
        live.max(dead)
    }

    // == Purge ==
    /// Removes every entry whose key or tags match any pattern, as one unit.
    ///
    /// Removed keys, exact-pattern keys even if absent, and the wildcard
    /// patterns themselves are tombstoned at `version` so that older in-flight
    /// writes cannot resurrect anything the purge covered.
    pub fn purge(&mut self, patterns: &[KeyPattern], version: u64) -> usize {
        let doomed: Vec<String> = self
            .entries
            .values()
            .filter(|entry| patterns.iter().any(|p| p.matches_entry(entry)))
            .map(|entry| entry.key.clone())
            .collect();

        for key in &doomed {
            if let Some(entry) = self.remove_entry(key) {
                self.remember_version(key, entry.version.max(version));
            }
        }
        let at_ms = current_timestamp_ms();
        for pattern in patterns {
            if pattern.is_wildcard() {
                let stone = self
                    .pattern_tombstones
                    .entry(pattern.clone())
                    .or_insert(Tombstone { version, at_ms });
                stone.version = stone.version.max(version);
                stone.at_ms = at_ms;
            } else {
                self.remember_version(pattern.as_str(), version);
            }
        }

        self.stats.record_purged(doomed.len());
        doomed.len()
    }

    // == Delete ==
    /// Removes a single key, tombstoning it at `version`.
    pub fn delete(&mut self, key: &str, version: u64) -> bool {
        let removed = self.remove_entry(key);
        let floor = removed.as_ref().map(|e| e.version).unwrap_or(0).max(version);
        self.remember_version(key, floor);
        if removed.is_some() {
            self.stats.record_purged(1);
        }
        removed.is_some()
    }

    // == Cleanup Expired ==
    /// Removes entries past `stale_until` and tombstones older than
    /// `tombstone_ttl_ms`. Returns the number of entries removed.
    pub fn cleanup_expired(&mut self, tombstone_ttl_ms: u64) -> usize {
        let now = current_timestamp_ms();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state_at(now) == EntryState::Expired)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            if let Some(entry) = self.remove_entry(key) {
                self.remember_version(key, entry.version);
            }
        }

        self.tombstones
            .retain(|_, stone| now.saturating_sub(stone.at_ms) < tombstone_ttl_ms);
        self.pattern_tombstones
            .retain(|_, stone| now.saturating_sub(stone.at_ms) < tombstone_ttl_ms);

        expired.len()
    }

    /// Keys currently held that match `pattern`.
    pub fn matching_keys(&self, pattern: &KeyPattern) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .values()
            .filter(|entry| pattern.matches_entry(entry))
            .map(|entry| entry.key.clone())
            .collect();
        keys.sort();
        keys
    }

    // == Stats ==
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.clone();
        stats.set_total_entries(self.entries.len());
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn entries_for_test(&mut self) -> &mut HashMap<String, CacheEntry> {
        &mut self.entries
    }

    /// Highest wildcard-purge version covering the entry's key or tags.
    fn purged_floor(&self, entry: &CacheEntry) -> Option<u64> {
        self.pattern_tombstones
            .iter()
            .filter(|(pattern, _)| pattern.matches_entry(entry))
            .map(|(_, stone)| stone.version)
            .max()
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.lru.remove(key);
            self.stats.set_total_entries(self.entries.len());
        }
        removed
    }

    fn remember_version(&mut self, key: &str, version: u64) {
        let at_ms = current_timestamp_ms();
        let stone = self
            .tombstones
            .entry(key.to_string())
            .or_insert(Tombstone { version, at_ms });
        if version >= stone.version {
            stone.version = version;
            stone.at_ms = at_ms;
        }
    }
}
