//! Cache Statistics Module
//!
//! Per-tier counters for hits, stale hits, misses, evictions, purges and
//! version-gated write discards.

use serde::Serialize;

// == Cache Stats ==
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Reads answered with a fresh entry
    pub hits: u64,
    /// Reads answered with a stale-but-servable entry
    pub stale_hits: u64,
    /// Reads that found nothing servable
    pub misses: u64,
    /// Entries dropped by LRU capacity eviction
    pub evictions: u64,
    /// Entries removed by invalidation
    pub purged: u64,
    /// Writes discarded because their version was not newer
    pub discarded_writes: u64,
    /// Current number of entries in the store
    pub total_entries: usize,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Fresh and stale hits over all reads, 0.0 if there were none.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_stale_hit(&mut self) {
        self.stale_hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    pub fn record_purged(&mut self, count: usize) {
        self.purged += count as u64;
    }

    pub fn record_discarded_write(&mut self) {
        self.discarded_writes += 1;
    }

    pub fn set_total_entries(&mut self, count: usize) {
        self.total_entries = count;
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_no_requests() {
        assert_eq!(CacheStats::new().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_counts_stale_hits_as_served() {
        let mut stats = CacheStats::new();
        stats.record_hit();
        stats.record_stale_hit();
        stats.record_miss();
        stats.record_miss();
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_counters() {
        let mut stats = CacheStats::new();
        stats.record_eviction();
        stats.record_purged(3);
        stats.record_discarded_write();
        stats.set_total_entries(42);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.purged, 3);
        assert_eq!(stats.discarded_writes, 1);
        assert_eq!(stats.total_entries, 42);
    }
}
