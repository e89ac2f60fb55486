//! Version Clock Module
//!
//! Issues monotonically increasing entry versions anchored to wall-clock time,
//! so versions issued by different processes stay roughly comparable.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::entry::current_timestamp_ms;

/// Low bits reserved for the per-millisecond sequence.
const SEQUENCE_BITS: u32 = 10;

// == Version Clock ==
/// Hybrid logical clock: `max(last + 1, now_ms << SEQUENCE_BITS)`.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a version strictly greater than every version issued before.
    pub fn next(&self) -> u64 {
        let wall = current_timestamp_ms() << SEQUENCE_BITS;
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = wall.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }

    /// Moves the clock past a version issued elsewhere, so local writes made
    /// after a remote purge are never shadowed by its tombstones.
    pub fn observe(&self, version: u64) {
        self.last.fetch_max(version, Ordering::AcqRel);
    }

    /// Most recently issued version, zero if none.
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_strictly_increasing() {
        let clock = VersionClock::new();
        let mut previous = 0;
        for _ in 0..10_000 {
            let v = clock.next();
            assert!(v > previous);
            previous = v;
        }
        assert_eq!(clock.current(), previous);
    }

    #[test]
    fn test_observe_remote_version() {
        let clock = VersionClock::new();
        let remote = clock.next() + 1_000_000;
        clock.observe(remote);
        assert!(clock.next() > remote);

        clock.observe(1);
        assert!(clock.current() > remote);
    }

    #[test]
    fn test_unique_across_threads() {
        let clock = Arc::new(VersionClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || (0..1000).map(|_| clock.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
