//! Cache Module
//!
//! Entry model, key patterns, versioning and the in-memory store that backs
//! every tier.

mod entry;
mod lru;
mod pattern;
mod stats;
mod store;
mod version;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use entry::{current_timestamp_ms, CacheEntry, EntryState, Tier};
pub use lru::LruTracker;
pub use pattern::KeyPattern;
pub use stats::CacheStats;
pub use store::{TierStore, WriteOutcome};
pub use version::VersionClock;

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;

/// Maximum allowed value size in bytes
pub const MAX_VALUE_SIZE: usize = 4 * 1024 * 1024; // 4 MB

/// How long a purge keeps rejecting older writes for the keys it covered
pub const TOMBSTONE_TTL: std::time::Duration = std::time::Duration::from_secs(10 * 60);
