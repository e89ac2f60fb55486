//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check version monotonicity, purge idempotence, bounded
//! staleness and capacity limits of the tier store.

use proptest::prelude::*;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::cache::{
    current_timestamp_ms, CacheEntry, EntryState, KeyPattern, Tier, TierStore, WriteOutcome,
};

// == Test Configuration ==
const TEST_MAX_ENTRIES: usize = 100;

// == Strategies ==
fn key_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "v1:cat:detail:a".to_string(),
        "v1:cat:detail:b".to_string(),
        "v1:cat:list:c".to_string(),
        "v1:agg:d".to_string(),
    ])
}

fn tag_strategy() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set(
        prop::sample::select(vec![
            "cat:list".to_string(),
            "cat:hierarchy".to_string(),
            "cat:children:1".to_string(),
            "agg:counts".to_string(),
        ]),
        0..3,
    )
}

fn pattern_strategy() -> impl Strategy<Value = KeyPattern> {
    prop::sample::select(vec![
        KeyPattern::new("cat:list:*"),
        KeyPattern::new("cat:hierarchy:*"),
        KeyPattern::new("agg:*"),
        KeyPattern::new("v1:cat:detail:*"),
        KeyPattern::exact("v1:cat:detail:a"),
    ])
}

#[derive(Debug, Clone)]
enum StoreOp {
    Put {
        key: String,
        version: u64,
        tags: BTreeSet<String>,
    },
    Purge {
        pattern: KeyPattern,
        version: u64,
    },
}

fn store_op_strategy() -> impl Strategy<Value = StoreOp> {
    prop_oneof![
        4 => (key_strategy(), 1u64..1_000, tag_strategy())
            .prop_map(|(key, version, tags)| StoreOp::Put { key, version, tags }),
        1 => (pattern_strategy(), 1u64..1_000)
            .prop_map(|(pattern, version)| StoreOp::Purge { pattern, version }),
    ]
}

fn entry(key: &str, version: u64, tags: BTreeSet<String>) -> CacheEntry {
    CacheEntry::new(
        key,
        version.to_be_bytes().to_vec(),
        version,
        Duration::from_secs(60),
        Duration::from_secs(600),
        tags,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    // Property: versions held for a key never decrease, whatever order writes
    // and purges arrive in.
    #[test]
    fn prop_version_is_non_decreasing(ops in prop::collection::vec(store_op_strategy(), 1..80)) {
        let mut store = TierStore::new(Tier::Regional, TEST_MAX_ENTRIES);
        let mut observed: std::collections::HashMap<String, u64> = Default::default();

        for op in ops {
            match op {
                StoreOp::Put { key, version, tags } => {
                    let outcome = store.put(entry(&key, version, tags)).unwrap();
                    if let WriteOutcome::VersionConflict { current } = outcome {
                        prop_assert!(version <= current);
                    }
                }
                StoreOp::Purge { pattern, version } => {
                    store.purge(&[pattern], version);
                }
            }

            for key in ["v1:cat:detail:a", "v1:cat:detail:b", "v1:cat:list:c", "v1:agg:d"] {
                if let Some(current) = store.current_version(key) {
                    let previous = observed.insert(key.to_string(), current).unwrap_or(0);
                    prop_assert!(current >= previous, "version for {} went {} -> {}", key, previous, current);
                }
            }
        }
    }

    // Property: a stored value always belongs to the highest version written.
    #[test]
    fn prop_last_writer_wins_by_version(versions in prop::collection::vec(1u64..10_000, 1..40)) {
        let mut store = TierStore::new(Tier::Local, TEST_MAX_ENTRIES);
        for version in &versions {
            store.put(entry("k", *version, BTreeSet::new())).unwrap();
        }
        let max = *versions.iter().max().unwrap();
        let found = store.get("k").unwrap();
        prop_assert_eq!(found.version, max);
        prop_assert_eq!(found.value.as_slice(), &max.to_be_bytes()[..]);
    }

    // Property: purging the same patterns twice leaves the same entries as
    // purging once.
    #[test]
    fn prop_purge_is_idempotent(
        puts in prop::collection::vec((key_strategy(), tag_strategy()), 1..20),
        patterns in prop::collection::vec(pattern_strategy(), 1..3)
    ) {
        let mut once = TierStore::new(Tier::Local, TEST_MAX_ENTRIES);
        let mut twice = TierStore::new(Tier::Local, TEST_MAX_ENTRIES);
        for (i, (key, tags)) in puts.into_iter().enumerate() {
            once.put(entry(&key, i as u64 + 1, tags.clone())).unwrap();
            twice.put(entry(&key, i as u64 + 1, tags)).unwrap();
        }

        once.purge(&patterns, 5_000);
        twice.purge(&patterns, 5_000);
        twice.purge(&patterns, 5_001);

        let all = KeyPattern::new("*");
        prop_assert_eq!(once.matching_keys(&all), twice.matching_keys(&all));
        for pattern in &patterns {
            prop_assert!(twice.matching_keys(pattern).is_empty());
        }
    }

    // Property: the store never exceeds its capacity.
    #[test]
    fn prop_capacity_enforcement(keys in prop::collection::vec("[a-z]{1,12}", 1..200)) {
        let max_entries = 25;
        let mut store = TierStore::new(Tier::Local, max_entries);
        for (i, key) in keys.into_iter().enumerate() {
            store.put(entry(&key, i as u64 + 1, BTreeSet::new())).unwrap();
            prop_assert!(store.len() <= max_entries);
        }
    }

    // Property: whatever the deadlines, a returned entry is within its
    // staleness bound at the moment it is returned.
    #[test]
    fn prop_never_serves_past_stale_bound(
        fresh_offset in -5_000i64..5_000,
        stale_extra in 0i64..5_000
    ) {
        let mut store = TierStore::new(Tier::Local, TEST_MAX_ENTRIES);
        let now = current_timestamp_ms() as i64;
        let mut e = entry("k", 1, BTreeSet::new());
        e.fresh_until = (now + fresh_offset).max(0) as u64;
        e.stale_until = (now + fresh_offset + stale_extra).max(0) as u64;
        store.entries_for_test().insert("k".to_string(), e);

        let before = current_timestamp_ms();
        match store.get("k") {
            Some(found) => {
                prop_assert!(before < found.stale_until);
                prop_assert_ne!(found.state_at(before), EntryState::Expired);
            }
            None => prop_assert!(store.is_empty()),
        }
    }
}
