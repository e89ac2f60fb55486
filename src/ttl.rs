//! TTL policy.
//!
//! Maps a volatility class to a base `(fresh, stale)` pair and adjusts it for
//! update frequency, payload size, generation cost, load, tier health and time
//! of day. Also decides when a hot key should be revalidated ahead of expiry,
//! and tracks how often invalidation tags change to classify update frequency.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::cache::KeyPattern;

/// Lower bound applied to every adjusted fresh TTL.
pub const MIN_TTL: Duration = Duration::from_secs(30);

// == TTL Class ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlClass {
    /// Hierarchy, validation rules
    Static,
    /// Lists, aggregates
    Dynamic,
    /// Counters
    RealTime,
    /// Compatibility views
    Legacy,
}

/// How often the underlying data changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFrequency {
    High,
    #[default]
    Normal,
    Low,
}

// == TTL Metadata ==
/// Observations that drive dynamic adjustment. Defaults apply no adjustment
/// except the business-hours dampener, which depends on `now`.
#[derive(Debug, Clone)]
pub struct TtlMetadata {
    pub update_frequency: UpdateFrequency,
    pub payload_bytes: usize,
    pub generation_cost: Duration,
    /// Requests per minute for the key
    pub request_rate: f64,
    /// Fraction of failed calls on the serving tiers, 0.0..=1.0
    pub tier_error_rate: f64,
    pub now: DateTime<Utc>,
}

impl Default for TtlMetadata {
    fn default() -> Self {
        Self {
            update_frequency: UpdateFrequency::Normal,
            payload_bytes: 0,
            generation_cost: Duration::ZERO,
            request_rate: 0.0,
            tier_error_rate: 0.0,
            now: Utc::now(),
        }
    }
}

// == Access Stats ==
/// Per-key access observations used for early refresh.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessStats {
    pub requests_per_minute: f64,
}

/// Base fresh TTL and additional stale window for one class.
#[derive(Debug, Clone, Copy)]
pub struct BaseTtl {
    pub fresh: Duration,
    pub stale_extra: Duration,
}

// == TTL Policy Config ==
#[derive(Debug, Clone)]
pub struct TtlPolicyConfig {
    pub static_ttl: BaseTtl,
    pub dynamic_ttl: BaseTtl,
    pub realtime_ttl: BaseTtl,
    pub legacy_ttl: BaseTtl,
    pub large_payload_bytes: usize,
    pub expensive_generation: Duration,
    /// Requests per minute above which cache is favored over reload
    pub request_rate_threshold: f64,
    pub error_rate_threshold: f64,
    /// Inclusive start, exclusive end, UTC hours
    pub business_hours: (u32, u32),
    /// Minimum requests per minute for a key to count as hot
    pub hot_key_rate: f64,
    /// Fraction of fresh TTL remaining below which hot keys refresh early
    pub early_refresh_ratio: f64,
}

impl Default for TtlPolicyConfig {
    fn default() -> Self {
        Self {
            static_ttl: BaseTtl {
                fresh: Duration::from_secs(60 * 60),
                stale_extra: Duration::from_secs(12 * 60 * 60),
            },
            dynamic_ttl: BaseTtl {
                fresh: Duration::from_secs(3 * 60),
                stale_extra: Duration::from_secs(15 * 60),
            },
            realtime_ttl: BaseTtl {
                fresh: Duration::from_secs(20),
                stale_extra: Duration::from_secs(3 * 60),
            },
            legacy_ttl: BaseTtl {
                fresh: Duration::from_secs(2 * 60 * 60),
                stale_extra: Duration::from_secs(24 * 60 * 60),
            },
            large_payload_bytes: 100 * 1024,
            expensive_generation: Duration::from_secs(1),
            request_rate_threshold: 100.0,
            error_rate_threshold: 0.05,
            business_hours: (9, 18),
            hot_key_rate: 100.0,
            early_refresh_ratio: 0.15,
        }
    }
}

// == TTL Policy ==
#[derive(Debug, Clone, Default)]
pub struct TtlPolicy {
    config: TtlPolicyConfig,
}

impl TtlPolicy {
    pub fn new(config: TtlPolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TtlPolicyConfig {
        &self.config
    }

    pub fn base(&self, class: TtlClass) -> BaseTtl {
        match class {
            TtlClass::Static => self.config.static_ttl,
            TtlClass::Dynamic => self.config.dynamic_ttl,
            TtlClass::RealTime => self.config.realtime_ttl,
            TtlClass::Legacy => self.config.legacy_ttl,
        }
    }

    // == Resolve TTL ==
    /// Returns `(fresh_ttl, stale_ttl)` in whole seconds, both measured from
    /// now, with `stale_ttl >= fresh_ttl` and `fresh_ttl >= MIN_TTL`.
    pub fn resolve(&self, class: TtlClass, meta: &TtlMetadata) -> (Duration, Duration) {
        let base = self.base(class);
        let cfg = &self.config;
        let mut fresh = base.fresh.as_secs_f64();
        let mut stale_extra = base.stale_extra.as_secs_f64();

        fresh *= match meta.update_frequency {
            UpdateFrequency::High => 0.5,
            UpdateFrequency::Normal => 1.0,
            UpdateFrequency::Low => 2.0,
        };
        if meta.payload_bytes > cfg.large_payload_bytes {
            fresh *= 1.5;
        }
        if meta.generation_cost > cfg.expensive_generation {
            fresh *= 2.0;
        }
        if meta.request_rate > cfg.request_rate_threshold {
            fresh *= 1.2;
        }
        if meta.tier_error_rate > cfg.error_rate_threshold {
            fresh *= 5.0;
            stale_extra *= 5.0;
        }
        if self.is_business_hours(meta.now) {
            fresh *= 0.8;
        }

        let fresh = Duration::from_secs(fresh.round() as u64).max(MIN_TTL);
        let stale = fresh + Duration::from_secs(stale_extra.round() as u64);
        (fresh, stale)
    }

    fn is_business_hours(&self, now: DateTime<Utc>) -> bool {
        let (start, end) = self.config.business_hours;
        let hour = now.hour();
        hour >= start && hour < end
    }

    // == Early Refresh ==
    /// True when `key` is hot and its remaining fresh lifetime has dropped
    /// below its refresh threshold.
    ///
    /// The threshold is jittered per key between 1x and 1.33x of
    /// `early_refresh_ratio` so hot keys cached together do not all refresh
    /// on the same tick.
    pub fn should_refresh_early(
        &self,
        key: &str,
        remaining: Duration,
        total_fresh: Duration,
        stats: &AccessStats,
    ) -> bool {
        if stats.requests_per_minute < self.config.hot_key_rate || total_fresh.is_zero() {
            return false;
        }
        if remaining.is_zero() {
            // Already stale; the normal miss/revalidate path handles it.
            return false;
        }
        let ratio = self.config.early_refresh_ratio * (1.0 + key_jitter(key) / 3.0);
        remaining.as_secs_f64() <= total_fresh.as_secs_f64() * ratio
    }
}

/// Stable value in `0.0..1.0` derived from the key.
fn key_jitter(key: &str) -> f64 {
    let digest = Sha256::digest(key.as_bytes());
    let n = u16::from_be_bytes([digest[0], digest[1]]);
    n as f64 / (u16::MAX as f64 + 1.0)
}

// == Access Tracker ==
#[derive(Debug, Clone, Copy)]
struct AccessWindow {
    started: Instant,
    current: u64,
    previous: u64,
}

/// Per-key request rate over a sliding one-minute window, estimated from the
/// current and previous fixed windows.
#[derive(Debug)]
pub struct AccessTracker {
    windows: DashMap<String, AccessWindow>,
    window: Duration,
}

impl Default for AccessTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl AccessTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window: window.max(Duration::from_millis(1)),
        }
    }

    /// Counts one request for `key` and returns the updated rate.
    pub fn record(&self, key: &str) -> AccessStats {
        let now = Instant::now();
        let mut slot = self.windows.entry(key.to_string()).or_insert(AccessWindow {
            started: now,
            current: 0,
            previous: 0,
        });
        self.roll(&mut slot, now);
        slot.current += 1;
        self.estimate(&slot, now)
    }

    pub fn stats(&self, key: &str) -> AccessStats {
        let now = Instant::now();
        match self.windows.get_mut(key) {
            Some(mut slot) => {
                self.roll(&mut slot, now);
                self.estimate(&slot, now)
            }
            None => AccessStats::default(),
        }
    }

    /// Forgets keys with no requests in the last two windows.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, slot| now.duration_since(slot.started) < self.window * 2);
        before - self.windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn roll(&self, slot: &mut AccessWindow, now: Instant) {
        let elapsed = now.duration_since(slot.started);
        if elapsed >= self.window * 2 {
            *slot = AccessWindow {
                started: now,
                current: 0,
                previous: 0,
            };
        } else if elapsed >= self.window {
            slot.previous = slot.current;
            slot.current = 0;
            slot.started += self.window;
        }
    }

    fn estimate(&self, slot: &AccessWindow, now: Instant) -> AccessStats {
        let progress = (now.duration_since(slot.started).as_secs_f64()
            / self.window.as_secs_f64())
        .min(1.0);
        let in_window = slot.previous as f64 * (1.0 - progress) + slot.current as f64;
        AccessStats {
            requests_per_minute: in_window * 60.0 / self.window.as_secs_f64(),
        }
    }
}

// == Change Tracker ==
/// Changes per hour at or above which a tag counts as frequently updated.
pub const HIGH_CHANGES_PER_HOUR: f64 = 6.0;

const CHANGE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Mutation rate per invalidation tag over a sliding one-hour window.
///
/// Every purged family or exact pattern counts as one change of the tag it
/// is anchored on, so `cat:detail:X:*` counts against entries tagged
/// `cat:detail:X`.
#[derive(Debug)]
pub struct ChangeTracker {
    changes: AccessTracker,
    started: Instant,
    high_per_hour: f64,
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self::new(HIGH_CHANGES_PER_HOUR)
    }
}

impl ChangeTracker {
    pub fn new(high_per_hour: f64) -> Self {
        Self {
            changes: AccessTracker::new(CHANGE_WINDOW),
            started: Instant::now(),
            high_per_hour,
        }
    }

    pub fn record(&self, pattern: &KeyPattern) {
        if let Some(base) = pattern.family_base() {
            self.changes.record(base);
        }
    }

    pub fn changes_per_hour(&self, tag: &str) -> f64 {
        self.changes.stats(tag).requests_per_minute * 60.0
    }

    /// High when any tag changed at least `high_per_hour` times in the last
    /// hour, Low when none changed during a full hour of observation.
    pub fn frequency<'a, I>(&self, tags: I) -> UpdateFrequency
    where
        I: IntoIterator<Item = &'a str>,
    {
        let busiest = tags
            .into_iter()
            .map(|tag| self.changes_per_hour(tag))
            .fold(0.0, f64::max);
        if busiest >= self.high_per_hour {
            UpdateFrequency::High
        } else if busiest == 0.0 && self.started.elapsed() >= CHANGE_WINDOW {
            UpdateFrequency::Low
        } else {
            UpdateFrequency::Normal
        }
    }

    pub fn prune(&self) -> usize {
        self.changes.prune()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn night() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 2, 0, 0).unwrap()
    }

    fn meta() -> TtlMetadata {
        TtlMetadata {
            now: night(),
            ..TtlMetadata::default()
        }
    }

    #[test]
    fn test_base_values_by_class() {
        let policy = TtlPolicy::default();
        let (fresh, stale) = policy.resolve(TtlClass::Static, &meta());
        assert_eq!(fresh, Duration::from_secs(3600));
        assert_eq!(stale, Duration::from_secs(3600 + 12 * 3600));

        let (fresh, stale) = policy.resolve(TtlClass::Dynamic, &meta());
        assert_eq!(fresh, Duration::from_secs(180));
        assert_eq!(stale, Duration::from_secs(180 + 900));

        let (fresh, _) = policy.resolve(TtlClass::Legacy, &meta());
        assert_eq!(fresh, Duration::from_secs(7200));
    }

    #[test]
    fn test_floor_applies() {
        let policy = TtlPolicy::default();
        let m = TtlMetadata {
            update_frequency: UpdateFrequency::High,
            ..meta()
        };
        let (fresh, stale) = policy.resolve(TtlClass::RealTime, &m);
        assert_eq!(fresh, MIN_TTL);
        assert!(stale >= fresh);
    }

    #[test]
    fn test_multipliers_compound() {
        let policy = TtlPolicy::default();
        let m = TtlMetadata {
            update_frequency: UpdateFrequency::Low,
            payload_bytes: 200 * 1024,
            generation_cost: Duration::from_secs(2),
            request_rate: 500.0,
            ..meta()
        };
        let (fresh, _) = policy.resolve(TtlClass::Dynamic, &m);
        // 180 * 2 * 1.5 * 2 * 1.2
        assert_eq!(fresh.as_secs(), 1296);
    }

    #[test]
    fn test_error_rate_favors_availability() {
        let policy = TtlPolicy::default();
        let m = TtlMetadata {
            tier_error_rate: 0.2,
            ..meta()
        };
        let (fresh, stale) = policy.resolve(TtlClass::Dynamic, &m);
        assert_eq!(fresh, Duration::from_secs(900));
        assert_eq!(stale, Duration::from_secs(900 + 4500));
    }

    #[test]
    fn test_business_hours_dampener() {
        let policy = TtlPolicy::default();
        let m = TtlMetadata {
            now: Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap(),
            ..TtlMetadata::default()
        };
        let (fresh, _) = policy.resolve(TtlClass::Static, &m);
        assert_eq!(fresh, Duration::from_secs(2880));
    }

    #[test]
    fn test_early_refresh_only_for_hot_keys() {
        let policy = TtlPolicy::default();
        let total = Duration::from_secs(100);
        let cold = AccessStats { requests_per_minute: 5.0 };
        let hot = AccessStats { requests_per_minute: 500.0 };

        assert!(!policy.should_refresh_early("k", Duration::from_secs(1), total, &cold));
        assert!(policy.should_refresh_early("k", Duration::from_secs(1), total, &hot));
        assert!(!policy.should_refresh_early("k", Duration::from_secs(90), total, &hot));
        assert!(!policy.should_refresh_early("k", Duration::ZERO, total, &hot));
    }

    #[test]
    fn test_early_refresh_threshold_is_jittered_within_bounds() {
        let policy = TtlPolicy::default();
        let total = Duration::from_secs(1000);
        let hot = AccessStats { requests_per_minute: 500.0 };
        for i in 0..50 {
            let key = format!("v1:cat:detail:{i}");
            // Always refresh below the base ratio, never above the jittered ceiling.
            assert!(policy.should_refresh_early(&key, Duration::from_secs(149), total, &hot));
            assert!(!policy.should_refresh_early(&key, Duration::from_secs(201), total, &hot));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_tracker_rate() {
        let tracker = AccessTracker::default();
        for _ in 0..120 {
            tracker.record("hot");
        }
        tracker.record("cold");

        assert!((tracker.stats("hot").requests_per_minute - 120.0).abs() < 1e-9);
        assert!((tracker.stats("cold").requests_per_minute - 1.0).abs() < 1e-9);
        assert_eq!(tracker.stats("unknown").requests_per_minute, 0.0);

        // Halfway into the next window the previous minute still counts half.
        tokio::time::advance(Duration::from_secs(90)).await;
        let rate = tracker.stats("hot").requests_per_minute;
        assert!((rate - 60.0).abs() < 1e-6);

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(tracker.prune(), 2);
        assert!(tracker.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_tracker_classifies_frequency() {
        let tracker = ChangeTracker::new(6.0);
        let pattern = KeyPattern::family("cat:detail:X");
        for _ in 0..10 {
            tracker.record(&pattern);
        }
        tracker.record(&KeyPattern::new("cat*"));

        assert_eq!(tracker.frequency(["cat:detail:X", "cat:X"]), UpdateFrequency::High);
        assert_eq!(tracker.frequency(["cat:detail:Y"]), UpdateFrequency::Normal);
        assert_eq!(tracker.len(), 1);

        tokio::time::advance(Duration::from_secs(3 * 60 * 60)).await;
        assert_eq!(tracker.prune(), 1);
        assert_eq!(tracker.frequency(["cat:detail:X"]), UpdateFrequency::Low);
    }
}
