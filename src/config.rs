//! Configuration Module
//!
//! Handles loading and managing engine configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::tasks::RetryPolicy;
use crate::tiers::CircuitBreakerConfig;

/// Bounds for the background worker pool.
pub const MIN_WORKERS: usize = 16;
pub const MAX_WORKERS: usize = 64;

/// Engine configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP port of the operational surface
    pub server_port: u16,
    /// Capacity of the process-local tier
    pub local_max_entries: usize,
    /// Capacity of each regional node
    pub regional_max_entries: usize,
    /// Capacity of the edge tier
    pub edge_max_entries: usize,
    /// Timeout applied to every tier call
    pub tier_timeout_ms: u64,
    /// Consecutive failures that open a tier's circuit
    pub failure_threshold: u64,
    pub failure_window_secs: u64,
    pub breaker_cooldown_secs: u64,
    /// Background workers, clamped to 16..=64
    pub worker_pool_size: usize,
    /// Attempts for batched and retried purges
    pub batch_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Leading key segment, bumped to orphan every key at once
    pub key_version: String,
    /// Hex characters of digest kept in derived keys
    pub key_hash_len: usize,
    /// Keys remembered for collision detection
    pub key_registry_capacity: usize,
    pub key_registry_retention_secs: u64,
    /// Changes per hour that mark a tag as frequently updated
    pub high_changes_per_hour: f64,
    /// Expiry sweep interval in seconds
    pub cleanup_interval: u64,
    pub revalidation_lock_ttl_ms: u64,
    /// Regional primary-to-replica lag, zero for synchronous replication
    pub replication_lag_ms: u64,
    pub max_hierarchy_depth: usize,
    pub event_bus_capacity: usize,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `SERVER_PORT` (default: 3000)
    /// - `LOCAL_MAX_ENTRIES` (default: 10000)
    /// - `REGIONAL_MAX_ENTRIES` (default: 100000)
    /// - `EDGE_MAX_ENTRIES` (default: 100000)
    /// - `TIER_TIMEOUT_MS` (default: 250)
    /// - `FAILURE_THRESHOLD` (default: 5)
    /// - `FAILURE_WINDOW_SECS` (default: 60)
    /// - `BREAKER_COOLDOWN_SECS` (default: 30)
    /// - `WORKER_POOL_SIZE` (default: 32)
    /// - `BATCH_MAX_ATTEMPTS` (default: 5)
    /// - `RETRY_BASE_DELAY_MS` (default: 100)
    /// - `KEY_VERSION` (default: "v1")
    /// - `KEY_HASH_LEN` (default: 16)
    /// - `KEY_REGISTRY_CAPACITY` (default: 100000)
    /// - `KEY_REGISTRY_RETENTION_SECS` (default: 3600)
    /// - `HIGH_CHANGES_PER_HOUR` (default: 6)
    /// - `CLEANUP_INTERVAL` (default: 5)
    /// - `REVALIDATION_LOCK_TTL_MS` (default: 10000)
    /// - `REPLICATION_LAG_MS` (default: 0)
    /// - `MAX_HIERARCHY_DEPTH` (default: 64)
    /// - `EVENT_BUS_CAPACITY` (default: 1024)
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            server_port: env_or("SERVER_PORT", d.server_port),
            local_max_entries: env_or("LOCAL_MAX_ENTRIES", d.local_max_entries),
            regional_max_entries: env_or("REGIONAL_MAX_ENTRIES", d.regional_max_entries),
            edge_max_entries: env_or("EDGE_MAX_ENTRIES", d.edge_max_entries),
            tier_timeout_ms: env_or("TIER_TIMEOUT_MS", d.tier_timeout_ms),
            failure_threshold: env_or("FAILURE_THRESHOLD", d.failure_threshold),
            failure_window_secs: env_or("FAILURE_WINDOW_SECS", d.failure_window_secs),
            breaker_cooldown_secs: env_or("BREAKER_COOLDOWN_SECS", d.breaker_cooldown_secs),
            worker_pool_size: env_or("WORKER_POOL_SIZE", d.worker_pool_size),
            batch_max_attempts: env_or("BATCH_MAX_ATTEMPTS", d.batch_max_attempts),
            retry_base_delay_ms: env_or("RETRY_BASE_DELAY_MS", d.retry_base_delay_ms),
            key_version: env::var("KEY_VERSION").unwrap_or(d.key_version),
            key_hash_len: env_or("KEY_HASH_LEN", d.key_hash_len),
            key_registry_capacity: env_or("KEY_REGISTRY_CAPACITY", d.key_registry_capacity),
            key_registry_retention_secs: env_or(
                "KEY_REGISTRY_RETENTION_SECS",
                d.key_registry_retention_secs,
            ),
            high_changes_per_hour: env_or("HIGH_CHANGES_PER_HOUR", d.high_changes_per_hour),
            cleanup_interval: env_or("CLEANUP_INTERVAL", d.cleanup_interval),
            revalidation_lock_ttl_ms: env_or("REVALIDATION_LOCK_TTL_MS", d.revalidation_lock_ttl_ms),
            replication_lag_ms: env_or("REPLICATION_LAG_MS", d.replication_lag_ms),
            max_hierarchy_depth: env_or("MAX_HIERARCHY_DEPTH", d.max_hierarchy_depth),
            event_bus_capacity: env_or("EVENT_BUS_CAPACITY", d.event_bus_capacity),
        }
    }

    pub fn tier_timeout(&self) -> Duration {
        Duration::from_millis(self.tier_timeout_ms)
    }

    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.max(1),
            failure_window: Duration::from_secs(self.failure_window_secs),
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.batch_max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn workers(&self) -> usize {
        self.worker_pool_size.clamp(MIN_WORKERS, MAX_WORKERS)
    }

    pub fn replication_lag(&self) -> Duration {
        Duration::from_millis(self.replication_lag_ms)
    }

    pub fn key_registry_retention(&self) -> Duration {
        Duration::from_secs(self.key_registry_retention_secs)
    }

    pub fn revalidation_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.revalidation_lock_ttl_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 3000,
            local_max_entries: 10_000,
            regional_max_entries: 100_000,
            edge_max_entries: 100_000,
            tier_timeout_ms: 250,
            failure_threshold: 5,
            failure_window_secs: 60,
            breaker_cooldown_secs: 30,
            worker_pool_size: 32,
            batch_max_attempts: 5,
            retry_base_delay_ms: 100,
            key_version: "v1".to_string(),
            key_hash_len: 16,
            key_registry_capacity: 100_000,
            key_registry_retention_secs: 3600,
            high_changes_per_hour: 6.0,
            cleanup_interval: 5,
            revalidation_lock_ttl_ms: 10_000,
            replication_lag_ms: 0,
            max_hierarchy_depth: 64,
            event_bus_capacity: 1024,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.local_max_entries, 10_000);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.key_version, "v1");
        assert_eq!(config.tier_timeout(), Duration::from_millis(250));
        assert_eq!(config.breaker().cooldown, Duration::from_secs(30));
        assert_eq!(config.retry_policy().max_attempts, 5);
        assert_eq!(config.key_registry_capacity, 100_000);
        assert_eq!(config.key_registry_retention(), Duration::from_secs(3600));
    }

    #[test]
    fn test_config_from_env_defaults() {
        env::remove_var("SERVER_PORT");
        env::remove_var("KEY_HASH_LEN");
        env::remove_var("WORKER_POOL_SIZE");

        let config = Config::from_env();
        assert_eq!(config.server_port, 3000);
        assert_eq!(config.key_hash_len, 16);
        assert_eq!(config.workers(), 32);
    }

    #[test]
    fn test_worker_pool_is_clamped() {
        let small = Config {
            worker_pool_size: 2,
            ..Config::default()
        };
        let large = Config {
            worker_pool_size: 1000,
            ..Config::default()
        };
        assert_eq!(small.workers(), MIN_WORKERS);
        assert_eq!(large.workers(), MAX_WORKERS);
    }
}
