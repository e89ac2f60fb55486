//! Tiered Cache - multi-tier cache consistency and invalidation engine
//!
//! Keeps Local, Regional and Edge caches of hierarchical configuration data
//! consistent with the source of truth: change events are turned into
//! invalidation plans, stale data is bounded and served under failure, and
//! each tier is guarded by a circuit breaker.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invalidation;
pub mod keys;
pub mod models;
pub mod source;
pub mod tasks;
pub mod tiers;
pub mod ttl;

pub use api::AppState;
pub use cache::{CacheEntry, EntryState, KeyPattern, Tier, VersionClock};
pub use config::Config;
pub use error::{CacheError, Result};
pub use events::{change_event_bus, ChangeEvent, ChangeEventPublisher, ChangeEventStream, EntityType, Operation};
pub use gateway::{CacheGateway, GatewayBuilder, GatewayStats, Served, ServedBy};
pub use invalidation::{ExecutionReport, InvalidationEngine, InvalidationNotice, InvalidationPlan, PlanBuilder};
pub use keys::{DerivedKey, KeyRegistry, Query};
pub use source::{Loader, MemorySource, SourceError, SourceOfTruth};
pub use tasks::{spawn_cleanup_task, spawn_event_consumer};
pub use ttl::{TtlClass, TtlMetadata, TtlPolicy};
