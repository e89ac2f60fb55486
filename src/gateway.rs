//! Cache Gateway
//!
//! The single entry point consumers call. Reads walk Local, Regional and Edge
//! through the fallback chain and fall back to the caller's loader; faster
//! tiers are backfilled on the way out. Invalidation goes through the engine,
//! and notices from other instances purge this instance's local tier.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, EntryState, KeyPattern, Tier, VersionClock, TOMBSTONE_TTL};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::events::ChangeEvent;
use crate::invalidation::{
    EngineStats, ExecutionReport, InvalidationEngine, InvalidationNotice, InvalidationPlan,
    PlanBuilder, Preloader,
};
use crate::keys::{DerivedKey, KeyRegistry, Query};
use crate::source::{Loader, QueryLoader, SourceOfTruth};
use crate::tasks::BackgroundPool;
use crate::tiers::{
    ChainHit, EdgeTier, FallbackChain, LocalTier, RegionalTier, TierClient, TierHealth,
};
use crate::ttl::{AccessStats, AccessTracker, ChangeTracker, TtlClass, TtlMetadata, TtlPolicy};

// == Served ==
/// Which layer ultimately answered a request. Observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServedBy {
    Local,
    Regional,
    Edge,
    Source,
}

impl From<Tier> for ServedBy {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Local => ServedBy::Local,
            Tier::Regional => ServedBy::Regional,
            Tier::Edge => ServedBy::Edge,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Served {
    pub value: Arc<Vec<u8>>,
    pub served_by: ServedBy,
    pub state: EntryState,
    pub version: u64,
}

impl Served {
    fn from_hit(hit: &ChainHit, state: EntryState) -> Self {
        Self {
            value: hit.entry.value.clone(),
            served_by: hit.tier.into(),
            state,
            version: hit.entry.version,
        }
    }
}

// == Stats ==
#[derive(Debug, Default)]
struct GatewayCounters {
    local: AtomicU64,
    regional: AtomicU64,
    edge: AtomicU64,
    source: AtomicU64,
    stale_fallbacks: AtomicU64,
    revalidations: AtomicU64,
    early_refreshes: AtomicU64,
    load_failures: AtomicU64,
    remote_notices: AtomicU64,
}

impl GatewayCounters {
    fn served(&self, by: ServedBy) {
        let counter = match by {
            ServedBy::Local => &self.local,
            ServedBy::Regional => &self.regional,
            ServedBy::Edge => &self.edge,
            ServedBy::Source => &self.source,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServedCounts {
    pub local: u64,
    pub regional: u64,
    pub edge: u64,
    pub source: u64,
    pub stale_fallbacks: u64,
    pub revalidations: u64,
    pub early_refreshes: u64,
    pub load_failures: u64,
    pub remote_notices: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub instance_id: String,
    pub served: ServedCounts,
    pub tiers: Vec<TierHealth>,
    pub engine: EngineStats,
    pub tracked_keys: usize,
    pub background_pending: usize,
}

// == Gateway Builder ==
pub struct GatewayBuilder {
    config: Config,
    regional: Option<RegionalTier>,
    edge: Option<EdgeTier>,
    source: Option<Arc<dyn SourceOfTruth>>,
    notices: Option<broadcast::Sender<InvalidationNotice>>,
    clock: Option<Arc<VersionClock>>,
    ttl: TtlPolicy,
    instance_id: Option<String>,
}

impl GatewayBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            regional: None,
            edge: None,
            source: None,
            notices: None,
            clock: None,
            ttl: TtlPolicy::default(),
            instance_id: None,
        }
    }

    /// Shares a regional cluster with other gateways.
    pub fn regional(mut self, regional: RegionalTier) -> Self {
        self.regional = Some(regional);
        self
    }

    /// Shares an edge tier with other gateways.
    pub fn edge(mut self, edge: EdgeTier) -> Self {
        self.edge = Some(edge);
        self
    }

    /// Source used for preloads and `get_or_load_query`.
    pub fn source(mut self, source: Arc<dyn SourceOfTruth>) -> Self {
        self.source = Some(source);
        self
    }

    /// The `cache:invalidate` channel shared by every instance.
    pub fn broadcast(mut self, notices: broadcast::Sender<InvalidationNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn clock(mut self, clock: Arc<VersionClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ttl_policy(mut self, ttl: TtlPolicy) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Builds the gateway and starts its cross-instance listener. Must be
    /// called inside a tokio runtime.
    pub fn build(self) -> CacheGateway {
        let config = self.config;
        let local = LocalTier::new(config.local_max_entries);
        let regional = self
            .regional
            .unwrap_or_else(|| RegionalTier::new(config.regional_max_entries, config.replication_lag()));
        let pool = BackgroundPool::new(config.workers());
        let edge = self.edge.unwrap_or_else(|| {
            EdgeTier::new(config.edge_max_entries, config.revalidation_lock_ttl()).with_pool(pool.clone())
        });
        let notices = self
            .notices
            .unwrap_or_else(|| broadcast::channel(config.event_bus_capacity.max(1)).0);
        let clock = self.clock.unwrap_or_default();
        let instance_id = self
            .instance_id
            .unwrap_or_else(|| format!("gateway-{}", std::process::id()));

        let chain = Arc::new(FallbackChain::new(
            vec![
                Arc::new(local.clone()) as Arc<dyn TierClient>,
                Arc::new(regional.clone()),
                Arc::new(edge.clone()),
            ],
            config.breaker(),
            config.tier_timeout(),
        ));
        let registry = Arc::new(
            KeyRegistry::new(config.key_version.clone(), config.key_hash_len)
                .with_limits(config.key_registry_capacity, config.key_registry_retention()),
        );
        let ttl = Arc::new(self.ttl);
        let changes = Arc::new(ChangeTracker::new(config.high_changes_per_hour));

        let mut engine = InvalidationEngine::new(
            chain.clone(),
            clock.clone(),
            pool.clone(),
            notices.clone(),
            instance_id.clone(),
        )
        .with_planner(PlanBuilder::new(config.max_hierarchy_depth))
        .with_retry(config.retry_policy())
        .with_change_tracker(changes.clone());
        if let Some(source) = &self.source {
            engine = engine.with_preloader(Preloader {
                source: source.clone(),
                registry: registry.clone(),
                ttl: ttl.clone(),
            });
        }

        let counters = Arc::new(GatewayCounters::default());
        let listener = spawn_notice_listener(
            notices.subscribe(),
            local.clone(),
            clock.clone(),
            changes.clone(),
            instance_id.clone(),
            counters.clone(),
        );
        info!(instance = %instance_id, "cache gateway started");

        CacheGateway {
            inner: Arc::new(GatewayInner {
                local,
                regional,
                edge,
                chain,
                engine: Arc::new(engine),
                registry,
                ttl,
                access: AccessTracker::default(),
                changes,
                clock,
                source: self.source,
                notices,
                pool,
                counters,
                instance_id,
                listener: Mutex::new(Some(listener)),
            }),
        }
    }
}

/// Drops keys named by notices from other instances out of the local tier.
fn spawn_notice_listener(
    mut notices: broadcast::Receiver<InvalidationNotice>,
    local: LocalTier,
    clock: Arc<VersionClock>,
    changes: Arc<ChangeTracker>,
    instance_id: String,
    counters: Arc<GatewayCounters>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) if notice.origin == instance_id => {}
                Ok(notice) => {
                    clock.observe(notice.version);
                    counters.remote_notices.fetch_add(1, Ordering::Relaxed);
                    for pattern in &notice.patterns {
                        changes.record(pattern);
                    }
                    match local.purge(&notice.patterns, notice.version).await {
                        Ok(purged) => debug!(
                            origin = %notice.origin,
                            purged,
                            "applied remote invalidation"
                        ),
                        Err(err) => warn!(error = %err, "remote invalidation failed"),
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    // Unknown patterns were missed; drop everything local.
                    warn!(missed, "invalidation listener lagged, clearing local tier");
                    let _ = local.purge(&[KeyPattern::new("*")], clock.next()).await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(instance = %instance_id, "invalidation listener stopped");
    })
}

// == Cache Gateway ==
struct GatewayInner {
    local: LocalTier,
    regional: RegionalTier,
    edge: EdgeTier,
    chain: Arc<FallbackChain>,
    engine: Arc<InvalidationEngine>,
    registry: Arc<KeyRegistry>,
    ttl: Arc<TtlPolicy>,
    access: AccessTracker,
    changes: Arc<ChangeTracker>,
    clock: Arc<VersionClock>,
    source: Option<Arc<dyn SourceOfTruth>>,
    notices: broadcast::Sender<InvalidationNotice>,
    pool: BackgroundPool,
    counters: Arc<GatewayCounters>,
    instance_id: String,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for GatewayInner {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
    }
}

/// Cheap to clone; clones share every tier and counter.
#[derive(Clone)]
pub struct CacheGateway {
    inner: Arc<GatewayInner>,
}

impl CacheGateway {
    pub fn builder(config: Config) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn local(&self) -> &LocalTier {
        &self.inner.local
    }

    pub fn regional(&self) -> &RegionalTier {
        &self.inner.regional
    }

    pub fn edge(&self) -> &EdgeTier {
        &self.inner.edge
    }

    pub fn chain(&self) -> &FallbackChain {
        &self.inner.chain
    }

    pub fn engine(&self) -> &Arc<InvalidationEngine> {
        &self.inner.engine
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.inner.registry
    }

    pub fn clock(&self) -> &Arc<VersionClock> {
        &self.inner.clock
    }

    pub fn pool(&self) -> &BackgroundPool {
        &self.inner.pool
    }

    // == Get ==
    /// Tier-only read; never calls a loader. Stale entries are returned as
    /// such, expired ones never.
    pub async fn get(&self, key: &str) -> Option<Served> {
        self.inner.access.record(key);
        let lookup = self.inner.chain.lookup(key).await;

        if let Some(hit) = lookup.fresh {
            self.backfill(&hit).await;
            let served = Served::from_hit(&hit, EntryState::Fresh);
            self.inner.counters.served(served.served_by);
            return Some(served);
        }

        let hit = lookup.stale.filter(|hit| hit.entry.is_servable())?;
        let served = Served::from_hit(&hit, EntryState::Stale);
        self.inner.counters.served(served.served_by);
        Some(served)
    }

    // == Get Or Load ==
    /// Full fallback read: Local, Regional, Edge, then `loader`.
    ///
    /// A stale edge hit is served immediately and revalidated in the
    /// background. If the source is unavailable, the newest stale entry still
    /// inside its bound is served instead; otherwise `SourceUnavailable` is
    /// returned. A missing entity is `KeyNotFound` and never served stale.
    pub async fn get_or_load(
        &self,
        key: &DerivedKey,
        loader: Arc<dyn Loader>,
        class: TtlClass,
    ) -> Result<Served> {
        let access = self.inner.access.record(&key.key);
        let lookup = self.inner.chain.lookup(&key.key).await;

        if let Some(hit) = lookup.fresh {
            self.backfill(&hit).await;
            if self.inner.ttl.should_refresh_early(
                &key.key,
                hit.entry.fresh_remaining(),
                hit.entry.fresh_lifetime(),
                &access,
            ) && self.refresh_in_background(key.clone(), loader, class)
            {
                self.inner.counters.early_refreshes.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key.key, "early refresh scheduled");
            }
            let served = Served::from_hit(&hit, EntryState::Fresh);
            self.inner.counters.served(served.served_by);
            return Ok(served);
        }

        if let Some(hit) = lookup.stale.as_ref().filter(|hit| hit.tier == Tier::Edge) {
            if hit.entry.is_servable() {
                if self.refresh_in_background(key.clone(), loader, class) {
                    self.inner.counters.revalidations.fetch_add(1, Ordering::Relaxed);
                }
                let served = Served::from_hit(hit, EntryState::Stale);
                self.inner.counters.served(served.served_by);
                return Ok(served);
            }
        }

        let err = match self.load_and_store(key, loader.as_ref(), class, access).await {
            Ok(served) => return Ok(served),
            Err(err @ CacheError::SourceUnavailable(_)) => err,
            Err(err) => return Err(err),
        };
        let Some(hit) = lookup.stale.filter(|hit| hit.entry.is_servable()) else {
            return Err(err);
        };
        warn!(key = %key.key, tier = %hit.tier, error = %err, "source unavailable, serving stale entry");
        self.inner.counters.stale_fallbacks.fetch_add(1, Ordering::Relaxed);
        let served = Served::from_hit(&hit, EntryState::Stale);
        self.inner.counters.served(served.served_by);
        Ok(served)
    }

    /// Derives the key for `query` and loads it from the configured source.
    pub async fn get_or_load_query(&self, query: &Query, class: Option<TtlClass>) -> Result<Served> {
        let source = self
            .inner
            .source
            .clone()
            .ok_or_else(|| CacheError::Internal("no source of truth configured".to_string()))?;
        let key = self.inner.registry.derive(query)?;
        let loader = Arc::new(QueryLoader::new(source, query.clone()));
        self.get_or_load(&key, loader, class.unwrap_or_else(|| query.ttl_class()))
            .await
    }

    async fn load_and_store(
        &self,
        key: &DerivedKey,
        loader: &dyn Loader,
        class: TtlClass,
        access: AccessStats,
    ) -> Result<Served> {
        // Taken before loading so a purge issued meanwhile wins.
        let version = self.inner.clock.next();
        let started = Instant::now();
        let value = loader.load().await.map_err(|err| {
            self.inner.counters.load_failures.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key.key, error = %err, "loader failed");
            CacheError::from(err)
        })?;

        let frequency = self
            .inner
            .changes
            .frequency(key.tags.iter().map(String::as_str).chain([key.key.as_str()]));
        let meta = TtlMetadata {
            update_frequency: frequency,
            payload_bytes: value.len(),
            generation_cost: started.elapsed(),
            request_rate: access.requests_per_minute,
            tier_error_rate: self.inner.chain.error_rate(),
            ..TtlMetadata::default()
        };
        let (fresh, stale) = self.inner.ttl.resolve(class, &meta);
        let entry = CacheEntry::new(key.key.clone(), value, version, fresh, stale, key.tags.clone());
        self.inner.chain.store_all(&entry).await;

        self.inner.counters.served(ServedBy::Source);
        Ok(Served {
            value: entry.value,
            served_by: ServedBy::Source,
            state: EntryState::Fresh,
            version,
        })
    }

    async fn backfill(&self, hit: &ChainHit) {
        if hit.index > 0 {
            self.inner.chain.store_upto(&hit.entry, hit.index).await;
        }
    }

    /// Reloads `key` on the background pool unless a revalidation for it is
    /// already in flight. The task is detached from the calling request.
    fn refresh_in_background(&self, key: DerivedKey, loader: Arc<dyn Loader>, class: TtlClass) -> bool {
        let Some(ticket) = self.inner.edge.locks().try_begin(&key.key) else {
            return false;
        };
        let gateway = self.clone();
        self.inner.pool.spawn("revalidate", async move {
            let _ticket = ticket;
            let access = gateway.inner.access.stats(&key.key);
            if let Err(err) = gateway.load_and_store(&key, loader.as_ref(), class, access).await {
                debug!(key = %key.key, error = %err, "background revalidation failed");
            }
        });
        true
    }

    // == Invalidate ==
    /// Manual invalidation: purged on every tier and broadcast.
    pub async fn invalidate(&self, patterns: Vec<KeyPattern>) -> Result<ExecutionReport> {
        if patterns.is_empty() || patterns.iter().any(|p| p.as_str().is_empty()) {
            return Err(CacheError::InvalidRequest(
                "at least one non-empty pattern is required".to_string(),
            ));
        }
        Ok(self.inner.engine.execute(InvalidationPlan::manual(patterns)).await)
    }

    pub async fn handle_event(&self, event: &ChangeEvent) -> Result<ExecutionReport> {
        self.inner.engine.handle(event).await
    }

    // == Subscribe ==
    /// Notices whose patterns could touch a key matching `pattern`.
    pub fn subscribe(&self, pattern: KeyPattern) -> impl Stream<Item = InvalidationNotice> + Send + Unpin + 'static {
        BroadcastStream::new(self.inner.notices.subscribe()).filter_map(move |received| match received {
            Ok(notice) if notice.patterns.iter().any(|p| p.overlaps(&pattern)) => Some(notice),
            Ok(_) => None,
            Err(err) => {
                debug!(error = %err, "subscriber lagged");
                None
            }
        })
    }

    // == Maintenance ==
    /// Replays pending purges, drops expired entries and tombstones from
    /// every tier, and forgets idle access counters, change counters and
    /// registry keys. Returns the number of entries removed.
    pub async fn sweep(&self) -> usize {
        let pending = self.inner.chain.flush_pending().await;
        if pending > 0 {
            debug!(pending, "purges still pending after sweep");
        }
        let removed = self
            .inner
            .chain
            .sweep_all(TOMBSTONE_TTL.as_millis() as u64)
            .await;
        self.inner.access.prune();
        self.inner.changes.prune();
        self.inner.registry.prune();
        removed
    }

    pub async fn stats(&self) -> GatewayStats {
        let c = &self.inner.counters;
        GatewayStats {
            instance_id: self.inner.instance_id.clone(),
            served: ServedCounts {
                local: c.local.load(Ordering::Relaxed),
                regional: c.regional.load(Ordering::Relaxed),
                edge: c.edge.load(Ordering::Relaxed),
                source: c.source.load(Ordering::Relaxed),
                stale_fallbacks: c.stale_fallbacks.load(Ordering::Relaxed),
                revalidations: c.revalidations.load(Ordering::Relaxed),
                early_refreshes: c.early_refreshes.load(Ordering::Relaxed),
                load_failures: c.load_failures.load(Ordering::Relaxed),
                remote_notices: c.remote_notices.load(Ordering::Relaxed),
            },
            tiers: self.inner.chain.health().await,
            engine: self.inner.engine.stats(),
            tracked_keys: self.inner.access.len(),
            background_pending: self.inner.pool.pending(),
        }
    }
}
