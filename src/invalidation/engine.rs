//! Invalidation Engine
//!
//! Executes an [`InvalidationPlan`] in four phases:
//!
//! 1. **Immediate**: purge Regional then Local before returning. A failed
//!    tier is logged and retried in the background; the caller is never
//!    blocked on it. Until the purge lands, the purge stays pending on the
//!    tier and the chain replays it before any other call reaches that tier.
//! 2. **Batched**: purge Local and Regional on the background pool with
//!    exponential backoff.
//! 3. **Propagate**: purge the edge and broadcast a `cache:invalidate` notice
//!    to every gateway instance.
//! 4. **Preload**: repopulate the hot keys on the background pool.
//!
//! Every purge in one plan carries the same version, so a load that started
//! before the plan can never write its older result back. Each purged pattern
//! also counts as a change of its tag, which drives update-frequency TTL
//! adjustment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{InvalidationPlan, PlanBuilder};
use crate::cache::{CacheEntry, KeyPattern, Tier, VersionClock};
use crate::error::{CacheError, Result};
use crate::events::ChangeEvent;
use crate::keys::{KeyRegistry, Query};
use crate::source::SourceOfTruth;
use crate::tasks::{retry_with_backoff, BackgroundPool, RetryPolicy};
use crate::tiers::FallbackChain;
use crate::ttl::{ChangeTracker, TtlMetadata, TtlPolicy};

/// Name of the cross-instance invalidation channel.
pub const INVALIDATE_CHANNEL: &str = "cache:invalidate";

const NEAR_TIERS: [Tier; 2] = [Tier::Regional, Tier::Local];

// == Invalidation Notice ==
/// Broadcast to every gateway after a plan's purges are issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationNotice {
    pub patterns: Vec<KeyPattern>,
    pub version: u64,
    /// Instance that executed the plan
    pub origin: String,
    pub issued_at: DateTime<Utc>,
}

// == Execution Report ==
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub version: u64,
    /// Entries removed from Local and Regional in the immediate phase
    pub immediate_purged: usize,
    /// Tiers whose immediate purge failed and was handed to a retry
    pub immediate_failed: Vec<Tier>,
    /// Entries removed from the edge, `None` if the edge purge failed
    pub edge_purged: Option<usize>,
    pub batched_scheduled: usize,
    pub preloads_scheduled: usize,
    /// Gateways that received the broadcast notice
    pub notified: usize,
}

#[derive(Debug, Default)]
struct EngineCounters {
    plans_executed: AtomicU64,
    immediate_failures: AtomicU64,
    propagation_failures: AtomicU64,
    preloads: AtomicU64,
    preload_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub plans_executed: u64,
    pub immediate_failures: u64,
    /// Background purges that gave up after every retry
    pub propagation_failures: u64,
    pub preloads: u64,
    pub preload_failures: u64,
}

// == Preloader ==
/// Repopulates a query's key from the source after a purge.
#[derive(Clone)]
pub struct Preloader {
    pub source: Arc<dyn SourceOfTruth>,
    pub registry: Arc<KeyRegistry>,
    pub ttl: Arc<TtlPolicy>,
}

impl Preloader {
    async fn preload(
        &self,
        chain: &FallbackChain,
        clock: &VersionClock,
        changes: &ChangeTracker,
        query: &Query,
    ) -> Result<String> {
        let derived = self.registry.derive(query)?;
        let version = clock.next();
        let started = Instant::now();
        let value = self.source.load(query).await?;

        let meta = TtlMetadata {
            update_frequency: changes.frequency(derived.tags.iter().map(String::as_str)),
            payload_bytes: value.len(),
            generation_cost: started.elapsed(),
            tier_error_rate: chain.error_rate(),
            ..TtlMetadata::default()
        };
        let (fresh, stale) = self.ttl.resolve(query.ttl_class(), &meta);
        let entry = CacheEntry::new(derived.key.clone(), value, version, fresh, stale, derived.tags);
        chain.store_all(&entry).await;
        Ok(derived.key)
    }
}

// == Invalidation Engine ==
pub struct InvalidationEngine {
    chain: Arc<FallbackChain>,
    planner: PlanBuilder,
    clock: Arc<VersionClock>,
    pool: BackgroundPool,
    retry: RetryPolicy,
    notices: broadcast::Sender<InvalidationNotice>,
    instance_id: String,
    preloader: Option<Preloader>,
    changes: Arc<ChangeTracker>,
    counters: Arc<EngineCounters>,
}

impl InvalidationEngine {
    pub fn new(
        chain: Arc<FallbackChain>,
        clock: Arc<VersionClock>,
        pool: BackgroundPool,
        notices: broadcast::Sender<InvalidationNotice>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            chain,
            planner: PlanBuilder::new(64),
            clock,
            pool,
            retry: RetryPolicy::default(),
            notices,
            instance_id: instance_id.into(),
            preloader: None,
            changes: Arc::new(ChangeTracker::default()),
            counters: Arc::new(EngineCounters::default()),
        }
    }

    pub fn with_planner(mut self, planner: PlanBuilder) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_preloader(mut self, preloader: Preloader) -> Self {
        self.preloader = Some(preloader);
        self
    }

    /// Shares the change-rate tracker with the read path.
    pub fn with_change_tracker(mut self, changes: Arc<ChangeTracker>) -> Self {
        self.changes = changes;
        self
    }

    pub fn changes(&self) -> &Arc<ChangeTracker> {
        &self.changes
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn pool(&self) -> &BackgroundPool {
        &self.pool
    }

    pub fn planner(&self) -> &PlanBuilder {
        &self.planner
    }

    // == Handle Event ==
    /// Plans and executes the invalidation for one change event.
    ///
    /// A fatal planning error still purges conservatively before it is
    /// returned, so a corrupt ancestor chain cannot leave stale trees behind.
    pub async fn handle(&self, event: &ChangeEvent) -> Result<ExecutionReport> {
        debug!(
            entity = %event.entity_id,
            entity_type = ?event.entity_type,
            operation = ?event.operation,
            "planning invalidation"
        );

        match self.planner.build(event) {
            Ok(plan) => Ok(self.execute(plan).await),
            Err(err) => {
                error!(entity = %event.entity_id, error = %err, "invalidation planning aborted");
                self.execute(self.planner.conservative(event)).await;
                Err(err)
            }
        }
    }

    // == Execute ==
    pub async fn execute(&self, plan: InvalidationPlan) -> ExecutionReport {
        let version = self.clock.next();
        let mut report = ExecutionReport {
            version,
            ..ExecutionReport::default()
        };
        for pattern in plan.all_patterns() {
            self.changes.record(pattern);
        }

        // Phase 1: immediate, as one unit per tier
        if !plan.immediate.is_empty() {
            for (tier, result) in self.chain.purge_tiers(&NEAR_TIERS, &plan.immediate, version).await {
                match result {
                    Ok(purged) => report.immediate_purged += purged,
                    Err(err) => {
                        self.counters.immediate_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(tier = %tier, error = %err, "immediate purge failed, retrying in background");
                        report.immediate_failed.push(tier);
                        self.schedule_purge("immediate-retry", vec![tier], plan.immediate.clone(), version);
                    }
                }
            }
        }

        // Phase 2: batched
        if !plan.batched.is_empty() {
            report.batched_scheduled = plan.batched.len();
            self.schedule_purge("batched", NEAR_TIERS.to_vec(), plan.batched.clone(), version);
        }

        // Phase 3: propagate
        if !plan.propagate.is_empty() {
            for (tier, result) in self.chain.purge_tiers(&[Tier::Edge], &plan.propagate, version).await {
                match result {
                    Ok(purged) => report.edge_purged = Some(purged),
                    Err(err) => {
                        debug!(tier = %tier, error = %err, "edge purge failed, retrying in background");
                        self.schedule_purge("edge-retry", vec![tier], plan.propagate.clone(), version);
                    }
                }
            }

            let notice = InvalidationNotice {
                patterns: plan.propagate.clone(),
                version,
                origin: self.instance_id.clone(),
                issued_at: Utc::now(),
            };
            report.notified = self.notices.send(notice).unwrap_or(0);
        }

        // Phase 4: preload
        for query in plan.preload {
            if self.schedule_preload(query) {
                report.preloads_scheduled += 1;
            }
        }

        self.counters.plans_executed.fetch_add(1, Ordering::Relaxed);
        info!(
            version,
            immediate = plan.immediate.len(),
            batched = plan.batched.len(),
            purged = report.immediate_purged,
            channel = INVALIDATE_CHANNEL,
            "invalidation plan executed"
        );
        report
    }

    /// Purges `tiers` on the background pool, retrying only the tiers that
    /// are still failing.
    fn schedule_purge(&self, label: &'static str, tiers: Vec<Tier>, patterns: Vec<KeyPattern>, version: u64) {
        let chain = self.chain.clone();
        let retry = self.retry.clone();
        let counters = self.counters.clone();

        self.pool.spawn(label, async move {
            let pending = Mutex::new(tiers);
            let (chain_ref, pending_ref, patterns_ref) = (&*chain, &pending, &patterns[..]);

            let result = retry_with_backoff(&retry, label, move |_| async move {
                let targets = lock(pending_ref).clone();
                let mut failed = Vec::new();
                let mut last_error = None;
                for (tier, result) in chain_ref.purge_tiers(&targets, patterns_ref, version).await {
                    if let Err(err) = result {
                        failed.push(tier);
                        last_error = Some(err);
                    }
                }
                *lock(pending_ref) = failed;
                match last_error {
                    None => Ok(()),
                    Some(err) => Err(err),
                }
            })
            .await;

            if let Err(exhausted) = result {
                counters.propagation_failures.fetch_add(1, Ordering::Relaxed);
                let failure = CacheError::InvalidationPropagationFailure {
                    pattern: join_patterns(&patterns),
                    attempts: exhausted.attempts,
                    reason: exhausted.last_error.to_string(),
                };
                warn!(
                    phase = label,
                    tiers = ?lock(&pending),
                    error = %failure,
                    "invalidation retries exhausted, purge stays pending on the tier"
                );
            }
        });
    }

    fn schedule_preload(&self, query: Query) -> bool {
        let Some(preloader) = self.preloader.clone() else {
            return false;
        };
        let chain = self.chain.clone();
        let clock = self.clock.clone();
        let changes = self.changes.clone();
        let counters = self.counters.clone();

        self.pool.spawn("preload", async move {
            match preloader.preload(&chain, &clock, &changes, &query).await {
                Ok(key) => {
                    counters.preloads.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "preloaded");
                }
                Err(err) => {
                    counters.preload_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(query_type = query.query_type(), error = %err, "preload failed");
                }
            }
        });
        true
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            plans_executed: c.plans_executed.load(Ordering::Relaxed),
            immediate_failures: c.immediate_failures.load(Ordering::Relaxed),
            propagation_failures: c.propagation_failures.load(Ordering::Relaxed),
            preloads: c.preloads.load(Ordering::Relaxed),
            preload_failures: c.preload_failures.load(Ordering::Relaxed),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn join_patterns(patterns: &[KeyPattern]) -> String {
    patterns
        .iter()
        .map(KeyPattern::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
