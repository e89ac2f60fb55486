//! Bounded Background Pool
//!
//! Batched invalidation, preloads and early refreshes run here so that an
//! invalidation storm queues behind a fixed number of permits instead of
//! competing with foreground reads.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};
use tracing::trace;

#[derive(Debug)]
struct PoolInner {
    permits: Arc<Semaphore>,
    pending: AtomicUsize,
    idle: Notify,
    size: usize,
}

/// Fixed-concurrency pool of detached tasks. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct BackgroundPool {
    inner: Arc<PoolInner>,
}

impl BackgroundPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(size)),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                size,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Tasks queued or running.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Queues `task`; it starts once a permit is free.
    pub fn spawn<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let _done = PendingGuard(inner.clone());
            let _permit = inner.permits.clone().acquire_owned().await.ok();
            trace!(task = label, "background task started");
            task.await;
        });
    }

    /// Resolves once no task is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the pending count even if the task panics.
struct PendingGuard(Arc<PoolInner>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
