//! Background Tasks Module
//!
//! Work that runs outside the request path.
//!
//! # Tasks
//! - Worker pool: bounded pool for purges, preloads and revalidations
//! - Retry: exponential backoff for background purges
//! - Expiry sweep: drops expired entries and tombstones at configured intervals
//! - Event consumer: drains the change-event bus into the invalidation engine

mod cleanup;
mod consumer;
mod pool;
mod retry;

pub use cleanup::spawn_cleanup_task;
pub use consumer::spawn_event_consumer;
pub use pool::BackgroundPool;
pub use retry::{retry_with_backoff, Exhausted, RetryPolicy};
