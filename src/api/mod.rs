//! API Module
//!
//! Operational HTTP surface over a cache gateway. Consumers use the gateway
//! as a library; these endpoints exist for operators and test harnesses.
//!
//! # Endpoints
//! - `GET /cache/:key` - Tier-only read, never loads from the source
//! - `POST /invalidate` - Manual invalidation by pattern
//! - `POST /events` - Ingest a change event onto the bus
//! - `GET /stats` - Gateway, tier and engine statistics
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
