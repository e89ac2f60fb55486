//! Invalidation Module
//!
//! Turns change events into invalidation plans and executes them across the
//! tiers.

mod engine;
mod plan;

pub use engine::{
    EngineStats, ExecutionReport, InvalidationEngine, InvalidationNotice, Preloader,
    INVALIDATE_CHANNEL,
};
pub use plan::{InvalidationPlan, PlanBuilder};
