//! Request and Response models for the operational HTTP surface
//!
//! This module defines the DTOs (Data Transfer Objects) used for
//! serializing/deserializing HTTP request and response bodies.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::InvalidateRequest;
pub use responses::{
    ErrorResponse, EventAcceptedResponse, GetResponse, HealthResponse, InvalidateResponse,
    StatsResponse,
};
