//! Tollgate - Request Admission Control
//!
//! This crate decides, once per inbound request, whether the request may reach
//! the protected service. Limits are enforced by a token bucket kept in Redis
//! and shared by every instance; when Redis cannot be reached each instance
//! falls back to its own fixed-window counter, and returns to the shared
//! bucket once Redis answers again.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
