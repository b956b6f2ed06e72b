//! Management API for watchtower.
//!
//! An axum router over the agent registry, the execution coordinator, the
//! result store and the health monitor. Every agent-facing route is scoped by
//! the caller's `x-tenant-id` header; see [`tenant::TenantScope`].

pub mod api_error;
pub mod http_api;
pub mod tenant;

pub use api_error::ApiError;
pub use http_api::{api_router, ApiState};
