//! Logging, metrics and request correlation for watchtower services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges and histograms with Prometheus export
//! - **Middleware**: axum layers for request metrics and `x-request-id` spans

pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod tracing_setup;
