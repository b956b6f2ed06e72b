//! Router and handlers for the management API.
//!
//! Handlers are grouped by resource; this module owns the router and its
//! middleware stack.

mod agents;
mod misc;
mod results;
pub mod state;
pub mod types;

use std::sync::Arc;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use wt_telemetry::middleware::metrics_middleware;
use wt_telemetry::tracing_setup::request_id_middleware;

pub use state::ApiState;

/// Build the full API router.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/agents", get(agents::list_agents).post(agents::create_agent))
        .route(
            "/api/agents/{id}",
            get(agents::get_agent)
                .patch(agents::update_agent)
                .delete(agents::delete_agent),
        )
        .route("/api/agents/{id}/execute", post(agents::execute_agent))
        .route("/api/agents/{id}/reactivate", post(agents::reactivate_agent))
        .route("/api/agents/{id}/health", get(agents::agent_health))
        .route("/api/setup-demo", post(agents::setup_demo))
        .route("/api/results", get(results::query_results))
        .route("/api/executions", get(results::list_executions))
        .route("/api/executions/{id}", get(results::get_execution))
        .route("/api/health", get(misc::liveness))
        .route("/metrics", get(misc::metrics_prometheus))
        .route("/metrics/json", get(misc::metrics_json))
        .layer(axum_middleware::from_fn_with_state(
            Arc::clone(&state.metrics),
            metrics_middleware,
        ))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
