use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};

use super::state::ApiState;
use super::types::LivenessResponse;

/// GET /api/health -- liveness of the daemon itself, not of any agent.
pub(crate) async fn liveness(State(state): State<Arc<ApiState>>) -> Json<LivenessResponse> {
    let status = if state.shutdown.is_shutting_down() {
        "draining"
    } else {
        "ok"
    };
    Json(LivenessResponse {
        status: status.to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        executions_in_flight: state.shutdown.in_flight(),
        available_slots: state.coordinator.available_slots(),
    })
}

/// GET /metrics -- Prometheus text exposition.
pub(crate) async fn metrics_prometheus(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.export_prometheus(),
    )
}

/// GET /metrics/json
pub(crate) async fn metrics_json(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.metrics.export_json())
}
