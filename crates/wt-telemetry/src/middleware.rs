use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};

use crate::metrics::{MetricsCollector, API_REQUESTS_TOTAL, API_REQUEST_DURATION_SECONDS};

/// Axum middleware that records API request metrics into the collector held
/// as layer state (`axum::middleware::from_fn_with_state`).
///
/// The `path` label is the matched route template, so `/api/agents/{id}`
/// does not explode into one series per agent.
pub async fn metrics_middleware(
    State(metrics): State<Arc<MetricsCollector>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    metrics.increment_counter(
        API_REQUESTS_TOTAL,
        &[("method", &method), ("path", &path), ("status", &status)],
    );
    metrics.record_histogram(API_REQUEST_DURATION_SECONDS, start.elapsed().as_secs_f64());

    response
}
