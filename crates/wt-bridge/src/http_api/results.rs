use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use uuid::Uuid;
use wt_core::types::{AgentExecution, AgentResult, Page};

use super::state::ApiState;
use super::types::{ExecutionQuery, ResultQuery};
use crate::api_error::ApiError;
use crate::tenant::TenantScope;

/// GET /api/results -- results visible to the caller, newest first.
///
/// `from`/`to` are RFC 3339 timestamps bounding `produced_at`, `keyword`
/// is a case-insensitive substring match on the content.
pub(crate) async fn query_results(
    State(state): State<Arc<ApiState>>,
    tenant: TenantScope,
    query: Result<Query<ResultQuery>, QueryRejection>,
) -> Result<Json<Page<AgentResult>>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err(ApiError::BadRequest("`from` must not be after `to`".into()));
        }
    }
    let filter = query.into_filter(tenant.as_deref());
    Ok(Json(state.results.query(&filter).await?))
}

/// GET /api/executions -- execution history, newest first.
pub(crate) async fn list_executions(
    State(state): State<Arc<ApiState>>,
    tenant: TenantScope,
    query: Result<Query<ExecutionQuery>, QueryRejection>,
) -> Result<Json<Page<AgentExecution>>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let filter = query.into_filter(tenant.as_deref());
    Ok(Json(state.results.list_executions(&filter).await?))
}

/// GET /api/executions/{id}
pub(crate) async fn get_execution(
    State(state): State<Arc<ApiState>>,
    tenant: TenantScope,
    Path(id): Path<Uuid>,
) -> Result<Json<AgentExecution>, ApiError> {
    state
        .results
        .get_execution(id, tenant.as_deref())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("execution {id} not found")))
}
