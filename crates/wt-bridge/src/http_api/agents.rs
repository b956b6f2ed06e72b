use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;
use uuid::Uuid;
use wt_agents::health::HealthStatus;
use wt_agents::registry::{AgentPatch, CreateAgentRequest};
use wt_core::types::Agent;

use super::state::ApiState;
use super::types::ExecuteQuery;
use crate::api_error::ApiError;
use crate::tenant::TenantScope;

fn not_found(id: Uuid) -> ApiError {
    ApiError::NotFound(format!("agent {id} not found"))
}

/// GET /api/agents -- agents visible to the caller, newest first.
pub(crate) async fn list_agents(
    State(state): State<Arc<ApiState>>,
    tenant: TenantScope,
) -> Result<Json<Vec<Agent>>, ApiError> {
    Ok(Json(state.registry.list(tenant.as_deref()).await?))
}

/// POST /api/agents -- register an agent.
///
/// The agent type defaults from the scope: tenant-specific when the request
/// carries a tenant, shared otherwise. All validation failures are reported
/// together in one 400.
pub(crate) async fn create_agent(
    State(state): State<Arc<ApiState>>,
    tenant: TenantScope,
    payload: Result<Json<CreateAgentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Agent>), ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let agent = state.registry.create(tenant.as_deref(), request).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

/// GET /api/agents/{id}
pub(crate) async fn get_agent(
    State(state): State<Arc<ApiState>>,
    tenant: TenantScope,
    Path(id): Path<Uuid>,
) -> Result<Json<Agent>, ApiError> {
    state
        .registry
        .get(id, tenant.as_deref())
        .await?
        .map(Json)
        .ok_or_else(|| not_found(id))
}

/// PATCH /api/agents/{id} -- partial update of name, capabilities, config,
/// or status (`active`/`inactive` only).
pub(crate) async fn update_agent(
    State(state): State<Arc<ApiState>>,
    tenant: TenantScope,
    Path(id): Path<Uuid>,
    payload: Result<Json<AgentPatch>, JsonRejection>,
) -> Result<Json<Agent>, ApiError> {
    let Json(patch) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    Ok(Json(state.registry.update(id, tenant.as_deref(), patch).await?))
}

/// DELETE /api/agents/{id}
pub(crate) async fn delete_agent(
    State(state): State<Arc<ApiState>>,
    tenant: TenantScope,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.registry.delete(id, tenant.as_deref()).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(id))
    }
}

/// POST /api/agents/{id}/execute -- force-run an agent.
///
/// Answers 202 with the `pending` record as soon as the run is claimed. With
/// `?wait=true` the response is the terminal record instead, 200 even when
/// the execution itself failed or timed out.
pub(crate) async fn execute_agent(
    State(state): State<Arc<ApiState>>,
    tenant: TenantScope,
    Path(id): Path<Uuid>,
    query: Result<Query<ExecuteQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let ticket = state.coordinator.submit(id, tenant.as_deref(), true).await?;
    info!(
        agent_id = %id,
        execution_id = %ticket.execution.id,
        tenant_id = tenant.as_deref().unwrap_or("-"),
        "manual execution requested"
    );
    if query.wait {
        let record = ticket.wait().await?;
        Ok(Json(record).into_response())
    } else {
        Ok((StatusCode::ACCEPTED, Json(ticket.execution)).into_response())
    }
}

/// POST /api/agents/{id}/reactivate -- clear `error`/`inactive` back to `active`.
pub(crate) async fn reactivate_agent(
    State(state): State<Arc<ApiState>>,
    tenant: TenantScope,
    Path(id): Path<Uuid>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.registry.reactivate(id, tenant.as_deref()).await?))
}

/// GET /api/agents/{id}/health -- read-only evaluation over the health window.
pub(crate) async fn agent_health(
    State(state): State<Arc<ApiState>>,
    tenant: TenantScope,
    Path(id): Path<Uuid>,
) -> Result<Json<HealthStatus>, ApiError> {
    if state.registry.get(id, tenant.as_deref()).await?.is_none() {
        return Err(not_found(id));
    }
    state
        .health
        .evaluate(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(id))
}

/// POST /api/setup-demo -- create the demo agent set for the caller.
pub(crate) async fn setup_demo(
    State(state): State<Arc<ApiState>>,
    tenant: TenantScope,
) -> Result<(StatusCode, Json<Vec<Agent>>), ApiError> {
    let created = state.registry.setup_demo(tenant.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}
