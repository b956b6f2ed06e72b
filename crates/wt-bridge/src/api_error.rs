//! HTTP API error type.
//!
//! Every handler returns `Result<_, ApiError>`. Domain errors convert into it
//! through `From`, so the status mapping lives in one place.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use wt_agents::coordinator::ExecutionError;
use wt_agents::registry::RegistryError;
use wt_core::store::StoreError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller can see the resource but may not change it.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let msg = err.to_string();
        match err {
            RegistryError::Validation(_) => ApiError::BadRequest(msg),
            RegistryError::ReadOnly => ApiError::Forbidden(msg),
            RegistryError::NotFound(_) => ApiError::NotFound(msg),
            RegistryError::InvalidTransition(_) => ApiError::Conflict(msg),
            RegistryError::Store(e) => e.into(),
        }
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        let msg = err.to_string();
        match err {
            ExecutionError::NotFound(_) => ApiError::NotFound(msg),
            ExecutionError::Concurrency(_) | ExecutionError::Ineligible { .. } => {
                ApiError::Conflict(msg)
            }
            ExecutionError::ShuttingDown => ApiError::Unavailable(msg),
            ExecutionError::Store(e) => e.into(),
            ExecutionError::Failed(_)
            | ExecutionError::Timeout(_)
            | ExecutionError::IsolationDispatch(_) => ApiError::InternalError(msg),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "store error while serving request");
        ApiError::InternalError(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::Unavailable(msg)
            | ApiError::InternalError(msg) => msg,
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wt_agents::capabilities::ValidationError;
    use wt_core::types::AgentStatus;

    async fn body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn validation_is_a_bad_request_with_every_issue() {
        let err: ApiError = RegistryError::Validation(ValidationError(vec![
            "name must not be empty".into(),
            "at least one capability is required".into(),
        ]))
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body(response).await;
        let message = json["error"].as_str().expect("error string");
        assert!(message.contains("name must not be empty"));
        assert!(message.contains("capability"));
    }

    #[test]
    fn registry_errors_map_to_statuses() {
        let id = Uuid::new_v4();
        assert_eq!(ApiError::from(RegistryError::ReadOnly).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::from(RegistryError::NotFound(id)).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn execution_errors_map_to_statuses() {
        let id = Uuid::new_v4();
        assert_eq!(
            ApiError::from(ExecutionError::Concurrency(id)).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(ExecutionError::Ineligible {
                agent_id: id,
                status: AgentStatus::Error
            })
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(ExecutionError::ShuttingDown).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(ExecutionError::NotFound(id)).status(),
            StatusCode::NOT_FOUND
        );
    }
}
