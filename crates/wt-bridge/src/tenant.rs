//! Tenant scope extraction.

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::api_error::ApiError;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const MAX_TENANT_LEN: usize = 128;

/// The caller's tenant, taken from the `x-tenant-id` header.
///
/// A request without the header is unscoped: it sees shared agents only and
/// may only create shared agents. A present but blank or oversized header is
/// rejected rather than treated as unscoped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TenantScope(pub Option<String>);

impl TenantScope {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl<S> FromRequestParts<S> for TenantScope
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(TENANT_HEADER) else {
            return Ok(TenantScope(None));
        };
        let tenant = value
            .to_str()
            .map_err(|_| ApiError::BadRequest(format!("{TENANT_HEADER} must be valid ASCII")))?
            .trim();
        if tenant.is_empty() {
            return Err(ApiError::BadRequest(format!("{TENANT_HEADER} must not be blank")));
        }
        if tenant.len() > MAX_TENANT_LEN {
            return Err(ApiError::BadRequest(format!(
                "{TENANT_HEADER} must be at most {MAX_TENANT_LEN} bytes"
            )));
        }
        Ok(TenantScope(Some(tenant.to_string())))
    }
}
