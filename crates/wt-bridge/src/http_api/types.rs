//! Query-string and response shapes that are not domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wt_core::types::{ExecutionFilter, ExecutionStatus, ResultFilter};

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteQuery {
    /// Wait for the terminal record instead of answering 202.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultQuery {
    pub agent_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub keyword: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ResultQuery {
    pub fn into_filter(self, tenant: Option<&str>) -> ResultFilter {
        ResultFilter {
            agent_id: self.agent_id,
            tenant_id: tenant.map(str::to_string),
            from: self.from,
            to: self.to,
            keyword: self.keyword.filter(|k| !k.trim().is_empty()),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecutionQuery {
    pub agent_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ExecutionQuery {
    pub fn into_filter(self, tenant: Option<&str>) -> ExecutionFilter {
        ExecutionFilter {
            agent_id: self.agent_id,
            tenant_id: tenant.map(str::to_string),
            status: self.status,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub executions_in_flight: usize,
    pub available_slots: usize,
}
