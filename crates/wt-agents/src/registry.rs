//! Agent Registry: tenant-scoped CRUD over agent definitions.
//!
//! Every read and write takes a tenant scope. `Some(t)` sees `t`'s agents
//! plus all shared agents; `None` sees shared agents only. An agent outside
//! the caller's scope is reported as not found, never as forbidden, so ids
//! of other tenants' agents do not leak.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;
use wt_core::clock::SharedClock;
use wt_core::store::{StatusChange, Store, StoreError};
use wt_core::types::{Agent, AgentConfig, AgentStatus, AgentType, Capability};

use crate::capabilities::{self, ValidationError};
use crate::events::{EventBus, WatchEvent};
use crate::state_machine::{self, AgentEvent, StateMachineError};

pub const MAX_NAME_LEN: usize = 200;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("agent {0} not found")]
    NotFound(Uuid),
    #[error("shared agents can only be modified without a tenant scope")]
    ReadOnly,
    #[error(transparent)]
    InvalidTransition(#[from] StateMachineError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    /// Defaults from the scope: tenant-specific with a tenant, shared without.
    #[serde(default)]
    pub agent_type: Option<AgentType>,
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub config: AgentConfig,
}

/// Partial update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: Option<BTreeSet<Capability>>,
    #[serde(default)]
    pub config: Option<AgentConfig>,
    /// Only `active` and `inactive` are accepted.
    #[serde(default)]
    pub status: Option<AgentStatus>,
}

impl AgentPatch {
    fn touches_definition(&self) -> bool {
        self.name.is_some() || self.capabilities.is_some() || self.config.is_some()
    }
}

fn validate_name(name: &str) -> std::result::Result<String, ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::single("name must not be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::single(format!(
            "name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Registry {
    store: Arc<Store>,
    clock: SharedClock,
    events: EventBus,
}

impl Registry {
    pub fn new(store: Arc<Store>, clock: SharedClock, events: EventBus) -> Self {
        Self {
            store,
            clock,
            events,
        }
    }

    pub async fn create(&self, tenant: Option<&str>, request: CreateAgentRequest) -> Result<Agent> {
        let agent_type = match (request.agent_type, tenant) {
            (None, Some(_)) | (Some(AgentType::TenantSpecific), Some(_)) => AgentType::TenantSpecific,
            (None, None) | (Some(AgentType::Shared), None) => AgentType::Shared,
            (Some(AgentType::Shared), Some(_)) => {
                return Err(ValidationError::single(
                    "shared agents can only be created without a tenant scope",
                )
                .into())
            }
            (Some(AgentType::TenantSpecific), None) => {
                return Err(ValidationError::single("tenant_specific agents require a tenant").into())
            }
        };
        let tenant_id = match agent_type {
            AgentType::TenantSpecific => tenant.map(str::to_string),
            AgentType::Shared => None,
        };
        self.insert(request, agent_type, tenant_id).await
    }

    async fn insert(
        &self,
        request: CreateAgentRequest,
        agent_type: AgentType,
        tenant_id: Option<String>,
    ) -> Result<Agent> {
        let name = validate_name(&request.name);
        let executor = capabilities::validate(&request.capabilities, &request.config);
        let (name, executor) = match (name, executor) {
            (Ok(name), Ok(executor)) => (name, executor),
            (name, executor) => {
                let mut issues = Vec::new();
                if let Err(e) = name {
                    issues.extend(e.0);
                }
                if let Err(e) = executor {
                    issues.extend(e.0);
                }
                return Err(ValidationError(issues).into());
            }
        };

        let now = self.clock.now();
        let agent = Agent {
            id: Uuid::new_v4(),
            name,
            tenant_id,
            agent_type,
            capabilities: request.capabilities,
            executor,
            config: request.config,
            status: AgentStatus::Active,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            consecutive_error_count: 0,
        };
        self.store.insert_agent(&agent).await?;
        info!(
            agent_id = %agent.id,
            tenant_id = agent.tenant_id.as_deref().unwrap_or("-"),
            executor = %agent.executor,
            "agent created"
        );
        Ok(agent)
    }

    pub async fn get(&self, id: Uuid, tenant: Option<&str>) -> Result<Option<Agent>> {
        let agent = self.store.get_agent(id).await?;
        Ok(agent.filter(|a| a.is_visible_to(tenant)))
    }

    async fn require(&self, id: Uuid, tenant: Option<&str>) -> Result<Agent> {
        self.get(id, tenant).await?.ok_or(RegistryError::NotFound(id))
    }

    /// Visible agents, newest first.
    pub async fn list(&self, tenant: Option<&str>) -> Result<Vec<Agent>> {
        Ok(self.store.list_visible_agents(tenant).await?)
    }

    pub async fn update(&self, id: Uuid, tenant: Option<&str>, patch: AgentPatch) -> Result<Agent> {
        let current = self.require(id, tenant).await?;
        ensure_writable(&current, tenant)?;

        if let Some(status) = patch.status {
            if !matches!(status, AgentStatus::Active | AgentStatus::Inactive) {
                return Err(ValidationError::single("status may only be set to active or inactive").into());
            }
        }

        if patch.touches_definition() {
            let mut next = current.clone();
            if let Some(name) = &patch.name {
                next.name = validate_name(name)?;
            }
            if let Some(capabilities) = &patch.capabilities {
                next.capabilities = capabilities.clone();
            }
            if let Some(config) = &patch.config {
                next.config = config.clone();
            }
            if patch.capabilities.is_some() || patch.config.is_some() {
                next.executor = capabilities::validate(&next.capabilities, &next.config)?;
            }
            next.updated_at = self.clock.now();
            if !self.store.update_agent_definition(&next).await? {
                return Err(RegistryError::NotFound(id));
            }
        }

        if let Some(requested) = patch.status {
            self.apply_status(&current, requested).await?;
        }

        self.require(id, tenant).await
    }

    async fn apply_status(&self, agent: &Agent, requested: AgentStatus) -> Result<()> {
        let Some(event) = state_machine::event_for_request(agent.status, requested)? else {
            return Ok(());
        };
        let now = self.clock.now();
        let previous = if event == AgentEvent::Reactivate {
            self.store.reactivate_agent(agent.id, now).await?;
            agent.status
        } else {
            let to = state_machine::transition(agent.status, event)?;
            match self
                .store
                .transition_agent(agent.id, state_machine::allowed_from(event), to, now)
                .await?
            {
                StatusChange::Changed { previous } => previous,
                StatusChange::Rejected { current } => {
                    return Err(StateMachineError::InvalidTransition {
                        status: current,
                        event,
                    }
                    .into())
                }
                StatusChange::Missing => return Err(RegistryError::NotFound(agent.id)),
            }
        };
        info!(agent_id = %agent.id, from = %previous, to = %requested, "agent status changed");
        self.events.publish(WatchEvent::AgentStatusChanged {
            agent_id: agent.id,
            from: previous,
            to: requested,
        });
        Ok(())
    }

    /// Idempotent. Returns whether an agent was removed.
    pub async fn delete(&self, id: Uuid, tenant: Option<&str>) -> Result<bool> {
        let Some(agent) = self.get(id, tenant).await? else {
            return Ok(false);
        };
        ensure_writable(&agent, tenant)?;
        let removed = self.store.delete_agent(id).await?;
        if removed {
            info!(agent_id = %id, "agent deleted");
        }
        Ok(removed)
    }

    /// Clear the error streak and return the agent to `active`.
    pub async fn reactivate(&self, id: Uuid, tenant: Option<&str>) -> Result<Agent> {
        let agent = self.require(id, tenant).await?;
        self.store.reactivate_agent(id, self.clock.now()).await?;
        if !matches!(agent.status, AgentStatus::Active | AgentStatus::Running) {
            self.events.publish(WatchEvent::AgentStatusChanged {
                agent_id: id,
                from: agent.status,
                to: AgentStatus::Active,
            });
        }
        info!(agent_id = %id, from = %agent.status, "agent reactivated");
        self.require(id, tenant).await
    }

    /// Create the demo set for `tenant`: a shared news monitor (once per
    /// deployment) plus, for a tenant, a trend analyzer and an isolated
    /// keyword watcher. Returns only the agents created by this call.
    pub async fn setup_demo(&self, tenant: Option<&str>) -> Result<Vec<Agent>> {
        let mut created = Vec::new();

        let shared_exists = self
            .store
            .list_visible_agents(None)
            .await?
            .iter()
            .any(|a| a.name == DEMO_SHARED_NAME);
        if !shared_exists {
            let request = CreateAgentRequest {
                name: DEMO_SHARED_NAME.to_string(),
                agent_type: Some(AgentType::Shared),
                capabilities: [Capability::NewsMonitoring].into_iter().collect(),
                config: AgentConfig {
                    keywords: vec!["markets".into(), "technology".into()],
                    update_frequency_minutes: 60,
                    ..AgentConfig::default()
                },
            };
            created.push(self.insert(request, AgentType::Shared, None).await?);
        }

        if let Some(tenant) = tenant {
            let trend = CreateAgentRequest {
                name: "Industry trends".to_string(),
                agent_type: None,
                capabilities: [Capability::NewsMonitoring, Capability::TrendAnalysis]
                    .into_iter()
                    .collect(),
                config: AgentConfig {
                    keywords: vec!["rust".into(), "databases".into(), "observability".into()],
                    update_frequency_minutes: 120,
                    max_results_per_update: 5,
                    ..AgentConfig::default()
                },
            };
            let watcher = CreateAgentRequest {
                name: "Competitor watch".to_string(),
                agent_type: None,
                capabilities: [Capability::CustomKeyword].into_iter().collect(),
                config: AgentConfig {
                    keywords: vec!["acquisition".into(), "launch".into()],
                    update_frequency_minutes: 30,
                    isolation_mode: true,
                    ..AgentConfig::default()
                },
            };
            for request in [trend, watcher] {
                created.push(self.create(Some(tenant), request).await?);
            }
        }

        info!(
            tenant_id = tenant.unwrap_or("-"),
            created = created.len(),
            "demo agents set up"
        );
        Ok(created)
    }
}

const DEMO_SHARED_NAME: &str = "Shared news monitor";

fn ensure_writable(agent: &Agent, tenant: Option<&str>) -> Result<()> {
    if agent.agent_type == AgentType::Shared && tenant.is_some() {
        return Err(RegistryError::ReadOnly);
    }
    Ok(())
}
