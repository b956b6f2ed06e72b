//! The isolated worker routine.
//!
//! Runs one execution against the shared store and writes the terminal
//! record itself, so the coordinator only has to observe the record by id.
//! The same routine backs the `watchtower-worker` binary and
//! [`LocalDispatcher`](crate::isolation::LocalDispatcher).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;
use wt_core::clock::SharedClock;
use wt_core::config::ExecutionConfig;
use wt_core::store::{StatusChange, Store, StoreError};
use wt_core::types::{Agent, AgentExecution, AgentStatus, ExecutionCompletion, ExecutionStatus};

use crate::events::{EventBus, WatchEvent};
use crate::executor::Executor;
use crate::isolation::IsolatedJob;
use crate::results::ResultStore;
use crate::state_machine::{self, AgentEvent};

pub const WORKER_INTERRUPTED: &str = "worker interrupted";

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),
    #[error("agent {0} not found")]
    AgentNotFound(Uuid),
    #[error("agent {0} does not belong to the requested tenant")]
    TenantMismatch(Uuid),
    #[error("agent {0} is already running")]
    AgentBusy(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct WorkerRuntime {
    store: Arc<Store>,
    results: ResultStore,
    executor: Arc<Executor>,
    clock: SharedClock,
    events: EventBus,
    config: ExecutionConfig,
}

impl WorkerRuntime {
    pub fn new(
        store: Arc<Store>,
        executor: Arc<Executor>,
        clock: SharedClock,
        events: EventBus,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            results: ResultStore::new(Arc::clone(&store)),
            store,
            executor,
            clock,
            events,
            config,
        }
    }

    /// Run the pending/running execution named by `job` to a terminal
    /// record. Agent bookkeeping stays with whoever claimed the agent.
    pub async fn run_execution(
        &self,
        job: &IsolatedJob,
        cancel: &CancellationToken,
    ) -> Result<ExecutionStatus, WorkerError> {
        let execution = self
            .store
            .get_execution(job.execution_id)
            .await?
            .ok_or(WorkerError::ExecutionNotFound(job.execution_id))?;
        if execution.status.is_terminal() {
            return Ok(execution.status);
        }

        let agent = match self.load_agent(job).await {
            Ok(agent) => agent,
            Err(e) => {
                self.fail(execution.id, &e.to_string()).await?;
                return Err(e);
            }
        };

        self.store
            .mark_execution_running(execution.id, self.clock.now())
            .await?;
        info!(agent_id = %agent.id, execution_id = %execution.id, "worker running execution");

        let outcome = self
            .executor
            .run_with_deadline(
                &agent,
                execution.id,
                self.config.timeout(),
                self.config.cancel_grace(),
                cancel,
            )
            .await;
        let (completion, results) =
            outcome.into_completion(execution.id, self.clock.now(), WORKER_INTERRUPTED);
        let status = completion.status;
        if self.results.append(&completion, &results).await? {
            self.events.publish(WatchEvent::ExecutionFinished {
                execution_id: execution.id,
                agent_id: agent.id,
                status,
            });
        }
        Ok(status)
    }

    /// Claim the agent, run one forced execution and release it. Used when
    /// the worker is started without an execution id.
    pub async fn run_standalone(
        &self,
        agent_id: Uuid,
        tenant_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<AgentExecution, WorkerError> {
        let probe = IsolatedJob {
            agent_id,
            tenant_id,
            execution_id: Uuid::nil(),
        };
        let agent = self.load_agent(&probe).await?;

        let event = AgentEvent::ForceClaim;
        let now = self.clock.now();
        let previous = match self
            .store
            .transition_agent(agent_id, state_machine::allowed_from(event), AgentStatus::Running, now)
            .await?
        {
            StatusChange::Changed { previous } => previous,
            StatusChange::Rejected { .. } => return Err(WorkerError::AgentBusy(agent_id)),
            StatusChange::Missing => return Err(WorkerError::AgentNotFound(agent_id)),
        };

        let execution = AgentExecution::pending(&agent, true, true, now);
        if let Err(e) = self.store.insert_execution(&execution).await {
            self.store
                .transition_agent(agent_id, &[AgentStatus::Running], previous, self.clock.now())
                .await?;
            return Err(e.into());
        }

        let job = IsolatedJob {
            execution_id: execution.id,
            ..probe
        };
        let status = self.run_execution(&job, cancel).await;
        let success = matches!(status, Ok(ExecutionStatus::Completed));
        self.store
            .release_agent(agent_id, success, previous, self.clock.now())
            .await?;
        status?;

        self.store
            .get_execution(execution.id)
            .await?
            .ok_or(WorkerError::ExecutionNotFound(execution.id))
    }

    async fn load_agent(&self, job: &IsolatedJob) -> Result<Agent, WorkerError> {
        let agent = self
            .store
            .get_agent(job.agent_id)
            .await?
            .ok_or(WorkerError::AgentNotFound(job.agent_id))?;
        if let Some(tenant) = job.tenant_id.as_deref() {
            if agent.tenant_id.as_deref() != Some(tenant) {
                return Err(WorkerError::TenantMismatch(job.agent_id));
            }
        }
        Ok(agent)
    }

    async fn fail(&self, execution_id: Uuid, error: &str) -> Result<(), WorkerError> {
        warn!(%execution_id, error, "worker failing execution");
        let completion = ExecutionCompletion {
            execution_id,
            status: ExecutionStatus::Failed,
            ended_at: self.clock.now(),
            error: Some(error.to_string()),
            warnings: Vec::new(),
        };
        self.results.append(&completion, &[]).await?;
        Ok(())
    }
}
