//! Execution Coordinator.
//!
//! Submitting claims the agent (`running`) and writes a `pending` record,
//! then hands the run to a spawned task and returns. The task waits for a
//! slot from the global budget, runs the agent in-process or through an
//! [`IsolationDispatcher`], and settles the agent when the record is
//! terminal. Submission never waits for the run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;
use wt_core::clock::SharedClock;
use wt_core::config::ExecutionConfig;
use wt_core::store::{StatusChange, Store, StoreError};
use wt_core::types::{Agent, AgentExecution, AgentStatus, ExecutionCompletion, ExecutionStatus};
use wt_harness::shutdown::ShutdownSignal;
use wt_telemetry::metrics::{
    MetricsCollector, EXECUTIONS_RUNNING, EXECUTIONS_TOTAL, EXECUTION_DURATION_SECONDS,
};
use wt_telemetry::tracing_setup::execution_span;

use crate::events::{EventBus, WatchEvent};
use crate::executor::Executor;
use crate::isolation::{IsolatedJob, IsolationDispatcher};
use crate::results::ResultStore;
use crate::state_machine::{self, AgentEvent};

pub const SHUTDOWN_REASON: &str = "interrupted by shutdown";

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("agent {0} not found")]
    NotFound(Uuid),
    #[error("agent {0} already has an execution in flight")]
    Concurrency(Uuid),
    #[error("agent {agent_id} is {status} and cannot be scheduled")]
    Ineligible { agent_id: Uuid, status: AgentStatus },
    #[error("execution failed: {0}")]
    Failed(String),
    #[error("isolated worker exceeded its {}s deadline", .0.as_secs())]
    Timeout(Duration),
    #[error("isolated worker could not be started: {0}")]
    IsolationDispatch(String),
    #[error("coordinator is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExecutionError {
    /// The error a terminal record represents, if it did not complete.
    pub fn from_record(record: &AgentExecution) -> Option<Self> {
        match record.status {
            ExecutionStatus::Failed => Some(ExecutionError::Failed(
                record.error.clone().unwrap_or_else(|| "unknown error".to_string()),
            )),
            ExecutionStatus::TimedOut => Some(ExecutionError::Timeout(
                record
                    .duration()
                    .and_then(|d| d.to_std().ok())
                    .unwrap_or_default(),
            )),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutionError>;

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

/// A submitted execution. `execution` is the `pending` record as written at
/// submission; [`ExecutionTicket::wait`] yields the terminal one.
#[derive(Debug)]
pub struct ExecutionTicket {
    pub execution: AgentExecution,
    done: oneshot::Receiver<AgentExecution>,
}

impl ExecutionTicket {
    pub async fn wait(self) -> Result<AgentExecution> {
        self.done.await.map_err(|_| ExecutionError::ShuttingDown)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct CoordinatorDeps {
    pub store: Arc<Store>,
    pub executor: Arc<Executor>,
    pub dispatcher: Option<Arc<dyn IsolationDispatcher>>,
    pub config: ExecutionConfig,
    pub max_concurrent: usize,
    pub clock: SharedClock,
    pub events: EventBus,
    pub metrics: Arc<MetricsCollector>,
    pub shutdown: ShutdownSignal,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<Store>,
    results: ResultStore,
    executor: Arc<Executor>,
    dispatcher: Option<Arc<dyn IsolationDispatcher>>,
    slots: Arc<Semaphore>,
    budget: usize,
    config: ExecutionConfig,
    clock: SharedClock,
    events: EventBus,
    metrics: Arc<MetricsCollector>,
    shutdown: ShutdownSignal,
}

impl Coordinator {
    pub fn new(deps: CoordinatorDeps) -> Self {
        let budget = deps.max_concurrent.max(1);
        Self {
            inner: Arc::new(Inner {
                results: ResultStore::new(Arc::clone(&deps.store)),
                store: deps.store,
                executor: deps.executor,
                dispatcher: deps.dispatcher,
                slots: Arc::new(Semaphore::new(budget)),
                budget,
                config: deps.config,
                clock: deps.clock,
                events: deps.events,
                metrics: deps.metrics,
                shutdown: deps.shutdown,
            }),
        }
    }

    pub fn budget(&self) -> usize {
        self.inner.budget
    }

    /// Slots not currently held by a running execution.
    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Scheduler entry point. Takes a slot without waiting; `Ok(None)` means
    /// the budget is exhausted and the agent stays due for the next tick.
    pub async fn try_submit_scheduled(&self, agent: &Agent) -> Result<Option<AgentExecution>> {
        if self.inner.shutdown.is_shutting_down() {
            return Err(ExecutionError::ShuttingDown);
        }
        let Ok(permit) = Arc::clone(&self.inner.slots).try_acquire_owned() else {
            return Ok(None);
        };
        let (agent, previous) = self.claim(agent.id, None, AgentEvent::Claim).await?;
        let execution = self.record(&agent, previous, false).await?;
        self.spawn_run(agent, execution.clone(), previous, Some(permit), None);
        Ok(Some(execution))
    }

    /// Claim and enqueue. A forced submission skips the due check and the
    /// active-status requirement; both kinds queue for a slot.
    pub async fn submit(
        &self,
        agent_id: Uuid,
        tenant: Option<&str>,
        force: bool,
    ) -> Result<ExecutionTicket> {
        if self.inner.shutdown.is_shutting_down() {
            return Err(ExecutionError::ShuttingDown);
        }
        let event = if force {
            AgentEvent::ForceClaim
        } else {
            AgentEvent::Claim
        };
        let (agent, previous) = self.claim(agent_id, Some(tenant), event).await?;
        let execution = self.record(&agent, previous, force).await?;
        let (tx, rx) = oneshot::channel();
        self.spawn_run(agent, execution.clone(), previous, None, Some(tx));
        Ok(ExecutionTicket {
            execution,
            done: rx,
        })
    }

    /// Run `agent_id` once and wait for the terminal record. Execution-level
    /// failures are reported through the record, not as errors.
    pub async fn execute(
        &self,
        agent_id: Uuid,
        tenant: Option<&str>,
        force: bool,
    ) -> Result<AgentExecution> {
        self.submit(agent_id, tenant, force).await?.wait().await
    }

    /// Atomically move the agent to `running`. `scope` is `None` for the
    /// scheduler, which sees every tenant.
    async fn claim(
        &self,
        agent_id: Uuid,
        scope: Option<Option<&str>>,
        event: AgentEvent,
    ) -> Result<(Agent, AgentStatus)> {
        let agent = self
            .inner
            .store
            .get_agent(agent_id)
            .await?
            .filter(|a| scope.map_or(true, |tenant| a.is_visible_to(tenant)))
            .ok_or(ExecutionError::NotFound(agent_id))?;

        let change = self
            .inner
            .store
            .transition_agent(
                agent_id,
                state_machine::allowed_from(event),
                AgentStatus::Running,
                self.inner.clock.now(),
            )
            .await?;
        match change {
            StatusChange::Changed { previous } => {
                self.inner.events.publish(WatchEvent::AgentStatusChanged {
                    agent_id,
                    from: previous,
                    to: AgentStatus::Running,
                });
                Ok((agent, previous))
            }
            StatusChange::Rejected {
                current: AgentStatus::Running,
            } => Err(ExecutionError::Concurrency(agent_id)),
            StatusChange::Rejected { current } => Err(ExecutionError::Ineligible {
                agent_id,
                status: current,
            }),
            StatusChange::Missing => Err(ExecutionError::NotFound(agent_id)),
        }
    }

    /// Write the pending record for a claimed agent, undoing the claim if
    /// the write fails.
    async fn record(&self, agent: &Agent, previous: AgentStatus, forced: bool) -> Result<AgentExecution> {
        let isolated = self.inner.isolates(agent);
        let execution = AgentExecution::pending(agent, isolated, forced, self.inner.clock.now());
        if let Err(e) = self.inner.store.insert_execution(&execution).await {
            if let Err(undo) = self
                .inner
                .store
                .transition_agent(agent.id, &[AgentStatus::Running], previous, self.inner.clock.now())
                .await
            {
                error!(agent_id = %agent.id, error = %undo, "failed to undo claim");
            }
            return Err(e.into());
        }
        Ok(execution)
    }

    fn spawn_run(
        &self,
        agent: Agent,
        execution: AgentExecution,
        previous: AgentStatus,
        permit: Option<OwnedSemaphorePermit>,
        done: Option<oneshot::Sender<AgentExecution>>,
    ) {
        let inner = Arc::clone(&self.inner);
        let guard = inner.shutdown.track();
        let span = execution_span(&agent.id, &execution.id, execution.forced);
        tokio::spawn(
            async move {
                let _guard = guard;
                let permit = match permit {
                    Some(permit) => Some(permit),
                    None => inner.acquire_slot().await,
                };
                let record = match permit {
                    Some(_permit) => inner.run(&agent, execution).await,
                    None => {
                        inner
                            .finalize_failed(execution.id, SHUTDOWN_REASON)
                            .await;
                        inner.reload(execution).await
                    }
                };
                inner.settle(&agent, &record, previous).await;
                if let Some(done) = done {
                    let _ = done.send(record);
                }
            }
            .instrument(span),
        );
    }
}

impl Inner {
    fn isolates(&self, agent: &Agent) -> bool {
        agent.config.isolation_mode && self.config.isolation_enabled && self.dispatcher.is_some()
    }

    /// Wait for a slot, giving up on shutdown.
    async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => permit.ok(),
            _ = self.shutdown.cancelled() => None,
        }
    }

    async fn run(&self, agent: &Agent, execution: AgentExecution) -> AgentExecution {
        if let Err(e) = self
            .store
            .mark_execution_running(execution.id, self.clock.now())
            .await
        {
            error!(error = %e, "failed to mark execution running");
        }
        self.metrics.add_gauge(EXECUTIONS_RUNNING, 1);
        self.events.publish(WatchEvent::ExecutionStarted {
            execution_id: execution.id,
            agent_id: agent.id,
            isolated: execution.isolation_mode_used,
        });
        if agent.config.isolation_mode && !execution.isolation_mode_used {
            debug!("isolation requested but disabled, running in-process");
        }

        if execution.isolation_mode_used {
            self.run_isolated(agent, &execution).await;
        } else {
            self.run_in_process(agent, &execution).await;
        }

        self.metrics.add_gauge(EXECUTIONS_RUNNING, -1);
        self.reload(execution).await
    }

    async fn run_in_process(&self, agent: &Agent, execution: &AgentExecution) {
        let cancel = self.shutdown.child_token();
        let outcome = self
            .executor
            .run_with_deadline(
                agent,
                execution.id,
                self.config.timeout(),
                self.config.cancel_grace(),
                &cancel,
            )
            .await;
        let (completion, results) = outcome.into_completion(execution.id, self.clock.now(), SHUTDOWN_REASON);
        if let Err(e) = self.results.append(&completion, &results).await {
            error!(error = %e, "failed to finalize execution");
        }
    }

    /// Dispatch and watch the store until the worker's terminal record
    /// appears. Bus notifications only shorten the wait; the store is the
    /// source of truth.
    async fn run_isolated(&self, agent: &Agent, execution: &AgentExecution) {
        let Some(dispatcher) = self.dispatcher.as_ref() else {
            return;
        };
        let bus = self.events.subscribe();
        let job = IsolatedJob {
            agent_id: agent.id,
            tenant_id: agent.tenant_id.clone(),
            execution_id: execution.id,
        };

        let mut handle = match dispatcher.dispatch(&job).await {
            Ok(handle) => handle,
            Err(e) => {
                let err = ExecutionError::IsolationDispatch(e.to_string());
                warn!(error = %err, "isolated dispatch failed");
                self.finalize_failed(execution.id, &err.to_string()).await;
                return;
            }
        };

        enum Wake {
            Deadline,
            Shutdown,
            Exited,
            Check,
        }

        let timeout = self.config.isolation_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.config.isolation_poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                _ = &mut deadline => Wake::Deadline,
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                _ = handle.exited() => Wake::Exited,
                _ = poll.tick() => Wake::Check,
                _ = bus.recv_async() => Wake::Check,
            };

            match wake {
                Wake::Check => {
                    if self.is_terminal(execution.id).await {
                        return;
                    }
                }
                Wake::Exited => {
                    if !self.is_terminal(execution.id).await {
                        self.finalize_failed(execution.id, "isolated worker exited without finalizing")
                            .await;
                    }
                    return;
                }
                Wake::Deadline => {
                    let err = ExecutionError::Timeout(timeout);
                    warn!(error = %err, "terminating isolated worker");
                    self.finalize(execution.id, ExecutionStatus::TimedOut, &err.to_string())
                        .await;
                    handle.terminate().await;
                    return;
                }
                Wake::Shutdown => {
                    handle.terminate().await;
                    self.finalize_failed(execution.id, SHUTDOWN_REASON).await;
                    return;
                }
            }
        }
    }

    async fn is_terminal(&self, id: Uuid) -> bool {
        match self.store.get_execution(id).await {
            Ok(Some(record)) => record.status.is_terminal(),
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "failed to poll execution");
                false
            }
        }
    }

    async fn finalize_failed(&self, id: Uuid, error: &str) {
        self.finalize(id, ExecutionStatus::Failed, error).await;
    }

    async fn finalize(&self, id: Uuid, status: ExecutionStatus, error: &str) {
        let completion = ExecutionCompletion {
            execution_id: id,
            status,
            ended_at: self.clock.now(),
            error: Some(error.to_string()),
            warnings: Vec::new(),
        };
        if let Err(e) = self.results.append(&completion, &[]).await {
            error!(execution_id = %id, error = %e, "failed to finalize execution");
        }
    }

    async fn reload(&self, execution: AgentExecution) -> AgentExecution {
        match self.store.get_execution(execution.id).await {
            Ok(Some(record)) => record,
            Ok(None) => execution,
            Err(e) => {
                error!(error = %e, "failed to reload execution");
                execution
            }
        }
    }

    /// Release the agent and account for the run. A failed run restores the
    /// status the agent was claimed from.
    async fn settle(&self, agent: &Agent, record: &AgentExecution, previous: AgentStatus) {
        let success = record.status == ExecutionStatus::Completed;
        let to = if success { AgentStatus::Active } else { previous };
        match self
            .store
            .release_agent(agent.id, success, previous, self.clock.now())
            .await
        {
            Ok(true) => {
                self.events.publish(WatchEvent::AgentStatusChanged {
                    agent_id: agent.id,
                    from: AgentStatus::Running,
                    to,
                });
            }
            Ok(false) => debug!(agent_id = %agent.id, "agent gone or no longer running, release skipped"),
            Err(e) => error!(agent_id = %agent.id, error = %e, "failed to release agent"),
        }

        self.metrics
            .increment_counter(EXECUTIONS_TOTAL, &[("status", record.status.as_str())]);
        if let Some(duration) = record.duration().and_then(|d| d.to_std().ok()) {
            self.metrics
                .record_histogram(EXECUTION_DURATION_SECONDS, duration.as_secs_f64());
        }
        self.events.publish(WatchEvent::ExecutionFinished {
            execution_id: record.id,
            agent_id: agent.id,
            status: record.status,
        });
        info!(
            status = %record.status,
            results = record.result_count,
            warnings = record.warnings.len(),
            error = record.error.as_deref().unwrap_or(""),
            "execution finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wt_core::clock::{Clock, FakeClock};
    use wt_core::types::{AgentConfig, AgentType, Capability, ExecutorKind};
    use wt_harness::circuit_breaker::{BreakerSet, CircuitBreakerConfig};

    use crate::sources::{GatedSource, RawItem, SourceCatalog, StaticSource};

    struct Fixture {
        coordinator: Coordinator,
        store: Arc<Store>,
        clock: FakeClock,
        shutdown: ShutdownSignal,
    }

    async fn fixture(catalog: SourceCatalog, budget: usize) -> Fixture {
        let clock = FakeClock::new();
        let store = Arc::new(Store::open_in_memory().await.expect("store"));
        let metrics = Arc::new(MetricsCollector::with_defaults());
        let executor = Arc::new(Executor::new(
            catalog,
            BreakerSet::new(CircuitBreakerConfig::default()),
            Arc::clone(&metrics),
            clock.shared(),
        ));
        let shutdown = ShutdownSignal::new();
        let coordinator = Coordinator::new(CoordinatorDeps {
            store: Arc::clone(&store),
            executor,
            dispatcher: None,
            config: ExecutionConfig::default(),
            max_concurrent: budget,
            clock: clock.shared(),
            events: EventBus::new(),
            metrics,
            shutdown: shutdown.clone(),
        });
        Fixture {
            coordinator,
            store,
            clock,
            shutdown,
        }
    }

    fn news_catalog() -> SourceCatalog {
        SourceCatalog::new().with_source(Arc::new(StaticSource::items(
            "news",
            vec![RawItem::text("one"), RawItem::text("two")],
        )))
    }

    async fn seed(f: &Fixture, status: AgentStatus) -> Agent {
        let agent = Agent {
            id: Uuid::new_v4(),
            name: "a".into(),
            tenant_id: Some("acme".into()),
            agent_type: AgentType::TenantSpecific,
            capabilities: [Capability::NewsMonitoring].into_iter().collect(),
            executor: ExecutorKind::NewsMonitor,
            config: AgentConfig::default(),
            status,
            created_at: f.clock.now(),
            updated_at: f.clock.now(),
            last_run_at: None,
            consecutive_error_count: 0,
        };
        f.store.insert_agent(&agent).await.expect("insert");
        agent
    }

    #[tokio::test]
    async fn execute_completes_and_releases_agent() {
        let f = fixture(news_catalog(), 2).await;
        let agent = seed(&f, AgentStatus::Active).await;

        let record = f
            .coordinator
            .execute(agent.id, Some("acme"), false)
            .await
            .expect("execute");
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.result_count, 2);

        let agent = f.store.get_agent(agent.id).await.expect("get").expect("exists");
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.last_run_at, Some(f.clock.now()));
    }

    #[tokio::test]
    async fn unforced_execute_requires_active_agent() {
        let f = fixture(news_catalog(), 2).await;
        let agent = seed(&f, AgentStatus::Inactive).await;
        let err = f
            .coordinator
            .execute(agent.id, Some("acme"), false)
            .await
            .expect_err("ineligible");
        assert!(matches!(err, ExecutionError::Ineligible { status: AgentStatus::Inactive, .. }));
    }

    #[tokio::test]
    async fn force_run_of_error_agent_recovers_on_success() {
        let f = fixture(news_catalog(), 1).await;
        let agent = seed(&f, AgentStatus::Error).await;
        let record = f
            .coordinator
            .execute(agent.id, Some("acme"), true)
            .await
            .expect("execute");
        assert!(record.forced);
        let agent = f.store.get_agent(agent.id).await.expect("get").expect("exists");
        assert_eq!(agent.status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn failed_run_restores_previous_status_and_counts() {
        let catalog = SourceCatalog::new().with_source(Arc::new(StaticSource::failing("news", "down")));
        let f = fixture(catalog, 1).await;
        let agent = seed(&f, AgentStatus::Inactive).await;

        let record = f
            .coordinator
            .execute(agent.id, Some("acme"), true)
            .await
            .expect("execute");
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(ExecutionError::from_record(&record).is_some());

        let agent = f.store.get_agent(agent.id).await.expect("get").expect("exists");
        assert_eq!(agent.status, AgentStatus::Inactive);
        assert_eq!(agent.consecutive_error_count, 1);
    }

    #[tokio::test]
    async fn other_tenant_cannot_force_run() {
        let f = fixture(news_catalog(), 1).await;
        let agent = seed(&f, AgentStatus::Active).await;
        let err = f
            .coordinator
            .submit(agent.id, Some("globex"), true)
            .await
            .expect_err("hidden");
        assert!(matches!(err, ExecutionError::NotFound(_)));
    }

    #[tokio::test]
    async fn second_submission_is_rejected_while_first_is_queued() {
        let gate = Arc::new(GatedSource::new("news"));
        let catalog = SourceCatalog::new().with_source(gate.clone());
        let f = fixture(catalog, 1).await;
        let first = seed(&f, AgentStatus::Active).await;
        let second = seed(&f, AgentStatus::Active).await;

        let running = f
            .coordinator
            .try_submit_scheduled(&first)
            .await
            .expect("submit")
            .expect("slot");
        assert_eq!(f.coordinator.available_slots(), 0);

        // Budget exhausted: the scheduler is deferred, a forced run queues.
        assert!(f.coordinator.try_submit_scheduled(&second).await.expect("submit").is_none());
        let queued = f.coordinator.submit(second.id, Some("acme"), true).await.expect("queued");
        assert_eq!(queued.execution.status, ExecutionStatus::Pending);
        assert!(matches!(
            f.coordinator.submit(second.id, Some("acme"), true).await,
            Err(ExecutionError::Concurrency(_))
        ));

        gate.release(2);
        let done = queued.wait().await.expect("done");
        assert_eq!(done.status, ExecutionStatus::Completed);
        let first_record = f.store.get_execution(running.id).await.expect("get").expect("exists");
        assert_eq!(first_record.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn shutdown_interrupts_in_process_runs() {
        let catalog = SourceCatalog::new().with_source(Arc::new(GatedSource::new("news")));
        let f = fixture(catalog, 1).await;
        let agent = seed(&f, AgentStatus::Active).await;
        let ticket = f.coordinator.submit(agent.id, Some("acme"), false).await.expect("submit");

        f.shutdown.trigger();
        let record = ticket.wait().await.expect("record");
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error.as_deref(), Some(SHUTDOWN_REASON));
        assert!(f.shutdown.wait_idle(Duration::from_secs(5)).await.is_complete());
        assert!(matches!(
            f.coordinator.submit(agent.id, Some("acme"), true).await,
            Err(ExecutionError::ShuttingDown)
        ));
    }
}
