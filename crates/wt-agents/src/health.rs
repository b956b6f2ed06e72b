//! Health Monitor evaluation.
//!
//! [`assess`] is a pure function over an agent and its windowed executions;
//! [`HealthMonitor`] loads the inputs and applies the one side effect the
//! monitor has: demoting an agent whose error streak reached the budget.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;
use wt_core::clock::SharedClock;
use wt_core::config::HealthConfig;
use wt_core::store::{Store, StoreError};
use wt_core::types::{Agent, AgentExecution, AgentStatus, ExecutionStatus};
use wt_telemetry::metrics::{MetricsCollector, AGENTS_DEMOTED_TOTAL};

use crate::events::{EventBus, WatchEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIssue {
    StatusNotActive,
    LowSuccessRate,
    ErrorCountExceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub agent_id: Uuid,
    pub status: AgentStatus,
    pub success_rate: f64,
    pub average_execution_time_secs: Option<f64>,
    pub error_count: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub is_healthy: bool,
    pub issues: Vec<HealthIssue>,
    /// Terminal executions inside the window.
    pub window_executions: usize,
}

/// Compute health from `executions` (already restricted to the window).
/// Non-terminal executions are ignored.
pub fn assess(agent: &Agent, executions: &[AgentExecution], config: &HealthConfig) -> HealthStatus {
    let terminal: Vec<&AgentExecution> = executions
        .iter()
        .filter(|e| e.status.is_terminal())
        .collect();
    let completed = terminal
        .iter()
        .filter(|e| e.status == ExecutionStatus::Completed)
        .count();
    let success_rate = if terminal.is_empty() {
        0.0
    } else {
        completed as f64 / terminal.len() as f64
    };

    let durations: Vec<f64> = terminal
        .iter()
        .filter_map(|e| e.duration())
        .map(|d| d.num_milliseconds() as f64 / 1000.0)
        .collect();
    let average_execution_time_secs = if durations.is_empty() {
        None
    } else {
        Some(durations.iter().sum::<f64>() / durations.len() as f64)
    };

    let error_count = agent.consecutive_error_count;
    let mut issues = Vec::new();
    if agent.status != AgentStatus::Active {
        issues.push(HealthIssue::StatusNotActive);
    }
    if success_rate < config.success_threshold {
        issues.push(HealthIssue::LowSuccessRate);
    }
    if error_count >= config.max_error_count {
        issues.push(HealthIssue::ErrorCountExceeded);
    }

    HealthStatus {
        agent_id: agent.id,
        status: agent.status,
        success_rate,
        average_execution_time_secs,
        error_count,
        last_run_at: agent.last_run_at,
        next_run_at: agent.next_run_at(),
        is_healthy: issues.is_empty(),
        issues,
        window_executions: terminal.len(),
    }
}

/// Outcome of one pass over every agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub evaluated: usize,
    pub unhealthy: usize,
    pub demoted: Vec<Uuid>,
}

#[derive(Clone)]
pub struct HealthMonitor {
    store: Arc<Store>,
    clock: SharedClock,
    config: HealthConfig,
    events: EventBus,
    metrics: Arc<MetricsCollector>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<Store>,
        clock: SharedClock,
        config: HealthConfig,
        events: EventBus,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            events,
            metrics,
        }
    }

    /// Read-only health query.
    pub async fn evaluate(&self, agent_id: Uuid) -> Result<Option<HealthStatus>, StoreError> {
        let Some(agent) = self.store.get_agent(agent_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.assess_agent(&agent).await?))
    }

    async fn assess_agent(&self, agent: &Agent) -> Result<HealthStatus, StoreError> {
        let since = self.clock.now() - self.config.window();
        let executions = self.store.executions_since(agent.id, since).await?;
        Ok(assess(agent, &executions, &self.config))
    }

    /// Evaluate and demote when the error budget is spent. The returned
    /// status reflects the agent after any demotion.
    pub async fn check(&self, agent: &Agent) -> Result<HealthStatus, StoreError> {
        let mut health = self.assess_agent(agent).await?;
        if health.error_count < self.config.max_error_count || agent.status != AgentStatus::Active {
            return Ok(health);
        }

        let demoted = self
            .store
            .demote_agent(agent.id, self.config.max_error_count, self.clock.now())
            .await?;
        if demoted {
            warn!(
                agent_id = %agent.id,
                error_count = health.error_count,
                max_error_count = self.config.max_error_count,
                "agent demoted to error"
            );
            self.metrics.increment_counter(AGENTS_DEMOTED_TOTAL, &[]);
            self.events.publish(WatchEvent::AgentStatusChanged {
                agent_id: agent.id,
                from: AgentStatus::Active,
                to: AgentStatus::Error,
            });
            health.status = AgentStatus::Error;
            health.is_healthy = false;
            if !health.issues.contains(&HealthIssue::StatusNotActive) {
                health.issues.insert(0, HealthIssue::StatusNotActive);
            }
        } else if let Some(current) = self.store.get_agent(agent.id).await? {
            // The snapshot was stale; report on the agent as it is now.
            health = self.assess_agent(&current).await?;
        }
        Ok(health)
    }

    /// One periodic pass over every agent.
    pub async fn check_all(&self) -> Result<HealthReport, StoreError> {
        let agents = self.store.list_all_agents().await?;
        let mut report = HealthReport::default();
        for agent in &agents {
            let health = self.check(agent).await?;
            report.evaluated += 1;
            if !health.is_healthy {
                report.unhealthy += 1;
            }
            if agent.status != health.status && health.status == AgentStatus::Error {
                report.demoted.push(agent.id);
            }
        }
        if !report.demoted.is_empty() {
            info!(demoted = report.demoted.len(), "health pass demoted agents");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use wt_core::clock::{Clock, FakeClock};
    use wt_core::types::{AgentConfig, AgentType, Capability, ExecutionCompletion, ExecutorKind};

    fn agent(clock: &FakeClock, errors: u32) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "h".into(),
            tenant_id: None,
            agent_type: AgentType::Shared,
            capabilities: [Capability::NewsMonitoring].into_iter().collect(),
            executor: ExecutorKind::NewsMonitor,
            config: AgentConfig {
                update_frequency_minutes: 30,
                ..AgentConfig::default()
            },
            status: AgentStatus::Active,
            created_at: clock.now(),
            updated_at: clock.now(),
            last_run_at: Some(clock.now()),
            consecutive_error_count: errors,
        }
    }

    fn exec(a: &Agent, status: ExecutionStatus, start: DateTime<Utc>, secs: i64) -> AgentExecution {
        let mut e = AgentExecution::pending(a, false, false, start);
        e.status = status;
        if status.is_terminal() {
            e.ended_at = Some(start + Duration::seconds(secs));
        }
        e
    }

    #[test]
    fn no_executions_means_zero_success_rate() {
        let clock = FakeClock::new();
        let a = agent(&clock, 0);
        let h = assess(&a, &[], &HealthConfig::default());
        assert_eq!(h.success_rate, 0.0);
        assert!(!h.is_healthy);
        assert_eq!(h.issues, vec![HealthIssue::LowSuccessRate]);
        assert_eq!(h.next_run_at, Some(clock.now() + Duration::minutes(30)));
    }

    #[test]
    fn rate_and_average_over_terminal_executions() {
        let clock = FakeClock::new();
        let a = agent(&clock, 0);
        let t = clock.now();
        let history = vec![
            exec(&a, ExecutionStatus::Completed, t, 2),
            exec(&a, ExecutionStatus::Completed, t, 4),
            exec(&a, ExecutionStatus::Completed, t, 6),
            exec(&a, ExecutionStatus::Completed, t, 8),
            exec(&a, ExecutionStatus::TimedOut, t, 10),
            exec(&a, ExecutionStatus::Running, t, 0),
        ];
        let h = assess(&a, &history, &HealthConfig::default());
        assert_eq!(h.window_executions, 5);
        assert!((h.success_rate - 0.8).abs() < f64::EPSILON);
        assert_eq!(h.average_execution_time_secs, Some(6.0));
        assert!(h.is_healthy);
    }

    #[test]
    fn every_violation_is_named() {
        let clock = FakeClock::new();
        let mut a = agent(&clock, 3);
        a.status = AgentStatus::Inactive;
        let history = vec![exec(&a, ExecutionStatus::Failed, clock.now(), 1)];
        let h = assess(&a, &history, &HealthConfig::default());
        assert_eq!(
            h.issues,
            vec![
                HealthIssue::StatusNotActive,
                HealthIssue::LowSuccessRate,
                HealthIssue::ErrorCountExceeded
            ]
        );
    }

    #[tokio::test]
    async fn check_demotes_at_error_budget_and_evaluate_does_not() {
        let clock = FakeClock::new();
        let store = Arc::new(Store::open_in_memory().await.expect("store"));
        let monitor = HealthMonitor::new(
            Arc::clone(&store),
            clock.shared(),
            HealthConfig::default(),
            EventBus::new(),
            Arc::new(MetricsCollector::new()),
        );
        let a = agent(&clock, 3);
        store.insert_agent(&a).await.expect("insert");
        let e = AgentExecution::pending(&a, false, false, clock.now());
        store.insert_execution(&e).await.expect("insert");
        store
            .finalize_execution(
                &ExecutionCompletion {
                    execution_id: e.id,
                    status: ExecutionStatus::Failed,
                    ended_at: clock.now(),
                    error: Some("boom".into()),
                    warnings: Vec::new(),
                },
                &[],
            )
            .await
            .expect("finalize");

        let read_only = monitor.evaluate(a.id).await.expect("eval").expect("exists");
        assert_eq!(read_only.status, AgentStatus::Active);
        assert_eq!(read_only.window_executions, 1);

        let report = monitor.check_all().await.expect("check");
        assert_eq!(report.demoted, vec![a.id]);
        let stored = store.get_agent(a.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, AgentStatus::Error);

        // A second pass is a no-op.
        let report = monitor.check_all().await.expect("check");
        assert!(report.demoted.is_empty());
        assert_eq!(report.unhealthy, 1);
    }

    #[tokio::test]
    async fn recovered_agent_is_not_demoted_from_stale_snapshot() {
        let clock = FakeClock::new();
        let store = Arc::new(Store::open_in_memory().await.expect("store"));
        let monitor = HealthMonitor::new(
            Arc::clone(&store),
            clock.shared(),
            HealthConfig::default(),
            EventBus::new(),
            Arc::new(MetricsCollector::new()),
        );
        let a = agent(&clock, 3);
        store.insert_agent(&a).await.expect("insert");
        let snapshot = store
            .list_all_agents()
            .await
            .expect("list")
            .into_iter()
            .find(|s| s.id == a.id)
            .expect("listed");

        // A run succeeds between the snapshot and the check.
        store
            .transition_agent(a.id, &[AgentStatus::Active], AgentStatus::Running, clock.now())
            .await
            .expect("claim");
        store
            .release_agent(a.id, true, AgentStatus::Active, clock.now())
            .await
            .expect("release");

        let health = monitor.check(&snapshot).await.expect("check");
        assert_eq!(health.status, AgentStatus::Active);
        assert_eq!(health.error_count, 0);
        assert!(!health.issues.contains(&HealthIssue::ErrorCountExceeded));

        let stored = store.get_agent(a.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, AgentStatus::Active);
        assert_eq!(stored.consecutive_error_count, 0);
    }

    #[tokio::test]
    async fn executions_outside_window_are_ignored() {
        let clock = FakeClock::new();
        let store = Arc::new(Store::open_in_memory().await.expect("store"));
        let monitor = HealthMonitor::new(
            Arc::clone(&store),
            clock.shared(),
            HealthConfig::default(),
            EventBus::new(),
            Arc::new(MetricsCollector::new()),
        );
        let a = agent(&clock, 0);
        store.insert_agent(&a).await.expect("insert");
        let e = AgentExecution::pending(&a, false, false, clock.now());
        store.insert_execution(&e).await.expect("insert");

        clock.advance(Duration::days(8));
        let h = monitor.evaluate(a.id).await.expect("eval").expect("exists");
        assert_eq!(h.window_executions, 0);
    }
}
