//! Scheduler tick.
//!
//! Each tick scans `active` agents, queues the due ones oldest-run first and
//! submits them while the coordinator has free slots. Whatever does not fit
//! stays due and is picked up again on the next tick.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;
use wt_agents::coordinator::{Coordinator, ExecutionError};
use wt_core::clock::SharedClock;
use wt_core::store::{Store, StoreError};
use wt_core::types::{Agent, AgentStatus};
use wt_telemetry::metrics::{MetricsCollector, SCHEDULER_DEFERRED_TOTAL};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Active agents that were due.
    pub due: usize,
    /// Agents submitted, in submission order.
    pub submitted: Vec<Uuid>,
    /// Due agents left for the next tick because the budget was exhausted.
    pub deferred: Vec<Uuid>,
    /// Due agents whose claim lost a race (manual run, status change, delete).
    pub skipped: usize,
}

/// Queue entry ordered by `(last_run_at, id)`; never-run agents sort first.
struct Due(Agent);

impl Due {
    fn key(&self) -> (Option<chrono::DateTime<chrono::Utc>>, Uuid) {
        (self.0.last_run_at, self.0.id)
    }
}

impl PartialEq for Due {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Due {}

impl PartialOrd for Due {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Due {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<Store>,
    coordinator: Coordinator,
    clock: SharedClock,
    metrics: Arc<MetricsCollector>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        coordinator: Coordinator,
        clock: SharedClock,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            coordinator,
            clock,
            metrics,
        }
    }

    /// Due agents in submission order as of now.
    pub async fn due_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let mut queue = self.queue().await?;
        let mut due = Vec::with_capacity(queue.len());
        while let Some(Reverse(Due(agent))) = queue.pop() {
            due.push(agent);
        }
        Ok(due)
    }

    async fn queue(&self) -> Result<BinaryHeap<Reverse<Due>>, StoreError> {
        let now = self.clock.now();
        let active = self.store.list_agents_by_status(AgentStatus::Active).await?;
        Ok(active
            .into_iter()
            .filter(|a| a.is_due(now))
            .map(|a| Reverse(Due(a)))
            .collect())
    }

    /// One pass. Never waits for an execution; submission returns once the
    /// pending record is written.
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let mut queue = self.queue().await?;
        let mut report = TickReport {
            due: queue.len(),
            ..TickReport::default()
        };

        while let Some(Reverse(Due(agent))) = queue.pop() {
            match self.coordinator.try_submit_scheduled(&agent).await {
                Ok(Some(execution)) => {
                    debug!(
                        agent_id = %agent.id,
                        execution_id = %execution.id,
                        last_run_at = ?agent.last_run_at,
                        "scheduled execution submitted"
                    );
                    report.submitted.push(agent.id);
                }
                Ok(None) => {
                    report.deferred.push(agent.id);
                    while let Some(Reverse(Due(rest))) = queue.pop() {
                        report.deferred.push(rest.id);
                    }
                }
                Err(ExecutionError::Store(e)) => return Err(e),
                Err(ExecutionError::ShuttingDown) => {
                    debug!("coordinator shutting down, tick abandoned");
                    break;
                }
                Err(e) => {
                    debug!(agent_id = %agent.id, error = %e, "due agent skipped");
                    report.skipped += 1;
                }
            }
        }

        if !report.deferred.is_empty() {
            self.metrics.increment_counter_by(
                SCHEDULER_DEFERRED_TOTAL,
                &[],
                report.deferred.len() as u64,
            );
            warn!(
                deferred = report.deferred.len(),
                budget = self.coordinator.budget(),
                "concurrency budget exhausted, due agents deferred to next tick"
            );
        }
        debug!(
            due = report.due,
            submitted = report.submitted.len(),
            skipped = report.skipped,
            "scheduler tick"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use wt_core::types::{AgentConfig, AgentType, Capability, ExecutorKind};

    fn agent(last_run_minutes_ago: Option<i64>) -> Agent {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).single().expect("date");
        Agent {
            id: Uuid::new_v4(),
            name: "q".into(),
            tenant_id: None,
            agent_type: AgentType::Shared,
            capabilities: [Capability::NewsMonitoring].into_iter().collect(),
            executor: ExecutorKind::NewsMonitor,
            config: AgentConfig::default(),
            status: AgentStatus::Active,
            created_at: now,
            updated_at: now,
            last_run_at: last_run_minutes_ago.map(|m| now - Duration::minutes(m)),
            consecutive_error_count: 0,
        }
    }

    #[test]
    fn queue_pops_never_run_then_oldest_run() {
        let recent = agent(Some(40));
        let stale = agent(Some(300));
        let never = agent(None);
        let expected = vec![never.id, stale.id, recent.id];

        let mut heap: BinaryHeap<Reverse<Due>> = [recent, never, stale]
            .into_iter()
            .map(|a| Reverse(Due(a)))
            .collect();
        let mut order = Vec::new();
        while let Some(Reverse(Due(a))) = heap.pop() {
            order.push(a.id);
        }
        assert_eq!(order, expected);
    }

    #[test]
    fn ties_break_on_id() {
        let mut a = agent(Some(60));
        let mut b = agent(Some(60));
        b.last_run_at = a.last_run_at;
        if a.id > b.id {
            std::mem::swap(&mut a, &mut b);
        }
        assert!(Due(a) < Due(b));
    }
}
