//! Result Store: results and execution history, plus retention.
//!
//! A thin facade over [`Store`] that owns the rules callers should not have
//! to repeat: appends are tied to the execution's terminal write, queries are
//! always tenant-scoped, and compaction derives its cutoff from config.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;
use wt_core::config::RetentionConfig;
use wt_core::store::{CompactionReport, Store, StoreError};
use wt_core::types::{
    AgentExecution, AgentResult, ExecutionCompletion, ExecutionFilter, Page, ResultFilter,
};

#[derive(Clone)]
pub struct ResultStore {
    store: Arc<Store>,
}

impl ResultStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Write the terminal record and its results atomically. Returns `false`
    /// when the execution was already terminal; nothing is written then.
    pub async fn append(
        &self,
        completion: &ExecutionCompletion,
        results: &[AgentResult],
    ) -> Result<bool, StoreError> {
        let won = self.store.finalize_execution(completion, results).await?;
        if won {
            debug!(
                execution_id = %completion.execution_id,
                status = %completion.status,
                results = results.len(),
                "execution finalized"
            );
        } else {
            debug!(execution_id = %completion.execution_id, "execution already terminal, append dropped");
        }
        Ok(won)
    }

    pub async fn query(&self, filter: &ResultFilter) -> Result<Page<AgentResult>, StoreError> {
        self.store.query_results(filter).await
    }

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Page<AgentExecution>, StoreError> {
        self.store.list_executions(filter).await
    }

    /// An execution visible to `tenant`: its own or a shared agent's.
    pub async fn get_execution(
        &self,
        id: Uuid,
        tenant: Option<&str>,
    ) -> Result<Option<AgentExecution>, StoreError> {
        let execution = self.store.get_execution(id).await?;
        Ok(execution.filter(|e| match (&e.tenant_id, tenant) {
            (None, _) => true,
            (Some(owner), Some(t)) => owner == t,
            (Some(_), None) => false,
        }))
    }

    /// Remove everything past the retention horizon as of `now`.
    pub async fn compact(
        &self,
        now: DateTime<Utc>,
        retention: &RetentionConfig,
    ) -> Result<CompactionReport, StoreError> {
        let cutoff = now - retention.max_age();
        let report = self
            .store
            .compact(cutoff, retention.max_results_per_agent)
            .await?;
        if report.total_results() > 0 || report.executions > 0 {
            info!(
                expired = report.expired_results,
                capped = report.capped_results,
                orphaned = report.orphaned_results,
                executions = report.executions,
                "retention compaction removed records"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use wt_core::clock::{Clock, FakeClock};
    use wt_core::types::{
        Agent, AgentConfig, AgentStatus, AgentType, Capability, ExecutionStatus, ExecutorKind,
    };

    fn agent(tenant: Option<&str>, now: DateTime<Utc>) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: "feed".into(),
            tenant_id: tenant.map(str::to_string),
            agent_type: if tenant.is_some() {
                AgentType::TenantSpecific
            } else {
                AgentType::Shared
            },
            capabilities: [Capability::NewsMonitoring].into_iter().collect(),
            executor: ExecutorKind::NewsMonitor,
            config: AgentConfig::default(),
            status: AgentStatus::Active,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            consecutive_error_count: 0,
        }
    }

    async fn finished(results: &ResultStore, store: &Store, a: &Agent, at: DateTime<Utc>) -> Uuid {
        let exec = AgentExecution::pending(a, false, false, at);
        store.insert_execution(&exec).await.expect("insert");
        let result = AgentResult {
            id: Uuid::new_v4(),
            agent_id: a.id,
            tenant_id: a.tenant_id.clone(),
            execution_id: exec.id,
            produced_at: at,
            source: "news".into(),
            content: "item".into(),
            relevance_score: None,
        };
        let completion = ExecutionCompletion {
            execution_id: exec.id,
            status: ExecutionStatus::Completed,
            ended_at: at,
            error: None,
            warnings: Vec::new(),
        };
        assert!(results.append(&completion, &[result]).await.expect("append"));
        exec.id
    }

    #[tokio::test]
    async fn second_append_is_dropped() {
        let clock = FakeClock::new();
        let store = Arc::new(Store::open_in_memory().await.expect("store"));
        let results = ResultStore::new(Arc::clone(&store));
        let a = agent(Some("acme"), clock.now());
        store.insert_agent(&a).await.expect("agent");
        let id = finished(&results, &store, &a, clock.now()).await;

        let late = ExecutionCompletion {
            execution_id: id,
            status: ExecutionStatus::TimedOut,
            ended_at: clock.now(),
            error: Some("late".into()),
            warnings: Vec::new(),
        };
        assert!(!results.append(&late, &[]).await.expect("append"));
        let exec = store.get_execution(id).await.expect("get").expect("exists");
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.result_count, 1);
    }

    #[tokio::test]
    async fn executions_are_tenant_scoped() {
        let clock = FakeClock::new();
        let store = Arc::new(Store::open_in_memory().await.expect("store"));
        let results = ResultStore::new(Arc::clone(&store));
        let owned = agent(Some("acme"), clock.now());
        let shared = agent(None, clock.now());
        store.insert_agent(&owned).await.expect("agent");
        store.insert_agent(&shared).await.expect("agent");
        let owned_exec = finished(&results, &store, &owned, clock.now()).await;
        let shared_exec = finished(&results, &store, &shared, clock.now()).await;

        let visible = |e: Option<AgentExecution>| e.is_some();
        assert!(visible(results.get_execution(owned_exec, Some("acme")).await.expect("get")));
        assert!(!visible(results.get_execution(owned_exec, Some("globex")).await.expect("get")));
        assert!(!visible(results.get_execution(owned_exec, None).await.expect("get")));
        assert!(visible(results.get_execution(shared_exec, Some("globex")).await.expect("get")));
    }

    #[tokio::test]
    async fn compact_uses_configured_horizon() {
        let clock = FakeClock::new();
        let store = Arc::new(Store::open_in_memory().await.expect("store"));
        let results = ResultStore::new(Arc::clone(&store));
        let a = agent(Some("acme"), clock.now());
        store.insert_agent(&a).await.expect("agent");
        finished(&results, &store, &a, clock.now()).await;

        let retention = RetentionConfig {
            max_age_days: 30,
            ..RetentionConfig::default()
        };
        let report = results
            .compact(clock.now() + Duration::days(29), &retention)
            .await
            .expect("compact");
        assert_eq!(report.total_results(), 0);

        let report = results
            .compact(clock.now() + Duration::days(31), &retention)
            .await
            .expect("compact");
        assert_eq!(report.expired_results, 1);
        assert_eq!(report.executions, 1);
    }
}
