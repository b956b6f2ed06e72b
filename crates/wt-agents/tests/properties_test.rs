use std::sync::Arc;

use chrono::Duration;
use proptest::prelude::*;
use uuid::Uuid;
use wt_agents::events::EventBus;
use wt_agents::health::assess;
use wt_agents::registry::{CreateAgentRequest, Registry};
use wt_core::clock::{Clock, FakeClock};
use wt_core::config::HealthConfig;
use wt_core::store::Store;
use wt_core::types::{
    Agent, AgentConfig, AgentExecution, AgentStatus, AgentType, Capability, ExecutionStatus,
    ExecutorKind,
};

fn status_strategy() -> impl Strategy<Value = AgentStatus> {
    prop_oneof![
        Just(AgentStatus::Active),
        Just(AgentStatus::Inactive),
        Just(AgentStatus::Error),
        Just(AgentStatus::Running),
    ]
}

fn execution_status_strategy() -> impl Strategy<Value = ExecutionStatus> {
    prop_oneof![
        Just(ExecutionStatus::Pending),
        Just(ExecutionStatus::Running),
        Just(ExecutionStatus::Completed),
        Just(ExecutionStatus::Failed),
        Just(ExecutionStatus::TimedOut),
    ]
}

fn agent(status: AgentStatus, errors: u32, clock: &FakeClock) -> Agent {
    Agent {
        id: Uuid::new_v4(),
        name: "prop".into(),
        tenant_id: None,
        agent_type: AgentType::Shared,
        capabilities: [Capability::NewsMonitoring].into_iter().collect(),
        executor: ExecutorKind::NewsMonitor,
        config: AgentConfig::default(),
        status,
        created_at: clock.now(),
        updated_at: clock.now(),
        last_run_at: None,
        consecutive_error_count: errors,
    }
}

proptest! {
    #[test]
    fn is_healthy_matches_its_definition(
        status in status_strategy(),
        errors in 0u32..10,
        history in proptest::collection::vec((execution_status_strategy(), 0i64..600), 0..40),
        threshold in 0.0f64..=1.0,
        max_errors in 1u32..8,
    ) {
        let clock = FakeClock::new();
        let a = agent(status, errors, &clock);
        let executions: Vec<AgentExecution> = history
            .iter()
            .map(|(s, secs)| {
                let mut e = AgentExecution::pending(&a, false, false, clock.now());
                e.status = *s;
                if s.is_terminal() {
                    e.ended_at = Some(clock.now() + Duration::seconds(*secs));
                }
                e
            })
            .collect();
        let config = HealthConfig {
            success_threshold: threshold,
            max_error_count: max_errors,
            ..HealthConfig::default()
        };

        let health = assess(&a, &executions, &config);

        let terminal = history.iter().filter(|(s, _)| s.is_terminal()).count();
        let completed = history.iter().filter(|(s, _)| *s == ExecutionStatus::Completed).count();
        let rate = if terminal == 0 { 0.0 } else { completed as f64 / terminal as f64 };
        let expected = status == AgentStatus::Active && rate >= threshold && errors < max_errors;

        prop_assert_eq!(health.is_healthy, expected);
        prop_assert_eq!(health.issues.is_empty(), expected);
        prop_assert!((0.0..=1.0).contains(&health.success_rate));
    }

    #[test]
    fn list_never_leaks_other_tenants(
        owners in proptest::collection::vec(proptest::option::of(0usize..3), 1..12),
        viewer in proptest::option::of(0usize..3),
    ) {
        let tenants = ["acme", "globex", "initech"];
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let (visible, expected_shared, expected_owned) = rt.block_on(async {
            let clock = FakeClock::new();
            let store = Arc::new(Store::open_in_memory().await.expect("store"));
            let registry = Registry::new(store, clock.shared(), EventBus::new());

            let mut shared = 0;
            let mut owned = 0;
            for owner in &owners {
                let tenant = owner.map(|i| tenants[i]);
                let request = CreateAgentRequest {
                    name: "agent".into(),
                    agent_type: None,
                    capabilities: [Capability::NewsMonitoring].into_iter().collect(),
                    config: AgentConfig::default(),
                };
                registry.create(tenant, request).await.expect("create");
                clock.advance_minutes(1);
                match (tenant, viewer.map(|i| tenants[i])) {
                    (None, _) => shared += 1,
                    (Some(t), Some(v)) if t == v => owned += 1,
                    _ => {}
                }
            }
            let visible = registry
                .list(viewer.map(|i| tenants[i]))
                .await
                .expect("list");
            (visible, shared, owned)
        });

        let viewer = viewer.map(|i| tenants[i]);
        for a in &visible {
            match a.agent_type {
                AgentType::Shared => prop_assert!(a.tenant_id.is_none()),
                AgentType::TenantSpecific => prop_assert_eq!(a.tenant_id.as_deref(), viewer),
            }
        }
        let shared = visible.iter().filter(|a| a.agent_type == AgentType::Shared).count();
        prop_assert_eq!(shared, expected_shared);
        prop_assert_eq!(visible.len() - shared, expected_owned);
        prop_assert!(visible.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }
}
