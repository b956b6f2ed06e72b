use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use wt_core::store::Store;
use wt_core::types::{
    Agent, AgentConfig, AgentExecution, AgentResult, AgentStatus, AgentType, Capability,
    ExecutionCompletion, ExecutionStatus, ExecutorKind, ResultFilter,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).single().expect("valid date")
}

fn make_agent(tenant: Option<&str>, name: &str) -> Agent {
    Agent {
        id: Uuid::new_v4(),
        name: name.into(),
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
        created_at: t0(),
        updated_at: t0(),
        last_run_at: None,
        consecutive_error_count: 0,
    }
}

/// Run one completed execution for `agent` producing `contents`, each result
/// one minute apart starting at `at`.
async fn run_once(store: &Store, agent: &Agent, at: DateTime<Utc>, contents: &[&str]) -> Uuid {
    let exec = AgentExecution::pending(agent, false, false, at);
    store.insert_execution(&exec).await.expect("insert execution");
    store.mark_execution_running(exec.id, at).await.expect("mark running");
    let results: Vec<AgentResult> = contents
        .iter()
        .enumerate()
        .map(|(i, c)| AgentResult {
            id: Uuid::new_v4(),
            agent_id: agent.id,
            tenant_id: agent.tenant_id.clone(),
            execution_id: exec.id,
            produced_at: at + Duration::minutes(i as i64),
            source: "news".into(),
            content: (*c).to_string(),
            relevance_score: None,
        })
        .collect();
    let completion = ExecutionCompletion {
        execution_id: exec.id,
        status: ExecutionStatus::Completed,
        ended_at: at + Duration::seconds(30),
        error: None,
        warnings: Vec::new(),
    };
    assert!(store
        .finalize_execution(&completion, &results)
        .await
        .expect("finalize"));
    exec.id
}

fn scoped(tenant: Option<&str>) -> ResultFilter {
    ResultFilter {
        tenant_id: tenant.map(str::to_string),
        ..Default::default()
    }
}

#[tokio::test]
async fn tenants_never_see_each_others_results() {
    let store = Store::open_in_memory().await.expect("open");
    let acme = make_agent(Some("acme"), "acme-news");
    let globex = make_agent(Some("globex"), "globex-news");
    let shared = make_agent(None, "wire");
    for a in [&acme, &globex, &shared] {
        store.insert_agent(a).await.expect("insert agent");
    }
    run_once(&store, &acme, t0(), &["acme one", "acme two"]).await;
    run_once(&store, &globex, t0(), &["globex one"]).await;
    run_once(&store, &shared, t0(), &["shared one"]).await;

    let page = store.query_results(&scoped(Some("acme"))).await.expect("query");
    assert_eq!(page.total, 3);
    assert!(page
        .items
        .iter()
        .all(|r| r.tenant_id.as_deref() == Some("acme") || r.tenant_id.is_none()));

    let page = store.query_results(&scoped(None)).await.expect("query");
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].content, "shared one");

    // Asking for another tenant's agent by id yields nothing.
    let page = store
        .query_results(&ResultFilter {
            agent_id: Some(globex.id),
            tenant_id: Some("acme".into()),
            ..Default::default()
        })
        .await
        .expect("query");
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn results_page_newest_first() {
    let store = Store::open_in_memory().await.expect("open");
    let a = make_agent(Some("acme"), "pager");
    store.insert_agent(&a).await.expect("insert agent");
    run_once(&store, &a, t0(), &["r0", "r1", "r2", "r3", "r4"]).await;

    let first = store
        .query_results(&ResultFilter {
            tenant_id: Some("acme".into()),
            limit: Some(2),
            ..Default::default()
        })
        .await
        .expect("query");
    assert_eq!(first.total, 5);
    assert!(first.has_more());
    let contents: Vec<_> = first.items.iter().map(|r| r.content.as_str()).collect();
    assert_eq!(contents, vec!["r4", "r3"]);

    let last = store
        .query_results(&ResultFilter {
            tenant_id: Some("acme".into()),
            limit: Some(2),
            offset: Some(4),
            ..Default::default()
        })
        .await
        .expect("query");
    assert_eq!(last.items.len(), 1);
    assert_eq!(last.items[0].content, "r0");
    assert!(!last.has_more());
}

#[tokio::test]
async fn keyword_and_time_range_filters() {
    let store = Store::open_in_memory().await.expect("open");
    let a = make_agent(Some("acme"), "filters");
    store.insert_agent(&a).await.expect("insert agent");
    run_once(
        &store,
        &a,
        t0(),
        &["Rust 2.0 released", "weather update", "rust conference"],
    )
    .await;

    let page = store
        .query_results(&ResultFilter {
            tenant_id: Some("acme".into()),
            keyword: Some("RUST".into()),
            ..Default::default()
        })
        .await
        .expect("query");
    assert_eq!(page.total, 2);

    let page = store
        .query_results(&ResultFilter {
            tenant_id: Some("acme".into()),
            from: Some(t0() + Duration::minutes(1)),
            to: Some(t0() + Duration::minutes(1)),
            ..Default::default()
        })
        .await
        .expect("query");
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].content, "weather update");

    // Wildcards in the keyword are matched literally.
    let page = store
        .query_results(&ResultFilter {
            tenant_id: Some("acme".into()),
            keyword: Some("%".into()),
            ..Default::default()
        })
        .await
        .expect("query");
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn deleted_agent_results_are_hidden_then_compacted() {
    let store = Store::open_in_memory().await.expect("open");
    let a = make_agent(Some("acme"), "doomed");
    store.insert_agent(&a).await.expect("insert agent");
    let exec_id = run_once(&store, &a, t0(), &["kept until compaction"]).await;

    assert!(store.delete_agent(a.id).await.expect("delete"));
    let page = store.query_results(&scoped(Some("acme"))).await.expect("query");
    assert_eq!(page.total, 0);

    let report = store
        .compact(t0() - Duration::days(30), 1000)
        .await
        .expect("compact");
    assert_eq!(report.orphaned_results, 1);
    assert_eq!(report.executions, 1);
    assert!(store.get_execution(exec_id).await.expect("get").is_none());
}

#[tokio::test]
async fn compaction_applies_age_and_per_agent_cap() {
    let store = Store::open_in_memory().await.expect("open");
    let a = make_agent(Some("acme"), "busy");
    store.insert_agent(&a).await.expect("insert agent");
    let old_exec = run_once(&store, &a, t0() - Duration::days(40), &["ancient"]).await;
    run_once(&store, &a, t0(), &["n0", "n1", "n2", "n3"]).await;

    let report = store.compact(t0() - Duration::days(30), 3).await.expect("compact");
    assert_eq!(report.expired_results, 1);
    assert_eq!(report.capped_results, 1);
    assert_eq!(report.executions, 1);
    assert!(store.get_execution(old_exec).await.expect("get").is_none());

    let page = store.query_results(&scoped(Some("acme"))).await.expect("query");
    let contents: Vec<_> = page.items.iter().map(|r| r.content.as_str()).collect();
    assert_eq!(contents, vec!["n3", "n2", "n1"]);
}

#[tokio::test]
async fn file_backed_store_persists_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("watchtower.db");
    let a = make_agent(None, "durable");
    {
        let store = Store::open(&path).await.expect("open");
        store.insert_agent(&a).await.expect("insert agent");
    }
    let store = Store::open(&path).await.expect("reopen");
    let loaded = store.get_agent(a.id).await.expect("get").expect("present");
    assert_eq!(loaded.name, "durable");
}
