//! The executor variants and the deadline-bounded run used by both the
//! in-process path and the isolated worker.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use wt_core::clock::SharedClock;
use wt_core::types::{Agent, AgentResult, ExecutionCompletion, ExecutionStatus, ExecutorKind};
use wt_harness::circuit_breaker::{BreakerSet, CircuitBreakerError};
use wt_telemetry::metrics::{MetricsCollector, SOURCE_FAILURES_TOTAL};

use crate::capabilities;
use crate::sources::{FetchRequest, RawItem, SourceCatalog};

// ---------------------------------------------------------------------------
// RunOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// At least one source answered. `warnings` has one entry per failed source.
    Completed {
        results: Vec<AgentResult>,
        warnings: Vec<String>,
    },
    /// Every source failed.
    Failed { error: String, warnings: Vec<String> },
    TimedOut { after: Duration },
    /// Cancelled from outside (shutdown, worker signal).
    Interrupted,
}

impl RunOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            RunOutcome::Completed { .. } => ExecutionStatus::Completed,
            RunOutcome::Failed { .. } | RunOutcome::Interrupted => ExecutionStatus::Failed,
            RunOutcome::TimedOut { .. } => ExecutionStatus::TimedOut,
        }
    }

    /// Split into the terminal record and the results to append with it.
    /// Only completed runs carry results.
    pub fn into_completion(
        self,
        execution_id: Uuid,
        ended_at: DateTime<Utc>,
        interrupted_reason: &str,
    ) -> (ExecutionCompletion, Vec<AgentResult>) {
        let status = self.status();
        let (error, warnings, results) = match self {
            RunOutcome::Completed { results, warnings } => (None, warnings, results),
            RunOutcome::Failed { error, warnings } => (Some(error), warnings, Vec::new()),
            RunOutcome::TimedOut { after } => (
                Some(format!("execution exceeded its {}s deadline", after.as_secs())),
                Vec::new(),
                Vec::new(),
            ),
            RunOutcome::Interrupted => (Some(interrupted_reason.to_string()), Vec::new(), Vec::new()),
        };
        (
            ExecutionCompletion {
                execution_id,
                status,
                ended_at,
                error,
                warnings,
            },
            results,
        )
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    catalog: SourceCatalog,
    breakers: BreakerSet,
    metrics: Arc<MetricsCollector>,
    clock: SharedClock,
}

impl Executor {
    pub fn new(
        catalog: SourceCatalog,
        breakers: BreakerSet,
        metrics: Arc<MetricsCollector>,
        clock: SharedClock,
    ) -> Self {
        Self {
            catalog,
            breakers,
            metrics,
            clock,
        }
    }

    pub fn breakers(&self) -> &BreakerSet {
        &self.breakers
    }

    pub fn catalog(&self) -> &SourceCatalog {
        &self.catalog
    }

    /// Run with a deadline. On expiry the run's token is cancelled and the
    /// executor gets `grace` to wind down; whatever it returns then is
    /// discarded in favour of [`RunOutcome::TimedOut`].
    pub async fn run_with_deadline(
        &self,
        agent: &Agent,
        execution_id: Uuid,
        timeout: Duration,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let deadline = cancel.child_token();
        let run = self.run(agent, execution_id, &deadline);
        tokio::pin!(run);

        tokio::select! {
            outcome = &mut run => outcome,
            _ = tokio::time::sleep(timeout) => {
                deadline.cancel();
                if tokio::time::timeout(grace, &mut run).await.is_err() {
                    warn!(%execution_id, "executor did not stop within the cancellation grace period");
                }
                RunOutcome::TimedOut { after: timeout }
            }
        }
    }

    /// Fetch every source of `agent` in turn, absorbing per-source failures,
    /// then shape the items according to the agent's executor variant.
    /// `cancel` is checked between sources and passed into every fetch.
    pub async fn run(&self, agent: &Agent, execution_id: Uuid, cancel: &CancellationToken) -> RunOutcome {
        let sources = capabilities::source_names(&agent.capabilities, &agent.config);
        if sources.is_empty() {
            return RunOutcome::Failed {
                error: "no data sources configured".to_string(),
                warnings: Vec::new(),
            };
        }

        let max_results = agent.config.max_results_per_update as usize;
        let request = FetchRequest {
            keywords: agent.config.keywords.clone(),
            limit: max_results.saturating_mul(2),
        };

        let mut items: Vec<(String, RawItem)> = Vec::new();
        let mut warnings = Vec::new();

        for name in &sources {
            if cancel.is_cancelled() {
                return RunOutcome::Interrupted;
            }
            match self.fetch_one(name, &request, cancel).await {
                Ok(fetched) => {
                    debug!(source = %name, items = fetched.len(), "source fetched");
                    items.extend(fetched.into_iter().map(|item| (name.clone(), item)));
                }
                Err(FetchFailure::Cancelled) => return RunOutcome::Interrupted,
                Err(FetchFailure::Warning(message)) => {
                    warn!(source = %name, error = %message, "source fetch failed");
                    self.metrics
                        .increment_counter(SOURCE_FAILURES_TOTAL, &[("source", name.as_str())]);
                    warnings.push(message);
                }
            }
        }

        if warnings.len() == sources.len() {
            return RunOutcome::Failed {
                error: format!("all {} sources failed", sources.len()),
                warnings,
            };
        }

        let produced_at = self.clock.now();
        let results = shape(agent.executor, items, &agent.config.keywords, max_results)
            .into_iter()
            .map(|scored| AgentResult {
                id: Uuid::new_v4(),
                agent_id: agent.id,
                tenant_id: agent.tenant_id.clone(),
                execution_id,
                produced_at,
                source: scored.source,
                content: scored.content,
                relevance_score: scored.score,
            })
            .collect();

        RunOutcome::Completed { results, warnings }
    }

    async fn fetch_one(
        &self,
        name: &str,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawItem>, FetchFailure> {
        let source = self
            .catalog
            .resolve(name)
            .map_err(|e| FetchFailure::Warning(e.to_string()))?;
        let breaker = self.breakers.get(name);
        let result = breaker
            .call(cancel, || async { source.fetch(request, cancel).await })
            .await;
        if cancel.is_cancelled() {
            return Err(FetchFailure::Cancelled);
        }
        result.map_err(|e| match e {
            CircuitBreakerError::Cancelled => FetchFailure::Cancelled,
            CircuitBreakerError::Open(_) => {
                FetchFailure::Warning(format!("source `{name}` skipped: circuit open"))
            }
            CircuitBreakerError::Timeout(after) => {
                FetchFailure::Warning(format!("source `{name}` timed out after {}s", after.as_secs()))
            }
            CircuitBreakerError::Inner(message) => FetchFailure::Warning(message),
        })
    }
}

enum FetchFailure {
    Cancelled,
    Warning(String),
}

// ---------------------------------------------------------------------------
// Result shaping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct Scored {
    source: String,
    content: String,
    score: Option<f64>,
}

/// Fraction of `keywords` occurring (case-insensitively) in `content`.
/// `None` when the agent has no keywords.
pub fn relevance(content: &str, keywords: &[String]) -> Option<f64> {
    if keywords.is_empty() {
        return None;
    }
    let haystack = content.to_lowercase();
    let matched = keywords
        .iter()
        .filter(|k| haystack.contains(&k.trim().to_lowercase()))
        .count();
    Some(matched as f64 / keywords.len() as f64)
}

fn rank(mut scored: Vec<Scored>, max_results: usize) -> Vec<Scored> {
    // Stable: equal scores keep source order.
    scored.sort_by(|a, b| {
        b.score
            .unwrap_or(0.0)
            .partial_cmp(&a.score.unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(max_results);
    scored
}

fn shape(
    kind: ExecutorKind,
    items: Vec<(String, RawItem)>,
    keywords: &[String],
    max_results: usize,
) -> Vec<Scored> {
    let scored = items.into_iter().map(|(source, item)| Scored {
        score: relevance(&item.content, keywords),
        source,
        content: item.content,
    });

    match kind {
        ExecutorKind::NewsMonitor => rank(scored.collect(), max_results),
        ExecutorKind::KeywordWatcher => rank(
            scored.filter(|s| s.score.is_some_and(|v| v > 0.0)).collect(),
            max_results,
        ),
        ExecutorKind::TrendAnalyzer if keywords.is_empty() => rank(scored.collect(), max_results),
        ExecutorKind::TrendAnalyzer => trends(scored.collect(), keywords, max_results),
    }
}

/// One result per keyword that was mentioned, ranked by mention count.
fn trends(items: Vec<Scored>, keywords: &[String], max_results: usize) -> Vec<Scored> {
    let total = items.len().max(1);
    let mut out: Vec<(usize, Scored)> = Vec::new();

    for keyword in keywords {
        let needle = keyword.trim().to_lowercase();
        let mentions: Vec<&Scored> = items
            .iter()
            .filter(|s| s.content.to_lowercase().contains(&needle))
            .collect();
        let Some(first) = mentions.first() else {
            continue;
        };
        let sources: BTreeSet<&str> = mentions.iter().map(|s| s.source.as_str()).collect();
        let content = format!(
            "trend `{}`: {} mention(s) across {} source(s); e.g. {}",
            keyword.trim(),
            mentions.len(),
            sources.len(),
            first.content
        );
        out.push((
            mentions.len(),
            Scored {
                source: sources.into_iter().collect::<Vec<_>>().join("+"),
                content,
                score: Some(mentions.len() as f64 / total as f64),
            },
        ));
    }

    out.sort_by(|a, b| b.0.cmp(&a.0));
    out.into_iter().map(|(_, s)| s).take(max_results).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wt_core::clock::{Clock, FakeClock};
    use wt_core::types::{AgentConfig, AgentStatus, AgentType, Capability};
    use wt_harness::circuit_breaker::CircuitBreakerConfig;

    use crate::sources::StaticSource;

    fn kw(list: &[&str]) -> Vec<String> {
        list.iter().map(|k| k.to_string()).collect()
    }

    fn items(source: &str, contents: &[&str]) -> Vec<(String, RawItem)> {
        contents
            .iter()
            .map(|c| (source.to_string(), RawItem::text(*c)))
            .collect()
    }

    fn agent(caps: &[Capability], config: AgentConfig) -> Agent {
        let clock = FakeClock::new();
        Agent {
            id: Uuid::new_v4(),
            name: "probe".into(),
            tenant_id: Some("acme".into()),
            agent_type: AgentType::TenantSpecific,
            capabilities: caps.iter().copied().collect(),
            executor: capabilities::resolve_executor(&caps.iter().copied().collect())
                .expect("capability"),
            config,
            status: AgentStatus::Running,
            created_at: clock.now(),
            updated_at: clock.now(),
            last_run_at: None,
            consecutive_error_count: 0,
        }
    }

    fn executor(catalog: SourceCatalog) -> Executor {
        Executor::new(
            catalog,
            BreakerSet::new(CircuitBreakerConfig::default()),
            Arc::new(MetricsCollector::new()),
            FakeClock::new().shared(),
        )
    }

    #[test]
    fn relevance_is_fraction_of_keywords_matched() {
        assert_eq!(relevance("Rust and Tokio", &kw(&["rust", "tokio"])), Some(1.0));
        assert_eq!(relevance("rust only", &kw(&["rust", "tokio"])), Some(0.5));
        assert_eq!(relevance("nothing", &kw(&["rust"])), Some(0.0));
        assert_eq!(relevance("anything", &[]), None);
    }

    #[test]
    fn keyword_watcher_drops_unmatched_and_ranks() {
        let out = shape(
            ExecutorKind::KeywordWatcher,
            items("news", &["weather", "rust", "rust tokio"]),
            &kw(&["rust", "tokio"]),
            10,
        );
        let contents: Vec<_> = out.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(contents, vec!["rust tokio", "rust"]);
    }

    #[test]
    fn news_monitor_truncates_to_max_results() {
        let out = shape(
            ExecutorKind::NewsMonitor,
            items("news", &["a", "b", "c", "d"]),
            &[],
            2,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].content, "a");
    }

    #[test]
    fn trend_analyzer_counts_mentions_per_keyword() {
        let mut all = items("news", &["rust 1", "rust 2", "go 1"]);
        all.extend(items("trends", &["rust 3"]));
        let out = shape(ExecutorKind::TrendAnalyzer, all, &kw(&["go", "rust", "zig"]), 10);
        assert_eq!(out.len(), 2);
        assert!(out[0].content.starts_with("trend `rust`: 3 mention(s) across 2 source(s)"));
        assert_eq!(out[0].source, "news+trends");
        assert_eq!(out[0].score, Some(0.75));
        assert!(out[1].content.starts_with("trend `go`"));
    }

    #[tokio::test]
    async fn one_failing_source_degrades_but_completes() {
        let catalog = SourceCatalog::new()
            .with_source(Arc::new(StaticSource::failing("alpha", "connection refused")))
            .with_source(Arc::new(StaticSource::items(
                "beta",
                (1..=5).map(|i| RawItem::text(format!("rust story {i}"))).collect(),
            )));
        let config = AgentConfig {
            keywords: kw(&["rust"]),
            custom_sources: kw(&["alpha", "beta"]),
            ..AgentConfig::default()
        };
        let a = agent(&[Capability::CustomKeyword], config);

        let outcome = executor(catalog)
            .run(&a, Uuid::new_v4(), &CancellationToken::new())
            .await;
        match outcome {
            RunOutcome::Completed { results, warnings } => {
                assert_eq!(results.len(), 5);
                assert_eq!(warnings, vec!["source `alpha` unavailable: connection refused"]);
                assert!(results.iter().all(|r| r.source == "beta"));
                assert!(results.iter().all(|r| r.tenant_id.as_deref() == Some("acme")));
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_sources_failing_fails_the_run() {
        let catalog = SourceCatalog::new()
            .with_source(Arc::new(StaticSource::failing("alpha", "down")));
        let config = AgentConfig {
            keywords: kw(&["rust"]),
            custom_sources: kw(&["alpha", "missing"]),
            ..AgentConfig::default()
        };
        let a = agent(&[Capability::CustomKeyword], config);

        let outcome = executor(catalog)
            .run(&a, Uuid::new_v4(), &CancellationToken::new())
            .await;
        match outcome {
            RunOutcome::Failed { error, warnings } => {
                assert_eq!(error, "all 2 sources failed");
                assert_eq!(warnings.len(), 2);
                assert!(warnings[1].contains("unknown source `missing`"));
            }
            other => panic!("expected failed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_slow_sources() {
        let catalog = SourceCatalog::new().with_source(Arc::new(
            StaticSource::items("news", vec![RawItem::text("late")])
                .with_delay(Duration::from_secs(120)),
        ));
        let a = agent(&[Capability::NewsMonitoring], AgentConfig::default());

        let outcome = executor(catalog)
            .run_with_deadline(
                &a,
                Uuid::new_v4(),
                Duration::from_secs(10),
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, RunOutcome::TimedOut { after: Duration::from_secs(10) });
    }

    #[tokio::test]
    async fn external_cancellation_interrupts() {
        let catalog = SourceCatalog::new().with_source(Arc::new(StaticSource::items("news", vec![])));
        let a = agent(&[Capability::NewsMonitoring], AgentConfig::default());
        let token = CancellationToken::new();
        token.cancel();

        let outcome = executor(catalog).run(&a, Uuid::new_v4(), &token).await;
        assert_eq!(outcome, RunOutcome::Interrupted);
    }

    #[test]
    fn timed_out_completion_carries_no_results() {
        let id = Uuid::new_v4();
        let now = FakeClock::new().now();
        let (completion, results) =
            RunOutcome::TimedOut { after: Duration::from_secs(300) }.into_completion(id, now, "x");
        assert_eq!(completion.status, ExecutionStatus::TimedOut);
        assert_eq!(completion.error.as_deref(), Some("execution exceeded its 300s deadline"));
        assert!(results.is_empty());
    }
}
