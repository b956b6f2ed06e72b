use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use wt_agents::coordinator::{Coordinator, CoordinatorDeps};
use wt_agents::events::EventBus;
use wt_agents::executor::Executor;
use wt_agents::health::HealthMonitor;
use wt_agents::isolation::{IsolationDispatcher, ProcessDispatcher};
use wt_agents::registry::Registry;
use wt_agents::results::ResultStore;
use wt_agents::sources::SourceCatalog;
use wt_bridge::http_api::{api_router, ApiState};
use wt_core::clock::{SharedClock, SystemClock};
use wt_core::config::{Config, RetentionConfig, CONFIG_ENV};
use wt_core::store::{Store, StoreError};
use wt_harness::circuit_breaker::{BreakerSet, CircuitBreakerConfig};
use wt_harness::shutdown::ShutdownSignal;
use wt_telemetry::metrics::{MetricsCollector, RETENTION_REMOVED_TOTAL};

use crate::scheduler::Scheduler;

pub const ABANDONED_REASON: &str = "abandoned by previous daemon run";

/// Extra time on top of the cancel grace for in-flight runs to finalize
/// after shutdown.
const DRAIN_SLACK: Duration = Duration::from_secs(5);

/// Executor wired from config: the built-in sources behind per-source
/// breakers. Shared by the daemon and the isolated worker so both paths
/// fetch the same way.
pub fn build_executor(
    config: &Config,
    metrics: Arc<MetricsCollector>,
    clock: SharedClock,
) -> Executor {
    Executor::new(
        SourceCatalog::demo(config.sources.fetch_timeout()),
        BreakerSet::new(CircuitBreakerConfig::from(&config.sources)),
        metrics,
        clock,
    )
}

/// Resolve `execution.worker_binary`: a bare name is looked up next to the
/// running executable first, then left to `PATH`.
pub fn resolve_worker_binary(name: &str) -> PathBuf {
    let candidate = PathBuf::from(name);
    if candidate.components().count() > 1 {
        return candidate;
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .filter(|path| path.exists())
        .unwrap_or(candidate)
}

/// Everything the daemon is built from. Tests substitute the clock, the
/// source catalog and the dispatcher.
pub struct DaemonParts {
    pub config: Config,
    pub store: Arc<Store>,
    pub clock: SharedClock,
    pub executor: Arc<Executor>,
    pub dispatcher: Option<Arc<dyn IsolationDispatcher>>,
    pub metrics: Arc<MetricsCollector>,
}

/// The watchtower daemon.
///
/// Owns the scheduler, health and retention loops and the API server. All
/// three loops are independent tasks; a slow health pass never delays a
/// scheduler tick.
pub struct Daemon {
    config: Config,
    store: Arc<Store>,
    clock: SharedClock,
    shutdown: ShutdownSignal,
    metrics: Arc<MetricsCollector>,
    coordinator: Coordinator,
    scheduler: Scheduler,
    health: HealthMonitor,
    results: ResultStore,
    registry: Registry,
    api_state: Arc<ApiState>,
}

impl Daemon {
    /// Open the store from config and wire the production collaborators.
    pub async fn new(config: Config) -> Result<Self> {
        let path = config.resolved_store_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let store = Store::open(&path)
            .await
            .with_context(|| format!("failed to open store at {}", path.display()))?;

        let metrics = Arc::new(MetricsCollector::with_defaults());
        let clock = SystemClock::shared();
        let executor = Arc::new(build_executor(&config, Arc::clone(&metrics), clock.clone()));
        let dispatcher: Option<Arc<dyn IsolationDispatcher>> = if config.execution.isolation_enabled {
            let mut process =
                ProcessDispatcher::new(resolve_worker_binary(&config.execution.worker_binary));
            if let Some(path) = std::env::var_os(CONFIG_ENV) {
                process = process.with_config_path(PathBuf::from(path));
            }
            Some(Arc::new(process))
        } else {
            None
        };

        Ok(Self::from_parts(DaemonParts {
            config,
            store: Arc::new(store),
            clock,
            executor,
            dispatcher,
            metrics,
        }))
    }

    pub fn from_parts(parts: DaemonParts) -> Self {
        let DaemonParts {
            config,
            store,
            clock,
            executor,
            dispatcher,
            metrics,
        } = parts;
        let shutdown = ShutdownSignal::new();
        let events = EventBus::new();

        let coordinator = Coordinator::new(CoordinatorDeps {
            store: Arc::clone(&store),
            executor,
            dispatcher,
            config: config.execution.clone(),
            max_concurrent: config.scheduler.max_concurrent_executions as usize,
            clock: clock.clone(),
            events: events.clone(),
            metrics: Arc::clone(&metrics),
            shutdown: shutdown.clone(),
        });
        let scheduler = Scheduler::new(
            Arc::clone(&store),
            coordinator.clone(),
            clock.clone(),
            Arc::clone(&metrics),
        );
        let health = HealthMonitor::new(
            Arc::clone(&store),
            clock.clone(),
            config.health.clone(),
            events.clone(),
            Arc::clone(&metrics),
        );
        let results = ResultStore::new(Arc::clone(&store));
        let registry = Registry::new(Arc::clone(&store), clock.clone(), events);
        let api_state = Arc::new(ApiState::new(
            registry.clone(),
            coordinator.clone(),
            results.clone(),
            health.clone(),
            Arc::clone(&metrics),
            shutdown.clone(),
        ));

        Self {
            config,
            store,
            clock,
            shutdown,
            metrics,
            coordinator,
            scheduler,
            health,
            results,
            registry,
            api_state,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn api_state(&self) -> &Arc<ApiState> {
        &self.api_state
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Fail executions a crashed predecessor left non-terminal and free
    /// their agents. Must run before the first scheduler tick.
    pub async fn recover(&self) -> Result<(usize, usize)> {
        let (executions, agents) = self
            .store
            .recover_abandoned(self.clock.now(), ABANDONED_REASON)
            .await
            .context("startup recovery failed")?;
        if executions > 0 || agents > 0 {
            warn!(executions, agents, "recovered work abandoned by previous run");
        }
        Ok((executions, agents))
    }

    /// One retention pass as of now.
    pub async fn compact(&self) -> Result<usize> {
        compact_once(&self.results, &self.clock, &self.config.retention, &self.metrics)
            .await
            .context("retention compaction failed")
    }

    /// Spawn the scheduler, health and retention loops. Each stops when
    /// shutdown triggers.
    pub fn spawn_loops(&self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(scheduler_loop(
                self.scheduler.clone(),
                self.config.scheduler.poll_interval(),
                self.shutdown.clone(),
            )),
            tokio::spawn(health_loop(
                self.health.clone(),
                self.config.health.check_interval(),
                self.shutdown.clone(),
            )),
            tokio::spawn(retention_loop(
                self.results.clone(),
                self.clock.clone(),
                self.config.clone(),
                Arc::clone(&self.metrics),
                self.shutdown.clone(),
            )),
        ]
    }

    /// Run until shutdown using a pre-bound listener.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        self.recover().await?;

        let router = api_router(Arc::clone(&self.api_state));
        let bind_addr = listener.local_addr()?;
        let server_shutdown = self.shutdown.clone();
        let api_handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "API server error");
            }
        });
        info!(%bind_addr, "API server listening");

        info!(
            poll_interval_secs = self.config.scheduler.poll_interval_secs,
            health_interval_secs = self.config.health.check_interval_secs,
            max_concurrent = self.coordinator.budget(),
            isolation_enabled = self.config.execution.isolation_enabled,
            "daemon starting loops"
        );
        let loops = self.spawn_loops();

        self.shutdown.cancelled().await;
        info!("shutdown signal received, stopping loops");
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "daemon loop panicked");
            }
        }

        let drain = self.config.execution.cancel_grace() + DRAIN_SLACK;
        let result = self.shutdown.wait_idle(drain).await;
        if result.is_complete() {
            info!("in-flight executions drained");
        } else {
            warn!(
                in_flight = self.shutdown.in_flight(),
                "in-flight executions still running at shutdown"
            );
        }

        if let Err(e) = api_handle.await {
            error!(error = %e, "API server task failed");
        }
        info!("daemon stopped");
        Ok(())
    }

    /// Bind to `daemon.host:daemon.port` and run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = self.config.daemon.bind_addr();
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

/// Returns the number of removed results plus executions.
async fn compact_once(
    results: &ResultStore,
    clock: &SharedClock,
    retention: &RetentionConfig,
    metrics: &MetricsCollector,
) -> Result<usize, StoreError> {
    let report = results.compact(clock.now(), retention).await?;
    let removed = report.total_results() + report.executions;
    metrics.increment_counter_by(RETENTION_REMOVED_TOTAL, &[], removed as u64);
    Ok(removed)
}

fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

async fn scheduler_loop(scheduler: Scheduler, period: Duration, shutdown: ShutdownSignal) {
    // The first tick fires immediately, so agents that are due at startup
    // run without waiting a full poll interval.
    let mut ticker = interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = scheduler.tick().await {
                    error!(error = %e, "scheduler tick failed");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    info!("scheduler loop stopped");
}

async fn health_loop(health: HealthMonitor, period: Duration, shutdown: ShutdownSignal) {
    let mut ticker = interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match health.check_all().await {
                    Ok(report) => info!(
                        evaluated = report.evaluated,
                        unhealthy = report.unhealthy,
                        demoted = report.demoted.len(),
                        "health pass completed"
                    ),
                    Err(e) => error!(error = %e, "health pass failed"),
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    info!("health loop stopped");
}

async fn retention_loop(
    results: ResultStore,
    clock: SharedClock,
    config: Config,
    metrics: Arc<MetricsCollector>,
    shutdown: ShutdownSignal,
) {
    let mut ticker = interval(config.retention.compaction_interval());
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = compact_once(&results, &clock, &config.retention, &metrics).await {
                    error!(error = %e, "retention compaction failed");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    info!("retention loop stopped");
}
