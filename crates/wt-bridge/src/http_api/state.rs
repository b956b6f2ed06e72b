use std::sync::Arc;
use std::time::Instant;

use wt_agents::coordinator::Coordinator;
use wt_agents::health::HealthMonitor;
use wt_agents::registry::Registry;
use wt_agents::results::ResultStore;
use wt_harness::shutdown::ShutdownSignal;
use wt_telemetry::metrics::MetricsCollector;

/// Shared application state for all handlers.
pub struct ApiState {
    pub registry: Registry,
    pub coordinator: Coordinator,
    pub results: ResultStore,
    pub health: HealthMonitor,
    pub metrics: Arc<MetricsCollector>,
    /// Reported by `/api/health` so a draining daemon is visible.
    pub shutdown: ShutdownSignal,
    pub start_time: Instant,
}

impl ApiState {
    pub fn new(
        registry: Registry,
        coordinator: Coordinator,
        results: ResultStore,
        health: HealthMonitor,
        metrics: Arc<MetricsCollector>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            registry,
            coordinator,
            results,
            health,
            metrics,
            shutdown,
            start_time: Instant::now(),
        }
    }
}
