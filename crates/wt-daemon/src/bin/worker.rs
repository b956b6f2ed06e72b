//! watchtower isolated worker.
//!
//! Started by the daemon with `AGENT_ID`, `TENANT_ID` and `EXECUTION_ID` in
//! its environment; runs that one execution to a terminal record in the
//! shared store and exits. Without `EXECUTION_ID` it claims the agent itself
//! and runs a standalone forced execution.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;
use wt_agents::events::EventBus;
use wt_agents::isolation::{IsolatedJob, AGENT_ID_ENV, EXECUTION_ID_ENV, TENANT_ID_ENV};
use wt_agents::worker::WorkerRuntime;
use wt_core::clock::SystemClock;
use wt_core::config::Config;
use wt_core::store::Store;
use wt_daemon::daemon::build_executor;
use wt_daemon::signals;
use wt_telemetry::metrics::MetricsCollector;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn env_uuid(key: &str) -> Result<Option<Uuid>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{key} is not a valid id: {raw}")),
        _ => Ok(None),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            let message = format!("{e:#}");
            error!(error = %message, "worker failed");
            eprintln!("watchtower-worker: {message}");
            ExitCode::from(2)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let config = Config::load().context("failed to load configuration")?;
    wt_telemetry::logging::init_logging_for(
        "watchtower-worker",
        &config.general.log_level,
        config.general.json_logs(),
    );

    let agent_id = env_uuid(AGENT_ID_ENV)?.with_context(|| format!("{AGENT_ID_ENV} is required"))?;
    let tenant_id = std::env::var(TENANT_ID_ENV)
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    let execution_id = env_uuid(EXECUTION_ID_ENV)?;

    let path = config.resolved_store_path();
    let store = Store::open(&path)
        .await
        .with_context(|| format!("failed to open store at {}", path.display()))?;
    let clock = SystemClock::shared();
    let executor = build_executor(&config, Arc::new(MetricsCollector::new()), clock.clone());
    let runtime = WorkerRuntime::new(
        Arc::new(store),
        Arc::new(executor),
        clock,
        EventBus::new(),
        config.execution.clone(),
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        signals::termination().await;
        on_signal.cancel();
    });

    let outcome = match execution_id {
        Some(execution_id) => {
            let job = IsolatedJob {
                agent_id,
                tenant_id,
                execution_id,
            };
            runtime
                .run_execution(&job, &cancel)
                .await
                .map(|status| (execution_id, status))
        }
        None => runtime
            .run_standalone(agent_id, tenant_id, &cancel)
            .await
            .map(|record| (record.id, record.status)),
    };

    match outcome {
        Ok((execution_id, status)) => {
            info!(%agent_id, %execution_id, %status, "worker finished");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(%agent_id, error = %e, "worker could not run the execution");
            Ok(ExitCode::FAILURE)
        }
    }
}
