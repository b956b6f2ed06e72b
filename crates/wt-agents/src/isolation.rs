//! Isolated execution dispatch.
//!
//! The coordinator contracts only on "submit a job, observe the terminal
//! record by id". Whether the unit behind a [`WorkerHandle`] is a child
//! process or a task in this process is the dispatcher's business.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wt_core::config::CONFIG_ENV;

use crate::worker::WorkerRuntime;

/// Environment variables understood by `watchtower-worker`.
pub const AGENT_ID_ENV: &str = "AGENT_ID";
pub const TENANT_ID_ENV: &str = "TENANT_ID";
pub const EXECUTION_ID_ENV: &str = "EXECUTION_ID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedJob {
    pub agent_id: Uuid,
    pub tenant_id: Option<String>,
    pub execution_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to spawn worker `{binary}`: {message}")]
    Spawn { binary: String, message: String },
}

/// A running isolated unit.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Best-effort hard stop.
    async fn terminate(&mut self);

    /// Resolves once the unit has exited, whatever it managed to write.
    async fn exited(&mut self);
}

#[async_trait]
pub trait IsolationDispatcher: Send + Sync {
    async fn dispatch(&self, job: &IsolatedJob) -> Result<Box<dyn WorkerHandle>, DispatchError>;
}

// ---------------------------------------------------------------------------
// ProcessDispatcher
// ---------------------------------------------------------------------------

/// Spawns the worker binary with the job in its environment.
#[derive(Debug, Clone)]
pub struct ProcessDispatcher {
    binary: PathBuf,
    config_path: Option<PathBuf>,
}

impl ProcessDispatcher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            config_path: None,
        }
    }

    /// Forward the daemon's config file so the worker opens the same store.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    fn command(&self, job: &IsolatedJob) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.env(AGENT_ID_ENV, job.agent_id.to_string())
            .env(EXECUTION_ID_ENV, job.execution_id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match &job.tenant_id {
            Some(tenant) => cmd.env(TENANT_ID_ENV, tenant),
            None => cmd.env_remove(TENANT_ID_ENV),
        };
        if let Some(path) = &self.config_path {
            cmd.env(CONFIG_ENV, path);
        }
        cmd
    }
}

#[async_trait]
impl IsolationDispatcher for ProcessDispatcher {
    async fn dispatch(&self, job: &IsolatedJob) -> Result<Box<dyn WorkerHandle>, DispatchError> {
        let child = self.command(job).spawn().map_err(|e| DispatchError::Spawn {
            binary: self.binary.display().to_string(),
            message: e.to_string(),
        })?;
        info!(
            execution_id = %job.execution_id,
            pid = child.id().unwrap_or_default(),
            "isolated worker process spawned"
        );
        Ok(Box::new(ProcessHandle { child }))
    }
}

struct ProcessHandle {
    child: Child,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    async fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "worker process already gone");
            return;
        }
        let _ = self.child.wait().await;
        warn!("isolated worker process terminated");
    }

    async fn exited(&mut self) {
        match self.child.wait().await {
            Ok(status) => debug!(%status, "isolated worker process exited"),
            Err(e) => warn!(error = %e, "waiting on worker process failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// LocalDispatcher
// ---------------------------------------------------------------------------

/// Runs the worker routine on a tokio task in this process.
#[derive(Clone)]
pub struct LocalDispatcher {
    worker: Arc<WorkerRuntime>,
    stop_grace: Duration,
}

impl LocalDispatcher {
    pub fn new(worker: Arc<WorkerRuntime>) -> Self {
        Self {
            worker,
            stop_grace: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl IsolationDispatcher for LocalDispatcher {
    async fn dispatch(&self, job: &IsolatedJob) -> Result<Box<dyn WorkerHandle>, DispatchError> {
        let worker = Arc::clone(&self.worker);
        let token = CancellationToken::new();
        let task_token = token.clone();
        let job = job.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = worker.run_execution(&job, &task_token).await {
                warn!(execution_id = %job.execution_id, error = %e, "local worker failed");
            }
        });
        Ok(Box::new(TaskHandle {
            task,
            token,
            stop_grace: self.stop_grace,
            done: false,
        }))
    }
}

struct TaskHandle {
    task: JoinHandle<()>,
    token: CancellationToken,
    stop_grace: Duration,
    done: bool,
}

#[async_trait]
impl WorkerHandle for TaskHandle {
    async fn terminate(&mut self) {
        if self.done {
            return;
        }
        self.token.cancel();
        if tokio::time::timeout(self.stop_grace, &mut self.task).await.is_err() {
            self.task.abort();
        }
        self.done = true;
    }

    async fn exited(&mut self) {
        if !self.done {
            let _ = (&mut self.task).await;
            self.done = true;
        }
    }
}
