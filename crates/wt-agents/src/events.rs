use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;
use wt_core::types::{AgentStatus, ExecutionStatus};

/// Lifecycle notifications published by the coordinator, worker, registry
/// and health monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    ExecutionStarted {
        execution_id: Uuid,
        agent_id: Uuid,
        isolated: bool,
    },
    ExecutionFinished {
        execution_id: Uuid,
        agent_id: Uuid,
        status: ExecutionStatus,
    },
    AgentStatusChanged {
        agent_id: Uuid,
        from: AgentStatus,
        to: AgentStatus,
    },
}

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`EventBus::subscribe`] creates a receiver that gets every
/// event published after the subscription. Clones share subscribers.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<WatchEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> flume::Receiver<WatchEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner.lock().push(tx);
        rx
    }

    /// Publish to all current subscribers, pruning disconnected ones.
    pub fn publish(&self, event: WatchEvent) {
        self.inner
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().len()
    }
}
