use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal: cooperative shutdown coordination
// ---------------------------------------------------------------------------

/// Cancellation-token based shutdown coordinator with in-flight tracking.
///
/// Loops `select!` on [`ShutdownSignal::cancelled`] alongside their tick.
/// Executions hold an [`InFlightGuard`] for as long as they run; after
/// triggering, the daemon calls [`ShutdownSignal::wait_idle`] so running
/// executions can finalize before the process exits.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// tokio::select! {
///     _ = shutdown.cancelled() => { /* graceful cleanup */ }
///     _ = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
    /// Set once so repeated triggers only log a warning.
    shutting_down: Arc<AtomicBool>,
    in_flight: Arc<watch::Sender<usize>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            token: CancellationToken::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(in_flight),
        }
    }

    /// A child token: cancelled when shutdown triggers, but cancelling it
    /// does not shut anything else down.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Trigger shutdown for all listeners.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!(in_flight = self.in_flight(), "shutdown signal triggered");
            self.token.cancel();
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Register one in-flight unit of work. Dropping the guard releases it.
    pub fn track(&self) -> InFlightGuard {
        self.in_flight.send_modify(|n| *n += 1);
        InFlightGuard {
            counter: Arc::clone(&self.in_flight),
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Wait until no work is in flight, or `timeout` elapses.
    pub async fn wait_idle(&self, timeout: Duration) -> DrainResult {
        let mut rx = self.in_flight.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let current = *rx.borrow_and_update();
            if current == 0 {
                info!("all in-flight work drained");
                return DrainResult::Complete;
            }

            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // The sender lives in `self`; closure cannot happen while we hold it.
                Ok(Err(_)) => return DrainResult::Complete,
                Err(_) => {
                    let remaining = *rx.borrow();
                    warn!(remaining, "drain timeout, executions still in flight");
                    return DrainResult::Timeout { remaining };
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DrainResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    /// Timeout expired with `remaining` units still running.
    Timeout { remaining: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete)
    }
}

// ---------------------------------------------------------------------------
// InFlightGuard: RAII guard that releases its slot on drop
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.send_modify(|n| *n = n.saturating_sub(1));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
