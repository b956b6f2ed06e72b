use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wt_core::config::SourcesConfig;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur when calling a data source through its breaker.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    /// The breaker is open; the source was not contacted.
    #[error("circuit for `{0}` is open")]
    Open(String),

    /// The call did not finish within the configured call timeout. Counts
    /// as a failure.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The source itself failed. Counts as a failure.
    #[error("{0}")]
    Inner(String),

    /// The caller gave up. Does not count against the source.
    #[error("call cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation – all calls pass through.
    Closed,
    /// Too many failures – calls are rejected immediately.
    Open,
    /// Testing recovery – a probe call is allowed through.
    HalfOpen,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open before closing.
    pub success_threshold: u32,
    /// How long the circuit stays open before transitioning to half-open.
    pub reset_timeout: Duration,
    /// Maximum duration for an individual call.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(300),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&SourcesConfig> for CircuitBreakerConfig {
    fn from(cfg: &SourcesConfig) -> Self {
        Self {
            failure_threshold: cfg.breaker_failure_threshold,
            reset_timeout: cfg.breaker_reset(),
            call_timeout: cfg.fetch_timeout(),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct InnerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<InnerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(InnerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Execute `f` through the breaker, bounded by the call timeout and the
    /// caller's cancellation token.
    ///
    /// If the circuit is **Open** and the reset timeout has not elapsed the
    /// call is rejected immediately. Once it has elapsed the circuit moves to
    /// **HalfOpen** and the call goes through as a probe.
    pub async fn call<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.preflight()?;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(CircuitBreakerError::Cancelled),
            r = tokio::time::timeout(self.config.call_timeout, f()) => r,
        };

        match outcome {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(e.to_string()))
            }
            Err(_elapsed) => {
                self.record_failure();
                Err(CircuitBreakerError::Timeout(self.config.call_timeout))
            }
        }
    }

    fn preflight(&self) -> Result<(), CircuitBreakerError> {
        let mut guard = self.inner.lock();
        if guard.state != CircuitState::Open {
            return Ok(());
        }
        match guard.last_failure_time {
            Some(last) if last.elapsed() >= self.config.reset_timeout => {
                info!(source = %self.name, "circuit breaker transitioning Open -> HalfOpen");
                guard.state = CircuitState::HalfOpen;
                guard.success_count = 0;
                Ok(())
            }
            _ => Err(CircuitBreakerError::Open(self.name.to_string())),
        }
    }

    fn record_success(&self) {
        let mut guard = self.inner.lock();
        match guard.state {
            CircuitState::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count >= self.config.success_threshold {
                    info!(source = %self.name, "circuit breaker transitioning HalfOpen -> Closed");
                    guard.state = CircuitState::Closed;
                    guard.failure_count = 0;
                    guard.success_count = 0;
                }
            }
            CircuitState::Closed => guard.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut guard = self.inner.lock();
        guard.failure_count += 1;
        guard.last_failure_time = Some(Instant::now());

        match guard.state {
            CircuitState::Closed if guard.failure_count >= self.config.failure_threshold => {
                warn!(
                    source = %self.name,
                    failures = guard.failure_count,
                    "circuit breaker transitioning Closed -> Open"
                );
                guard.state = CircuitState::Open;
            }
            CircuitState::HalfOpen => {
                warn!(source = %self.name, "circuit breaker transitioning HalfOpen -> Open (probe failed)");
                guard.state = CircuitState::Open;
                guard.success_count = 0;
            }
            _ => {}
        }
    }

    /// Manually reset the circuit breaker to the **Closed** state.
    pub fn reset(&self) {
        let mut guard = self.inner.lock();
        guard.state = CircuitState::Closed;
        guard.failure_count = 0;
        guard.success_count = 0;
        guard.last_failure_time = None;
    }
}

// ---------------------------------------------------------------------------
// BreakerSet: one breaker per data source
// ---------------------------------------------------------------------------

/// Lazily creates one [`CircuitBreaker`] per source name. Clones share the
/// same breakers, so every executor sees the same health for a source.
#[derive(Debug, Clone)]
pub struct BreakerSet {
    config: CircuitBreakerConfig,
    breakers: Arc<DashMap<String, CircuitBreaker>>,
}

impl BreakerSet {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, source: &str) -> CircuitBreaker {
        if let Some(existing) = self.breakers.get(source) {
            return existing.clone();
        }
        self.breakers
            .entry(source.to_string())
            .or_insert_with(|| CircuitBreaker::new(source, self.config.clone()))
            .clone()
    }

    /// `(source, state)` for every breaker created so far, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let mut out: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl Default for BreakerSet {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
