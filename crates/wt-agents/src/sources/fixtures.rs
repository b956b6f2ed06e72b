//! Scripted sources for tests in this and downstream crates. Built only
//! with `cfg(test)` or the `test-support` feature.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{DataSource, FetchRequest, RawItem, SourceFetchError};

// ---------------------------------------------------------------------------
// StaticSource
// ---------------------------------------------------------------------------

/// Fixed-response source, optionally slow. Useful for wiring a catalog
/// without network access.
#[derive(Debug, Clone)]
pub struct StaticSource {
    name: String,
    response: Result<Vec<RawItem>, String>,
    delay: Option<Duration>,
}

impl StaticSource {
    pub fn items(name: impl Into<String>, items: Vec<RawItem>) -> Self {
        Self {
            name: name.into(),
            response: Ok(items),
            delay: None,
        }
    }

    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            response: Err(message.into()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl DataSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawItem>, SourceFetchError> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SourceFetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        match &self.response {
            Ok(items) => Ok(items.iter().take(request.limit).cloned().collect()),
            Err(message) => Err(SourceFetchError::Unavailable {
                name: self.name.clone(),
                message: message.clone(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// GatedSource
// ---------------------------------------------------------------------------

/// Answers one fetch per [`GatedSource::release`]. Lets callers hold an
/// execution mid-run deterministically, without timers.
#[derive(Debug, Clone)]
pub struct GatedSource {
    name: String,
    gate: Arc<tokio::sync::Semaphore>,
}

impl GatedSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gate: Arc::new(tokio::sync::Semaphore::new(0)),
        }
    }

    pub fn release(&self, fetches: usize) {
        self.gate.add_permits(fetches);
    }
}

#[async_trait]
impl DataSource for GatedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        _request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawItem>, SourceFetchError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SourceFetchError::Cancelled),
            permit = self.gate.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(vec![RawItem::text(format!("[{}] released", self.name))])
                }
                Err(_) => Err(SourceFetchError::Unavailable {
                    name: self.name.clone(),
                    message: "gate closed".to_string(),
                }),
            },
        }
    }
}
