//! Data-source contract and the built-in sources.
//!
//! A source fetches a bounded list of raw items for a keyword set. Sources
//! report failure through [`SourceFetchError`]; the executor absorbs those
//! per source and never lets one escape as an execution error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

#[cfg(any(test, feature = "test-support"))]
mod fixtures;
#[cfg(any(test, feature = "test-support"))]
pub use fixtures::{GatedSource, StaticSource};

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    pub content: String,
    pub url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl RawItem {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            url: None,
            published_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub keywords: Vec<String>,
    /// Upper bound on items the source should return.
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceFetchError {
    #[error("unknown source `{0}`")]
    UnknownSource(String),
    #[error("source `{name}` unavailable: {message}")]
    Unavailable { name: String, message: String },
    #[error("source `{name}` returned malformed data: {message}")]
    Malformed { name: String, message: String },
    #[error("fetch cancelled")]
    Cancelled,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch at most `request.limit` items. Long fetches should return
    /// [`SourceFetchError::Cancelled`] promptly once `cancel` fires.
    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawItem>, SourceFetchError>;
}

// ---------------------------------------------------------------------------
// SourceCatalog
// ---------------------------------------------------------------------------

/// Named sources available to executors. Names that are `http(s)://` URLs
/// resolve to an [`HttpFeedSource`] when feeds are enabled.
#[derive(Clone, Default)]
pub struct SourceCatalog {
    sources: HashMap<String, Arc<dyn DataSource>>,
    http: Option<reqwest::Client>,
    feed_timeout: Option<Duration>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in synthetic `news` and `trends` sources plus HTTP feeds whose
    /// requests give up after `fetch_timeout`.
    pub fn demo(fetch_timeout: Duration) -> Self {
        Self::new()
            .with_source(Arc::new(DemoSource::new(crate::capabilities::NEWS_SOURCE, 8)))
            .with_source(Arc::new(DemoSource::new(crate::capabilities::TRENDS_SOURCE, 6)))
            .with_http_feeds(fetch_timeout)
    }

    pub fn with_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.sources.insert(source.name().to_string(), source);
        self
    }

    pub fn with_http_feeds(mut self, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        self.http = Some(client);
        self.feed_timeout = Some(timeout);
        self
    }

    /// Request timeout of the HTTP feed client, if feeds are enabled.
    pub fn feed_timeout(&self) -> Option<Duration> {
        self.feed_timeout
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn DataSource>, SourceFetchError> {
        if let Some(source) = self.sources.get(name) {
            return Ok(Arc::clone(source));
        }
        match &self.http {
            Some(client) if name.starts_with("http://") || name.starts_with("https://") => {
                Ok(Arc::new(HttpFeedSource::new(name, client.clone())))
            }
            _ => Err(SourceFetchError::UnknownSource(name.to_string())),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for SourceCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCatalog")
            .field("sources", &self.names())
            .field("feed_timeout", &self.feed_timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// DemoSource
// ---------------------------------------------------------------------------

/// Deterministic synthetic items, one per keyword in rotation.
#[derive(Debug, Clone)]
pub struct DemoSource {
    name: String,
    per_fetch: usize,
}

impl DemoSource {
    pub fn new(name: impl Into<String>, per_fetch: usize) -> Self {
        Self {
            name: name.into(),
            per_fetch,
        }
    }
}

#[async_trait]
impl DataSource for DemoSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawItem>, SourceFetchError> {
        if cancel.is_cancelled() {
            return Err(SourceFetchError::Cancelled);
        }
        let count = self.per_fetch.min(request.limit);
        let items = (0..count)
            .map(|i| {
                let topic = if request.keywords.is_empty() {
                    "general interest"
                } else {
                    request.keywords[i % request.keywords.len()].as_str()
                };
                RawItem::text(format!("[{}] update {} on {}", self.name, i + 1, topic))
            })
            .collect();
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// HttpFeedSource
// ---------------------------------------------------------------------------

/// A JSON feed: `GET <url>?q=<keywords>&limit=<n>` answering either an array
/// of items or `{"items": [...]}`, each item with `content` or `title`.
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedBody {
    Bare(Vec<FeedItem>),
    Wrapped { items: Vec<FeedItem> },
}

impl HttpFeedSource {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }

    fn unavailable(&self, message: impl ToString) -> SourceFetchError {
        SourceFetchError::Unavailable {
            name: self.url.clone(),
            message: message.to_string(),
        }
    }

    async fn get(&self, request: &FetchRequest) -> Result<Vec<RawItem>, SourceFetchError> {
        let resp = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .query(&[
                ("q", request.keywords.join(",")),
                ("limit", request.limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| self.unavailable(e))?;
        if !resp.status().is_success() {
            return Err(self.unavailable(format!("HTTP {}", resp.status())));
        }
        let body = resp
            .json::<FeedBody>()
            .await
            .map_err(|e| SourceFetchError::Malformed {
                name: self.url.clone(),
                message: e.to_string(),
            })?;
        let items = match body {
            FeedBody::Bare(items) | FeedBody::Wrapped { items } => items,
        };
        Ok(items
            .into_iter()
            .filter_map(|item| {
                let content = item.content.or(item.title)?;
                Some(RawItem {
                    content,
                    url: item.url,
                    published_at: item.published_at,
                })
            })
            .take(request.limit)
            .collect())
    }
}

#[async_trait]
impl DataSource for HttpFeedSource {
    fn name(&self) -> &str {
        &self.url
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawItem>, SourceFetchError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SourceFetchError::Cancelled),
            r = self.get(request) => r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(keywords: &[&str], limit: usize) -> FetchRequest {
        FetchRequest {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            limit,
        }
    }

    #[tokio::test]
    async fn demo_source_rotates_keywords_and_respects_limit() {
        let source = DemoSource::new("news", 8);
        let items = source
            .fetch(&request(&["rust", "tokio"], 3), &CancellationToken::new())
            .await
            .expect("fetch");
        assert_eq!(items.len(), 3);
        assert!(items[0].content.contains("rust"));
        assert!(items[1].content.contains("tokio"));
        assert!(items[2].content.contains("rust"));
    }

    #[tokio::test]
    async fn static_source_failure_names_the_source() {
        let err = StaticSource::failing("trends", "503")
            .fetch(&request(&[], 10), &CancellationToken::new())
            .await
            .expect_err("fails");
        assert_eq!(err.to_string(), "source `trends` unavailable: 503");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_honours_cancellation() {
        let source = StaticSource::items("slow", vec![RawItem::text("late")])
            .with_delay(Duration::from_secs(60));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let err = source.fetch(&request(&[], 10), &token).await.expect_err("cancelled");
        assert_eq!(err, SourceFetchError::Cancelled);
    }

    #[tokio::test]
    async fn gated_source_waits_for_release() {
        let source = GatedSource::new("gate");
        let token = CancellationToken::new();
        let pending = tokio::time::timeout(
            Duration::from_millis(20),
            source.fetch(&request(&[], 1), &token),
        )
        .await;
        assert!(pending.is_err());

        source.release(1);
        let items = source.fetch(&request(&[], 1), &token).await.expect("released");
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn catalog_resolves_registered_and_url_sources() {
        let catalog = SourceCatalog::new()
            .with_source(Arc::new(DemoSource::new("news", 1)))
            .with_http_feeds(Duration::from_secs(1));
        assert_eq!(catalog.resolve("news").expect("registered").name(), "news");
        assert_eq!(
            catalog.resolve("https://feeds.example.com/x").expect("url").name(),
            "https://feeds.example.com/x"
        );
        assert!(matches!(
            catalog.resolve("nope"),
            Err(SourceFetchError::UnknownSource(_))
        ));
    }

    #[test]
    fn demo_catalog_uses_the_given_feed_timeout() {
        let catalog = SourceCatalog::demo(Duration::from_secs(90));
        assert_eq!(catalog.feed_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(catalog.names(), vec!["news".to_string(), "trends".to_string()]);
        assert!(SourceCatalog::new().feed_timeout().is_none());
    }

    #[test]
    fn url_sources_need_http_feeds_enabled() {
        let catalog = SourceCatalog::new();
        assert!(catalog.resolve("https://feeds.example.com/x").is_err());
    }

    #[test]
    fn feed_body_accepts_both_shapes() {
        let bare: FeedBody =
            serde_json::from_str(r#"[{"title":"a"},{"content":"b"}]"#).expect("bare");
        assert!(matches!(bare, FeedBody::Bare(ref v) if v.len() == 2));
        let wrapped: FeedBody =
            serde_json::from_str(r#"{"items":[{"content":"c","url":"https://x"}]}"#)
                .expect("wrapped");
        assert!(matches!(wrapped, FeedBody::Wrapped { ref items } if items.len() == 1));
    }
}
