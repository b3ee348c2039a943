use crate::error::FetchError;
use crate::models::{ChapterNumber, ProgressEvent};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Body and metadata of a successful GET.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    /// URL after redirects; relative links on the page resolve against it.
    pub final_url: Url,
}

impl Fetched {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Trait for throttled page and image fetchers
#[async_trait::async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch a single URL once, waiting for the shared throttle first.
    async fn fetch(&self, url: &Url, cancel: &CancellationToken) -> Result<Fetched, FetchError>;
}

/// Strategy turning an href or link text into a chapter number.
pub trait ChapterNumberExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Option<ChapterNumber>;
}

/// Receiver for pipeline progress; the pipeline makes no assumption about the UI behind it.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Sink that drops every event.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_event(&self, _event: &ProgressEvent) {}
}
