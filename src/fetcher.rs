use crate::config::HttpConfig;
use crate::error::{FetchError, FetchErrorKind, MangaGrabError, Result};
use crate::traits::{Fetched, PageFetcher};
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Global request spacing shared by every clone.
///
/// Each request waits *before* it is issued until at least `delay` has passed
/// since the previous request started. The first request of a session goes
/// out immediately.
#[derive(Clone)]
pub struct Throttle {
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleCancelled;

impl Throttle {
    pub fn new(delay: Duration) -> Self {
        let limiter = Quota::with_period(delay).map(|quota| Arc::new(RateLimiter::direct(quota)));
        Self { limiter }
    }

    pub async fn wait(&self, cancel: &CancellationToken) -> std::result::Result<(), ThrottleCancelled> {
        if cancel.is_cancelled() {
            return Err(ThrottleCancelled);
        }
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(ThrottleCancelled),
            _ = limiter.until_ready() => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    throttle: Throttle,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| MangaGrabError::config(format!("invalid header name '{}': {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| MangaGrabError::config(format!("invalid value for header '{}': {}", key, e)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .map_err(|e| MangaGrabError::config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            throttle: Throttle::new(config.delay()?),
        })
    }
}

#[async_trait::async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, cancel: &CancellationToken) -> std::result::Result<Fetched, FetchError> {
        self.throttle
            .wait(cancel)
            .await
            .map_err(|_| FetchError::cancelled(url.as_str()))?;

        debug!("[FETCHER] GET {}", url);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::cancelled(url.as_str())),
            sent = self.client.get(url.clone()).send() => {
                sent.map_err(|e| FetchError::from_reqwest(url.as_str(), e))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            warn!("[FETCHER] {} answered {}", url, status);
            let mut err = FetchError::new(
                FetchErrorKind::HttpStatus(status.as_u16()),
                url.as_str(),
                status.canonical_reason().unwrap_or("unexpected status"),
            );
            err.retry_after = retry_after;
            return Err(err);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let final_url = response.url().clone();

        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::cancelled(url.as_str())),
            body = response.bytes() => body.map_err(|e| FetchError::from_reqwest(url.as_str(), e))?,
        };

        debug!("[FETCHER] {} -> {} bytes", url, bytes.len());

        Ok(Fetched {
            bytes,
            content_type,
            final_url,
        })
    }
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    // a date in the past means "now"
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Instant;

    fn http_config(delay_secs: f64, timeout_secs: u64) -> HttpConfig {
        HttpConfig {
            timeout_secs,
            connect_timeout_secs: timeout_secs,
            delay_secs,
            user_agent: "mangagrab-test".to_string(),
            headers: Default::default(),
        }
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("7", Utc::now()), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after(" 0 ", Utc::now()), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("soon", Utc::now()), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", now),
            Some(Duration::from_secs(60))
        );
        let later = Utc.with_ymd_and_hms(2015, 10, 21, 8, 0, 0).unwrap();
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT", later),
            Some(Duration::ZERO)
        );
    }

    #[tokio::test]
    async fn test_throttle_spaces_requests_after_the_first() {
        let throttle = Throttle::new(Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..3 {
            throttle.wait(&cancel).await.unwrap();
        }
        // first call is free, the next two wait one period each
        assert!(start.elapsed() >= Duration::from_millis(180));
    }

    #[tokio::test]
    async fn test_throttle_is_shared_between_clones() {
        let throttle = Throttle::new(Duration::from_millis(100));
        let other = throttle.clone();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        throttle.wait(&cancel).await.unwrap();
        other.wait(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_throttle_wait_is_cancellable() {
        let throttle = Throttle::new(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        throttle.wait(&cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let start = Instant::now();
        assert_eq!(throttle.wait(&cancel).await, Err(ThrottleCancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_zero_delay_never_waits() {
        let throttle = Throttle::new(Duration::ZERO);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..50 {
            throttle.wait(&cancel).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_content_type() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/page/1.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body(b"\x89PNG....")
            .create_async()
            .await;

        let fetcher = HttpFetcher::new(&http_config(0.0, 5)).unwrap();
        let url = Url::parse(&format!("{}/page/1.png", server.url())).unwrap();
        let fetched = fetcher.fetch(&url, &CancellationToken::new()).await.unwrap();

        assert_eq!(&fetched.bytes[..], b"\x89PNG....");
        assert_eq!(fetched.content_type.as_deref(), Some("image/png"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_maps_status_and_retry_after() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/busy")
            .with_status(429)
            .with_header("retry-after", "7")
            .create_async()
            .await;

        let fetcher = HttpFetcher::new(&http_config(0.0, 5)).unwrap();
        let cancel = CancellationToken::new();

        let missing = Url::parse(&format!("{}/missing", server.url())).unwrap();
        let err = fetcher.fetch(&missing, &cancel).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::HttpStatus(404));
        assert_eq!(err.retry_after, None);

        let busy = Url::parse(&format!("{}/busy", server.url())).unwrap();
        let err = fetcher.fetch(&busy, &cancel).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::HttpStatus(429));
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_network() {
        // bind then drop to obtain a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let fetcher = HttpFetcher::new(&http_config(0.0, 5)).unwrap();
        let url = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
        let err = fetcher.fetch(&url, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Network);
    }

    #[tokio::test]
    async fn test_fetch_silent_server_times_out() {
        // accepted by the kernel backlog, never answered
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let fetcher = HttpFetcher::new(&http_config(0.0, 1)).unwrap();

        let start = Instant::now();
        let err = fetcher.fetch(&url, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Timeout);
        assert!(start.elapsed() < Duration::from_secs(10));
        drop(listener);
    }

    #[tokio::test]
    async fn test_fetch_honours_pre_cancelled_token() {
        let fetcher = HttpFetcher::new(&http_config(0.0, 5)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let url = Url::parse("http://127.0.0.1:9/never").unwrap();
        let err = fetcher.fetch(&url, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
