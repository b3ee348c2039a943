use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MangaGrabError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Invalid chapter pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    #[error("Selector '{selector}' matched nothing on chapter {chapter}")]
    SelectorNotMatched { chapter: String, selector: String },

    #[error("Failed to fetch index page: {0}")]
    Fetch(#[from] FetchError),

    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("ZIP compression error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Operation cancelled")]
    Cancelled,
}

impl MangaGrabError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// True for errors that stem from user input rather than the remote site or disk.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Settings(_)
                | Self::Pattern(_)
                | Self::Selector { .. }
                | Self::SelectorNotMatched { .. }
                | Self::Url(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MangaGrabError>;

/// Classification of a single failed HTTP exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Connection refused, DNS failure, broken body stream.
    Network,
    /// The request did not finish within the configured timeout.
    Timeout,
    /// The server answered with a non-2xx status.
    HttpStatus(u16),
    /// The cancellation token fired while waiting or receiving.
    Cancelled,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Network => write!(f, "network error"),
            FetchErrorKind::Timeout => write!(f, "timed out"),
            FetchErrorKind::HttpStatus(code) => write!(f, "HTTP {}", code),
            FetchErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("{kind} for {url}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub message: String,
    /// Server-provided `Retry-After` hint, when present on a 429/503 answer.
    pub retry_after: Option<Duration>,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Cancelled, url, "request cancelled")
    }

    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FetchErrorKind::Timeout
        } else if let Some(status) = err.status() {
            FetchErrorKind::HttpStatus(status.as_u16())
        } else {
            FetchErrorKind::Network
        };
        Self::new(kind, url, err.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FetchErrorKind::Cancelled
    }
}
