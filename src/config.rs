use crate::error::{MangaGrabError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "MANGAGRAB";
pub const DEFAULT_CONFIG_FILE: &str = "mangagrab.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub http: HttpConfig,
    pub retry: RetryConfig,
    pub images: ImageConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output root; manga directories are created beneath it.
    pub root: PathBuf,
    /// Pack every complete chapter into a `.cbz` next to its directory.
    pub archive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Minimum spacing between the starts of consecutive requests, in seconds.
    pub delay_secs: f64,
    pub user_agent: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub max_retry_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Attributes consulted for an image URL, first non-empty wins.
    pub source_attributes: Vec<String>,
    /// Image URLs containing any of these substrings are ignored.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub skip_existing: bool,
    pub workers: usize,
    pub stale_lock_secs: u64,
}

impl Config {
    /// Layer defaults, the optional TOML file and `MANGAGRAB__*` environment variables.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("images.source_attributes")
                    .with_list_parse_key("images.exclude_patterns"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_delay(self.http.delay_secs)?;
        if self.http.timeout_secs == 0 {
            return Err(MangaGrabError::config("http.timeout_secs must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(MangaGrabError::config("retry.max_attempts must be at least 1"));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(MangaGrabError::config("retry.multiplier must be >= 1.0"));
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return Err(MangaGrabError::config(
                "retry.max_backoff_ms must not be smaller than retry.initial_backoff_ms",
            ));
        }
        if self.images.source_attributes.is_empty() {
            return Err(MangaGrabError::config("images.source_attributes must not be empty"));
        }
        if self.download.workers == 0 {
            return Err(MangaGrabError::config("download.workers must be at least 1"));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> std::result::Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl HttpConfig {
    pub fn delay(&self) -> Result<Duration> {
        validate_delay(self.delay_secs)
    }
}

/// Delays are user input: finite, non-negative seconds.
pub fn validate_delay(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(MangaGrabError::config(format!(
            "request delay must be a non-negative number of seconds, got {}",
            secs
        )));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| {
        MangaGrabError::config(format!("request delay of {} seconds is out of range: {}", secs, e))
    })
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig {
                root: PathBuf::from("./comics"),
                archive: false,
            },
            http: HttpConfig {
                timeout_secs: 30,
                connect_timeout_secs: 10,
                delay_secs: 1.0,
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".to_string(),
                headers: HashMap::new(),
            },
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 1000,
                max_backoff_ms: 30_000,
                multiplier: 2.0,
                max_retry_after_secs: 120,
            },
            images: ImageConfig {
                source_attributes: vec![
                    "data-src".to_string(),
                    "data-lazy-src".to_string(),
                    "data-original".to_string(),
                    "src".to_string(),
                ],
                exclude_patterns: vec![
                    "logo".to_string(),
                    "icon".to_string(),
                    "avatar".to_string(),
                ],
            },
            download: DownloadConfig {
                skip_existing: true,
                workers: 1,
                stale_lock_secs: 3600,
            },
        }
    }
}
