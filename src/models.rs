use crate::error::FetchErrorKind;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Numeric chapter key. Finite and non-negative, totally ordered, so decimal
/// chapters such as `10.5` sort between `10` and `11`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct ChapterNumber(f64);

impl ChapterNumber {
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && value >= 0.0 {
            // -0.0 >= 0.0 holds, normalize it so equal keys hash equally
            Some(Self(value + 0.0))
        } else {
            None
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn is_integral(self) -> bool {
        self.0.fract() == 0.0
    }

    /// Directory label: integral part zero-padded to at least three digits,
    /// fractional part appended verbatim (`7` -> `007`, `10.5` -> `010.5`).
    pub fn dir_label(self) -> String {
        let whole = self.0.trunc() as u64;
        if self.is_integral() {
            format!("{:03}", whole)
        } else {
            let text = self.0.to_string();
            let fraction = text.split_once('.').map(|(_, f)| f).unwrap_or("0");
            format!("{:03}.{}", whole, fraction)
        }
    }
}

impl PartialEq for ChapterNumber {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ChapterNumber {}

impl PartialOrd for ChapterNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChapterNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for ChapterNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for ChapterNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_integral() && self.0 < 1e15 {
            write!(f, "{}", self.0 as u64)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseChapterNumberError(pub String);

impl fmt::Display for ParseChapterNumberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a valid chapter number", self.0)
    }
}

impl std::error::Error for ParseChapterNumberError {}

impl FromStr for ChapterNumber {
    type Err = ParseChapterNumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<f64>()
            .ok()
            .and_then(ChapterNumber::new)
            .ok_or_else(|| ParseChapterNumberError(s.to_string()))
    }
}

impl TryFrom<f64> for ChapterNumber {
    type Error = ParseChapterNumberError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        ChapterNumber::new(value).ok_or_else(|| ParseChapterNumberError(value.to_string()))
    }
}

impl From<ChapterNumber> for f64 {
    fn from(number: ChapterNumber) -> Self {
        number.0
    }
}

/// A chapter discovered on the index page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterRef {
    pub number: ChapterNumber,
    pub source_url: Url,
}

impl ChapterRef {
    pub fn new(number: ChapterNumber, source_url: Url) -> Self {
        Self { number, source_url }
    }
}

/// One page image of a chapter. `index` is 1-based and follows document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRef {
    pub chapter_number: ChapterNumber,
    pub index: usize,
    pub source_url: Url,
}

/// Per-chapter work item, created at dispatch time.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub chapter: ChapterRef,
    pub target_dir: PathBuf,
    pub skip_existing: bool,
    pub delay: Duration,
}

/// Progress of a chapter through the download state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterState {
    Pending,
    Fetching,
    Locating,
    DownloadingImages,
    Complete,
    Partial,
    Skipped,
    Failed,
}

/// Terminal outcome of a chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    Complete,
    Partial,
    Skipped,
    Failed,
}

impl From<ChapterStatus> for ChapterState {
    fn from(status: ChapterStatus) -> Self {
        match status {
            ChapterStatus::Complete => ChapterState::Complete,
            ChapterStatus::Partial => ChapterState::Partial,
            ChapterStatus::Skipped => ChapterState::Skipped,
            ChapterStatus::Failed => ChapterState::Failed,
        }
    }
}

impl fmt::Display for ChapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChapterStatus::Complete => write!(f, "Complete"),
            ChapterStatus::Partial => write!(f, "Partial"),
            ChapterStatus::Skipped => write!(f, "Skipped"),
            ChapterStatus::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "code")]
pub enum FailureKind {
    Network,
    Timeout,
    HttpStatus(u16),
    NoImagesFound,
    Locked,
    Cancelled,
}

impl From<FetchErrorKind> for FailureKind {
    fn from(kind: FetchErrorKind) -> Self {
        match kind {
            FetchErrorKind::Network => FailureKind::Network,
            FetchErrorKind::Timeout => FailureKind::Timeout,
            FetchErrorKind::HttpStatus(code) => FailureKind::HttpStatus(code),
            FetchErrorKind::Cancelled => FailureKind::Cancelled,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Network => write!(f, "network"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::HttpStatus(code) => write!(f, "http {}", code),
            FailureKind::NoImagesFound => write!(f, "no images found"),
            FailureKind::Locked => write!(f, "locked"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageFailure {
    pub index: usize,
    pub failure: Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadResult {
    pub chapter_number: ChapterNumber,
    pub status: ChapterStatus,
    pub succeeded_images: usize,
    pub failed_images: Vec<ImageFailure>,
    /// Chapter-level cause when the chapter failed before or instead of its images.
    pub failure: Option<Failure>,
}

impl DownloadResult {
    pub fn skipped(chapter_number: ChapterNumber, on_disk: usize) -> Self {
        Self {
            chapter_number,
            status: ChapterStatus::Skipped,
            succeeded_images: on_disk,
            failed_images: Vec::new(),
            failure: None,
        }
    }

    pub fn failed(chapter_number: ChapterNumber, failure: Failure) -> Self {
        Self {
            chapter_number,
            status: ChapterStatus::Failed,
            succeeded_images: 0,
            failed_images: Vec::new(),
            failure: Some(failure),
        }
    }

    /// Aggregate per-image outcomes into a terminal status.
    pub fn from_images(
        chapter_number: ChapterNumber,
        succeeded_images: usize,
        failed_images: Vec<ImageFailure>,
    ) -> Self {
        let status = if failed_images.is_empty() {
            ChapterStatus::Complete
        } else if succeeded_images > 0 {
            ChapterStatus::Partial
        } else {
            ChapterStatus::Failed
        };
        Self {
            chapter_number,
            status,
            succeeded_images,
            failed_images,
            failure: None,
        }
    }

    pub fn missing_indices(&self) -> Vec<usize> {
        self.failed_images.iter().map(|f| f.index).collect()
    }

    /// True when the chapter stopped only because the run was cancelled.
    pub fn was_cancelled(&self) -> bool {
        match &self.failure {
            Some(failure) => failure.kind == FailureKind::Cancelled,
            None => {
                !self.failed_images.is_empty()
                    && self
                        .failed_images
                        .iter()
                        .all(|f| f.failure.kind == FailureKind::Cancelled)
            }
        }
    }
}

/// Events emitted to a [`crate::traits::ProgressSink`] while a run progresses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StateChanged {
        chapter: ChapterNumber,
        state: ChapterState,
    },
    ImagesLocated {
        chapter: ChapterNumber,
        total: usize,
    },
    ImageFinished {
        chapter: ChapterNumber,
        index: usize,
        total: usize,
        failure: Option<Failure>,
    },
    ChapterFinished(DownloadResult),
}

/// Outcome of a multi-chapter run, results ordered by chapter number.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub results: Vec<DownloadResult>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn count(&self, status: ChapterStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn total_images(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status != ChapterStatus::Skipped)
            .map(|r| r.succeeded_images)
            .sum()
    }
}
