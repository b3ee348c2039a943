use crate::config::Config;
use crate::error::{MangaGrabError, Result};
use crate::fetcher::HttpFetcher;
use crate::locator::{ContainerSelector, ImageLocator, LocateError};
use crate::models::{
    ChapterNumber, ChapterRef, ChapterState, ChapterStatus, DownloadResult, DownloadTask, Failure,
    FailureKind, ImageFailure, ImageRef, ProgressEvent, RunReport,
};
use crate::retry::RetryPolicy;
use crate::scanner::{extract_chapters, extract_title};
use crate::storage::{infer_extension, write_atomic, ChapterManifest, LockError, StorageLayout};
use crate::traits::{ChapterNumberExtractor, PageFetcher, ProgressSink};
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub skip_existing: bool,
    /// Chapters processed at once; all of them share the fetcher's throttle.
    pub workers: usize,
    pub stale_lock: Duration,
    pub archive: bool,
    /// Request spacing the fetcher was built with, recorded on each task.
    pub delay: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            skip_existing: true,
            workers: 1,
            stale_lock: Duration::from_secs(3600),
            archive: false,
            delay: Duration::ZERO,
        }
    }
}

/// Result of scanning an index page.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub title: String,
    pub index_url: Url,
    pub chapters: Vec<ChapterRef>,
}

/// Drives chapters through fetch -> locate -> download -> persist.
pub struct DownloadManager {
    fetcher: Arc<dyn PageFetcher>,
    locator: ImageLocator,
    storage: StorageLayout,
    retry: RetryPolicy,
    options: DownloadOptions,
}

impl DownloadManager {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        locator: ImageLocator,
        storage: StorageLayout,
        retry: RetryPolicy,
        options: DownloadOptions,
    ) -> Self {
        Self {
            fetcher,
            locator,
            storage,
            retry,
            options,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let fetcher = HttpFetcher::new(&config.http)?;
        let options = DownloadOptions {
            skip_existing: config.download.skip_existing,
            workers: config.download.workers.max(1),
            stale_lock: Duration::from_secs(config.download.stale_lock_secs),
            archive: config.storage.archive,
            delay: config.http.delay()?,
        };
        Ok(Self::new(
            Arc::new(fetcher),
            ImageLocator::from_config(&config.images),
            StorageLayout::new(&config.storage.root),
            RetryPolicy::from(&config.retry),
            options,
        ))
    }

    pub fn storage(&self) -> &StorageLayout {
        &self.storage
    }

    /// Fetch the index page and extract its title and chapters.
    pub async fn discover(
        &self,
        index_url: &Url,
        extractor: &dyn ChapterNumberExtractor,
        cancel: &CancellationToken,
    ) -> Result<Discovery> {
        info!("[MANAGER] Scanning index page: {}", index_url);

        let page = self
            .retry
            .run("index page", cancel, || self.fetcher.fetch(index_url, cancel))
            .await
            .map_err(|e| {
                if e.is_cancelled() {
                    MangaGrabError::Cancelled
                } else {
                    MangaGrabError::Fetch(e)
                }
            })?;

        let html = page.text();
        let chapters = extract_chapters(&html, &page.final_url, extractor);
        let title = extract_title(&html, &page.final_url);

        if chapters.is_empty() {
            warn!("[MANAGER] No chapter links matched on {}", index_url);
        } else {
            info!("[MANAGER] Found {} chapters for '{}'", chapters.len(), title);
        }

        Ok(Discovery {
            title,
            index_url: index_url.clone(),
            chapters,
        })
    }

    pub fn task_for(&self, manga_title: &str, chapter: &ChapterRef) -> DownloadTask {
        DownloadTask {
            chapter: chapter.clone(),
            target_dir: self.storage.chapter_dir(manga_title, chapter.number),
            skip_existing: self.options.skip_existing,
            delay: self.options.delay,
        }
    }

    /// Download the given chapters in reading order.
    ///
    /// Chapter failures are reported in the returned [`RunReport`]; configuration
    /// and filesystem errors abort the run. Cancellation stops the run between
    /// chapters and between images.
    pub async fn download_all(
        &self,
        manga_title: &str,
        chapters: &[ChapterRef],
        container: Option<&ContainerSelector>,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let span = info_span!("run", id = %Uuid::new_v4());
        self.run_chapters(manga_title, chapters, container, sink, cancel)
            .instrument(span)
            .await
    }

    async fn run_chapters(
        &self,
        manga_title: &str,
        chapters: &[ChapterRef],
        container: Option<&ContainerSelector>,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        info!(
            "[MANAGER] Downloading {} chapters of '{}' with {} worker(s)",
            chapters.len(),
            manga_title,
            self.options.workers
        );
        let tasks: Vec<DownloadTask> = chapters.iter().map(|c| self.task_for(manga_title, c)).collect();

        let mut results = if self.options.workers <= 1 {
            let mut results = Vec::with_capacity(tasks.len());
            for task in &tasks {
                if cancel.is_cancelled() {
                    info!("[MANAGER] Run cancelled, {} chapters left untouched", tasks.len() - results.len());
                    break;
                }
                results.push(self.download_chapter(manga_title, task, container, sink, cancel).await?);
            }
            results
        } else {
            stream::iter(tasks.iter())
                .map(|task| async move {
                    if cancel.is_cancelled() {
                        return Ok(None);
                    }
                    self.download_chapter(manga_title, task, container, sink, cancel)
                        .await
                        .map(Some)
                })
                .buffer_unordered(self.options.workers)
                .try_collect::<Vec<Option<DownloadResult>>>()
                .await?
                .into_iter()
                .flatten()
                .collect()
        };

        results.sort_by_key(|r| r.chapter_number);
        let report = RunReport {
            results,
            cancelled: cancel.is_cancelled(),
        };
        info!(
            "[MANAGER] Run finished: {} complete, {} partial, {} skipped, {} failed, {} images",
            report.count(ChapterStatus::Complete),
            report.count(ChapterStatus::Partial),
            report.count(ChapterStatus::Skipped),
            report.count(ChapterStatus::Failed),
            report.total_images()
        );
        Ok(report)
    }

    /// Run one chapter through the state machine.
    pub async fn download_chapter(
        &self,
        manga_title: &str,
        task: &DownloadTask,
        container: Option<&ContainerSelector>,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult> {
        let chapter = task.chapter.number;
        transition(sink, chapter, ChapterState::Pending);

        if cancel.is_cancelled() {
            return Ok(self.finish(
                sink,
                DownloadResult::failed(chapter, Failure::new(FailureKind::Cancelled, "run cancelled")),
            ));
        }

        if task.skip_existing {
            let check = self.storage.completion_check(manga_title, chapter).await?;
            let on_disk = self.storage.image_indices(manga_title, chapter).await?;
            if check.is_satisfied_by(&on_disk) {
                debug!("[MANAGER] chapter {} satisfied by {:?}", chapter, check);
                return Ok(self.finish(sink, DownloadResult::skipped(chapter, on_disk.len())));
            }
        }

        let _lock = match self.storage.lock_chapter(manga_title, chapter, self.options.stale_lock) {
            Ok(lock) => lock,
            Err(LockError::Held(dir)) => {
                let failure = Failure::new(
                    FailureKind::Locked,
                    format!("{} is being written by another run", dir.display()),
                );
                return Ok(self.finish(sink, DownloadResult::failed(chapter, failure)));
            }
            Err(LockError::Io(e)) => return Err(e.into()),
        };

        transition(sink, chapter, ChapterState::Fetching);
        let what = format!("chapter {} page", chapter);
        let page = match self
            .retry
            .run(&what, cancel, || self.fetcher.fetch(&task.chapter.source_url, cancel))
            .await
        {
            Ok(page) => page,
            Err(e) => {
                error!("[MANAGER] chapter {}: page fetch failed: {}", chapter, e);
                let failure = Failure::new(e.kind.into(), e.to_string());
                return Ok(self.finish(sink, DownloadResult::failed(chapter, failure)));
            }
        };

        transition(sink, chapter, ChapterState::Locating);
        let images = match self.locator.locate(&page.text(), &page.final_url, chapter, container) {
            Ok(images) => images,
            Err(LocateError::SelectorNotMatched(selector)) => {
                transition(sink, chapter, ChapterState::Failed);
                return Err(MangaGrabError::SelectorNotMatched {
                    chapter: chapter.to_string(),
                    selector,
                });
            }
        };
        if images.is_empty() {
            let failure = Failure::new(
                FailureKind::NoImagesFound,
                format!("no images located on {}", page.final_url),
            );
            return Ok(self.finish(sink, DownloadResult::failed(chapter, failure)));
        }
        sink.on_event(&ProgressEvent::ImagesLocated {
            chapter,
            total: images.len(),
        });

        transition(sink, chapter, ChapterState::DownloadingImages);
        let mut on_disk: HashMap<usize, PathBuf> = self
            .storage
            .chapter_images(manga_title, chapter)
            .await?
            .into_iter()
            .collect();

        let total = images.len();
        let mut succeeded = 0;
        let mut failed = Vec::new();
        for image in &images {
            let existing = on_disk.remove(&image.index);
            let outcome = match existing {
                Some(path) if task.skip_existing => {
                    debug!("[MANAGER] keeping {:?}", path);
                    Ok(path)
                }
                _ if cancel.is_cancelled() => Err(Failure::new(
                    FailureKind::Cancelled,
                    "run cancelled before this image",
                )),
                existing => self.download_image(manga_title, image, existing, cancel).await?,
            };

            let failure = match outcome {
                Ok(_) => {
                    succeeded += 1;
                    None
                }
                Err(failure) => {
                    warn!(
                        "[MANAGER] chapter {} image {}: {} ({})",
                        chapter, image.index, failure.kind, failure.message
                    );
                    failed.push(ImageFailure {
                        index: image.index,
                        failure: failure.clone(),
                    });
                    Some(failure)
                }
            };
            sink.on_event(&ProgressEvent::ImageFinished {
                chapter,
                index: image.index,
                total,
                failure,
            });
        }

        let result = DownloadResult::from_images(chapter, succeeded, failed);
        let manifest = ChapterManifest {
            chapter,
            source_url: task.chapter.source_url.to_string(),
            expected_images: total,
            missing: result.missing_indices(),
            status: result.status,
            updated_at: Utc::now(),
        };
        self.storage.write_manifest(manga_title, &manifest).await?;

        if result.status == ChapterStatus::Complete && self.options.archive {
            self.storage.archive_chapter(manga_title, chapter).await?;
        }

        Ok(self.finish(sink, result))
    }

    /// Fetch and persist one image. The outer error is fatal for the run,
    /// the inner one is this image's failure.
    async fn download_image(
        &self,
        manga_title: &str,
        image: &ImageRef,
        existing: Option<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<PathBuf, Failure>> {
        let what = format!("chapter {} image {}", image.chapter_number, image.index);
        let fetched = match self
            .retry
            .run(&what, cancel, || self.fetcher.fetch(&image.source_url, cancel))
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => return Ok(Err(Failure::new(e.kind.into(), e.to_string()))),
        };

        let extension = infer_extension(fetched.content_type.as_deref(), &image.source_url, &fetched.bytes);
        let path = self
            .storage
            .path_for(manga_title, image.chapter_number, image.index, &extension);
        write_atomic(path.clone(), fetched.bytes).await?;

        // an earlier run may have stored this page under another extension
        if let Some(stale) = existing.filter(|p| *p != path) {
            tokio::fs::remove_file(&stale).await?;
        }

        debug!("[MANAGER] saved {:?}", path);
        Ok(Ok(path))
    }

    fn finish(&self, sink: &dyn ProgressSink, result: DownloadResult) -> DownloadResult {
        match result.status {
            _ if result.was_cancelled() => info!(
                "[MANAGER] chapter {} stopped by cancellation, missing {:?}",
                result.chapter_number,
                result.missing_indices()
            ),
            ChapterStatus::Complete => info!(
                "[MANAGER] chapter {} complete ({} images)",
                result.chapter_number, result.succeeded_images
            ),
            ChapterStatus::Skipped => info!(
                "[MANAGER] chapter {} already on disk, skipped",
                result.chapter_number
            ),
            ChapterStatus::Partial => warn!(
                "[MANAGER] chapter {} partial: {} ok, missing {:?}",
                result.chapter_number,
                result.succeeded_images,
                result.missing_indices()
            ),
            ChapterStatus::Failed => error!(
                "[MANAGER] chapter {} failed: {}",
                result.chapter_number,
                result
                    .failure
                    .as_ref()
                    .map(|f| format!("{} ({})", f.kind, f.message))
                    .unwrap_or_else(|| format!("all images failed {:?}", result.missing_indices()))
            ),
        }
        transition(sink, result.chapter_number, result.status.into());
        sink.on_event(&ProgressEvent::ChapterFinished(result.clone()));
        result
    }
}

fn transition(sink: &dyn ProgressSink, chapter: ChapterNumber, state: ChapterState) {
    debug!("[MANAGER] chapter {} -> {:?}", chapter, state);
    sink.on_event(&ProgressEvent::StateChanged { chapter, state });
}
