use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use mangagrab::models::{ChapterNumber, ChapterStatus, ProgressEvent};
use mangagrab::traits::ProgressSink;
use std::collections::HashMap;
use std::sync::Mutex;

/// Terminal progress: one bar for the run, one per chapter being downloaded.
pub struct CliProgress {
    multi: MultiProgress,
    overall: ProgressBar,
    chapters: Mutex<HashMap<ChapterNumber, ProgressBar>>,
}

impl CliProgress {
    pub fn new(total_chapters: usize) -> Self {
        let multi = MultiProgress::new();
        let overall = multi.add(ProgressBar::new(total_chapters as u64));
        overall.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{elapsed_precise}] {wide_bar} {pos}/{len} chapters")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        overall.set_message("📚");

        Self {
            multi,
            overall,
            chapters: Mutex::new(HashMap::new()),
        }
    }

    pub fn finish(&self) {
        self.overall.finish_and_clear();
    }

    fn chapter_bar(&self, chapter: ChapterNumber, total: usize) -> ProgressBar {
        let bar = self.multi.add(ProgressBar::new(total as u64));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  {msg:>14} {bar:40} {pos}/{len} images")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message(format!("Chapter {}", chapter));
        bar
    }
}

impl ProgressSink for CliProgress {
    fn on_event(&self, event: &ProgressEvent) {
        let Ok(mut chapters) = self.chapters.lock() else {
            return;
        };
        match event {
            ProgressEvent::ImagesLocated { chapter, total } => {
                let bar = self.chapter_bar(*chapter, *total);
                chapters.insert(*chapter, bar);
            }
            ProgressEvent::ImageFinished { chapter, .. } => {
                if let Some(bar) = chapters.get(chapter) {
                    bar.inc(1);
                }
            }
            ProgressEvent::ChapterFinished(result) => {
                if let Some(bar) = chapters.remove(&result.chapter_number) {
                    bar.finish_and_clear();
                    self.multi.remove(&bar);
                }
                let marker = match result.status {
                    ChapterStatus::Complete => "✅",
                    ChapterStatus::Skipped => "⏭️",
                    ChapterStatus::Partial => "⚠️",
                    ChapterStatus::Failed => "❌",
                };
                let _ = self.multi.println(format!(
                    "{} Chapter {}: {} ({} images)",
                    marker, result.chapter_number, result.status, result.succeeded_images
                ));
                self.overall.inc(1);
            }
            ProgressEvent::StateChanged { .. } => {}
        }
    }
}
