use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mangagrab::config::{validate_delay, Config, DEFAULT_CONFIG_FILE};
use mangagrab::library::Library;
use mangagrab::locator::ContainerSelector;
use mangagrab::manager::DownloadManager;
use mangagrab::models::{ChapterStatus, RunReport};
use mangagrab::scanner::{parse_index_url, RegexExtractor};
use mangagrab::selection::ChapterSelection;
use mangagrab::storage::StorageLayout;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod progress;

use progress::CliProgress;

#[derive(Parser)]
#[command(name = "mangagrab")]
#[command(about = "Discover manga chapters with a regex and download their pages")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// List the chapters found on an index page
    Chapters {
        /// Manga index page URL
        url: String,
        /// Pattern whose `number` group (or first group) is the chapter number
        #[arg(short, long)]
        regex: String,
    },
    /// Download chapters found on an index page
    Download {
        /// Manga index page URL
        url: String,
        /// Pattern whose `number` group (or first group) is the chapter number
        #[arg(short, long)]
        regex: String,
        /// CSS selector of the element holding the page images
        #[arg(short, long)]
        selector: Option<String>,
        /// Seconds between consecutive requests
        #[arg(short, long)]
        delay: Option<f64>,
        /// Skip chapters and images already on disk
        #[arg(long, conflicts_with = "redownload")]
        skip_existing: bool,
        /// Fetch everything again, replacing files on disk
        #[arg(long)]
        redownload: bool,
        /// Chapters to fetch, e.g. `1,3,5-10`
        #[arg(long, conflicts_with = "all")]
        chapters: Option<String>,
        /// Fetch every discovered chapter
        #[arg(long)]
        all: bool,
        /// Directory name to use instead of the scraped title
        #[arg(long)]
        title: Option<String>,
        /// Chapters downloaded at once
        #[arg(short, long)]
        workers: Option<usize>,
        /// Pack complete chapters into CBZ archives
        #[arg(long)]
        archive: bool,
    },
    /// Show what has been downloaded
    List {
        /// Manga directory to list chapters of
        title: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Init { force } => {
            init_config(&cli.config, force)?;
        }
        Commands::Chapters { url, regex } => {
            let config = Config::load(&cli.config)?;
            run_chapters(&config, &url, &regex).await?;
        }
        Commands::Download {
            url,
            regex,
            selector,
            delay,
            skip_existing,
            redownload,
            chapters,
            all,
            title,
            workers,
            archive,
        } => {
            let mut config = Config::load(&cli.config)?;
            if let Some(delay) = delay {
                validate_delay(delay)?;
                config.http.delay_secs = delay;
            }
            if skip_existing {
                config.download.skip_existing = true;
            }
            if redownload {
                config.download.skip_existing = false;
            }
            if let Some(workers) = workers {
                config.download.workers = workers;
            }
            if archive {
                config.storage.archive = true;
            }
            config.validate()?;

            let selection = match chapters {
                Some(list) if !all => list.parse::<ChapterSelection>()?,
                _ => ChapterSelection::All,
            };

            let report = run_download(&config, &url, &regex, selector.as_deref(), &selection, title).await?;
            print_summary(&report);
            let failed = report
                .results
                .iter()
                .any(|r| r.status == ChapterStatus::Failed && !r.was_cancelled());
            if failed {
                std::process::exit(1);
            }
        }
        Commands::List { title } => {
            let config = Config::load(&cli.config)?;
            show_library(&config, title.as_deref()).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mangagrab={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();

    Ok(())
}

fn init_config(path: &str, force: bool) -> Result<()> {
    if Path::new(path).exists() && !force {
        bail!("{} already exists, pass --force to overwrite it", path);
    }
    let contents = Config::default().to_toml().context("Failed to render default configuration")?;
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path))?;
    info!("Wrote default configuration to {}", path);
    Ok(())
}

/// Cancellation token fired by Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the current file and stopping...");
            token.cancel();
        }
    });
    cancel
}

async fn run_chapters(config: &Config, url: &str, regex: &str) -> Result<()> {
    let index_url = parse_index_url(url)?;
    let extractor = RegexExtractor::new(regex)?;
    let manager = DownloadManager::from_config(config)?;

    let discovery = manager
        .discover(&index_url, &extractor, &cancel_on_ctrl_c())
        .await?;

    println!("📚 {} ({} chapters)", discovery.title, discovery.chapters.len());
    println!("{:<10} {}", "Chapter", "URL");
    println!("{}", "-".repeat(60));
    for chapter in &discovery.chapters {
        println!("{:<10} {}", chapter.number.to_string(), chapter.source_url);
    }
    Ok(())
}

async fn run_download(
    config: &Config,
    url: &str,
    regex: &str,
    selector: Option<&str>,
    selection: &ChapterSelection,
    title: Option<String>,
) -> Result<RunReport> {
    let index_url = parse_index_url(url)?;
    let extractor = RegexExtractor::new(regex)?;
    let container = selector.map(ContainerSelector::parse).transpose()?;
    let manager = DownloadManager::from_config(config)?;
    let cancel = cancel_on_ctrl_c();

    let discovery = manager.discover(&index_url, &extractor, &cancel).await?;
    let title = title.unwrap_or(discovery.title);
    let chapters = selection.apply(&discovery.chapters);
    if chapters.is_empty() {
        warn!("No chapters to download for '{}'", title);
        return Ok(RunReport::default());
    }

    info!(
        "Downloading {} of {} chapters of '{}' into {:?}",
        chapters.len(),
        discovery.chapters.len(),
        title,
        manager.storage().manga_dir(&title)
    );

    let progress = CliProgress::new(chapters.len());
    let report = manager
        .download_all(&title, &chapters, container.as_ref(), &progress, &cancel)
        .await;
    progress.finish();
    Ok(report?)
}

fn print_summary(report: &RunReport) {
    println!();
    println!("📊 Run summary");
    println!("{}", "-".repeat(40));
    println!("{:<12} {}", "Complete", report.count(ChapterStatus::Complete));
    println!("{:<12} {}", "Partial", report.count(ChapterStatus::Partial));
    println!("{:<12} {}", "Skipped", report.count(ChapterStatus::Skipped));
    println!("{:<12} {}", "Failed", report.count(ChapterStatus::Failed));
    println!("{:<12} {}", "Images", report.total_images());

    for result in &report.results {
        match result.status {
            _ if result.was_cancelled() => println!(
                "🛑 Chapter {} was interrupted, missing images {:?}",
                result.chapter_number,
                result.missing_indices()
            ),
            ChapterStatus::Partial => println!(
                "⚠️  Chapter {} is missing images {:?}",
                result.chapter_number,
                result.missing_indices()
            ),
            ChapterStatus::Failed => {
                let reason = result
                    .failure
                    .as_ref()
                    .map(|f| format!("{}: {}", f.kind, f.message))
                    .unwrap_or_else(|| "every image failed".to_string());
                println!("❌ Chapter {} failed ({})", result.chapter_number, reason);
            }
            _ => {}
        }
    }

    if report.cancelled {
        println!("🛑 Run was cancelled; run the same command again to resume.");
    }
}

async fn show_library(config: &Config, title: Option<&str>) -> Result<()> {
    let library = Library::new(StorageLayout::new(&config.storage.root));

    match title {
        None => {
            let manga = library.list_manga().await?;
            if manga.is_empty() {
                println!("Nothing downloaded under {:?} yet", config.storage.root);
                return Ok(());
            }
            println!("{:<40} {:<10}", "Manga", "Chapters");
            println!("{}", "-".repeat(50));
            for name in manga {
                let chapters = library.list_chapters(&name).await?;
                println!("{:<40} {:<10}", name, chapters.len());
            }
        }
        Some(title) => {
            let chapters = library.list_chapters(title).await?;
            if chapters.is_empty() {
                println!("No chapters of '{}' under {:?}", title, config.storage.root);
                return Ok(());
            }
            println!("{:<10} {:<8} {}", "Chapter", "Images", "Path");
            println!("{}", "-".repeat(60));
            for chapter in chapters {
                println!(
                    "{:<10} {:<8} {}",
                    chapter.number.to_string(),
                    chapter.images,
                    chapter.path.display()
                );
            }
        }
    }
    Ok(())
}
