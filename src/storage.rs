use crate::error::{MangaGrabError, Result};
use crate::models::{ChapterNumber, ChapterStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use zip::write::FileOptions;

pub const MANIFEST_FILE: &str = ".chapter.json";
pub const LOCK_FILE: &str = ".lock";
pub const DEFAULT_EXTENSION: &str = "jpg";
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "avif", "bmp"];

/// How a chapter directory is judged complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCheck {
    /// A manifest recorded how many images the chapter has; every index
    /// `1..=n` must be on disk.
    ExactMatch(usize),
    /// No record: any image on disk is taken as complete. An approximation.
    HeuristicNonEmpty,
}

impl CompletionCheck {
    pub fn from_expected(expected: Option<usize>) -> Self {
        match expected {
            Some(count) => CompletionCheck::ExactMatch(count),
            None => CompletionCheck::HeuristicNonEmpty,
        }
    }

    /// `on_disk` holds the indices of the final-named images present.
    pub fn is_satisfied_by(&self, on_disk: &[usize]) -> bool {
        match *self {
            CompletionCheck::ExactMatch(expected) => {
                expected > 0 && (1..=expected).all(|index| on_disk.contains(&index))
            }
            CompletionCheck::HeuristicNonEmpty => !on_disk.is_empty(),
        }
    }
}

/// Per-chapter record written after every download attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterManifest {
    pub chapter: ChapterNumber,
    pub source_url: String,
    pub expected_images: usize,
    #[serde(default)]
    pub missing: Vec<usize>,
    pub status: ChapterStatus,
    pub updated_at: DateTime<Utc>,
}

/// Filesystem layout: `<root>/<title>/Chapter <NNN>/image_<NNN>.<ext>`.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manga_dir(&self, manga_title: &str) -> PathBuf {
        self.root.join(sanitize_title(manga_title))
    }

    pub fn chapter_dir(&self, manga_title: &str, chapter: ChapterNumber) -> PathBuf {
        self.manga_dir(manga_title).join(chapter_dir_name(chapter))
    }

    pub fn path_for(&self, manga_title: &str, chapter: ChapterNumber, index: usize, extension: &str) -> PathBuf {
        self.chapter_dir(manga_title, chapter).join(image_file_name(index, extension))
    }

    pub fn archive_path(&self, manga_title: &str, chapter: ChapterNumber) -> PathBuf {
        self.manga_dir(manga_title)
            .join(format!("{}.cbz", chapter_dir_name(chapter)))
    }

    pub async fn ensure_chapter_dir(&self, manga_title: &str, chapter: ChapterNumber) -> Result<PathBuf> {
        let path = self.chapter_dir(manga_title, chapter);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    /// Final-named image files in the chapter directory as `(index, path)`, by index.
    pub async fn chapter_images(&self, manga_title: &str, chapter: ChapterNumber) -> Result<Vec<(usize, PathBuf)>> {
        list_image_files(&self.chapter_dir(manga_title, chapter)).await
    }

    /// Indices of the final-named images on disk, ascending.
    pub async fn image_indices(&self, manga_title: &str, chapter: ChapterNumber) -> Result<Vec<usize>> {
        Ok(self
            .chapter_images(manga_title, chapter)
            .await?
            .into_iter()
            .map(|(index, _)| index)
            .collect())
    }

    pub async fn read_manifest(&self, manga_title: &str, chapter: ChapterNumber) -> Result<Option<ChapterManifest>> {
        let path = self.chapter_dir(manga_title, chapter).join(MANIFEST_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(manifest) => Ok(Some(manifest)),
                Err(e) => {
                    // an unreadable record is treated as no record
                    warn!("[STORAGE] ignoring corrupt manifest {:?}: {}", path, e);
                    Ok(None)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_manifest(&self, manga_title: &str, manifest: &ChapterManifest) -> Result<()> {
        let path = self.chapter_dir(manga_title, manifest.chapter).join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(manifest)?;
        write_atomic(path, bytes).await
    }

    /// Completion check for a chapter, derived from its manifest when one exists.
    pub async fn completion_check(&self, manga_title: &str, chapter: ChapterNumber) -> Result<CompletionCheck> {
        let expected = self
            .read_manifest(manga_title, chapter)
            .await?
            .map(|m| m.expected_images);
        Ok(CompletionCheck::from_expected(expected))
    }

    pub async fn is_chapter_complete(
        &self,
        manga_title: &str,
        chapter: ChapterNumber,
        expected: Option<usize>,
    ) -> Result<bool> {
        let on_disk = self.image_indices(manga_title, chapter).await?;
        Ok(CompletionCheck::from_expected(expected).is_satisfied_by(&on_disk))
    }

    /// Take the chapter's lock file, reclaiming one older than `stale_after`.
    pub fn lock_chapter(&self, manga_title: &str, chapter: ChapterNumber, stale_after: Duration) -> std::result::Result<ChapterLock, LockError> {
        ChapterLock::acquire(&self.chapter_dir(manga_title, chapter), stale_after)
    }

    /// Pack the chapter's images into `Chapter <NNN>.cbz` beside its directory.
    pub async fn archive_chapter(&self, manga_title: &str, chapter: ChapterNumber) -> Result<PathBuf> {
        let images = self.chapter_images(manga_title, chapter).await?;
        let archive = self.archive_path(manga_title, chapter);
        info!("[STORAGE] Creating CBZ archive: {:?}", archive);

        let target = archive.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut pending = PendingFile::create(&target)?;
            {
                let mut zip = zip::ZipWriter::new(pending.file_mut());
                let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
                for (_, path) in &images {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    zip.start_file(name, options)?;
                    zip.write_all(&std::fs::read(path)?)?;
                }
                zip.finish()?;
            }
            pending.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| MangaGrabError::Io(io::Error::other(e)))??;

        info!("[STORAGE] Created CBZ archive: {:?}", archive);
        Ok(archive)
    }
}

/// Replace characters illegal in paths; the same title always maps to the same name.
pub fn sanitize_title(title: &str) -> String {
    let sanitized = title
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>();
    let trimmed = sanitized.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn chapter_dir_name(chapter: ChapterNumber) -> String {
    format!("Chapter {}", chapter.dir_label())
}

pub fn image_file_name(index: usize, extension: &str) -> String {
    format!("image_{:03}.{}", index, extension)
}

/// Index of a final-named image file (`image_007.png` -> 7).
pub fn parse_image_index(file_name: &str) -> Option<usize> {
    let rest = file_name.strip_prefix("image_")?;
    let (digits, extension) = rest.split_once('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !IMAGE_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str()) {
        return None;
    }
    digits.parse().ok()
}

pub(crate) async fn list_image_files(dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut images = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(index) = parse_image_index(&name.to_string_lossy()) {
            images.push((index, entry.path()));
        }
    }
    images.sort();
    Ok(images)
}

/// Choose a file extension: content type, then URL suffix, then magic bytes, then `jpg`.
pub fn infer_extension(content_type: Option<&str>, url: &url::Url, bytes: &[u8]) -> String {
    if let Some(ext) = content_type.and_then(extension_for_mime) {
        return ext.to_string();
    }

    let from_url = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()));
    if let Some(ext) = from_url {
        return ext;
    }

    image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .filter(|ext| IMAGE_EXTENSIONS.contains(ext))
        .unwrap_or(DEFAULT_EXTENSION)
        .to_string()
}

fn extension_for_mime(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    match mime.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/avif" => Some("avif"),
        "image/bmp" => Some("bmp"),
        _ => None,
    }
}

/// A file being written under a temporary name next to its destination.
///
/// Nothing appears under the final name until [`PendingFile::commit`]; dropping
/// an uncommitted file deletes the temporary.
pub struct PendingFile {
    temp: tempfile::NamedTempFile,
    target: PathBuf,
}

impl PendingFile {
    pub fn create(target: impl Into<PathBuf>) -> io::Result<Self> {
        let target = target.into();
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let prefix = format!(
            ".{}.",
            target.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
        );
        let temp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".part")
            .tempfile_in(dir)?;
        Ok(Self { temp, target })
    }

    pub fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.temp.as_file_mut().write_all(chunk)
    }

    pub fn file_mut(&mut self) -> &mut std::fs::File {
        self.temp.as_file_mut()
    }

    pub fn commit(self) -> io::Result<PathBuf> {
        self.temp.as_file().sync_all()?;
        self.temp.persist(&self.target).map_err(|e| e.error)?;
        Ok(self.target)
    }
}

/// Write `bytes` to `path` via temp-then-rename.
pub async fn write_atomic(path: PathBuf, bytes: impl AsRef<[u8]> + Send + 'static) -> Result<()> {
    tokio::task::spawn_blocking(move || -> io::Result<()> {
        let mut pending = PendingFile::create(&path)?;
        pending.write(bytes.as_ref())?;
        let path = pending.commit()?;
        debug!("[STORAGE] wrote {:?}", path);
        Ok(())
    })
    .await
    .map_err(io::Error::other)??;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("chapter directory {0:?} is locked by another run")]
    Held(PathBuf),
    #[error("lock file error: {0}")]
    Io(#[from] io::Error),
}

/// Exclusive claim on a chapter directory, released on drop.
#[derive(Debug)]
pub struct ChapterLock {
    path: PathBuf,
}

impl ChapterLock {
    pub fn acquire(chapter_dir: &Path, stale_after: Duration) -> std::result::Result<Self, LockError> {
        std::fs::create_dir_all(chapter_dir)?;
        let path = chapter_dir.join(LOCK_FILE);

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "pid={} started={}", std::process::id(), Utc::now().to_rfc3339())?;
                    debug!("[STORAGE] locked {:?}", chapter_dir);
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let age = std::fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                        .unwrap_or(Duration::ZERO);
                    if age <= stale_after {
                        return Err(LockError::Held(chapter_dir.to_path_buf()));
                    }
                    warn!("[STORAGE] reclaiming stale lock {:?} ({:?} old)", path, age);
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LockError::Held(chapter_dir.to_path_buf()))
    }
}

impl Drop for ChapterLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("[STORAGE] failed to release lock {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn num(v: f64) -> ChapterNumber {
        ChapterNumber::new(v).unwrap()
    }

    #[test]
    fn test_sanitize_title_is_deterministic() {
        assert_eq!(sanitize_title("Re:Zero / Part? 2*"), "Re_Zero _ Part_ 2_");
        assert_eq!(sanitize_title("  ..Hidden.. "), "Hidden");
        assert_eq!(sanitize_title("tab\there"), "tab_here");
        assert_eq!(sanitize_title("..."), "untitled");
        assert_eq!(sanitize_title("Re:Zero"), sanitize_title("Re:Zero"));
    }

    #[test]
    fn test_path_layout() {
        let layout = StorageLayout::new("/data/comics");
        assert_eq!(
            layout.path_for("One: Piece", num(7.0), 3, "png"),
            PathBuf::from("/data/comics/One_ Piece/Chapter 007/image_003.png")
        );
        assert_eq!(
            layout.chapter_dir("X", num(1250.0)),
            PathBuf::from("/data/comics/X/Chapter 1250")
        );
        assert_eq!(
            layout.archive_path("X", num(12.0)),
            PathBuf::from("/data/comics/X/Chapter 012.cbz")
        );
    }

    #[test]
    fn test_chapter_dirs_sort_lexically() {
        let mut names: Vec<String> = [100.0, 9.0, 20.0, 1.0, 999.0]
            .iter()
            .map(|v| chapter_dir_name(num(*v)))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["Chapter 001", "Chapter 009", "Chapter 020", "Chapter 100", "Chapter 999"]
        );
    }

    #[test]
    fn test_parse_image_index() {
        assert_eq!(parse_image_index("image_007.png"), Some(7));
        assert_eq!(parse_image_index("image_1200.JPG"), Some(1200));
        assert_eq!(parse_image_index(".image_007.png.abc.part"), None);
        assert_eq!(parse_image_index("image_007.txt"), None);
        assert_eq!(parse_image_index("cover.jpg"), None);
        assert_eq!(parse_image_index("image_.jpg"), None);
    }

    #[test]
    fn test_completion_check_branches() {
        assert!(CompletionCheck::ExactMatch(3).is_satisfied_by(&[1, 2, 3]));
        assert!(!CompletionCheck::ExactMatch(3).is_satisfied_by(&[1, 3]));
        // extra pages left over from a longer earlier version
        assert!(CompletionCheck::ExactMatch(3).is_satisfied_by(&[1, 2, 3, 4]));
        // the count matches but a recorded page is missing
        assert!(!CompletionCheck::ExactMatch(3).is_satisfied_by(&[1, 3, 4]));
        assert!(!CompletionCheck::ExactMatch(0).is_satisfied_by(&[]));
        assert!(CompletionCheck::HeuristicNonEmpty.is_satisfied_by(&[7]));
        assert!(!CompletionCheck::HeuristicNonEmpty.is_satisfied_by(&[]));
    }

    #[test]
    fn test_infer_extension_precedence() {
        let url = Url::parse("https://cdn.example/p/001.png?v=2").unwrap();
        assert_eq!(infer_extension(Some("image/webp; charset=binary"), &url, b""), "webp");
        assert_eq!(infer_extension(Some("application/octet-stream"), &url, b""), "png");

        let bare = Url::parse("https://cdn.example/p/001").unwrap();
        let png_magic = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(infer_extension(None, &bare, &png_magic), "png");
        assert_eq!(infer_extension(None, &bare, b"????"), "jpg");
    }

    #[test]
    fn test_uncommitted_pending_file_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("image_001.jpg");

        let mut pending = PendingFile::create(&target).unwrap();
        pending.write(b"first half of the image").unwrap();
        // interrupted before commit
        drop(pending);

        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_committed_pending_file_appears_complete() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("image_001.jpg");

        let mut pending = PendingFile::create(&target).unwrap();
        pending.write(b"abc").unwrap();
        pending.write(b"def").unwrap();
        assert!(!target.exists());
        pending.commit().unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"abcdef");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_count_ignores_temp_and_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let chapter_dir = layout.ensure_chapter_dir("T", num(1.0)).await.unwrap();
        std::fs::write(chapter_dir.join("image_001.jpg"), b"x").unwrap();
        std::fs::write(chapter_dir.join("image_002.png"), b"x").unwrap();
        std::fs::write(chapter_dir.join(".image_003.jpg.1234.part"), b"x").unwrap();
        std::fs::write(chapter_dir.join(MANIFEST_FILE), b"{}").unwrap();

        assert_eq!(layout.image_indices("T", num(1.0)).await.unwrap(), vec![1, 2]);
        assert_eq!(
            layout.chapter_images("T", num(1.0)).await.unwrap()[1],
            (2, chapter_dir.join("image_002.png"))
        );
    }

    #[tokio::test]
    async fn test_is_chapter_complete_exact_and_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        assert!(!layout.is_chapter_complete("T", num(2.0), None).await.unwrap());

        let chapter_dir = layout.ensure_chapter_dir("T", num(2.0)).await.unwrap();
        for i in 1..=2 {
            std::fs::write(chapter_dir.join(image_file_name(i, "jpg")), b"x").unwrap();
        }
        assert!(layout.is_chapter_complete("T", num(2.0), None).await.unwrap());
        assert!(layout.is_chapter_complete("T", num(2.0), Some(2)).await.unwrap());
        assert!(!layout.is_chapter_complete("T", num(2.0), Some(3)).await.unwrap());

        // a stray fourth page does not stand in for the missing third
        std::fs::write(chapter_dir.join(image_file_name(4, "jpg")), b"x").unwrap();
        assert!(!layout.is_chapter_complete("T", num(2.0), Some(3)).await.unwrap());
    }

    #[tokio::test]
    async fn test_manifest_round_trip_drives_completion_check() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.ensure_chapter_dir("T", num(3.0)).await.unwrap();
        assert_eq!(
            layout.completion_check("T", num(3.0)).await.unwrap(),
            CompletionCheck::HeuristicNonEmpty
        );

        let manifest = ChapterManifest {
            chapter: num(3.0),
            source_url: "https://example.com/chapter-3".to_string(),
            expected_images: 5,
            missing: vec![4],
            status: ChapterStatus::Partial,
            updated_at: Utc::now(),
        };
        layout.write_manifest("T", &manifest).await.unwrap();

        assert_eq!(layout.read_manifest("T", num(3.0)).await.unwrap(), Some(manifest));
        assert_eq!(
            layout.completion_check("T", num(3.0)).await.unwrap(),
            CompletionCheck::ExactMatch(5)
        );
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let chapter_dir = layout.ensure_chapter_dir("T", num(4.0)).await.unwrap();
        std::fs::write(chapter_dir.join(MANIFEST_FILE), b"not json").unwrap();
        assert_eq!(layout.read_manifest("T", num(4.0)).await.unwrap(), None);
    }

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let hour = Duration::from_secs(3600);

        let lock = layout.lock_chapter("T", num(1.0), hour).unwrap();
        assert!(matches!(
            layout.lock_chapter("T", num(1.0), hour),
            Err(LockError::Held(_))
        ));
        drop(lock);
        assert!(layout.lock_chapter("T", num(1.0), hour).is_ok());
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let chapter_dir = layout.chapter_dir("T", num(1.0));
        std::fs::create_dir_all(&chapter_dir).unwrap();
        std::fs::write(chapter_dir.join(LOCK_FILE), b"pid=1").unwrap();
        std::thread::sleep(Duration::from_millis(1100));

        assert!(layout.lock_chapter("T", num(1.0), Duration::ZERO).is_ok());
    }

    #[tokio::test]
    async fn test_archive_contains_chapter_images() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        let chapter_dir = layout.ensure_chapter_dir("T", num(5.0)).await.unwrap();
        std::fs::write(chapter_dir.join("image_001.jpg"), b"one").unwrap();
        std::fs::write(chapter_dir.join("image_002.jpg"), b"two").unwrap();

        let archive = layout.archive_chapter("T", num(5.0)).await.unwrap();
        let mut zip = zip::ZipArchive::new(std::fs::File::open(&archive).unwrap()).unwrap();
        assert_eq!(zip.len(), 2);
        assert_eq!(zip.by_index(0).unwrap().name(), "image_001.jpg");
    }
}
