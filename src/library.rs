use crate::error::Result;
use crate::models::ChapterNumber;
use crate::storage::{list_image_files, StorageLayout};
use serde::Serialize;
use std::io;
use std::path::PathBuf;

/// A downloaded chapter as found on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryChapter {
    pub number: ChapterNumber,
    pub path: PathBuf,
    pub images: usize,
}

/// Read-only view over the output root, for viewers and listings.
#[derive(Debug, Clone)]
pub struct Library {
    layout: StorageLayout,
}

impl Library {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Manga directory names under the root, alphabetically.
    pub async fn list_manga(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.layout.root()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.starts_with('.') {
                    names.push(name);
                }
            }
        }
        names.sort_by_key(|n| n.to_lowercase());
        Ok(names)
    }

    /// Chapter directories of a manga, in numeric order.
    pub async fn list_chapters(&self, manga_title: &str) -> Result<Vec<LibraryChapter>> {
        let manga_dir = self.layout.manga_dir(manga_title);
        let mut entries = match tokio::fs::read_dir(&manga_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut chapters = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(number) = name
                .strip_prefix("Chapter ")
                .and_then(|n| n.parse::<ChapterNumber>().ok())
            else {
                continue;
            };
            let path = entry.path();
            let images = list_image_files(&path).await?.len();
            chapters.push(LibraryChapter { number, path, images });
        }
        chapters.sort_by_key(|c| c.number);
        Ok(chapters)
    }

    /// Page images of a chapter in page order.
    pub async fn chapter_images(&self, manga_title: &str, chapter: ChapterNumber) -> Result<Vec<PathBuf>> {
        Ok(self
            .layout
            .chapter_images(manga_title, chapter)
            .await?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(v: f64) -> ChapterNumber {
        ChapterNumber::new(v).unwrap()
    }

    #[tokio::test]
    async fn test_empty_root_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let library = Library::new(StorageLayout::new(dir.path().join("missing")));
        assert!(library.list_manga().await.unwrap().is_empty());
        assert!(library.list_chapters("Nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lists_manga_chapters_and_pages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        for chapter in [10.0, 2.0, 1000.0] {
            layout.ensure_chapter_dir("Berserk", num(chapter)).await.unwrap();
        }
        layout.ensure_chapter_dir("akira", num(1.0)).await.unwrap();
        std::fs::create_dir_all(layout.manga_dir("Berserk").join("extras")).unwrap();

        let two = layout.chapter_dir("Berserk", num(2.0));
        for name in ["image_010.jpg", "image_002.png", "image_001.jpg", "notes.txt"] {
            std::fs::write(two.join(name), b"x").unwrap();
        }

        let library = Library::new(layout);
        assert_eq!(library.list_manga().await.unwrap(), vec!["akira", "Berserk"]);

        let chapters = library.list_chapters("Berserk").await.unwrap();
        let numbers: Vec<String> = chapters.iter().map(|c| c.number.to_string()).collect();
        assert_eq!(numbers, vec!["2", "10", "1000"]);
        assert_eq!(chapters[0].images, 3);

        let pages = library.chapter_images("Berserk", num(2.0)).await.unwrap();
        let names: Vec<String> = pages
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["image_001.jpg", "image_002.png", "image_010.jpg"]);
    }
}
