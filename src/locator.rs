use crate::config::ImageConfig;
use crate::error::{MangaGrabError, Result};
use crate::models::{ChapterNumber, ImageRef};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocateError {
    /// The container selector matched no element; usually a typo.
    #[error("container selector '{0}' matched no element")]
    SelectorNotMatched(String),
}

/// A parsed container selector together with its source text.
#[derive(Debug, Clone)]
pub struct ContainerSelector {
    source: String,
    selector: Selector,
}

impl ContainerSelector {
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        let selector = Selector::parse(source).map_err(|e| MangaGrabError::selector(source, format!("{:?}", e)))?;
        Ok(Self {
            source: source.to_string(),
            selector,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn img_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| Selector::parse("img").expect("static selector"))
}

/// Finds page images on a chapter page.
///
/// Without a container every `<img>` on the page is a candidate, which can
/// include logos and ads; `exclude_patterns` trims the usual suspects.
#[derive(Debug, Clone)]
pub struct ImageLocator {
    source_attributes: Vec<String>,
    exclude_patterns: Vec<String>,
}

impl ImageLocator {
    pub fn new(source_attributes: Vec<String>, exclude_patterns: Vec<String>) -> Self {
        Self {
            source_attributes,
            exclude_patterns: exclude_patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &ImageConfig) -> Self {
        Self::new(config.source_attributes.clone(), config.exclude_patterns.clone())
    }

    /// Image refs in document order, numbered from 1.
    pub fn locate(
        &self,
        html: &str,
        page_url: &Url,
        chapter: ChapterNumber,
        container: Option<&ContainerSelector>,
    ) -> std::result::Result<Vec<ImageRef>, LocateError> {
        let document = Html::parse_document(html);

        let candidates: Vec<ElementRef<'_>> = match container {
            Some(container) => {
                let root = document
                    .select(&container.selector)
                    .next()
                    .ok_or_else(|| LocateError::SelectorNotMatched(container.source.clone()))?;
                root.select(img_selector()).collect()
            }
            None => document.select(img_selector()).collect(),
        };

        debug!(
            "[LOCATOR] chapter {}: {} <img> candidates",
            chapter,
            candidates.len()
        );

        let mut seen = HashSet::new();
        let mut images = Vec::new();
        for element in candidates {
            let Some(raw) = self.source_of(&element) else {
                continue;
            };
            let Ok(url) = page_url.join(raw) else {
                debug!("[LOCATOR] unresolvable image source '{}'", raw);
                continue;
            };
            if !matches!(url.scheme(), "http" | "https") || self.is_excluded(&url) {
                continue;
            }
            if !seen.insert(url.clone()) {
                continue;
            }
            images.push(ImageRef {
                chapter_number: chapter,
                index: images.len() + 1,
                source_url: url,
            });
        }

        info!("[LOCATOR] chapter {}: located {} images", chapter, images.len());
        Ok(images)
    }

    fn source_of<'a>(&self, element: &ElementRef<'a>) -> Option<&'a str> {
        self.source_attributes.iter().find_map(|attr| {
            element
                .value()
                .attr(attr)
                .map(str::trim)
                // inline placeholders are never the real page
                .filter(|v| !v.is_empty() && !v.starts_with("data:"))
        })
    }

    /// Patterns match the path only, so a host like `iconscans.net` is not excluded.
    fn is_excluded(&self, url: &Url) -> bool {
        let lowered = url.path().to_lowercase();
        self.exclude_patterns.iter().any(|p| lowered.contains(p.as_str()))
    }
}

impl Default for ImageLocator {
    fn default() -> Self {
        Self::new(
            vec![
                "data-src".to_string(),
                "data-lazy-src".to_string(),
                "data-original".to_string(),
                "src".to_string(),
            ],
            Vec::new(),
        )
    }
}
