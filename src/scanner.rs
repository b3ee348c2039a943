use crate::error::{MangaGrabError, Result};
use crate::models::{ChapterNumber, ChapterRef};
use crate::traits::ChapterNumberExtractor;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tracing::{debug, info};
use url::Url;

/// Default extraction strategy: a user pattern whose `number` group (or first
/// capturing group) holds the chapter number.
#[derive(Debug, Clone)]
pub struct RegexExtractor {
    pattern: Regex,
    group: Group,
}

#[derive(Debug, Clone, Copy)]
enum Group {
    Named,
    First,
}

impl RegexExtractor {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)?;
        // captures_len counts the implicit whole-match group
        if pattern.captures_len() < 2 {
            return Err(MangaGrabError::config(format!(
                "chapter pattern '{}' needs a capturing group for the chapter number",
                pattern.as_str()
            )));
        }
        let group = if pattern.capture_names().flatten().any(|name| name == "number") {
            Group::Named
        } else {
            Group::First
        };
        Ok(Self { pattern, group })
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}

impl ChapterNumberExtractor for RegexExtractor {
    fn extract(&self, text: &str) -> Option<ChapterNumber> {
        let captures = self.pattern.captures(text)?;
        let matched = match self.group {
            Group::Named => captures.name("number"),
            Group::First => captures.get(1),
        }?;
        matched.as_str().parse().ok()
    }
}

/// Parse a user-supplied index URL; it must be absolute http(s).
pub fn parse_index_url(input: &str) -> Result<Url> {
    let url = Url::parse(input.trim())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(MangaGrabError::config(format!(
            "index URL must use http or https, got '{}'",
            url.scheme()
        )));
    }
    Ok(url)
}

fn anchor_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| Selector::parse("a").expect("static selector"))
}

fn element_text(element: &ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Discover chapter links on an index page.
///
/// Every anchor's raw href and visible text are offered to `extractor`; when
/// both yield a number and they disagree, the href wins. Chapters are keyed by
/// number, the first absolute URL seen for a number is kept, and the result is
/// ordered ascending by numeric value. No matches is an empty list.
pub fn extract_chapters(
    html: &str,
    base_url: &Url,
    extractor: &dyn ChapterNumberExtractor,
) -> Vec<ChapterRef> {
    let document = Html::parse_document(html);
    let mut chapters: BTreeMap<ChapterNumber, Url> = BTreeMap::new();
    let mut anchors = 0usize;

    for anchor in document.select(anchor_selector()) {
        anchors += 1;
        let Some(href) = anchor.value().attr("href").map(str::trim).filter(|h| !h.is_empty()) else {
            continue;
        };

        let number = match extractor.extract(href) {
            Some(number) => number,
            None => match extractor.extract(&element_text(&anchor)) {
                Some(number) => number,
                None => continue,
            },
        };

        let url = match base_url.join(href) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            Ok(url) => {
                debug!("[SCANNER] ignoring non-http chapter link {}", url);
                continue;
            }
            Err(e) => {
                debug!("[SCANNER] ignoring unresolvable href '{}': {}", href, e);
                continue;
            }
        };

        chapters.entry(number).or_insert(url);
    }

    info!(
        "[SCANNER] {} anchors scanned, {} distinct chapters found",
        anchors,
        chapters.len()
    );

    chapters
        .into_iter()
        .map(|(number, url)| ChapterRef::new(number, url))
        .collect()
}

fn title_noise() -> &'static Regex {
    static NOISE: OnceLock<Regex> = OnceLock::new();
    NOISE.get_or_init(|| {
        Regex::new(r"(?i)\s*-?\s*(manga|read online|free|scans).*$").expect("static regex")
    })
}

/// Best-effort manga title: first non-empty heading-like element with trailing
/// site noise removed, else the capitalised first label of the host.
pub fn extract_title(html: &str, page_url: &Url) -> String {
    let document = Html::parse_document(html);

    for css in ["h1", ".manga-title", ".series-title", "title"] {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        if let Some(element) = document.select(&selector).next() {
            let text = element_text(&element);
            if text.is_empty() {
                continue;
            }
            let cleaned = title_noise().replace(&text, "").trim().to_string();
            if !cleaned.is_empty() {
                return cleaned;
            }
        }
    }

    title_from_host(page_url)
}

fn title_from_host(page_url: &Url) -> String {
    let host = page_url.host_str().unwrap_or("manga");
    let host = host.strip_prefix("www.").unwrap_or(host);
    let label = host.split('.').next().unwrap_or(host);
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
        None => "Manga".to_string(),
    }
}
