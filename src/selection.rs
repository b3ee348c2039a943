use crate::error::{MangaGrabError, Result};
use crate::models::{ChapterNumber, ChapterRef};
use std::str::FromStr;

/// Which discovered chapters to download: everything, or a list like `1,3,5-10`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChapterSelection {
    All,
    Ranges(Vec<(ChapterNumber, ChapterNumber)>),
}

impl ChapterSelection {
    pub fn contains(&self, number: ChapterNumber) -> bool {
        match self {
            ChapterSelection::All => true,
            ChapterSelection::Ranges(ranges) => ranges.iter().any(|(lo, hi)| *lo <= number && number <= *hi),
        }
    }

    /// Selected chapters, keeping the input (reading) order.
    pub fn apply(&self, chapters: &[ChapterRef]) -> Vec<ChapterRef> {
        chapters
            .iter()
            .filter(|c| self.contains(c.number))
            .cloned()
            .collect()
    }
}

impl FromStr for ChapterSelection {
    type Err = MangaGrabError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(ChapterSelection::All);
        }

        let mut ranges = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (parse_bound(lo)?, parse_bound(hi)?),
                None => {
                    let n = parse_bound(part)?;
                    (n, n)
                }
            };
            if lo > hi {
                return Err(MangaGrabError::config(format!("chapter range '{}' is reversed", part)));
            }
            ranges.push((lo, hi));
        }

        if ranges.is_empty() {
            return Err(MangaGrabError::config("empty chapter selection"));
        }
        Ok(ChapterSelection::Ranges(ranges))
    }
}

fn parse_bound(text: &str) -> Result<ChapterNumber> {
    text.parse::<ChapterNumber>()
        .map_err(|e| MangaGrabError::config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn refs(numbers: &[f64]) -> Vec<ChapterRef> {
        numbers
            .iter()
            .map(|n| {
                ChapterRef::new(
                    ChapterNumber::new(*n).unwrap(),
                    Url::parse(&format!("https://example.com/chapter-{}", n)).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_parse_list_and_ranges() {
        let selection: ChapterSelection = "1, 3,5-10".parse().unwrap();
        let picked: Vec<String> = selection
            .apply(&refs(&[1.0, 2.0, 3.0, 5.0, 7.5, 10.0, 11.0]))
            .iter()
            .map(|c| c.number.to_string())
            .collect();
        assert_eq!(picked, vec!["1", "3", "5", "7.5", "10"]);
    }

    #[test]
    fn test_all_selects_everything() {
        let selection: ChapterSelection = "ALL".parse().unwrap();
        assert_eq!(selection.apply(&refs(&[1.0, 2.0])).len(), 2);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!("".parse::<ChapterSelection>().is_err());
        assert!("5-1".parse::<ChapterSelection>().is_err());
        assert!("one".parse::<ChapterSelection>().is_err());
    }
}
