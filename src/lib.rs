//! Regex-driven manga chapter discovery and resumable image downloading.
//!
//! The pipeline is index page -> chapter refs -> chapter pages -> image refs ->
//! files under `<root>/<title>/Chapter <NNN>/`. All HTTP goes through one
//! throttled [`fetcher::HttpFetcher`]; see [`manager::DownloadManager`] for the
//! per-chapter state machine.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod library;
pub mod locator;
pub mod manager;
pub mod models;
pub mod retry;
pub mod scanner;
pub mod selection;
pub mod storage;
pub mod traits;

pub use error::{MangaGrabError, Result};
