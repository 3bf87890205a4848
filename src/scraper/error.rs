//! Shared error type for resolution, retrieval, and parsing.

use thiserror::Error;

/// Scraper error. Every variant except `Transport` is fatal for the run;
/// `Transport` only escapes the fetcher when a caller asks for a single attempt.
#[derive(Debug, Error)]
pub enum ScraperError {
    // Input
    #[error("Invalid work identifier '{input}': expected an ncode (e.g. n1234ab) or a work URL.")]
    InvalidWorkId { input: String },

    // Retrieval
    #[error("Network error at {url}: {reason}")]
    Transport { url: String, reason: String },

    #[error("Not found (HTTP {status}): {url}")]
    SourceNotFound { status: u16, url: String },

    #[error("HTTP {status} when fetching: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Access blocked or restricted at {url} (HTTP 403).")]
    AccessBlocked { url: String },

    #[error("Gave up on {url} after {attempts} attempt(s): {reason}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        reason: String,
    },

    // Resolution
    #[error("Metadata API response for {ncode} did not match the expected shape: {reason}")]
    MetadataSchema { ncode: String, reason: String },

    #[error("Could not parse index page {url}: {reason}")]
    IndexPageParse { url: String, reason: String },

    #[error("Could not resolve the episode list for {ncode}: {}", reasons.join("; "))]
    IndexResolution { ncode: String, reasons: Vec<String> },

    #[error("No episodes in the requested range (work has {available} episode(s)).")]
    NoEpisodesInRange { available: usize },

    // Parsing
    #[error("Episode {index}: unexpected page structure: {reason}")]
    ContentStructure { index: u32, reason: String },

    #[error("Invalid selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },
}

impl ScraperError {
    /// Errors raised while retrieving a URL, as opposed to resolving or parsing.
    pub fn is_retrieval(&self) -> bool {
        matches!(
            self,
            ScraperError::Transport { .. }
                | ScraperError::SourceNotFound { .. }
                | ScraperError::HttpStatus { .. }
                | ScraperError::AccessBlocked { .. }
                | ScraperError::RetriesExhausted { .. }
        )
    }
}
