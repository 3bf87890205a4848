//! naroudl: download a Shousetsuka ni Narou work and package it as an EPUB.

pub mod cli;
pub mod config;
pub mod epub;
pub mod model;
pub mod scraper;

// Re-exports for CLI and consumers.
pub use epub::{write_epub, EpubBuilder, EpubError, EpubOptions};
pub use model::{EpisodeDescriptor, EpisodeDocument, EpisodeRange, Inline, Paragraph, WorkMetadata};
pub use scraper::{
    download_work, parse_work_id, DownloadOptions, DownloadedWork, FetchPolicy, PoliteClient,
    PoliteClientBuilder, RetrievalOutcome, ScraperError,
};
