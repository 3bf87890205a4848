//! EPUB 3 assembler. Consumes [WorkMetadata] and ordered [EpisodeDocument]s and writes
//! one archive (mimetype, container, OPF, nav, optional NCX and stylesheet, episodes).
//!
//! The archive is built in a temporary file next to the destination and renamed into
//! place, so a failed run never leaves a partial file at the output path.

mod xhtml;

use crate::model::{EpisodeDocument, WorkMetadata};
use std::collections::HashSet;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};
use xhtml::{ManifestItem, PackageDocument, TocEntry, STYLESHEET_HREF, VERTICAL_CSS};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const CONTAINER_XML: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n  <rootfiles>\n    <rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/>\n  </rootfiles>\n</container>";

const MIMETYPE: &[u8] = b"application/epub+zip";
const OEBPS_PREFIX: &str = "OEBPS/";
const XHTML_MEDIA_TYPE: &str = "application/xhtml+xml";

/// Timestamp used when no modification time is given.
pub const EPOCH_MODIFIED: &str = "1970-01-01T00:00:00Z";

/// Errors from the EPUB writer.
///
/// Maps to CLI exit code 5.
#[derive(Debug, Error)]
pub enum EpubError {
    #[error("Cannot write EPUB: no episodes to package.")]
    NoEpisodes,

    #[error("Cannot write EPUB: episode {index} was added twice.")]
    DuplicateEpisode { index: u32 },

    #[error("Failed to create output directory: {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create EPUB file: {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move finished EPUB into place: {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write EPUB archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl From<std::io::Error> for EpubError {
    fn from(e: std::io::Error) -> Self {
        EpubError::Zip(zip::result::ZipError::Io(e))
    }
}

/// Packaging options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpubOptions {
    /// Vertical text with right-to-left page progression; adds one stylesheet.
    pub vertical_writing: bool,
    /// Also write a legacy `toc.ncx`.
    pub include_ncx: bool,
    /// `dcterms:modified` value (`YYYY-MM-DDThh:mm:ssZ`).
    pub modified: String,
    pub language: String,
}

impl Default for EpubOptions {
    fn default() -> Self {
        Self {
            vertical_writing: false,
            include_ncx: false,
            modified: EPOCH_MODIFIED.to_string(),
            language: "ja".to_string(),
        }
    }
}

#[derive(Debug)]
struct ContentEntry {
    id: String,
    href: String,
    title: String,
    markup: String,
}

/// Accumulates content documents, then writes the whole package in [EpubBuilder::finish].
#[derive(Debug)]
pub struct EpubBuilder<'a> {
    metadata: &'a WorkMetadata,
    options: EpubOptions,
    entries: Vec<ContentEntry>,
    seen: HashSet<u32>,
}

impl<'a> EpubBuilder<'a> {
    pub fn new(metadata: &'a WorkMetadata, options: EpubOptions) -> Self {
        Self {
            metadata,
            options,
            entries: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Render and append one episode. Spine order is the order of calls.
    pub fn add_episode(&mut self, doc: &EpisodeDocument) -> Result<(), EpubError> {
        if !self.seen.insert(doc.index) {
            return Err(EpubError::DuplicateEpisode { index: doc.index });
        }
        let id = format!("episode-{:05}", doc.index);
        let stylesheet = self
            .options
            .vertical_writing
            .then(|| format!("../{}", STYLESHEET_HREF));
        let markup = xhtml::episode_document(doc, &self.options.language, stylesheet.as_deref());
        self.entries.push(ContentEntry {
            href: format!("text/{}.xhtml", id),
            id,
            title: doc.title.clone(),
            markup,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the archive to `path` atomically, creating the parent directory if needed.
    pub fn finish(self, path: &Path) -> Result<(), EpubError> {
        if self.entries.is_empty() {
            return Err(EpubError::NoEpisodes);
        }
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| EpubError::CreateDir {
            path: dir.clone(),
            source: e,
        })?;
        let tmp = NamedTempFile::new_in(&dir).map_err(|e| EpubError::CreateFile {
            path: dir.clone(),
            source: e,
        })?;
        // Temp files are created owner-only; the finished book should not be.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))
                .map_err(|e| EpubError::CreateFile {
                    path: tmp.path().to_path_buf(),
                    source: e,
                })?;
        }
        debug!(tmp = %tmp.path().display(), "writing archive");

        let mut zip = ZipWriter::new(tmp);
        self.write_entries(&mut zip)?;
        let tmp = zip.finish()?;
        tmp.persist(path).map_err(|e| EpubError::Persist {
            path: path.to_path_buf(),
            source: e.error,
        })?;
        info!(path = %path.display(), episodes = self.entries.len(), "EPUB written");
        Ok(())
    }

    fn write_entries<W: Write + Seek>(&self, zip: &mut ZipWriter<W>) -> Result<(), EpubError> {
        // Fixed timestamps keep identical inputs byte-identical.
        let options_stored = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(0o644);
        let options_deflate = options_stored.compression_method(zip::CompressionMethod::Deflated);

        // Mimetype first, uncompressed
        zip.start_file("mimetype", options_stored)?;
        zip.write_all(MIMETYPE)?;

        zip.start_file("META-INF/container.xml", options_deflate)?;
        zip.write_all(CONTAINER_XML)?;

        let meta = self.metadata;
        let toc: Vec<TocEntry> = self
            .entries
            .iter()
            .map(|e| TocEntry {
                href: e.href.clone(),
                title: e.title.clone(),
            })
            .collect();

        let opf = xhtml::package_document(&PackageDocument {
            identifier: &meta.source_url,
            title: &meta.title,
            author: &meta.author,
            language: &self.options.language,
            modified: &self.options.modified,
            manifest: &self.manifest(),
            spine: &self.entries.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            right_to_left: self.options.vertical_writing,
            include_ncx: self.options.include_ncx,
        });
        write_file(zip, "content.opf", opf.as_bytes(), options_deflate)?;

        let nav = xhtml::nav_document(&meta.title, &self.options.language, &toc);
        write_file(zip, "nav.xhtml", nav.as_bytes(), options_deflate)?;

        if self.options.include_ncx {
            let ncx = xhtml::ncx_document(&meta.source_url, &meta.title, &toc);
            write_file(zip, "toc.ncx", ncx.as_bytes(), options_deflate)?;
        }
        if self.options.vertical_writing {
            write_file(zip, STYLESHEET_HREF, VERTICAL_CSS.as_bytes(), options_deflate)?;
        }
        for entry in &self.entries {
            write_file(zip, &entry.href, entry.markup.as_bytes(), options_deflate)?;
        }
        Ok(())
    }

    fn manifest(&self) -> Vec<ManifestItem> {
        let mut items = vec![ManifestItem {
            id: "nav".to_string(),
            href: "nav.xhtml".to_string(),
            media_type: XHTML_MEDIA_TYPE,
            properties: Some("nav"),
        }];
        if self.options.include_ncx {
            items.push(ManifestItem {
                id: "ncx".to_string(),
                href: "toc.ncx".to_string(),
                media_type: "application/x-dtbncx+xml",
                properties: None,
            });
        }
        if self.options.vertical_writing {
            items.push(ManifestItem {
                id: "style".to_string(),
                href: STYLESHEET_HREF.to_string(),
                media_type: "text/css",
                properties: None,
            });
        }
        items.extend(self.entries.iter().map(|e| ManifestItem {
            id: e.id.clone(),
            href: e.href.clone(),
            media_type: XHTML_MEDIA_TYPE,
            properties: None,
        }));
        items
    }
}

fn write_file<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    name: &str,
    data: &[u8],
    options: SimpleFileOptions,
) -> Result<(), EpubError> {
    zip.start_file(format!("{}{}", OEBPS_PREFIX, name), options)?;
    zip.write_all(data)?;
    Ok(())
}

/// Write `episodes`, in the given order, as one EPUB at `path`.
///
/// Fails before touching the filesystem when `episodes` is empty or repeats an ordinal.
pub fn write_epub(
    metadata: &WorkMetadata,
    episodes: &[EpisodeDocument],
    path: &Path,
    options: &EpubOptions,
) -> Result<(), EpubError> {
    let mut builder = EpubBuilder::new(metadata, options.clone());
    for doc in episodes {
        builder.add_episode(doc)?;
    }
    builder.finish(path)
}
