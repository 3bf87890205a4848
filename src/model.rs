//! Data model shared by the resolver, the episode parser, and the EPUB writer.

use serde::{Deserialize, Serialize};

/// One work (novel) as resolved at the start of a run. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMetadata {
    /// Site-assigned ncode, lowercase (e.g. `n1234ab`).
    pub ncode: String,
    pub title: String,
    pub author: String,
    /// Episode count declared by the metadata API; the number of discovered links
    /// only when the API was unavailable.
    #[serde(rename = "episodeCount")]
    pub episode_count: u32,
    /// Single-episode work whose text lives on the top page.
    #[serde(rename = "isShortStory")]
    pub is_short_story: bool,
    /// Top page URL. Used as the package identifier.
    #[serde(rename = "sourceUrl")]
    pub source_url: String,
}

/// One entry of the resolved episode list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeDescriptor {
    /// 1-based site episode number. For short stories this is always 1.
    pub index: u32,
    pub url: String,
    /// Title from the index page; the parser may refine it.
    pub title: String,
}

/// Inline unit inside a paragraph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "camelCase")]
pub enum Inline {
    Text(String),
    LineBreak,
}

/// A paragraph: ordered inline units. Never empty once produced by the parser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paragraph(pub Vec<Inline>);

impl Paragraph {
    /// Concatenated text, line breaks rendered as `\n`.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for unit in &self.0 {
            match unit {
                Inline::Text(t) => out.push_str(t),
                Inline::LineBreak => out.push('\n'),
            }
        }
        out
    }

    pub fn is_blank(&self) -> bool {
        self.0.iter().all(|unit| match unit {
            Inline::Text(t) => t.trim().is_empty(),
            Inline::LineBreak => true,
        })
    }
}

/// Normalized content of one episode page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeDocument {
    /// Matches the originating descriptor's index.
    pub index: u32,
    pub title: String,
    pub body: Vec<Paragraph>,
    pub preface: Option<Vec<Paragraph>>,
    pub afterword: Option<Vec<Paragraph>>,
}

/// Inclusive, 1-based episode filter. Either end may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpisodeRange {
    pub from: Option<u32>,
    pub to: Option<u32>,
}

impl EpisodeRange {
    pub fn new(from: Option<u32>, to: Option<u32>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, index: u32) -> bool {
        self.from.map_or(true, |f| index >= f) && self.to.map_or(true, |t| index <= t)
    }

    /// Keep only descriptors inside the range, preserving order.
    pub fn apply(&self, descriptors: Vec<EpisodeDescriptor>) -> Vec<EpisodeDescriptor> {
        descriptors
            .into_iter()
            .filter(|d| self.contains(d.index))
            .collect()
    }
}
