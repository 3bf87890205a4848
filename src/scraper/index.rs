//! Episode index resolution.
//!
//! Three strategies are tried in rank order; the first one that produces a list wins:
//! the metadata API (authoritative for title, author, and declared count), the
//! paginated index pages (authoritative for actual episode ordinals), and finally a
//! synthesised `1..=count` list from the declared count.

use crate::model::{EpisodeDescriptor, EpisodeRange, WorkMetadata};
use crate::scraper::client::{FetchPolicy, PoliteClient};
use crate::scraper::episode::{has_body, parse_selector, parse_work_header};
use crate::scraper::error::ScraperError;
use crate::scraper::{episode_url, index_page_url, metadata_api_url, top_page_url, NCODE_BASE};
use regex::Regex;
use reqwest::Url;
use scraper::Html;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static EPISODE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^/(n\d{4,}[a-z]{1,2})/(\d+)/?$").expect("valid episode path regex")
});

/// Episode list anchors on the index page, current layout first.
const EPISODE_LINK_SELECTORS: &[&str] = &["a.p-eplist__subtitle", "dd.subtitle a", ".subtitle a"];

/// Upper bound on index pages followed for one work.
const MAX_INDEX_PAGES: u32 = 1000;

/// Novel type reported by the API for a short story.
const NOVEL_TYPE_SHORT: u8 = 2;

/// Work record from the metadata API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub title: Option<String>,
    pub writer: Option<String>,
    pub episode_count: u32,
    pub novel_type: Option<u8>,
}

impl MetadataRecord {
    pub fn is_short_story(&self) -> bool {
        self.episode_count == 1 || self.novel_type == Some(NOVEL_TYPE_SHORT)
    }
}

#[derive(Debug, Deserialize)]
struct ApiHeader {
    allcount: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiRecord {
    title: Option<String>,
    writer: Option<String>,
    general_all_no: Option<u32>,
    noveltype: Option<u8>,
}

/// Parse the API's `[{"allcount":N}, {record}]` response.
pub fn parse_metadata_response(ncode: &str, body: &str) -> Result<MetadataRecord, ScraperError> {
    let schema = |reason: String| ScraperError::MetadataSchema {
        ncode: ncode.to_string(),
        reason,
    };
    let items: Vec<serde_json::Value> =
        serde_json::from_str(body).map_err(|e| schema(format!("not a JSON array: {}", e)))?;
    let mut items = items.into_iter();

    let header: ApiHeader = items
        .next()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| schema(format!("bad header object: {}", e)))?
        .ok_or_else(|| schema("empty response".to_string()))?;
    if header.allcount == Some(0) {
        return Err(schema("allcount is 0 (no such work)".to_string()));
    }

    let record: ApiRecord = items
        .next()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| schema(format!("bad work record: {}", e)))?
        .ok_or_else(|| schema("work record missing".to_string()))?;
    let episode_count = record
        .general_all_no
        .filter(|n| *n > 0)
        .ok_or_else(|| schema("general_all_no missing or zero".to_string()))?;

    Ok(MetadataRecord {
        title: record.title.filter(|t| !t.trim().is_empty()),
        writer: record.writer.filter(|w| !w.trim().is_empty()),
        episode_count,
        novel_type: record.noveltype,
    })
}

/// Episode links on one index page, keyed by ordinal. Links to other works are ignored.
pub fn parse_episode_links(html: &str, ncode: &str) -> Result<Vec<EpisodeDescriptor>, ScraperError> {
    let doc = Html::parse_document(html);
    let base = Url::parse(NCODE_BASE).map_err(|e| ScraperError::IndexPageParse {
        url: NCODE_BASE.to_string(),
        reason: e.to_string(),
    })?;

    let mut links = Vec::new();
    for sel in EPISODE_LINK_SELECTORS.iter().copied().chain(["a[href]"]) {
        let selector = parse_selector(sel)?;
        for a in doc.select(&selector) {
            let Some(href) = a.value().attr("href") else {
                continue;
            };
            let Some(index) = episode_ordinal(&base, href, ncode) else {
                continue;
            };
            let title = a.text().collect::<String>().trim().to_string();
            links.push(EpisodeDescriptor {
                index,
                url: episode_url(ncode, index),
                title: if title.is_empty() {
                    fallback_title(index)
                } else {
                    title
                },
            });
        }
        // The generic anchor scan only runs when no episode list markup exists.
        if !links.is_empty() {
            break;
        }
    }
    Ok(links)
}

fn episode_ordinal(base: &Url, href: &str, ncode: &str) -> Option<u32> {
    let url = base.join(href).ok()?;
    if url.host_str() != base.host_str() {
        return None;
    }
    let caps = EPISODE_PATH_RE.captures(url.path())?;
    if !caps.get(1)?.as_str().eq_ignore_ascii_case(ncode) {
        return None;
    }
    caps.get(2)?.as_str().parse::<u32>().ok().filter(|n| *n >= 1)
}

/// Parse `p=N` from a URL or query string.
fn page_from_href(href: &str) -> Option<u32> {
    let query = href.split('?').nth(1)?;
    query
        .split(['&', '#'])
        .find_map(|param| param.trim().strip_prefix("p="))
        .and_then(|n| n.parse::<u32>().ok())
}

/// Whether the page links to index page `page` (pager "next" or numbered link).
fn links_to_page(html: &str, page: u32) -> Result<bool, ScraperError> {
    let doc = Html::parse_document(html);
    let selector = parse_selector("a[href*=\"p=\"]")?;
    Ok(doc
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .any(|href| page_from_href(href) == Some(page)))
}

fn fallback_title(index: u32) -> String {
    format!("第{}部分", index)
}

/// Merge newly found links into `entries`, keeping the first title seen per ordinal.
/// Returns how many ordinals were new.
fn merge_links(entries: &mut BTreeMap<u32, EpisodeDescriptor>, found: Vec<EpisodeDescriptor>) -> usize {
    let before = entries.len();
    for d in found {
        entries.entry(d.index).or_insert(d);
    }
    entries.len() - before
}

/// Resolution strategies, in the order they are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    MetadataApi,
    IndexPages,
    DeclaredCount,
}

impl Strategy {
    pub const RANKED: [Strategy; 3] = [
        Strategy::MetadataApi,
        Strategy::IndexPages,
        Strategy::DeclaredCount,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Strategy::MetadataApi => "metadata-api",
            Strategy::IndexPages => "index-pages",
            Strategy::DeclaredCount => "declared-count",
        }
    }

    /// `Ok(None)` means the strategy had nothing to say and the next one should run.
    fn run(self, ctx: &mut ResolveContext<'_>) -> Result<Option<ResolvedIndex>, ScraperError> {
        match self {
            Strategy::MetadataApi => from_metadata_api(ctx),
            Strategy::IndexPages => from_index_pages(ctx),
            Strategy::DeclaredCount => Ok(from_declared_count(ctx)),
        }
    }
}

/// Work metadata plus the ordered episode list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIndex {
    pub metadata: WorkMetadata,
    pub episodes: Vec<EpisodeDescriptor>,
}

struct ResolveContext<'a> {
    ncode: &'a str,
    client: &'a mut PoliteClient,
    policy: &'a FetchPolicy,
    record: Option<MetadataRecord>,
}

/// Resolve the full episode list, then keep only episodes inside `range`.
///
/// A range that excludes everything yields an empty list, not an error.
pub fn resolve(
    ncode: &str,
    client: &mut PoliteClient,
    policy: &FetchPolicy,
    range: EpisodeRange,
) -> Result<ResolvedIndex, ScraperError> {
    let mut resolved = resolve_all(ncode, client, policy)?;
    let available = resolved.episodes.len();
    resolved.episodes = range.apply(resolved.episodes);
    if resolved.episodes.len() != available {
        info!(
            available,
            selected = resolved.episodes.len(),
            "applied episode range"
        );
    }
    Ok(resolved)
}

/// Resolve the unfiltered episode list by trying each strategy in rank order.
pub fn resolve_all(
    ncode: &str,
    client: &mut PoliteClient,
    policy: &FetchPolicy,
) -> Result<ResolvedIndex, ScraperError> {
    let mut ctx = ResolveContext {
        ncode,
        client,
        policy,
        record: None,
    };
    let mut reasons = Vec::new();
    for strategy in Strategy::RANKED {
        match strategy.run(&mut ctx) {
            Ok(Some(resolved)) => {
                info!(
                    strategy = strategy.name(),
                    episodes = resolved.episodes.len(),
                    short_story = resolved.metadata.is_short_story,
                    "resolved episode list"
                );
                return Ok(resolved);
            }
            Ok(None) => debug!(strategy = strategy.name(), "strategy deferred"),
            Err(e) => {
                warn!(strategy = strategy.name(), error = %e, "resolution strategy failed");
                reasons.push(format!("{}: {}", strategy.name(), e));
            }
        }
    }
    Err(ScraperError::IndexResolution {
        ncode: ncode.to_string(),
        reasons,
    })
}

fn short_story(ncode: &str, title: String, author: String) -> ResolvedIndex {
    let url = top_page_url(ncode);
    ResolvedIndex {
        metadata: WorkMetadata {
            ncode: ncode.to_string(),
            title: title.clone(),
            author,
            episode_count: 1,
            is_short_story: true,
            source_url: url.clone(),
        },
        episodes: vec![EpisodeDescriptor {
            index: 1,
            url,
            title,
        }],
    }
}

/// Short stories resolve here; serials only record the API metadata for later strategies.
fn from_metadata_api(ctx: &mut ResolveContext<'_>) -> Result<Option<ResolvedIndex>, ScraperError> {
    let body = ctx
        .client
        .fetch_text(&metadata_api_url(ctx.ncode), ctx.policy)?;
    let record = parse_metadata_response(ctx.ncode, &body)?;
    debug!(
        count = record.episode_count,
        novel_type = ?record.novel_type,
        "metadata api record"
    );
    let resolved = record.is_short_story().then(|| {
        short_story(
            ctx.ncode,
            record.title.clone().unwrap_or_else(|| ctx.ncode.to_string()),
            record.writer.clone().unwrap_or_default(),
        )
    });
    ctx.record = Some(record);
    Ok(resolved)
}

fn from_index_pages(ctx: &mut ResolveContext<'_>) -> Result<Option<ResolvedIndex>, ScraperError> {
    let top_url = top_page_url(ctx.ncode);
    let first = ctx.client.fetch_text(&top_url, ctx.policy)?;
    let header = parse_work_header(&first)?;
    let record = ctx.record.as_ref();
    let title = record
        .and_then(|r| r.title.clone())
        .or(header.title)
        .ok_or_else(|| ScraperError::IndexPageParse {
            url: top_url.clone(),
            reason: "no work title found".to_string(),
        })?;
    let author = record
        .and_then(|r| r.writer.clone())
        .or(header.author)
        .unwrap_or_default();

    let mut entries = BTreeMap::new();
    merge_links(&mut entries, parse_episode_links(&first, ctx.ncode)?);
    if entries.is_empty() {
        if has_body(&first)? {
            return Ok(Some(short_story(ctx.ncode, title, author)));
        }
        return Err(ScraperError::IndexPageParse {
            url: top_url,
            reason: "no episode links and no story body".to_string(),
        });
    }

    let mut page = 1;
    let mut html = first;
    while page < MAX_INDEX_PAGES && links_to_page(&html, page + 1)? {
        page += 1;
        let url = index_page_url(ctx.ncode, page);
        html = match ctx.client.fetch_text(&url, ctx.policy) {
            Ok(html) => html,
            Err(ScraperError::SourceNotFound { .. }) => {
                debug!(page, "index page missing, stopping pagination");
                break;
            }
            Err(e) => return Err(e),
        };
        let added = merge_links(&mut entries, parse_episode_links(&html, ctx.ncode)?);
        debug!(page, added, "index page parsed");
        if added == 0 {
            break;
        }
    }

    let episodes: Vec<EpisodeDescriptor> = entries.into_values().collect();
    let declared = record.map(|r| r.episode_count);
    if let Some(declared) = declared {
        if declared as usize != episodes.len() {
            warn!(
                declared,
                found = episodes.len(),
                "index page episode count differs from metadata; using index pages"
            );
        }
    }
    Ok(Some(ResolvedIndex {
        metadata: WorkMetadata {
            ncode: ctx.ncode.to_string(),
            title,
            author,
            episode_count: declared.unwrap_or(episodes.len() as u32),
            is_short_story: false,
            source_url: top_url,
        },
        episodes,
    }))
}

/// Last resort: trust the declared count and assume ordinals `1..=count`.
fn from_declared_count(ctx: &ResolveContext<'_>) -> Option<ResolvedIndex> {
    let record = ctx.record.as_ref()?;
    warn!(
        count = record.episode_count,
        "index pages unavailable, assuming contiguous episode numbers"
    );
    let episodes = (1..=record.episode_count)
        .map(|index| EpisodeDescriptor {
            index,
            url: episode_url(ctx.ncode, index),
            title: fallback_title(index),
        })
        .collect();
    Some(ResolvedIndex {
        metadata: WorkMetadata {
            ncode: ctx.ncode.to_string(),
            title: record.title.clone().unwrap_or_else(|| ctx.ncode.to_string()),
            author: record.writer.clone().unwrap_or_default(),
            episode_count: record.episode_count,
            is_short_story: false,
            source_url: top_page_url(ctx.ncode),
        },
        episodes,
    })
}
