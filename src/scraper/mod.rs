//! Retrieval pipeline: work-id parsing, the polite fetcher, index resolution,
//! episode parsing, and the sequential driver that ties them together.

mod client;
mod error;

pub mod episode;
pub mod index;
pub mod mock;

pub use client::{
    backoff_for, classify_response, Clock, FailureReason, FetchPolicy, HttpResponse,
    PoliteClient, PoliteClientBuilder, ReqwestTransport, RetrievalOutcome, SystemClock,
    Transport, TransportError, TransportErrorKind, DEFAULT_DELAY_SECS, DEFAULT_RETRY_LIMIT,
    DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT,
};
pub use error::ScraperError;

use crate::model::{EpisodeDocument, EpisodeRange, WorkMetadata};
use regex::Regex;
use reqwest::Url;
use std::sync::LazyLock;
use tracing::{error, info};

pub const NCODE_BASE: &str = "https://ncode.syosetu.com";
pub const METADATA_API: &str = "https://api.syosetu.com/novelapi/api/";

static NCODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^n\d{4,}[a-z]{1,2}$").expect("valid ncode regex"));
static NCODE_IN_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)/(n\d{4,}[a-z]{1,2})(?:/|$)").expect("valid ncode path regex")
});

/// Accept a bare ncode or any URL whose path contains one. Returns the lowercase ncode.
pub fn parse_work_id(input: &str) -> Result<String, ScraperError> {
    let raw = input.trim();
    if NCODE_RE.is_match(raw) {
        return Ok(raw.to_ascii_lowercase());
    }
    let invalid = || ScraperError::InvalidWorkId {
        input: input.to_string(),
    };
    let url = Url::parse(raw).map_err(|_| invalid())?;
    NCODE_IN_PATH_RE
        .captures(url.path())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .ok_or_else(invalid)
}

pub fn top_page_url(ncode: &str) -> String {
    format!("{}/{}/", NCODE_BASE, ncode)
}

/// Index page `page` (1-based). Page 1 is the top page itself.
pub fn index_page_url(ncode: &str, page: u32) -> String {
    if page <= 1 {
        top_page_url(ncode)
    } else {
        format!("{}?p={}", top_page_url(ncode), page)
    }
}

pub fn episode_url(ncode: &str, index: u32) -> String {
    format!("{}/{}/{}/", NCODE_BASE, ncode, index)
}

pub fn metadata_api_url(ncode: &str) -> String {
    format!("{}?out=json&of=t-w-ga-nt&ncode={}", METADATA_API, ncode)
}

/// Options for one download run.
pub struct DownloadOptions<'a> {
    pub policy: FetchPolicy,
    pub range: EpisodeRange,
    pub include_preface: bool,
    pub include_afterword: bool,
    /// Called after each episode with (done, total).
    pub progress: Option<&'a dyn Fn(u32, u32)>,
}

impl Default for DownloadOptions<'_> {
    fn default() -> Self {
        Self {
            policy: FetchPolicy::default(),
            range: EpisodeRange::default(),
            include_preface: true,
            include_afterword: true,
            progress: None,
        }
    }
}

/// Everything the EPUB writer needs.
#[derive(Debug, Clone)]
pub struct DownloadedWork {
    pub metadata: WorkMetadata,
    pub episodes: Vec<EpisodeDocument>,
}

/// Resolve the episode list, then fetch and parse each episode in ascending order.
///
/// Strictly sequential; the first fatal error aborts the run and nothing is returned.
pub fn download_work(
    input: &str,
    client: &mut PoliteClient,
    options: &DownloadOptions<'_>,
) -> Result<DownloadedWork, ScraperError> {
    let ncode = parse_work_id(input)?;
    let resolved = index::resolve(&ncode, client, &options.policy, options.range)?;
    if resolved.episodes.is_empty() {
        return Err(ScraperError::NoEpisodesInRange {
            available: resolved.metadata.episode_count as usize,
        });
    }

    let total = resolved.episodes.len() as u32;
    info!(ncode = %ncode, title = %resolved.metadata.title, episodes = total, "downloading");
    let mut episodes = Vec::with_capacity(resolved.episodes.len());
    for (done, descriptor) in (1..).zip(resolved.episodes.iter()) {
        let html = client
            .fetch_text(&descriptor.url, &options.policy)
            .inspect_err(|e| {
                error!(index = descriptor.index, url = %descriptor.url, error = %e, "episode retrieval failed")
            })?;
        let mut doc = episode::parse_episode(
            descriptor.index,
            &html,
            options.include_preface,
            options.include_afterword,
        )
        .inspect_err(|e| {
            error!(index = descriptor.index, url = %descriptor.url, error = %e, "episode parse failed")
        })?;
        if doc.title.is_empty() {
            doc.title = descriptor.title.clone();
        }
        episodes.push(doc);
        if let Some(progress) = options.progress {
            progress(done, total);
        }
    }

    Ok(DownloadedWork {
        metadata: resolved.metadata,
        episodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::mock::{MockTransport, VirtualClock};
    use std::cell::RefCell;
    use std::time::Duration;

    #[test]
    fn work_id_from_bare_ncode() -> Result<(), ScraperError> {
        assert_eq!(parse_work_id("N1234AB")?, "n1234ab");
        assert_eq!(parse_work_id("  n9669bk ")?, "n9669bk");
        Ok(())
    }

    #[test]
    fn work_id_from_urls() -> Result<(), ScraperError> {
        assert_eq!(parse_work_id("https://ncode.syosetu.com/n1234ab/")?, "n1234ab");
        assert_eq!(parse_work_id("https://ncode.syosetu.com/n1234ab/12/")?, "n1234ab");
        assert_eq!(parse_work_id("https://ncode.syosetu.com/N1234AB")?, "n1234ab");
        Ok(())
    }

    #[test]
    fn work_id_rejects_garbage() {
        for input in ["", "hello", "n12ab", "https://example.com/novel/1/"] {
            assert!(
                matches!(parse_work_id(input), Err(ScraperError::InvalidWorkId { .. })),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn url_helpers() {
        assert_eq!(top_page_url("n0001aa"), "https://ncode.syosetu.com/n0001aa/");
        assert_eq!(index_page_url("n0001aa", 1), "https://ncode.syosetu.com/n0001aa/");
        assert_eq!(
            index_page_url("n0001aa", 3),
            "https://ncode.syosetu.com/n0001aa/?p=3"
        );
        assert_eq!(episode_url("n0001aa", 12), "https://ncode.syosetu.com/n0001aa/12/");
        assert!(metadata_api_url("n0001aa").ends_with("ncode=n0001aa"));
    }

    fn serial_site(transport: &MockTransport) {
        serial_site_with_broken(transport, None);
    }

    fn serial_site_with_broken(transport: &MockTransport, broken: Option<u32>) {
        transport.respond(
            &metadata_api_url("n0001aa"),
            200,
            r#"[{"allcount":1},{"title":"連載","writer":"作者","general_all_no":3,"noveltype":1}]"#,
        );
        transport.respond(
            &top_page_url("n0001aa"),
            200,
            r#"<html><body><h1 class="p-novel__title">連載</h1>
<div class="p-novel__author">作者：<a href="/u/">作者</a></div>
<a class="p-eplist__subtitle" href="/n0001aa/1/">一</a>
<a class="p-eplist__subtitle" href="/n0001aa/2/">二</a>
<a class="p-eplist__subtitle" href="/n0001aa/3/">三</a>
</body></html>"#,
        );
        for i in 1..=3 {
            if broken == Some(i) {
                transport.respond(
                    &episode_url("n0001aa", i),
                    200,
                    "<html><body>メンテナンス中</body></html>",
                );
                continue;
            }
            transport.respond(
                &episode_url("n0001aa", i),
                200,
                &format!(
                    r#"<html><body><div id="novel_honbun"><p>本文{i}</p></div><div id="novel_a"><p>後書き{i}</p></div></body></html>"#
                ),
            );
        }
    }

    fn client(transport: &MockTransport, clock: &VirtualClock) -> PoliteClient {
        PoliteClient::builder()
            .transport(transport.clone())
            .clock(clock.clone())
            .build()
            .expect("mock client")
    }

    #[test]
    fn download_fetches_filtered_episodes_in_order() -> Result<(), ScraperError> {
        let clock = VirtualClock::new();
        let transport = MockTransport::with_clock(&clock);
        serial_site(&transport);
        let mut c = client(&transport, &clock);
        let seen = RefCell::new(Vec::new());
        let progress = |done: u32, total: u32| seen.borrow_mut().push((done, total));
        let options = DownloadOptions {
            range: EpisodeRange::new(Some(2), Some(3)),
            include_afterword: false,
            progress: Some(&progress),
            ..DownloadOptions::default()
        };
        let work = download_work("n0001aa", &mut c, &options)?;
        let indices: Vec<u32> = work.episodes.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![2, 3]);
        assert!(work.episodes.iter().all(|e| e.afterword.is_none()));
        assert_eq!(work.episodes[0].title, "二", "index title used when page has none");
        assert_eq!(*seen.borrow(), vec![(1, 2), (2, 2)]);
        assert_eq!(transport.call_count(&episode_url("n0001aa", 1)), 0);
        Ok(())
    }

    #[test]
    fn download_requests_are_spaced_by_delay() -> Result<(), ScraperError> {
        let clock = VirtualClock::new();
        let transport = MockTransport::with_clock(&clock);
        serial_site(&transport);
        let mut c = client(&transport, &clock);
        let options = DownloadOptions {
            policy: FetchPolicy {
                delay: Duration::from_millis(1500),
                ..FetchPolicy::default()
            },
            ..DownloadOptions::default()
        };
        download_work("n0001aa", &mut c, &options)?;
        let calls = transport.calls();
        assert!(calls.len() >= 5);
        for pair in calls.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(1500));
        }
        Ok(())
    }

    #[test]
    fn download_aborts_on_first_broken_episode() {
        let clock = VirtualClock::new();
        let transport = MockTransport::with_clock(&clock);
        serial_site_with_broken(&transport, Some(2));
        let mut c = client(&transport, &clock);
        let result = download_work("n0001aa", &mut c, &DownloadOptions::default());
        assert!(matches!(
            result,
            Err(ScraperError::ContentStructure { index: 2, .. })
        ));
        assert_eq!(transport.call_count(&episode_url("n0001aa", 1)), 1);
        assert_eq!(transport.call_count(&episode_url("n0001aa", 3)), 0);
    }

    #[test]
    fn download_reports_empty_range() {
        let clock = VirtualClock::new();
        let transport = MockTransport::with_clock(&clock);
        serial_site(&transport);
        let mut c = client(&transport, &clock);
        let options = DownloadOptions {
            range: EpisodeRange::new(Some(10), Some(20)),
            ..DownloadOptions::default()
        };
        assert!(matches!(
            download_work("n0001aa", &mut c, &options),
            Err(ScraperError::NoEpisodesInRange { available: 3 })
        ));
    }
}
