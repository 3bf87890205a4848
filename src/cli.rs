//! CLI parsing and orchestration. Parses args, merges the config file, runs
//! download -> EPUB (or a dry-run listing), and maps errors to exit codes.

use crate::config::{self, Config};
use crate::epub::{write_epub, EpubError, EpubOptions};
use crate::model::{EpisodeDescriptor, EpisodeRange, WorkMetadata};
use crate::scraper::{
    download_work, index, parse_work_id, DownloadOptions, FetchPolicy, PoliteClient, ScraperError,
    DEFAULT_DELAY_SECS, DEFAULT_RETRY_LIMIT, DEFAULT_TIMEOUT_SECS, DEFAULT_USER_AGENT,
};
use clap::{ArgAction, Parser};
use serde::Serialize;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// CLI error carrying exit code and message.
#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Scraper(#[from] ScraperError),

    #[error("{0}")]
    Epub(#[from] EpubError),
}

impl CliRunError {
    /// 1 input/config, 2 resolution, 3 retrieval, 4 page structure, 5 output.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) => 1,
            CliRunError::Scraper(e) => match e {
                ScraperError::InvalidWorkId { .. } => 1,
                ScraperError::MetadataSchema { .. }
                | ScraperError::IndexPageParse { .. }
                | ScraperError::IndexResolution { .. }
                | ScraperError::NoEpisodesInRange { .. } => 2,
                ScraperError::ContentStructure { .. } | ScraperError::InvalidSelector { .. } => 4,
                _ if e.is_retrieval() => 3,
                _ => 2,
            },
            CliRunError::Epub(_) => 5,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "naroudl", version)]
#[command(about = "Download a Shousetsuka ni Narou work and build an EPUB (personal use only)")]
#[command(
    after_help = "Config file keys (output_dir, user_agent, delay_secs, timeout_secs, retry, vertical, include_preface, include_afterword, ncx) are read from ./naroudl.toml or the user config directory. CLI flags override config."
)]
pub struct Args {
    /// Work ncode (e.g. n1234ab) or any work/episode URL.
    #[arg(value_name = "URL_OR_NCODE")]
    pub input: String,

    /// Output path. Default: {output_dir}/{ncode}.epub
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Minimum seconds between requests (default 1.0).
    #[arg(long)]
    pub delay: Option<f64>,

    /// Retries per request after the first attempt (default 3).
    #[arg(long)]
    pub retry: Option<u32>,

    /// Per-request timeout in seconds (default 20).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// First episode to include (1-based, inclusive).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub from_ep: Option<u32>,

    /// Last episode to include (1-based, inclusive).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub to_ep: Option<u32>,

    /// Drop author prefaces.
    #[arg(long)]
    pub no_preface: bool,

    /// Drop author afterwords.
    #[arg(long)]
    pub no_afterword: bool,

    /// Vertical writing (tategaki) with right-to-left page progression.
    #[arg(long)]
    pub vertical: bool,

    /// HTTP User-Agent (overrides config).
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Also write toc.ncx for legacy readers.
    #[arg(long)]
    pub ncx: bool,

    /// Resolve the episode list and print it without downloading episodes.
    #[arg(long)]
    pub dry_run: bool,

    /// With --dry-run, print the listing as JSON.
    #[arg(long, requires = "dry_run")]
    pub json: bool,

    /// Suppress progress output (errors only).
    #[arg(short, long)]
    pub quiet: bool,

    /// More log output and the full error chain (-vv for trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Options after merging CLI flags, config file, and defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub ncode: String,
    pub output_path: PathBuf,
    pub policy: FetchPolicy,
    pub range: EpisodeRange,
    pub include_preface: bool,
    pub include_afterword: bool,
    pub vertical: bool,
    pub ncx: bool,
}

/// CLI > config > defaults.
pub fn resolve_settings(args: &Args, config: Option<&Config>) -> Result<Settings, CliRunError> {
    let ncode = parse_work_id(&args.input)?;

    if let (Some(from), Some(to)) = (args.from_ep, args.to_ep) {
        if from > to {
            return Err(CliRunError::InvalidInput(format!(
                "Invalid episode range: --from-ep ({}) must be <= --to-ep ({})",
                from, to
            )));
        }
    }

    let delay_secs = args
        .delay
        .or_else(|| config.and_then(|c| c.delay_secs))
        .unwrap_or(DEFAULT_DELAY_SECS);
    let delay = Duration::try_from_secs_f64(delay_secs).map_err(|_| {
        CliRunError::InvalidInput(format!(
            "Invalid --delay: {} (expected a non-negative number of seconds)",
            delay_secs
        ))
    })?;
    let timeout_secs = args
        .timeout
        .or_else(|| config.and_then(|c| c.timeout_secs))
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(CliRunError::InvalidInput(
            "Invalid --timeout: must be at least 1 second".to_string(),
        ));
    }
    let retry_limit = args
        .retry
        .or_else(|| config.and_then(|c| c.retry))
        .unwrap_or(DEFAULT_RETRY_LIMIT);
    let user_agent = args
        .user_agent
        .clone()
        .or_else(|| config.and_then(|c| c.user_agent.clone()))
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

    let output_path = match &args.output {
        Some(p) => p.clone(),
        None => config
            .and_then(|c| c.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."))
            .join(format!("{}.epub", ncode)),
    };

    let flag_or = |flag: bool, key: Option<bool>| flag || key.unwrap_or(false);
    Ok(Settings {
        policy: FetchPolicy {
            timeout: Duration::from_secs(timeout_secs),
            retry_limit,
            delay,
            user_agent,
        },
        range: EpisodeRange::new(args.from_ep, args.to_ep),
        include_preface: !args.no_preface
            && config.and_then(|c| c.include_preface).unwrap_or(true),
        include_afterword: !args.no_afterword
            && config.and_then(|c| c.include_afterword).unwrap_or(true),
        vertical: flag_or(args.vertical, config.and_then(|c| c.vertical)),
        ncx: flag_or(args.ncx, config.and_then(|c| c.ncx)),
        output_path,
        ncode,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DryRunReport<'a> {
    metadata: &'a WorkMetadata,
    episodes: &'a [EpisodeDescriptor],
    output: &'a Path,
}

fn print_dry_run(
    metadata: &WorkMetadata,
    episodes: &[EpisodeDescriptor],
    output: &Path,
    json: bool,
) -> Result<(), CliRunError> {
    if json {
        let report = DryRunReport {
            metadata,
            episodes,
            output,
        };
        let s = serde_json::to_string_pretty(&report)
            .map_err(|e| CliRunError::InvalidInput(format!("Failed to encode listing: {}", e)))?;
        println!("{}", s);
        return Ok(());
    }
    println!("{} / {}", metadata.title, metadata.author);
    for d in episodes {
        println!("{:>5}  {}  {}", d.index, d.title, d.url);
    }
    eprintln!(
        "Episodes: {} of {}{}",
        episodes.len(),
        metadata.episode_count,
        if metadata.is_short_story { " (short story)" } else { "" }
    );
    eprintln!("Output: {}", output.display());
    Ok(())
}

/// Install the stderr log subscriber. `RUST_LOG` overrides the level picked from -q/-v.
pub fn init_tracing(args: &Args) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = match (args.quiet, args.verbose) {
        (true, 0) => "naroudl=error",
        (_, 0) => "naroudl=warn",
        (_, 1) => "naroudl=debug",
        _ => "naroudl=trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn progress_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::default_bar()
        .template("{spinner} {msg} [{bar:40}] {pos}/{len} ({elapsed})")
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .progress_chars("█▉▊▋▌▍▎▏ ")
}

/// Entry point for the CLI. Returns Ok(()) on success; Err with exit code and message on failure.
pub fn run(args: &Args) -> Result<(), CliRunError> {
    let config = config::load_config().map_err(CliRunError::InvalidInput)?;
    let settings = resolve_settings(args, config.as_ref())?;

    let mut client = PoliteClient::new()
        .map_err(|e| CliRunError::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

    if args.dry_run {
        let resolved = index::resolve(
            &settings.ncode,
            &mut client,
            &settings.policy,
            settings.range,
        )?;
        return print_dry_run(
            &resolved.metadata,
            &resolved.episodes,
            &settings.output_path,
            args.json,
        );
    }

    let progress_state: RefCell<Option<indicatif::ProgressBar>> = RefCell::new(None);
    let progress_cb = |n: u32, total: u32| {
        if total == 0 {
            return;
        }
        let mut state = progress_state.borrow_mut();
        let pb = state.get_or_insert_with(|| {
            let bar = indicatif::ProgressBar::new(total as u64);
            bar.set_style(progress_style());
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        });
        pb.set_position(n as u64);
        pb.set_message(format!("Fetching episode {}/{}", n, total));
    };

    let progress: Option<&dyn Fn(u32, u32)> = if args.quiet { None } else { Some(&progress_cb) };

    let options = DownloadOptions {
        policy: settings.policy.clone(),
        range: settings.range,
        include_preface: settings.include_preface,
        include_afterword: settings.include_afterword,
        progress,
    };
    let result = download_work(&settings.ncode, &mut client, &options);

    if let Some(pb) = progress_state.borrow_mut().take() {
        pb.disable_steady_tick();
        pb.finish_and_clear();
    }
    let work = result?;

    let epub_options = EpubOptions {
        vertical_writing: settings.vertical,
        include_ncx: settings.ncx,
        modified: chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string(),
        ..EpubOptions::default()
    };
    write_epub(
        &work.metadata,
        &work.episodes,
        &settings.output_path,
        &epub_options,
    )?;
    info!(requests = client.attempts(), "done");

    if !args.quiet {
        eprintln!("Wrote {}", settings.output_path.display());
    }
    Ok(())
}
