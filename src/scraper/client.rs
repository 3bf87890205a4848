//! Blocking HTTP fetcher with a courtesy delay between requests and classified retries.
//!
//! Pacing and retry settings travel with each call in a [FetchPolicy]; the client only
//! remembers when its previous request finished.

use crate::scraper::error::ScraperError;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const DEFAULT_USER_AGENT: &str = concat!("naroudl/", env!("CARGO_PKG_VERSION"), " (personal-use)");
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_DELAY_SECS: f64 = 1.0;
pub const DEFAULT_RETRY_LIMIT: u32 = 3;
const MAX_REDIRECTS: usize = 10;

/// First backoff step; doubles per retry up to [BACKOFF_CAP].
const BASE_BACKOFF: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Rate-limit (HTTP 429) backoff grows linearly in these steps up to [RATE_LIMIT_CAP].
const RATE_LIMIT_STEP: Duration = Duration::from_secs(10);
const RATE_LIMIT_CAP: Duration = Duration::from_secs(120);

/// Per-call retrieval settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPolicy {
    pub timeout: Duration,
    /// Additional attempts after the first one for retryable failures.
    pub retry_limit: u32,
    /// Minimum spacing between the end of one request and the start of the next.
    pub delay: Duration,
    pub user_agent: String,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry_limit: DEFAULT_RETRY_LIMIT,
            delay: Duration::from_secs_f64(DEFAULT_DELAY_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Raw response from the transport. Any status code is a response, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    /// Response started but the body could not be read.
    Body,
    /// Anything else (bad URL, redirect loop, TLS setup).
    Other,
}

/// Failure below the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, TransportErrorKind::Other)
    }

    fn from_reqwest(e: &reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if e.is_connect() || e.is_request() {
            TransportErrorKind::Connect
        } else if e.is_body() || e.is_decode() {
            TransportErrorKind::Body
        } else {
            TransportErrorKind::Other
        };
        Self::new(kind, e.to_string())
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// HTTP GET capability. Connection pooling and TLS belong to the implementation.
pub trait Transport {
    fn get(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError>;
}

/// Time source used for pacing. Tests substitute a virtual clock.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// [Transport] over a blocking reqwest client with a cookie jar and bounded redirects.
#[derive(Debug)]
pub struct ReqwestTransport {
    inner: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let inner = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self { inner })
    }
}

impl Transport for ReqwestTransport {
    fn get(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let mut request = self.inner.get(url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request
            .send()
            .map_err(|e| TransportError::from_reqwest(&e))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| TransportError::new(TransportErrorKind::Body, e.to_string()))?;
        Ok(HttpResponse { status, body })
    }
}

/// Why an attempt (or a whole fetch) failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Transport(TransportError),
    Status(u16),
    /// Retry budget spent; carries the last retryable reason.
    Exhausted {
        attempts: u32,
        last: Box<FailureReason>,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Transport(e) => write!(f, "{}", e),
            FailureReason::Status(s) => write!(f, "HTTP {}", s),
            FailureReason::Exhausted { attempts, last } => {
                write!(f, "{} after {} attempt(s)", last, attempts)
            }
        }
    }
}

/// Result of one attempt, or of a whole [PoliteClient::fetch] (which never yields `RetryableFailure`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrievalOutcome {
    Success(String),
    RetryableFailure(FailureReason),
    FatalFailure(FailureReason),
}

/// Classify a status code. 2xx succeeds, 429 and 5xx are worth retrying, everything else is final.
pub fn classify_response(response: HttpResponse) -> RetrievalOutcome {
    match response.status {
        200..=299 => RetrievalOutcome::Success(response.body),
        429 | 500..=599 => RetrievalOutcome::RetryableFailure(FailureReason::Status(response.status)),
        s => RetrievalOutcome::FatalFailure(FailureReason::Status(s)),
    }
}

/// Wait before retry number `retry` (1-based). Never shorter than the courtesy delay.
pub fn backoff_for(reason: &FailureReason, retry: u32, delay: Duration) -> Duration {
    let retry = retry.max(1);
    let step = match reason {
        FailureReason::Status(429) => RATE_LIMIT_STEP.saturating_mul(retry).min(RATE_LIMIT_CAP),
        _ => BASE_BACKOFF
            .saturating_mul(1u32 << (retry - 1).min(16))
            .min(BACKOFF_CAP),
    };
    step.max(delay)
}

/// Fetcher that paces every attempt and retries transient failures.
pub struct PoliteClient {
    transport: Box<dyn Transport>,
    clock: Box<dyn Clock>,
    last_request: Option<Instant>,
    attempts: u64,
}

impl fmt::Debug for PoliteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoliteClient")
            .field("last_request", &self.last_request)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl PoliteClient {
    /// Reqwest transport and the system clock.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::builder().build()
    }

    pub fn builder() -> PoliteClientBuilder {
        PoliteClientBuilder::default()
    }

    /// Total attempts issued by this client so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// One paced attempt, classified. No retry.
    pub fn attempt(&mut self, url: &str, policy: &FetchPolicy) -> RetrievalOutcome {
        self.wait_delay(policy.delay);
        self.attempts += 1;
        debug!(url, attempt = self.attempts, "GET");
        let headers = [
            ("User-Agent", policy.user_agent.as_str()),
            ("Accept-Language", "ja,en;q=0.5"),
        ];
        let result = self.transport.get(url, &headers, policy.timeout);
        self.last_request = Some(self.clock.now());
        match result {
            Ok(response) => classify_response(response),
            Err(e) if e.is_retryable() => RetrievalOutcome::RetryableFailure(FailureReason::Transport(e)),
            Err(e) => RetrievalOutcome::FatalFailure(FailureReason::Transport(e)),
        }
    }

    /// Fetch with up to `policy.retry_limit` retries. Returns `Success` or `FatalFailure`.
    pub fn fetch(&mut self, url: &str, policy: &FetchPolicy) -> RetrievalOutcome {
        let max_attempts = policy.retry_limit.saturating_add(1);
        let mut attempt = 1u32;
        loop {
            match self.attempt(url, policy) {
                RetrievalOutcome::RetryableFailure(reason) => {
                    if attempt >= max_attempts {
                        warn!(url, attempts = attempt, %reason, "retry budget exhausted");
                        return RetrievalOutcome::FatalFailure(FailureReason::Exhausted {
                            attempts: attempt,
                            last: Box::new(reason),
                        });
                    }
                    let wait = backoff_for(&reason, attempt, policy.delay);
                    warn!(url, attempt, %reason, wait_ms = wait.as_millis() as u64, "transient failure, retrying");
                    self.clock.sleep(wait);
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    /// [fetch](Self::fetch) mapped onto [ScraperError].
    pub fn fetch_text(&mut self, url: &str, policy: &FetchPolicy) -> Result<String, ScraperError> {
        match self.fetch(url, policy) {
            RetrievalOutcome::Success(body) => Ok(body),
            RetrievalOutcome::FatalFailure(reason) | RetrievalOutcome::RetryableFailure(reason) => {
                Err(failure_to_error(url, reason))
            }
        }
    }

    fn wait_delay(&self, delay: Duration) {
        if let Some(last) = self.last_request {
            let elapsed = self.clock.now().saturating_duration_since(last);
            if elapsed < delay {
                self.clock.sleep(delay - elapsed);
            }
        }
    }
}

fn failure_to_error(url: &str, reason: FailureReason) -> ScraperError {
    let url = url.to_string();
    match reason {
        FailureReason::Status(status @ (404 | 410)) => ScraperError::SourceNotFound { status, url },
        FailureReason::Status(403) => ScraperError::AccessBlocked { url },
        FailureReason::Status(status) => ScraperError::HttpStatus { status, url },
        FailureReason::Transport(e) => ScraperError::Transport {
            url,
            reason: e.to_string(),
        },
        FailureReason::Exhausted { attempts, last } => ScraperError::RetriesExhausted {
            url,
            attempts,
            reason: last.to_string(),
        },
    }
}

/// Builder for [PoliteClient]; swaps in a custom transport or clock.
#[derive(Default)]
pub struct PoliteClientBuilder {
    transport: Option<Box<dyn Transport>>,
    clock: Option<Box<dyn Clock>>,
}

impl PoliteClientBuilder {
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    /// Build the client. Falls back to [ReqwestTransport] and [SystemClock].
    pub fn build(self) -> Result<PoliteClient, reqwest::Error> {
        let transport = match self.transport {
            Some(t) => t,
            None => Box::new(ReqwestTransport::new()?),
        };
        Ok(PoliteClient {
            transport,
            clock: self.clock.unwrap_or_else(|| Box::new(SystemClock)),
            last_request: None,
            attempts: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::mock::{MockTransport, VirtualClock};

    const URL: &str = "https://ncode.syosetu.com/n0001aa/1/";

    fn client(transport: &MockTransport, clock: &VirtualClock) -> PoliteClient {
        PoliteClient::builder()
            .transport(transport.clone())
            .clock(clock.clone())
            .build()
            .expect("mock transport needs no reqwest client")
    }

    fn policy(retry_limit: u32, delay_ms: u64) -> FetchPolicy {
        FetchPolicy {
            retry_limit,
            delay: Duration::from_millis(delay_ms),
            ..FetchPolicy::default()
        }
    }

    #[test]
    fn first_request_is_not_delayed_later_ones_are() {
        let clock = VirtualClock::new();
        let transport = MockTransport::with_clock(&clock);
        transport.respond(URL, 200, "a");
        let mut c = client(&transport, &clock);
        let p = policy(0, 1000);
        assert_eq!(c.fetch(URL, &p), RetrievalOutcome::Success("a".into()));
        assert_eq!(c.fetch(URL, &p), RetrievalOutcome::Success("a".into()));
        let calls = transport.calls();
        assert_eq!(calls[0].at, Duration::ZERO);
        assert_eq!(calls[1].at, Duration::from_millis(1000));
    }

    #[test]
    fn retry_exhaustion_makes_n_plus_one_spaced_attempts() {
        let clock = VirtualClock::new();
        let transport = MockTransport::with_clock(&clock);
        transport.respond(URL, 503, "");
        let mut c = client(&transport, &clock);
        let p = policy(3, 1000);
        let outcome = c.fetch(URL, &p);
        match outcome {
            RetrievalOutcome::FatalFailure(FailureReason::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(*last, FailureReason::Status(503));
            }
            other => panic!("expected exhausted failure, got {:?}", other),
        }
        let calls = transport.calls();
        assert_eq!(calls.len(), 4);
        for pair in calls.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(1000));
        }
    }

    #[test]
    fn backoff_grows_and_never_drops_below_delay() {
        let delay = Duration::from_secs(1);
        let reason = FailureReason::Status(500);
        let waits: Vec<Duration> = (1..=8).map(|r| backoff_for(&reason, r, delay)).collect();
        assert!(waits.iter().all(|w| *w >= delay));
        assert!(waits.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(waits[0], delay);
        assert_eq!(waits[2], Duration::from_secs(2));
        assert_eq!(waits[7], BACKOFF_CAP);
        let big_delay = Duration::from_secs(90);
        assert_eq!(backoff_for(&reason, 8, big_delay), big_delay);
    }

    #[test]
    fn rate_limit_backs_off_longer() {
        let delay = Duration::from_secs(1);
        assert_eq!(
            backoff_for(&FailureReason::Status(429), 2, delay),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn not_found_is_fatal_without_retry() {
        let clock = VirtualClock::new();
        let transport = MockTransport::with_clock(&clock);
        transport.respond(URL, 404, "");
        let mut c = client(&transport, &clock);
        let err = c.fetch_text(URL, &policy(5, 10)).unwrap_err();
        assert!(matches!(err, ScraperError::SourceNotFound { status: 404, .. }));
        assert_eq!(transport.call_count(URL), 1);
    }

    #[test]
    fn bad_request_is_fatal_without_retry() {
        let clock = VirtualClock::new();
        let transport = MockTransport::with_clock(&clock);
        transport.respond(URL, 400, "");
        let mut c = client(&transport, &clock);
        let err = c.fetch_text(URL, &policy(5, 10)).unwrap_err();
        assert!(matches!(err, ScraperError::HttpStatus { status: 400, .. }));
        assert_eq!(transport.call_count(URL), 1);
    }

    #[test]
    fn transient_failure_then_success() {
        let clock = VirtualClock::new();
        let transport = MockTransport::with_clock(&clock);
        transport.fail(URL, TransportErrorKind::Timeout, "timed out");
        transport.respond(URL, 429, "");
        transport.respond(URL, 200, "body");
        let mut c = client(&transport, &clock);
        assert_eq!(c.fetch_text(URL, &policy(3, 100)).unwrap(), "body");
        assert_eq!(transport.call_count(URL), 3);
        assert_eq!(c.attempts(), 3);
    }

    #[test]
    fn non_retryable_transport_error_is_fatal() {
        let clock = VirtualClock::new();
        let transport = MockTransport::with_clock(&clock);
        transport.fail(URL, TransportErrorKind::Other, "builder error");
        let mut c = client(&transport, &clock);
        let err = c.fetch_text(URL, &policy(3, 100)).unwrap_err();
        assert!(matches!(err, ScraperError::Transport { .. }));
        assert_eq!(transport.call_count(URL), 1);
    }

    #[test]
    fn exhaustion_maps_to_retries_exhausted_with_url() {
        let clock = VirtualClock::new();
        let transport = MockTransport::with_clock(&clock);
        transport.fail(URL, TransportErrorKind::Connect, "refused");
        let mut c = client(&transport, &clock);
        match c.fetch_text(URL, &policy(2, 100)) {
            Err(ScraperError::RetriesExhausted { url, attempts, reason }) => {
                assert_eq!(url, URL);
                assert_eq!(attempts, 3);
                assert!(reason.contains("refused"));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[test]
    fn user_agent_is_sent_on_every_attempt() {
        let clock = VirtualClock::new();
        let transport = MockTransport::with_clock(&clock);
        transport.respond(URL, 500, "");
        transport.respond(URL, 200, "ok");
        let mut c = client(&transport, &clock);
        let p = FetchPolicy {
            user_agent: "custom-agent/2".to_string(),
            ..policy(1, 0)
        };
        c.fetch_text(URL, &p).unwrap();
        assert!(transport
            .calls()
            .iter()
            .all(|call| call.user_agent.as_deref() == Some("custom-agent/2")));
    }
}
