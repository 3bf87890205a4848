//! Scripted in-memory transport and virtual clock for testing.
//!
//! Both types are cheap handles over shared state, so a test keeps one clone for
//! assertions and hands another to [PoliteClient](crate::scraper::PoliteClient).

use crate::scraper::client::{Clock, HttpResponse, Transport, TransportError, TransportErrorKind};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Clock whose `sleep` advances virtual time instantly.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    base: Instant,
    elapsed: Rc<Cell<Duration>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            elapsed: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    /// Virtual time since creation.
    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed.get()
    }

    fn sleep(&self, duration: Duration) {
        self.elapsed.set(self.elapsed.get() + duration);
    }
}

/// One request seen by [MockTransport].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub url: String,
    pub user_agent: Option<String>,
    /// Virtual time of the call; zero when no clock is attached.
    pub at: Duration,
}

type Scripted = Result<HttpResponse, TransportError>;

#[derive(Debug, Default)]
struct MockState {
    routes: HashMap<String, VecDeque<Scripted>>,
    calls: Vec<MockCall>,
}

/// Transport answering from per-URL response queues.
///
/// Each queued response is used once, except the last one for a URL, which repeats.
/// Unknown URLs answer 404 with an empty body.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
    clock: Option<VirtualClock>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record call times against `clock`.
    pub fn with_clock(clock: &VirtualClock) -> Self {
        Self {
            state: Rc::default(),
            clock: Some(clock.clone()),
        }
    }

    /// Queue a response for `url`.
    pub fn respond(&self, url: &str, status: u16, body: &str) -> &Self {
        self.push(
            url,
            Ok(HttpResponse {
                status,
                body: body.to_string(),
            }),
        )
    }

    /// Queue a transport failure for `url`.
    pub fn fail(&self, url: &str, kind: TransportErrorKind, message: &str) -> &Self {
        self.push(url, Err(TransportError::new(kind, message)))
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.borrow().calls.clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|c| c.url == url)
            .count()
    }

    fn push(&self, url: &str, scripted: Scripted) -> &Self {
        self.state
            .borrow_mut()
            .routes
            .entry(url.to_string())
            .or_default()
            .push_back(scripted);
        self
    }
}

impl Transport for MockTransport {
    fn get(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        _timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(MockCall {
            url: url.to_string(),
            user_agent: headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
                .map(|(_, value)| value.to_string()),
            at: self.clock.as_ref().map_or(Duration::ZERO, |c| c.elapsed()),
        });
        match state.routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(not_found),
            Some(queue) => queue.front().cloned().unwrap_or_else(not_found),
            None => not_found(),
        }
    }
}

fn not_found() -> Scripted {
    Ok(HttpResponse {
        status: 404,
        body: String::new(),
    })
}
