//! Scripted fetcher and extractor shared by the scheduler and pipeline tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{ExtractionMiss, FetchError};
use crate::extract::RecordExtractor;
use crate::fetch::{FetchSession, PageContent, PageFetcher};
use crate::record::{Record, Schema};

#[derive(Clone)]
enum Script {
    Page { body: String, latency: Duration },
    Fail(FetchError),
}

#[derive(Default)]
pub struct Gauges {
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub open_sessions: AtomicUsize,
    pub sessions_opened: AtomicUsize,
    pub fetches: AtomicUsize,
    pub completed: Mutex<Vec<String>>,
}

/// Serves canned bodies with simulated latency and tracks concurrency.
#[derive(Clone, Default)]
pub struct ScriptedFetcher {
    scripts: HashMap<String, Script>,
    pub gauges: Arc<Gauges>,
    cancel_on: Option<(String, CancellationToken)>,
    open_delay: Duration,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Body format understood by `PipeExtractor`: `name|phone|mobile`, empty
    /// parts are absent.
    pub fn page(mut self, url: &str, body: &str, latency_ms: u64) -> Self {
        self.scripts.insert(
            url.to_string(),
            Script::Page {
                body: body.to_string(),
                latency: Duration::from_millis(latency_ms),
            },
        );
        self
    }

    pub fn failing(mut self, url: &str, error: FetchError) -> Self {
        self.scripts.insert(url.to_string(), Script::Fail(error));
        self
    }

    /// Every `open` sleeps this long before handing out a session.
    pub fn slow_open(mut self, delay_ms: u64) -> Self {
        self.open_delay = Duration::from_millis(delay_ms);
        self
    }

    /// Trigger `token` while fetching `url`.
    pub fn cancel_on(mut self, url: &str, token: CancellationToken) -> Self {
        self.cancel_on = Some((url.to_string(), token));
        self
    }
}

struct ScriptedSession {
    fetcher: ScriptedFetcher,
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.fetcher.gauges.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn open(&self) -> Result<Box<dyn FetchSession>, FetchError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        self.gauges.open_sessions.fetch_add(1, Ordering::SeqCst);
        self.gauges.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            fetcher: self.clone(),
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[async_trait]
impl FetchSession for ScriptedSession {
    async fn fetch(&mut self, url: &str, _timeout: Duration) -> Result<PageContent, FetchError> {
        let g = &self.fetcher.gauges;
        g.fetches.fetch_add(1, Ordering::SeqCst);
        let now = g.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        g.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some((target, token)) = &self.fetcher.cancel_on {
            if target == url {
                token.cancel();
            }
        }

        let result = match self.fetcher.scripts.get(url).cloned() {
            Some(Script::Page { body, latency }) => {
                tokio::time::sleep(latency).await;
                Ok(PageContent {
                    url: url.to_string(),
                    body,
                })
            }
            Some(Script::Fail(e)) => Err(e),
            None => Err(FetchError::NotFound),
        };

        g.in_flight.fetch_sub(1, Ordering::SeqCst);
        g.completed.lock().unwrap().push(url.to_string());
        result
    }
}

/// Parses `name|phone|mobile` bodies.
pub struct PipeExtractor {
    pub schema: Arc<Schema>,
}

impl RecordExtractor for PipeExtractor {
    fn extract(&self, page: &PageContent) -> Result<Record, ExtractionMiss> {
        let parts: Vec<&str> = page.body.split('|').collect();
        if parts.len() != 3 {
            return Err(ExtractionMiss::Unparseable(page.body.clone()));
        }
        let opt = |s: &'static str, v: &str| (s, if v.is_empty() { None } else { Some(v.to_string()) });
        let mut record = Record::empty(&self.schema);
        for (field, value) in [opt("Name", parts[0]), opt("Phone", parts[1]), opt("Mobile", parts[2])] {
            record.set(field, value);
        }
        Ok(record)
    }
}
