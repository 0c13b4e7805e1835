mod http;
mod spider;

pub use http::HttpFetcher;
pub use spider::SpiderFetcher;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use crate::config::{FetcherKind, Settings};
use crate::error::FetchError;

/// Raw page as returned by a fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContent {
    pub url: String,
    pub body: String,
}

/// One acquired fetch capability (an HTTP client handle, a rendering
/// session, ...). Owned by a single work item and released on drop.
#[async_trait]
pub trait FetchSession: Send {
    async fn fetch(&mut self, url: &str, timeout: Duration) -> Result<PageContent, FetchError>;
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn open(&self) -> Result<Box<dyn FetchSession>, FetchError>;
    fn name(&self) -> &str;
}

/// Open a session, fetch one page, release the session.
pub async fn fetch_once(
    fetcher: &dyn PageFetcher,
    url: &str,
    timeout: Duration,
) -> Result<PageContent, FetchError> {
    let mut session = fetcher.open().await?;
    session.fetch(url, timeout).await
}

/// Build the configured fetcher, wrapped in a retry policy when enabled.
pub fn build_fetcher(settings: &Settings) -> Result<Arc<dyn PageFetcher>> {
    let base: Arc<dyn PageFetcher> = match settings.fetcher {
        FetcherKind::Http => Arc::new(HttpFetcher::new(&settings.user_agent)?),
        FetcherKind::Spider => Arc::new(SpiderFetcher::from_env()?),
    };
    if settings.max_retries == 0 {
        return Ok(base);
    }
    Ok(Arc::new(RetryingFetcher::new(
        base,
        settings.max_retries,
        Duration::from_millis(settings.retry_backoff_ms),
    )))
}

/// Retries transient failures with exponential backoff. A policy layered on
/// top of a fetcher; the scheduler itself never retries.
pub struct RetryingFetcher {
    inner: Arc<dyn PageFetcher>,
    max_retries: u32,
    base_backoff: Duration,
}

impl RetryingFetcher {
    pub fn new(inner: Arc<dyn PageFetcher>, max_retries: u32, base_backoff: Duration) -> Self {
        RetryingFetcher {
            inner,
            max_retries,
            base_backoff,
        }
    }
}

#[async_trait]
impl PageFetcher for RetryingFetcher {
    async fn open(&self) -> Result<Box<dyn FetchSession>, FetchError> {
        Ok(Box::new(RetryingSession {
            inner: self.inner.open().await?,
            max_retries: self.max_retries,
            base_backoff: self.base_backoff,
        }))
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

struct RetryingSession {
    inner: Box<dyn FetchSession>,
    max_retries: u32,
    base_backoff: Duration,
}

#[async_trait]
impl FetchSession for RetryingSession {
    async fn fetch(&mut self, url: &str, timeout: Duration) -> Result<PageContent, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.fetch(url, timeout).await {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let backoff = self.base_backoff * 2u32.saturating_pow(attempt);
                    warn!(
                        "{} on {} (attempt {}/{}), backing off {:.1}s",
                        e,
                        url,
                        attempt + 1,
                        self.max_retries,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: Arc<AtomicU32>,
        fail_first: u32,
        error: FetchError,
    }

    struct FlakySession {
        calls: Arc<AtomicU32>,
        fail_first: u32,
        error: FetchError,
    }

    #[async_trait]
    impl PageFetcher for Flaky {
        async fn open(&self) -> Result<Box<dyn FetchSession>, FetchError> {
            Ok(Box::new(FlakySession {
                calls: Arc::clone(&self.calls),
                fail_first: self.fail_first,
                error: self.error.clone(),
            }))
        }
        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[async_trait]
    impl FetchSession for FlakySession {
        async fn fetch(&mut self, url: &str, _: Duration) -> Result<PageContent, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(self.error.clone())
            } else {
                Ok(PageContent {
                    url: url.to_string(),
                    body: "ok".into(),
                })
            }
        }
    }

    fn flaky(fail_first: u32, error: FetchError) -> (Arc<dyn PageFetcher>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let f = Flaky {
            calls: Arc::clone(&calls),
            fail_first,
            error,
        };
        (Arc::new(f), calls)
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let (inner, calls) = flaky(2, FetchError::Timeout);
        let retrying = RetryingFetcher::new(inner, 3, Duration::from_millis(1));
        let page = fetch_once(&retrying, "http://a", Duration::from_secs(1)).await.unwrap();
        assert_eq!(page.body, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (inner, calls) = flaky(10, FetchError::Network("reset".into()));
        let retrying = RetryingFetcher::new(inner, 2, Duration::from_millis(1));
        let err = fetch_once(&retrying, "http://a", Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, FetchError::Network("reset".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let (inner, calls) = flaky(10, FetchError::NotFound);
        let retrying = RetryingFetcher::new(inner, 5, Duration::from_millis(1));
        let err = fetch_once(&retrying, "http://a", Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, FetchError::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
