use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::debug;

use super::{FetchSession, PageContent, PageFetcher};
use crate::error::FetchError;

/// Fetches rendered pages through the spider.cloud API.
pub struct SpiderFetcher {
    spider: Arc<Spider>,
}

impl SpiderFetcher {
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("SPIDER_API_KEY")
            .map_err(|_| anyhow::anyhow!("SPIDER_API_KEY environment variable must be set"))?;
        let spider = Spider::new(Some(api_key))
            .map_err(|e| anyhow::anyhow!("Failed to create Spider client: {}", e))?;
        Ok(SpiderFetcher {
            spider: Arc::new(spider),
        })
    }
}

#[async_trait]
impl PageFetcher for SpiderFetcher {
    async fn open(&self) -> Result<Box<dyn FetchSession>, FetchError> {
        Ok(Box::new(SpiderSession {
            spider: Arc::clone(&self.spider),
        }))
    }

    fn name(&self) -> &str {
        "spider"
    }
}

struct SpiderSession {
    spider: Arc<Spider>,
}

#[async_trait]
impl FetchSession for SpiderSession {
    async fn fetch(&mut self, url: &str, timeout: Duration) -> Result<PageContent, FetchError> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            ..Default::default()
        };

        let start = Instant::now();
        let response = tokio::time::timeout(
            timeout,
            self.spider.scrape_url(url, Some(params), "application/json"),
        )
        .await
        .map_err(|_| FetchError::Timeout)?
        .map_err(|e| FetchError::Network(e.to_string()))?;
        debug!(url, latency_ms = start.elapsed().as_millis() as u64, "spider response");

        let parsed: serde_json::Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };
        let first = parsed.as_array().and_then(|arr| arr.first());

        let status = first
            .and_then(|obj| obj.get("status"))
            .and_then(|s| s.as_i64());
        if status == Some(404) {
            return Err(FetchError::NotFound);
        }

        let body = first
            .and_then(|obj| obj.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| FetchError::Network("no content in spider response".into()))?;

        Ok(PageContent {
            url: url.to_string(),
            body: body.to_string(),
        })
    }
}
