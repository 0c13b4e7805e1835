use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{FetchSession, PageContent, PageFetcher};
use crate::error::FetchError;

/// Plain HTTP GET. Sessions share the client's connection pool.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn open(&self) -> Result<Box<dyn FetchSession>, FetchError> {
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
        }))
    }

    fn name(&self) -> &str {
        "http"
    }
}

struct HttpSession {
    client: reqwest::Client,
}

#[async_trait]
impl FetchSession for HttpSession {
    async fn fetch(&mut self, url: &str, timeout: Duration) -> Result<PageContent, FetchError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        Ok(PageContent {
            url: url.to_string(),
            body,
        })
    }
}
