use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::discover::{dedupe_urls, discover_from_search, discover_from_sitemap};
use crate::error::RunAborted;
use crate::extract::RecordExtractor;
use crate::fetch::PageFetcher;
use crate::identity::IdentityRules;
use crate::merge::{merge, MergeReport};
use crate::pool::{run_pool, Baseline, PoolConfig, PoolStats};
use crate::record::Schema;
use crate::store::{load_or_empty, RecordStore};

/// Where the URLs of a run come from.
#[derive(Debug, Clone)]
pub enum UrlSource {
    List(Vec<String>),
    Search { url: String, link_selector: String },
    Sitemap { url: String, pattern: Option<String> },
}

pub struct Pipeline {
    pub store: Box<dyn RecordStore>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub extractor: Arc<dyn RecordExtractor>,
    pub schema: Arc<Schema>,
    pub rules: IdentityRules,
    pub pool: PoolConfig,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub urls_discovered: usize,
    pub pool: PoolStats,
    pub baseline_len: usize,
    pub final_len: usize,
    pub records_added: usize,
    /// Already stored (pre-check) plus repeated among the new records.
    pub duplicates_skipped: usize,
    pub merge: MergeReport,
}

impl RunReport {
    pub fn cancelled(&self) -> bool {
        self.pool.not_dispatched > 0
    }

    /// Discovery and store growth, printed after the summary line.
    pub fn store_summary(&self) -> String {
        format!(
            "{} URLs discovered ({} distinct); store went from {} to {} records",
            self.urls_discovered, self.pool.distinct_urls, self.baseline_len, self.final_len
        )
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} URLs processed, {} records added, {} duplicates skipped",
            self.pool.dispatched, self.records_added, self.duplicates_skipped
        )?;
        if self.pool.fetch_failures + self.pool.extraction_misses > 0 {
            write!(
                f,
                " ({} fetch failures, {} pages without a record)",
                self.pool.fetch_failures, self.pool.extraction_misses
            )?;
        }
        if self.merge.baseline_dropped() > 0 {
            write!(f, "; removed {} duplicates already in the store", self.merge.baseline_dropped())?;
        }
        if self.cancelled() {
            write!(f, "; cancelled with {} URLs not dispatched", self.pool.not_dispatched)?;
        }
        Ok(())
    }
}

impl Pipeline {
    /// load → discover → dedupe URLs → scrape → merge → persist.
    ///
    /// Only store failures abort. On a persist failure the merged dataset is
    /// returned inside the error and the stored content is left untouched.
    pub async fn run(&self, source: UrlSource, cancel: CancellationToken) -> Result<RunReport, RunAborted> {
        let started_at = Utc::now();

        let baseline = load_or_empty(self.store.as_ref(), &self.schema).map_err(RunAborted::Load)?;
        let baseline_len = baseline.len();

        let urls = self.discover(source).await;
        let urls_discovered = urls.len();
        let urls = dedupe_urls(urls);
        info!("{} URLs discovered, {} distinct", urls_discovered, urls.len());

        let snapshot = Arc::new(Baseline::new(&baseline, self.rules.clone()));
        let scraped = run_pool(
            urls,
            snapshot,
            Arc::clone(&self.fetcher),
            Arc::clone(&self.extractor),
            &self.pool,
            cancel,
        )
        .await;

        let outcome = merge(baseline, scraped.records, &self.rules, &self.pool.name_field);
        let report = outcome.report;
        let dataset = outcome.dataset;

        if let Err(source) = self.store.persist(&dataset) {
            return Err(RunAborted::Persist { source, dataset });
        }
        info!("Persisted {} records to {}", dataset.len(), self.store.locator());

        let baseline_kept = baseline_len - report.baseline_dropped();
        let new_dropped = report.duplicates_removed() - report.baseline_dropped();
        Ok(RunReport {
            started_at,
            finished_at: Utc::now(),
            urls_discovered,
            baseline_len,
            final_len: dataset.len(),
            records_added: dataset.len() - baseline_kept,
            duplicates_skipped: scraped.stats.baseline_duplicates + new_dropped,
            pool: scraped.stats,
            merge: report,
        })
    }

    async fn discover(&self, source: UrlSource) -> Vec<String> {
        let found = match source {
            UrlSource::List(urls) => Ok(urls),
            UrlSource::Search { url, link_selector } => {
                discover_from_search(self.fetcher.as_ref(), &url, &link_selector, self.pool.fetch_timeout).await
            }
            UrlSource::Sitemap { url, pattern } => {
                let client = reqwest::Client::new();
                discover_from_sitemap(&client, &url, pattern.as_deref()).await
            }
        };
        match found {
            Ok(urls) => urls,
            Err(e) => {
                warn!("URL discovery failed: {:#}", e);
                Vec::new()
            }
        }
    }
}
