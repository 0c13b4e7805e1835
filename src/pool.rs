use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discover::dedupe_urls;
use crate::error::FetchError;
use crate::extract::{require_name, RecordExtractor};
use crate::fetch::PageFetcher;
use crate::identity::{IdentityRules, KeyIndex};
use crate::record::{Dataset, Record};

/// Identity lookup over the dataset as it was before scraping started.
/// Built once, shared read-only by every worker.
pub struct Baseline {
    index: KeyIndex,
}

impl Baseline {
    pub fn new(dataset: &Dataset, rules: IdentityRules) -> Self {
        Baseline {
            index: KeyIndex::build(rules, dataset.records()),
        }
    }

    /// Row of the baseline record `candidate` collides with.
    pub fn find(&self, candidate: &Record) -> Option<usize> {
        self.index.find(candidate)
    }
}

/// One URL to scrape plus the snapshot used for the duplicate pre-check.
pub struct WorkItem {
    pub url: String,
    pub baseline: Arc<Baseline>,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub name_field: String,
    pub show_progress: bool,
}

#[derive(Debug)]
enum Outcome {
    Collected(Record),
    Duplicate,
    FetchFailed,
    Missed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub distinct_urls: usize,
    pub dispatched: usize,
    pub collected: usize,
    pub baseline_duplicates: usize,
    pub fetch_failures: usize,
    pub extraction_misses: usize,
    /// URLs never dispatched because the run was cancelled.
    pub not_dispatched: usize,
}

/// Records in the order their work items completed.
pub struct PoolResult {
    pub records: Vec<Record>,
    pub stats: PoolStats,
}

/// Fetch and extract every distinct URL with at most `concurrency` items in
/// flight. Returns once every dispatched item has finished. Failures are
/// counted, never retried, never propagated.
pub async fn run_pool(
    urls: Vec<String>,
    baseline: Arc<Baseline>,
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<dyn RecordExtractor>,
    config: &PoolConfig,
    cancel: CancellationToken,
) -> PoolResult {
    let urls = dedupe_urls(urls);
    let total = urls.len();
    let concurrency = config.concurrency.max(1);

    let pb = if config.show_progress {
        ProgressBar::new(total as u64)
    } else {
        ProgressBar::hidden()
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    let semaphore = Arc::new(Semaphore::new(concurrency));
    // Workers send outcomes, this task is the only one that touches `records`
    let (tx, mut rx) = mpsc::channel::<Outcome>(concurrency * 2);

    let dispatcher = {
        let fetcher = Arc::clone(&fetcher);
        let extractor = Arc::clone(&extractor);
        let config = config.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut dispatched = 0usize;
            for url in urls {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };
                if cancel.is_cancelled() {
                    break;
                }

                dispatched += 1;
                let item = WorkItem {
                    url,
                    baseline: Arc::clone(&baseline),
                };
                let fetcher = Arc::clone(&fetcher);
                let extractor = Arc::clone(&extractor);
                let config = config.clone();
                let tx = tx.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    let outcome = process(item, fetcher.as_ref(), extractor.as_ref(), &config).await;
                    let _ = tx.send(outcome).await;
                });
            }
            dispatched
        })
    };

    let mut records = Vec::new();
    let mut stats = PoolStats {
        distinct_urls: total,
        ..PoolStats::default()
    };
    let mut received = 0usize;

    // Closes once the dispatcher and every worker have dropped their sender
    while let Some(outcome) = rx.recv().await {
        received += 1;
        match outcome {
            Outcome::Collected(record) => {
                stats.collected += 1;
                records.push(record);
            }
            Outcome::Duplicate => stats.baseline_duplicates += 1,
            Outcome::FetchFailed => stats.fetch_failures += 1,
            Outcome::Missed => stats.extraction_misses += 1,
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    stats.dispatched = match dispatcher.await {
        Ok(n) => n,
        Err(e) => {
            warn!("Dispatcher failed: {}", e);
            received
        }
    };
    if received < stats.dispatched {
        warn!("{} work items ended without reporting", stats.dispatched - received);
    }
    stats.not_dispatched = total - stats.dispatched;
    if stats.not_dispatched > 0 {
        info!("Cancelled: {} URLs were not dispatched", stats.not_dispatched);
    }

    info!(
        "Scraped {} URLs ({} collected, {} already stored, {} fetch errors, {} misses)",
        stats.dispatched,
        stats.collected,
        stats.baseline_duplicates,
        stats.fetch_failures,
        stats.extraction_misses
    );

    PoolResult { records, stats }
}

async fn process(
    item: WorkItem,
    fetcher: &dyn PageFetcher,
    extractor: &dyn RecordExtractor,
    config: &PoolConfig,
) -> Outcome {
    // One deadline covers acquiring the session and fetching with it.
    // `session` is released at the end of the block whatever happened.
    let fetched = tokio::time::timeout(config.fetch_timeout, async {
        let mut session = match fetcher.open().await {
            Ok(s) => s,
            Err(e) => return Err(e),
        };
        session.fetch(&item.url, config.fetch_timeout).await
    })
    .await
    .unwrap_or(Err(FetchError::Timeout));
    let page = match fetched {
        Ok(page) => page,
        Err(e) => {
            warn!("Fetch failed for {} via {}: {}", item.url, fetcher.name(), e);
            return Outcome::FetchFailed;
        }
    };

    let record = match extractor
        .extract(&page)
        .and_then(|r| require_name(r, &config.name_field))
    {
        Ok(r) => r,
        Err(miss) => {
            debug!("No record from {}: {}", item.url, miss);
            return Outcome::Missed;
        }
    };

    if let Some(row) = item.baseline.find(&record) {
        debug!("{} already stored at row {}", item.url, row);
        return Outcome::Duplicate;
    }
    Outcome::Collected(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::identity::DedupStrategy;
    use crate::record::{person, test_schema};
    use crate::testing::{PipeExtractor, ScriptedFetcher};

    fn config(concurrency: usize) -> PoolConfig {
        PoolConfig {
            concurrency,
            fetch_timeout: Duration::from_secs(5),
            name_field: "Name".into(),
            show_progress: false,
        }
    }

    fn rules() -> IdentityRules {
        IdentityRules::new(DedupStrategy::Tuple, ["Phone", "Mobile"])
    }

    fn empty_baseline() -> Arc<Baseline> {
        Arc::new(Baseline::new(&Dataset::new(test_schema()), rules()))
    }

    fn extractor() -> Arc<dyn RecordExtractor> {
        Arc::new(PipeExtractor { schema: test_schema() })
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let latencies = [40, 5, 25, 60, 10];
        let mut fetcher = ScriptedFetcher::new();
        let mut list = Vec::new();
        for (i, ms) in latencies.iter().enumerate() {
            let url = format!("https://example.test/{}", i);
            fetcher = fetcher.page(&url, &format!("N{}|{}|", i, i), *ms);
            list.push(url);
        }
        let gauges = Arc::clone(&fetcher.gauges);

        let result = run_pool(
            list,
            empty_baseline(),
            Arc::new(fetcher),
            extractor(),
            &config(2),
            CancellationToken::new(),
        )
        .await;

        assert!(gauges.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(gauges.fetches.load(Ordering::SeqCst), 5);
        assert_eq!(result.stats.dispatched, 5);
        assert_eq!(result.records.len(), 5);
    }

    #[tokio::test]
    async fn failures_and_misses_do_not_stop_the_run() {
        let fetcher = ScriptedFetcher::new()
            .page("a", "A|1|", 5)
            .failing("b", FetchError::Timeout)
            .page("c", "|2|", 5)
            .page("d", "garbage", 5)
            .failing("e", FetchError::Network("reset".into()));
        let gauges = Arc::clone(&fetcher.gauges);

        let result = run_pool(
            urls(&["a", "b", "c", "d", "e", "missing"]),
            empty_baseline(),
            Arc::new(fetcher),
            extractor(),
            &config(3),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(result.records.len(), 1);
        assert_eq!(result.stats.fetch_failures, 3);
        assert_eq!(result.stats.extraction_misses, 2);
        assert_eq!(gauges.sessions_opened.load(Ordering::SeqCst), 6);
        assert_eq!(gauges.open_sessions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hanging_session_open_times_out() {
        let fetcher = ScriptedFetcher::new()
            .slow_open(10_000)
            .page("a", "A|1|", 1);
        let gauges = Arc::clone(&fetcher.gauges);
        let mut cfg = config(1);
        cfg.fetch_timeout = Duration::from_millis(50);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            run_pool(
                urls(&["a"]),
                empty_baseline(),
                Arc::new(fetcher),
                extractor(),
                &cfg,
                CancellationToken::new(),
            ),
        )
        .await
        .expect("pool slot stayed held by a hanging open");

        assert_eq!(result.stats.fetch_failures, 1);
        assert!(result.records.is_empty());
        assert_eq!(gauges.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(gauges.open_sessions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_urls_are_fetched_once() {
        let fetcher = ScriptedFetcher::new().page("a", "A|1|", 1).page("b", "B|2|", 1);
        let gauges = Arc::clone(&fetcher.gauges);

        let result = run_pool(
            urls(&["a", "b", "a", "a", "b"]),
            empty_baseline(),
            Arc::new(fetcher),
            extractor(),
            &config(4),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(gauges.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(result.stats.distinct_urls, 2);
        assert_eq!(result.records.len(), 2);
    }

    #[tokio::test]
    async fn baseline_collisions_are_discarded_but_new_ones_kept() {
        let schema = test_schema();
        let baseline = Dataset::with_records(
            Arc::clone(&schema),
            vec![person(&schema, "Old", Some("100"), None)],
        );
        let fetcher = ScriptedFetcher::new()
            .page("a", "Again|100|", 1)
            .page("b", "New|200|", 1)
            .page("c", "New too|200|", 1);

        let result = run_pool(
            urls(&["a", "b", "c"]),
            Arc::new(Baseline::new(&baseline, rules())),
            Arc::new(fetcher),
            extractor(),
            &config(2),
            CancellationToken::new(),
        )
        .await;

        // Workers only check the baseline; b and c are resolved by the merge
        assert_eq!(result.stats.baseline_duplicates, 1);
        assert_eq!(result.records.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_dispatches_nothing() {
        let fetcher = ScriptedFetcher::new().page("a", "A|1|", 1);
        let gauges = Arc::clone(&fetcher.gauges);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_pool(
            urls(&["a", "b"]),
            empty_baseline(),
            Arc::new(fetcher),
            extractor(),
            &config(2),
            cancel,
        )
        .await;

        assert_eq!(gauges.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(result.stats.dispatched, 0);
        assert_eq!(result.stats.not_dispatched, 2);
    }

    #[tokio::test]
    async fn cancellation_lets_in_flight_work_finish() {
        let cancel = CancellationToken::new();
        let fetcher = ScriptedFetcher::new()
            .page("a", "A|1|", 1)
            .page("stop", "S|2|", 20)
            .page("c", "C|3|", 1)
            .page("d", "D|4|", 1)
            .cancel_on("stop", cancel.clone());
        let gauges = Arc::clone(&fetcher.gauges);

        let result = run_pool(
            urls(&["a", "stop", "c", "d"]),
            empty_baseline(),
            Arc::new(fetcher),
            extractor(),
            &config(1),
            cancel,
        )
        .await;

        assert_eq!(result.stats.dispatched, 2);
        assert_eq!(result.stats.not_dispatched, 2);
        // The item that triggered cancellation still completed
        assert_eq!(result.records.len(), 2);
        assert_eq!(gauges.open_sessions.load(Ordering::SeqCst), 0);
    }
}
