mod config;
mod discover;
mod error;
mod extract;
mod fetch;
mod identity;
mod merge;
mod pipeline;
mod pool;
mod record;
mod store;
#[cfg(test)]
mod testing;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{FetcherKind, Settings};
use crate::error::RunAborted;
use crate::extract::HtmlExtractor;
use crate::identity::{compute_key, DedupStrategy};
use crate::pipeline::{Pipeline, UrlSource};
use crate::pool::PoolConfig;
use crate::record::Record;
use crate::store::{CsvStore, RecordStore};

#[derive(Parser)]
#[command(name = "listing_scraper", about = "Scrape directory listings into a deduplicated record store")]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalOpts {
    /// Config file (default: ./scraper.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Record store path (.csv, or .sqlite/.db)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Max concurrent fetches
    #[arg(short = 'j', long, global = true)]
    concurrency: Option<usize>,
    /// Duplicate detection strategy
    #[arg(long, value_enum, global = true)]
    strategy: Option<DedupStrategy>,
    /// Per-fetch timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,
    /// Identity fields, comma separated (e.g. "Phone" or "Phone,Mobile")
    #[arg(long, value_delimiter = ',', global = true)]
    fields: Option<Vec<String>>,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover profile pages, scrape them and merge new records into the store
    Run {
        /// File with one URL per line
        #[arg(long, conflicts_with_all = ["search", "sitemap", "profession"])]
        urls: Option<PathBuf>,
        /// Search-results page listing profile links
        #[arg(long, conflicts_with_all = ["sitemap", "profession"])]
        search: Option<String>,
        /// Build the search URL from the configured template
        #[arg(long, requires = "location")]
        profession: Option<String>,
        #[arg(long, requires = "profession")]
        location: Option<String>,
        /// Sitemap whose <loc> entries are scraped
        #[arg(long)]
        sitemap: Option<String>,
        /// Regex a sitemap URL must match
        #[arg(long, requires = "sitemap")]
        pattern: Option<String>,
        #[arg(long, value_enum)]
        fetcher: Option<FetcherKind>,
        /// Retries for timeouts and network errors
        #[arg(long)]
        retries: Option<u32>,
        #[arg(long)]
        no_progress: bool,
    },
    /// Remove duplicate rows already in the store
    Dedupe {
        /// Report only, leave the store untouched
        #[arg(long)]
        dry_run: bool,
    },
    /// Append records from another CSV file, skipping known identities
    Import { file: PathBuf },
    /// Check whether an identity is already stored. Values follow the
    /// identity field order; "-" marks an absent value
    Lookup {
        #[arg(required = true)]
        values: Vec<String>,
    },
    /// Store statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.global.config.as_deref())?;
    apply_overrides(&mut settings, &cli.global);

    let result = match cli.command {
        Commands::Run {
            urls,
            search,
            profession,
            location,
            sitemap,
            pattern,
            fetcher,
            retries,
            no_progress,
        } => {
            if let Some(f) = fetcher {
                settings.fetcher = f;
            }
            if let Some(r) = retries {
                settings.max_retries = r;
            }
            if no_progress {
                settings.show_progress = false;
            }
            settings.validate()?;

            let source = if let Some(path) = urls {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read URL list {}", path.display()))?;
                UrlSource::List(discover::read_url_list(&text))
            } else if let Some(url) = search {
                UrlSource::Search {
                    url,
                    link_selector: settings.discovery.link_selector.clone(),
                }
            } else if let (Some(p), Some(l)) = (profession, location) {
                UrlSource::Search {
                    url: discover::search_url(&settings.discovery.search_template, &p, &l)?,
                    link_selector: settings.discovery.link_selector.clone(),
                }
            } else if let Some(url) = sitemap {
                UrlSource::Sitemap {
                    url,
                    pattern: pattern.or_else(|| settings.discovery.sitemap_pattern.clone()),
                }
            } else {
                bail!("Nothing to scrape: pass --urls, --search, --profession/--location or --sitemap");
            };
            run(&settings, source).await
        }
        Commands::Dedupe { dry_run } => {
            settings.validate()?;
            let schema = settings.schema();
            let store = store::open_store(&settings);
            let dataset = store.load(&schema).context("Failed to load store")?;
            if dataset.is_empty() {
                println!("Store {} is empty.", store.locator());
                return Ok(());
            }
            println!("Checking {} records for duplicates...", dataset.len());
            let outcome = merge::merge(dataset, Vec::new(), &settings.identity_rules(), &settings.name_field);
            println!("{}", outcome.report.render());
            if dry_run || outcome.report.duplicates_removed() == 0 {
                return Ok(());
            }
            store.persist(&outcome.dataset).context("Failed to save store")?;
            println!("Store saved with {} records.", outcome.dataset.len());
            Ok(())
        }
        Commands::Import { file } => {
            settings.validate()?;
            let schema = settings.schema();
            let store = store::open_store(&settings);
            let baseline = store::load_or_empty(store.as_ref(), &schema)?;
            let incoming = CsvStore::new(&file)
                .with_absent_marker(&settings.absent_marker)
                .load(&schema)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let before = baseline.len();
            let offered = incoming.len();
            let updated = store::append(baseline, incoming.into_records(), &settings.identity_rules());
            let added = updated.len() - before;
            store.persist(&updated).context("Failed to save store")?;
            println!(
                "Imported {} of {} records ({} duplicates skipped).",
                added,
                offered,
                offered - added
            );
            Ok(())
        }
        Commands::Lookup { values } => {
            settings.validate()?;
            let schema = settings.schema();
            let rules = settings.identity_rules();
            if values.len() > rules.fields.len() {
                bail!("{} values given for identity fields {:?}", values.len(), rules.fields);
            }
            let mut candidate = Record::empty(&schema);
            for (field, value) in rules.fields.iter().zip(&values) {
                if value != "-" {
                    candidate.set(field, Some(value.clone()));
                }
            }
            let store = store::open_store(&settings);
            let dataset = store::load_or_empty(store.as_ref(), &schema)?;
            let key = compute_key(&candidate, &rules);
            if store::exists(&dataset, &candidate, &rules) {
                println!("{} already stored ({} strategy).", key, rules.strategy);
            } else {
                println!("{} not stored ({} strategy).", key, rules.strategy);
            }
            Ok(())
        }
        Commands::Stats => {
            settings.validate()?;
            let schema = settings.schema();
            let rules = settings.identity_rules();
            let store = store::open_store(&settings);
            let dataset = store::load_or_empty(store.as_ref(), &schema)?;
            let keys: Vec<_> = dataset.records().iter().map(|r| compute_key(r, &rules)).collect();
            let no_identity = keys.iter().filter(|k| k.is_absent()).count();
            let distinct: HashSet<String> = keys
                .iter()
                .filter(|k| !k.is_absent())
                .map(|k| k.to_string())
                .collect();
            let dupes = merge::merge(dataset.clone(), Vec::new(), &rules, &settings.name_field)
                .report
                .duplicates_removed();
            println!("Store:       {}", store.locator());
            println!("Records:     {}", dataset.len());
            println!("No identity: {}", no_identity);
            println!("Identities:  {}", distinct.len());
            println!("Duplicates:  {} ({} strategy)", dupes, rules.strategy);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn apply_overrides(settings: &mut Settings, opts: &GlobalOpts) {
    if let Some(p) = &opts.store {
        settings.store_path = p.clone();
    }
    if let Some(n) = opts.concurrency {
        settings.concurrency = n;
    }
    if let Some(s) = opts.strategy {
        settings.strategy = s;
    }
    if let Some(t) = opts.timeout {
        settings.fetch_timeout_secs = t;
    }
    if let Some(f) = &opts.fields {
        settings.identity_fields = f.iter().map(|s| s.trim().to_string()).collect();
    }
}

async fn run(settings: &Settings, source: UrlSource) -> Result<()> {
    let schema = settings.schema();
    let pipeline = Pipeline {
        store: store::open_store(settings),
        fetcher: fetch::build_fetcher(settings)?,
        extractor: Arc::new(HtmlExtractor::new(Arc::clone(&schema), &settings.extractor.rules)?),
        schema,
        rules: settings.identity_rules(),
        pool: PoolConfig {
            concurrency: settings.concurrency,
            fetch_timeout: settings.fetch_timeout(),
            name_field: settings.name_field.clone(),
            show_progress: settings.show_progress,
        },
    };

    info!(
        "Scraping into {} (strategy={}, concurrency={}, fetcher={})",
        pipeline.store.locator(),
        settings.strategy,
        settings.concurrency,
        pipeline.fetcher.name()
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted: finishing in-flight pages, no new ones will start");
                cancel.cancel();
            }
        });
    }

    match pipeline.run(source, cancel).await {
        Ok(report) => {
            if !report.merge.groups.is_empty() {
                println!("{}", report.merge.render());
            }
            println!("{}", report);
            println!(
                "{} (run {} .. {}).",
                report.store_summary(),
                report.started_at.format("%Y-%m-%d %H:%M:%S"),
                report.finished_at.format("%H:%M:%S")
            );
            Ok(())
        }
        Err(RunAborted::Persist { source, dataset }) => {
            println!("Run aborted: {}", source);
            bail!(
                "{} merged records were not saved; {} was left unchanged",
                dataset.len(),
                settings.store_path.display()
            )
        }
        Err(e) => {
            println!("Run aborted: {}", e);
            Err(e.into())
        }
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
