use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::extract::{default_rules, FieldRule};
use crate::identity::{DedupStrategy, IdentityRules};
use crate::record::Schema;

const ENV_PREFIX: &str = "SCRAPER";
const DEFAULT_CONFIG_NAME: &str = "scraper";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreFormat {
    Csv,
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FetcherKind {
    Http,
    Spider,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractorSettings {
    pub rules: Vec<FieldRule>,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        ExtractorSettings { rules: default_rules() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Anchors on a search-results page that point at profile pages.
    pub link_selector: String,
    /// `{profession}` and `{location}` are substituted.
    pub search_template: String,
    /// Sitemap `<loc>` entries must match this to be scraped.
    pub sitemap_pattern: Option<String>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        DiscoverySettings {
            link_selector: "div.AdvAreaRight a.AdvAreaBottomRight".to_string(),
            search_template: "https://www.vrisko.gr/search/{profession}/{location}".to_string(),
            sitemap_pattern: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store_path: PathBuf,
    pub store_format: Option<StoreFormat>,
    pub sqlite_table: String,
    pub absent_marker: String,

    pub concurrency: usize,
    pub fetch_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,

    pub strategy: DedupStrategy,
    pub identity_fields: Vec<String>,
    pub name_field: String,
    pub schema: Vec<String>,

    pub fetcher: FetcherKind,
    pub user_agent: String,
    pub show_progress: bool,

    pub extractor: ExtractorSettings,
    pub discovery: DiscoverySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            store_path: PathBuf::from("records.csv"),
            store_format: None,
            sqlite_table: "records".to_string(),
            absent_marker: String::new(),
            concurrency: 8,
            fetch_timeout_secs: 30,
            max_retries: 0,
            retry_backoff_ms: 2000,
            strategy: DedupStrategy::Tuple,
            identity_fields: vec!["Phone".to_string(), "Mobile".to_string()],
            name_field: "Name".to_string(),
            schema: [
                "Name",
                "Address",
                "Profession",
                "Phone",
                "Mobile",
                "Website",
                "Email",
                "Hours",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            fetcher: FetcherKind::Http,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36"
                .to_string(),
            show_progress: true,
            extractor: ExtractorSettings::default(),
            discovery: DiscoverySettings::default(),
        }
    }
}

impl Settings {
    /// Defaults, then the config file, then `SCRAPER_*` environment variables
    /// (`SCRAPER_MAX_RETRIES`, nested as `SCRAPER_DISCOVERY__SITEMAP_PATTERN`).
    /// An explicit `path` must exist; the default `scraper.{toml,json,...}` may not.
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("identity_fields")
                    .with_list_parse_key("schema")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.schema.is_empty() {
            bail!("schema must name at least one field");
        }
        if self.identity_fields.is_empty() {
            bail!("at least one identity field is required");
        }
        for f in self.identity_fields.iter().chain(std::iter::once(&self.name_field)) {
            if !self.schema.contains(f) {
                bail!("field {:?} is not part of the schema {:?}", f, self.schema);
            }
        }
        for rule in &self.extractor.rules {
            if !self.schema.contains(&rule.field) {
                bail!("extractor rule targets unknown field {:?}", rule.field);
            }
        }
        Ok(())
    }

    pub fn store_format(&self) -> StoreFormat {
        if let Some(format) = self.store_format {
            return format;
        }
        match self.store_path.extension().and_then(|e| e.to_str()) {
            Some("sqlite" | "sqlite3" | "db") => StoreFormat::Sqlite,
            _ => StoreFormat::Csv,
        }
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(self.schema.iter().cloned()))
    }

    pub fn identity_rules(&self) -> IdentityRules {
        IdentityRules::new(self.strategy, self.identity_fields.iter().cloned())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
