use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use regex::Regex;
use scraper::{Html, Selector};
use serde::Deserialize;

use crate::error::ExtractionMiss;
use crate::fetch::PageContent;
use crate::record::{Record, Schema};

/// Turns one fetched page into a candidate record.
pub trait RecordExtractor: Send + Sync {
    fn extract(&self, page: &PageContent) -> Result<Record, ExtractionMiss>;
}

/// A record without a name is never kept, whatever the extractor returned.
pub fn require_name(record: Record, name_field: &str) -> Result<Record, ExtractionMiss> {
    match record.get(name_field) {
        Some(name) if !name.trim().is_empty() => Ok(record),
        _ => Err(ExtractionMiss::NoName),
    }
}

/// Where one field comes from on a profile page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldRule {
    pub field: String,
    pub selector: String,
    /// Read this attribute instead of the element text.
    #[serde(default)]
    pub attr: Option<String>,
    #[serde(default)]
    pub strip_prefix: Option<String>,
}

impl FieldRule {
    fn new(field: &str, selector: &str) -> Self {
        FieldRule {
            field: field.to_string(),
            selector: selector.to_string(),
            attr: None,
            strip_prefix: None,
        }
    }

    fn attr(mut self, attr: &str) -> Self {
        self.attr = Some(attr.to_string());
        self
    }

    fn strip(mut self, prefix: &str) -> Self {
        self.strip_prefix = Some(prefix.to_string());
        self
    }
}

/// Selectors for vrisko.gr business profiles. `Hours` has no rule and stays absent.
pub fn default_rules() -> Vec<FieldRule> {
    vec![
        FieldRule::new("Name", "label#CompanyNameLbl span"),
        FieldRule::new("Address", "label#AddressLbl"),
        FieldRule::new("Profession", "label#ProfessionLbl"),
        FieldRule::new("Phone", "label.rc_firstphone"),
        FieldRule::new("Mobile", "label#MobileContLbl span"),
        FieldRule::new("Website", "a.rc_Detaillink[itemprop=\"url\"][href]").attr("href"),
        FieldRule::new("Email", "a.rc_Detaillink[rel=\"nofollow\"][href^=\"mailto:\"]")
            .attr("href")
            .strip("mailto:"),
    ]
}

struct CompiledRule {
    field: String,
    selector: Selector,
    attr: Option<String>,
    strip_prefix: Option<String>,
}

/// CSS-selector driven extractor: first match per rule wins.
pub struct HtmlExtractor {
    schema: Arc<Schema>,
    rules: Vec<CompiledRule>,
}

impl HtmlExtractor {
    pub fn new(schema: Arc<Schema>, rules: &[FieldRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|r| {
                let selector = Selector::parse(&r.selector)
                    .map_err(|e| anyhow!("Invalid selector {:?} for {}: {}", r.selector, r.field, e))?;
                Ok(CompiledRule {
                    field: r.field.clone(),
                    selector,
                    attr: r.attr.clone(),
                    strip_prefix: r.strip_prefix.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(HtmlExtractor { schema, rules })
    }
}

fn collapse_whitespace(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\s+").unwrap());
    re.replace_all(s.trim(), " ").into_owned()
}

impl RecordExtractor for HtmlExtractor {
    fn extract(&self, page: &PageContent) -> Result<Record, ExtractionMiss> {
        if page.body.trim().is_empty() {
            return Err(ExtractionMiss::Unparseable(format!("empty body from {}", page.url)));
        }
        let doc = Html::parse_document(&page.body);
        let mut record = Record::empty(&self.schema);

        for rule in &self.rules {
            let Some(el) = doc.select(&rule.selector).next() else {
                continue;
            };
            let raw = match &rule.attr {
                Some(attr) => el.value().attr(attr).unwrap_or_default().to_string(),
                None => el.text().collect::<String>(),
            };
            let mut value = collapse_whitespace(&raw);
            if let Some(prefix) = &rule.strip_prefix {
                if let Some(rest) = value.strip_prefix(prefix.as_str()) {
                    value = rest.trim().to_string();
                }
            }
            if !value.is_empty() {
                record.set(&rule.field, Some(value));
            }
        }

        Ok(record)
    }
}
