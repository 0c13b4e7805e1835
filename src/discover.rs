use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{info, warn};
use url::Url;

use crate::fetch::{fetch_once, PageFetcher};

/// Distinct URLs in first-seen order.
pub fn dedupe_urls(urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter().filter(|u| seen.insert(u.clone())).collect()
}

/// One URL per line. Blank lines and `#` comments are skipped.
pub fn read_url_list(text: &str) -> Vec<String> {
    dedupe_urls(
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect(),
    )
}

/// Fill `{profession}` and `{location}` in a search URL template.
pub fn search_url(template: &str, profession: &str, location: &str) -> Result<String> {
    let raw = template
        .replace("{profession}", profession.trim())
        .replace("{location}", location.trim());
    let url = Url::parse(&raw).with_context(|| format!("Invalid search URL {:?}", raw))?;
    Ok(url.to_string())
}

/// Profile links on a search-results page. A page that cannot be fetched
/// yields no links rather than an error.
pub async fn discover_from_search(
    fetcher: &dyn PageFetcher,
    search: &str,
    link_selector: &str,
    timeout: Duration,
) -> Result<Vec<String>> {
    let selector = Selector::parse(link_selector)
        .map_err(|e| anyhow::anyhow!("Invalid link selector {:?}: {}", link_selector, e))?;
    let base = Url::parse(search).with_context(|| format!("Invalid search URL {:?}", search))?;

    info!("Fetching search results: {}", search);
    let page = match fetch_once(fetcher, search, timeout).await {
        Ok(page) => page,
        Err(e) => {
            warn!("Error loading search results page {}: {}", search, e);
            return Ok(Vec::new());
        }
    };

    let links = extract_links(&page.body, &base, &selector);
    info!("Found {} profile links", links.len());
    Ok(links)
}

fn extract_links(html: &str, base: &Url, selector: &Selector) -> Vec<String> {
    let doc = Html::parse_document(html);
    let links = doc
        .select(selector)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty() && !href.starts_with('#') && !href.starts_with("javascript:"))
        .filter_map(|href| base.join(href).ok())
        .filter(|u| u.scheme() == "http" || u.scheme() == "https")
        .map(|u| u.to_string())
        .collect();
    dedupe_urls(links)
}

/// `<loc>` entries of a sitemap, optionally filtered by `pattern`.
pub async fn discover_from_sitemap(
    client: &reqwest::Client,
    sitemap: &str,
    pattern: Option<&str>,
) -> Result<Vec<String>> {
    let re = pattern.map(Regex::new).transpose()?;

    info!("Fetching sitemap: {}", sitemap);
    let xml = client
        .get(sitemap)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
        .context("Failed to fetch sitemap")?;

    let all_urls = parse_urlset(&xml)?;
    info!("Total URLs in sitemap: {}", all_urls.len());

    let filtered: Vec<String> = all_urls
        .into_iter()
        .filter(|u| re.as_ref().map_or(true, |re| re.is_match(u)))
        .collect();
    info!("URLs after filtering: {}", filtered.len());
    Ok(dedupe_urls(filtered))
}

/// Parse a urlset XML and return all <loc> URLs.
fn parse_urlset(xml: &str) -> Result<Vec<String>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut urls = Vec::new();
    let mut in_url = false;
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.name().as_ref() {
                b"url" => in_url = true,
                b"loc" if in_url => in_loc = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(e)) if in_loc => {
                urls.push(e.unescape()?.trim().to_string());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.name().as_ref() {
                b"loc" => in_loc = false,
                b"url" => in_url = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
        buf.clear();
    }
    Ok(urls)
}
