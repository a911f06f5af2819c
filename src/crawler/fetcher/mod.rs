#[cfg(test)]
mod tests;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use itertools::Itertools;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::debug;
use ureq::Agent;
use url::Url;

use crate::config::CrawlerSettings;

/// What the crawler keeps from a fetched page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub title: String,
    /// Visible text with whitespace collapsed
    pub text: String,
    /// Absolute http(s) links in document order, duplicates removed
    pub links: Vec<Url>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Page>;
}

/// Blocking `ureq` fetcher run on the blocking thread pool
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    agent: Agent,
}

impl HttpFetcher {
    #[inline]
    pub fn new(settings: &CrawlerSettings) -> Self {
        let agent = Agent::config_builder()
            .timeout_global(Some(settings.fetch_timeout()))
            .user_agent(&settings.user_agent)
            .build()
            .into();
        Self { agent }
    }

    fn get(&self, url: &str) -> Result<String> {
        debug!("Making HTTP GET request to: {}", url);
        match self.agent.get(url).call() {
            Ok(mut response) => {
                let text = response
                    .body_mut()
                    .read_to_string()
                    .with_context(|| format!("Failed to read response body from {}", url))?;
                debug!("Successfully read {} bytes from {}", text.len(), url);
                Ok(text)
            }
            Err(ureq::Error::StatusCode(status)) => Err(anyhow!("HTTP error {}", status)),
            Err(e) => Err(anyhow::Error::from(e))
                .with_context(|| format!("Failed to make HTTP request to {}", url)),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Page> {
        let page_url = validate_url(url)?;
        let client = self.clone();
        let target = page_url.to_string();
        let html = tokio::task::spawn_blocking(move || client.get(&target))
            .await
            .context("Fetch task failed")??;
        parse_page(&html, &page_url)
    }
}

/// Validate and normalize a URL
#[inline]
pub fn validate_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str).with_context(|| format!("Invalid URL format: {}", url_str))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(anyhow!("URL must use HTTP or HTTPS scheme: {}", url_str));
    }

    if url.host_str().is_none() {
        return Err(anyhow!("URL must have a valid host: {}", url_str));
    }

    Ok(url)
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("Failed to create CSS selector: {:?}", e))
}

/// Title, visible text and outbound links of an HTML document
#[inline]
pub fn parse_page(html: &str, page_url: &Url) -> Result<Page> {
    let document = Html::parse_document(html);

    let title = document
        .select(&selector("title")?)
        .next()
        .map(|element| collapse_whitespace(&element.text().collect::<String>()))
        .unwrap_or_default();

    let body = document.select(&selector("body")?).next();
    let mut raw = String::new();
    visible_text(body.unwrap_or_else(|| document.root_element()), &mut raw);

    Ok(Page {
        title,
        text: collapse_whitespace(&raw),
        links: extract_links(&document, page_url)?,
    })
}

const INLINE_ELEMENTS: &[&str] = &[
    "a", "abbr", "b", "bdi", "bdo", "cite", "code", "data", "dfn", "em", "i", "kbd", "mark", "q",
    "s", "samp", "small", "span", "strong", "sub", "sup", "time", "u", "var",
];

/// Text of `element` and its descendants, skipping non-rendered elements
fn visible_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(inner) => {
                let name = inner.name();
                if matches!(name, "script" | "style" | "noscript" | "template" | "head") {
                    continue;
                }
                if let Some(child_element) = ElementRef::wrap(child) {
                    visible_text(child_element, out);
                }
                // Block boundaries separate words even without whitespace
                if !INLINE_ELEMENTS.contains(&name) {
                    out.push(' ');
                }
            }
            _ => {}
        }
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Absolute http(s) targets of every `a[href]`, resolved against `page_url`
#[inline]
pub fn extract_links(document: &Html, page_url: &Url) -> Result<Vec<Url>> {
    let mut links = Vec::new();

    for element in document.select(&selector("a[href]")?) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() {
            continue;
        }

        match page_url.join(href) {
            Ok(absolute) if matches!(absolute.scheme(), "http" | "https") => links.push(absolute),
            Ok(absolute) => debug!("Ignoring non-HTTP link {}", absolute),
            Err(e) => debug!(
                "Failed to resolve URL '{}' relative to '{}': {}",
                href, page_url, e
            ),
        }
    }

    let links: Vec<Url> = links.into_iter().unique().collect();
    debug!("Extracted {} links from {}", links.len(), page_url);
    Ok(links)
}
