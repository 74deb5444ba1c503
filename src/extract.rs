//! Fetching pages and extracting readable text.
//!
//! [`Fetcher`] is the seam between the worker and the network; the worker
//! only ever sees a [`FetchedPage`]. [`extract_readable`] is a small
//! readability-style heuristic: drop boilerplate elements, pick the most
//! likely content container, and convert it to plain text.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::WorkerConfig;

/// Wrap width for html-to-text conversion.
const TEXT_WIDTH: usize = 100;

/// Elements whose content never counts as article text.
const BOILERPLATE_TAGS: [&str; 9] = [
    "script", "style", "noscript", "nav", "header", "footer", "aside", "form", "svg",
];

/// Candidate content containers, most specific first.
const CONTENT_SELECTORS: [&str; 9] = [
    "article",
    "main",
    "[role='main']",
    "#content",
    "#main",
    ".post-content",
    ".entry-content",
    ".article-body",
    ".content",
];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unsupported content-type {content_type} for {url}")]
    UnsupportedContentType { content_type: String, url: String },
    #[error("no readable text found")]
    NoReadableText,
}

/// A fetched HTTP response body.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL after redirects.
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchedPage {
    pub fn is_html(&self) -> bool {
        match self.content_type.as_deref() {
            Some(ct) => ct.contains("html") || ct.contains("xml"),
            None => looks_like_html(&self.body),
        }
    }

    pub fn is_plain_text(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.starts_with("text/plain") || ct.starts_with("text/markdown"))
            .unwrap_or(false)
    }
}

/// Retrieves a URL. Implemented over HTTP in production and stubbed in tests.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// `reqwest`-backed fetcher with a fixed user agent and timeout.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("HTTP request failed for {}", url))?;

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(ExtractError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            }
            .into());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase());

        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        debug!(url = %final_url, bytes = body.len(), "fetched page");

        Ok(FetchedPage {
            url: final_url,
            status: status.as_u16(),
            content_type,
            body,
        })
    }
}

/// Title and text pulled out of an HTML document.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub title: Option<String>,
    pub text: String,
}

/// Turn a fetched page into readable text.
pub fn extract_page(page: &FetchedPage) -> Result<Extracted, ExtractError> {
    if page.is_plain_text() {
        let text = clean_text(&page.body);
        if text.is_empty() {
            return Err(ExtractError::NoReadableText);
        }
        return Ok(Extracted { title: None, text });
    }
    if !page.is_html() {
        return Err(ExtractError::UnsupportedContentType {
            content_type: page.content_type.clone().unwrap_or_default(),
            url: page.url.clone(),
        });
    }
    extract_readable(&page.body)
}

/// Readability-style extraction of an HTML document.
pub fn extract_readable(html: &str) -> Result<Extracted, ExtractError> {
    let title = extract_title(&Html::parse_document(html));

    let stripped = strip_boilerplate(html);
    let document = Html::parse_document(&stripped);
    let container = main_content_html(&document).unwrap_or(stripped);

    let text = html_to_text(&container);
    if text.is_empty() {
        return Err(ExtractError::NoReadableText);
    }
    Ok(Extracted { title, text })
}

/// Plain-text rendering of an HTML fragment, whitespace collapsed.
pub fn html_to_text(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), TEXT_WIDTH) {
        Ok(text) => clean_text(&text),
        Err(e) => {
            debug!("html2text failed, falling back to tag stripping: {}", e);
            match tag_regex() {
                Some(re) => clean_text(&re.replace_all(html, " ")),
                None => clean_text(html),
            }
        }
    }
}

/// Title from `og:title`, `<title>`, or the first `<h1>`.
pub fn extract_title(document: &Html) -> Option<String> {
    if let Ok(sel) = Selector::parse("meta[property='og:title']") {
        if let Some(content) = document
            .select(&sel)
            .next()
            .and_then(|el| el.value().attr("content"))
        {
            let t = collapse_ws(content);
            if !t.is_empty() {
                return Some(t);
            }
        }
    }

    for sel in ["title", "h1"] {
        if let Ok(selector) = Selector::parse(sel) {
            if let Some(el) = document.select(&selector).next() {
                let t = collapse_ws(&el.text().collect::<String>());
                if !t.is_empty() {
                    return Some(t);
                }
            }
        }
    }
    None
}

fn main_content_html(document: &Html) -> Option<String> {
    for selector_str in CONTENT_SELECTORS {
        if let Ok(selector) = Selector::parse(selector_str) {
            // Prefer the candidate carrying the most text.
            let best = document
                .select(&selector)
                .max_by_key(|el| el.text().map(str::len).sum::<usize>());
            if let Some(el) = best {
                let len: usize = el.text().map(|t| t.trim().len()).sum();
                if len > 0 {
                    return Some(el.html());
                }
            }
        }
    }

    let body = Selector::parse("body").ok()?;
    document.select(&body).next().map(|el| el.html())
}

fn strip_boilerplate(html: &str) -> String {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        let mut v: Vec<Regex> = BOILERPLATE_TAGS
            .iter()
            .filter_map(|tag| Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")).ok())
            .collect();
        if let Ok(comments) = Regex::new(r"(?s)<!--.*?-->") {
            v.push(comments);
        }
        v
    });

    let mut out = html.to_string();
    for re in patterns {
        out = re.replace_all(&out, " ").into_owned();
    }
    out
}

fn tag_regex() -> Option<&'static Regex> {
    static TAGS: OnceLock<Option<Regex>> = OnceLock::new();
    TAGS.get_or_init(|| Regex::new(r"<[^>]*>").ok()).as_ref()
}

fn looks_like_html(body: &str) -> bool {
    let lower: String = body
        .trim_start()
        .chars()
        .take(256)
        .collect::<String>()
        .to_ascii_lowercase();
    lower.starts_with("<!doctype html") || lower.starts_with("<html") || lower.contains("<body")
}

/// Trim lines and drop blank ones.
fn clean_text(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
