//! RSS/Atom polling.
//!
//! Feeds are listed in a TOML file (`RSS_CONFIG_PATH`):
//!
//! ```toml
//! [[feeds]]
//! url = "https://example.com/feed.xml"
//! name = "Example"        # optional
//! source = "blogs"        # optional, defaults to "rss"
//! ```
//!
//! Each entry becomes an `rss_item` job once. `(feed url, guid)` pairs are
//! recorded in `processed_entries`, so polling an unchanged feed again
//! enqueues nothing.

use anyhow::{Context, Result};
use feed_rs::model::Entry;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::extract::{Fetcher, HttpFetcher};
use crate::feed_state::{has_processed_entry, mark_processed_entry, set_last_guid};
use crate::ingest::{IngestError, PollSummary};
use crate::migrate::migrate_pool;
use crate::models::{JobPayload, RssItemPayload};
use crate::queue::Queue;

pub const DEFAULT_SOURCE: &str = "rss";

#[derive(Debug, Deserialize, Default)]
struct FeedList {
    #[serde(default)]
    feeds: Vec<FeedSpec>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FeedSpec {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

impl FeedSpec {
    pub fn source(&self) -> &str {
        self.source
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SOURCE)
    }
}

pub fn load_feed_list(path: &Path) -> Result<Vec<FeedSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read feed list: {}", path.display()))?;
    let list: FeedList = toml::from_str(&content)
        .with_context(|| format!("Failed to parse feed list: {}", path.display()))?;
    Ok(list.feeds)
}

/// Parse an RSS or Atom document into payloads, one per entry.
pub fn entries_from_feed(body: &[u8], feed_url: &str) -> Result<Vec<RssItemPayload>> {
    let feed = feed_rs::parser::parse(body)
        .with_context(|| format!("Failed to parse feed {}", feed_url))?;
    let feed_title = feed.title.map(|t| t.content);

    Ok(feed
        .entries
        .into_iter()
        .map(|entry| entry_to_payload(entry, feed_url, feed_title.clone()))
        .collect())
}

fn entry_to_payload(entry: Entry, feed_url: &str, feed_title: Option<String>) -> RssItemPayload {
    let summary = entry
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .or_else(|| entry.summary.as_ref().map(|s| s.content.clone()));

    // Podcast audio shows up as a media object; a link with rel="enclosure"
    // is the Atom spelling.
    let enclosure_url = entry
        .media
        .iter()
        .flat_map(|m| m.content.iter())
        .find_map(|c| c.url.as_ref().map(|u| u.to_string()))
        .or_else(|| {
            entry
                .links
                .iter()
                .find(|l| l.rel.as_deref() == Some("enclosure"))
                .map(|l| l.href.clone())
        });

    let url = entry
        .links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| entry.links.first())
        .map(|l| l.href.clone());

    // Entries without a guid fall back to their link so dedup still works.
    let guid = if entry.id.trim().is_empty() {
        url.clone().unwrap_or_default()
    } else {
        entry.id
    };

    RssItemPayload {
        feed_url: feed_url.to_string(),
        guid,
        feed_title,
        url,
        title: entry.title.map(|t| t.content),
        author: entry.authors.first().map(|a| a.name.clone()),
        summary,
        published: entry.published.or(entry.updated),
        enclosure_url,
        extra: Default::default(),
    }
}

/// Enqueue the entries not seen before, and record the newest guid.
pub async fn enqueue_entries(
    pool: &SqlitePool,
    queue: &Queue,
    feed: &FeedSpec,
    entries: Vec<RssItemPayload>,
) -> Result<PollSummary> {
    let mut summary = PollSummary {
        sources: 1,
        ..Default::default()
    };
    let newest = entries.first().map(|e| e.guid.clone());

    for mut entry in entries {
        summary.seen += 1;
        if entry.guid.is_empty() {
            warn!(feed = %feed.url, "skipping entry without guid or link");
            summary.errors += 1;
            continue;
        }
        if has_processed_entry(pool, &feed.url, &entry.guid).await? {
            summary.skipped += 1;
            continue;
        }
        if entry.feed_title.is_none() {
            entry.feed_title = feed.name.clone();
        }

        let guid = entry.guid.clone();
        queue.create_job(JobPayload::RssItem(entry), feed.source(), None, None)?;
        mark_processed_entry(pool, &feed.url, &guid).await?;
        summary.enqueued += 1;
    }

    set_last_guid(pool, &feed.url, newest.as_deref()).await?;
    Ok(summary)
}

/// Fetch, parse and enqueue every feed. A feed that fails is logged and
/// counted; the rest are still polled.
pub async fn poll_feeds(
    pool: &SqlitePool,
    queue: &Queue,
    fetcher: &dyn Fetcher,
    feeds: &[FeedSpec],
) -> PollSummary {
    let mut total = PollSummary::default();

    for feed in feeds {
        let result: Result<PollSummary> = async {
            let page = fetcher.fetch(&feed.url).await?;
            let entries = entries_from_feed(page.body.as_bytes(), &feed.url)?;
            enqueue_entries(pool, queue, feed, entries).await
        }
        .await;

        match result {
            Ok(summary) => {
                info!(
                    feed = %feed.url,
                    seen = summary.seen,
                    enqueued = summary.enqueued,
                    "polled feed"
                );
                total.merge(summary);
            }
            Err(e) => {
                warn!(feed = %feed.url, "feed poll failed: {:#}", e);
                total.sources += 1;
                total.errors += 1;
            }
        }
    }

    total
}

/// Poll every feed in the configured feed list.
pub async fn poll_rss(config: &Config) -> Result<PollSummary> {
    let path = config
        .rss
        .config_path
        .as_ref()
        .ok_or(IngestError::NotConfigured("RSS_CONFIG_PATH"))?;
    let feeds = load_feed_list(path)?;

    let queue = Queue::open(&config.paths.queue_root)?;
    let fetcher = HttpFetcher::new(&config.worker)?;
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;

    let summary = poll_feeds(&pool, &queue, &fetcher, &feeds).await;
    pool.close().await;
    Ok(summary)
}

/// CLI entry point for `atlas poll-rss`.
pub async fn run_poll_rss(config: &Config) -> Result<()> {
    poll_rss(config).await?.print("poll-rss");
    Ok(())
}
