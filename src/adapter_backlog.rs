//! Backlog replay from exported archives.
//!
//! A TOML manifest (`BACKLOG_CONFIG_PATH`) lists the sources to replay:
//!
//! ```toml
//! [[sources]]
//! id = "pocket-2019"
//! kind = "csv"              # csv | json | directory
//! path = "pocket.csv"       # relative to BACKLOG_ROOT
//! source = "pocket"         # optional, defaults to "backlog"
//! url_column = "url"        # csv/json only
//! title_column = "title"
//!
//! [[sources]]
//! id = "notes"
//! kind = "directory"
//! path = "notes/"
//! include_globs = ["**/*.md"]   # optional
//! ```
//!
//! Every item is recorded in `processed_entries` under
//! `backlog:{id}`, keyed by its URL when it has one and by its position in
//! the source otherwise, so replaying a manifest twice enqueues nothing new.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::db;
use crate::feed_state::{has_processed_entry, mark_processed_entry};
use crate::ingest::{IngestError, PollSummary};
use crate::migrate::migrate_pool;
use crate::models::{BacklogPayload, JobPayload};
use crate::queue::Queue;

pub const DEFAULT_SOURCE: &str = "backlog";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BacklogKind {
    Csv,
    Json,
    Directory,
}

#[derive(Debug, Deserialize, Default)]
struct Manifest {
    #[serde(default)]
    sources: Vec<BacklogSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BacklogSource {
    pub id: String,
    pub kind: BacklogKind,
    pub path: PathBuf,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_url_column")]
    pub url_column: String,
    #[serde(default = "default_title_column")]
    pub title_column: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

fn default_url_column() -> String {
    "url".to_string()
}
fn default_title_column() -> String {
    "title".to_string()
}
fn default_include_globs() -> Vec<String> {
    ["**/*.html", "**/*.htm", "**/*.md", "**/*.txt"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl BacklogSource {
    pub fn source(&self) -> &str {
        self.source
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_SOURCE)
    }

    fn dedup_key(&self) -> String {
        format!("backlog:{}", self.id)
    }
}

/// One replayable item and the key it is deduplicated by.
#[derive(Debug, Clone, PartialEq)]
pub struct BacklogItem {
    pub key: String,
    pub payload: BacklogPayload,
}

pub fn load_manifest(path: &Path) -> Result<Vec<BacklogSource>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read backlog manifest: {}", path.display()))?;
    let manifest: Manifest = toml::from_str(&content)
        .with_context(|| format!("Failed to parse backlog manifest: {}", path.display()))?;

    for (i, s) in manifest.sources.iter().enumerate() {
        if s.id.trim().is_empty() {
            bail!("backlog source #{} has an empty id", i + 1);
        }
    }
    Ok(manifest.sources)
}

/// Read every item of `source`. Relative paths resolve against `root`.
pub fn read_items(source: &BacklogSource, root: &Path) -> Result<Vec<BacklogItem>> {
    let path = if source.path.is_absolute() {
        source.path.clone()
    } else {
        root.join(&source.path)
    };
    if !path.exists() {
        bail!("backlog source '{}' not found: {}", source.id, path.display());
    }

    match source.kind {
        BacklogKind::Csv => read_csv(source, &path),
        BacklogKind::Json => read_json(source, &path),
        BacklogKind::Directory => read_directory(source, &path),
    }
}

fn read_csv(source: &BacklogSource, path: &Path) -> Result<Vec<BacklogItem>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let headers = reader.headers()?.clone();

    let mut items = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Bad CSV row {} in {}", i + 1, path.display()))?;
        let row: HashMap<&str, &str> = headers
            .iter()
            .zip(record.iter())
            .filter(|(_, v)| !v.is_empty())
            .collect();

        let mut extra = Map::new();
        for (k, v) in &row {
            if ![source.url_column.as_str(), source.title_column.as_str(), "html", "text"]
                .contains(k)
            {
                extra.insert(k.to_string(), Value::String(v.to_string()));
            }
        }

        items.push(make_item(
            format!("row:{}", i + 1),
            row.get(source.url_column.as_str()).map(|s| s.to_string()),
            row.get(source.title_column.as_str()).map(|s| s.to_string()),
            row.get("html").map(|s| s.to_string()),
            row.get("text").map(|s| s.to_string()),
            extra,
        ));
    }
    Ok(items)
}

fn read_json(source: &BacklogSource, path: &Path) -> Result<Vec<BacklogItem>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    // Either a bare array or an export object with an `items` array.
    let array = match value {
        Value::Array(a) => a,
        Value::Object(mut o) => match o.remove("items") {
            Some(Value::Array(a)) => a,
            _ => bail!("{}: expected an array or an object with \"items\"", path.display()),
        },
        _ => bail!("{}: expected an array of items", path.display()),
    };

    let mut items = Vec::new();
    for (i, entry) in array.into_iter().enumerate() {
        let Value::Object(mut obj) = entry else {
            warn!(source = %source.id, index = i, "skipping non-object backlog item");
            continue;
        };
        let mut take = |key: &str| match obj.remove(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            _ => None,
        };
        let url = take(&source.url_column);
        let title = take(&source.title_column);
        let html = take("html");
        let text = take("text");

        items.push(make_item(format!("item:{}", i), url, title, html, text, obj));
    }
    Ok(items)
}

fn read_directory(source: &BacklogSource, root: &Path) -> Result<Vec<BacklogItem>> {
    let include = build_globset(&source.include_globs)?;

    let mut items = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();
        if !include.is_match(&rel_str) {
            continue;
        }

        let body = match std::fs::read_to_string(path) {
            Ok(b) => b,
            Err(e) => {
                warn!(file = %path.display(), "skipping unreadable file: {}", e);
                continue;
            }
        };
        let is_html = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("html") | Some("htm")
        );
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string());
        let (html, text) = if is_html { (Some(body), None) } else { (None, Some(body)) };

        let mut item = make_item(rel_str.clone(), None, title, html, text, Map::new());
        item.key = format!("file:{}", rel_str);
        items.push(item);
    }
    Ok(items)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn make_item(
    entry: String,
    url: Option<String>,
    title: Option<String>,
    html: Option<String>,
    text: Option<String>,
    extra: Map<String, Value>,
) -> BacklogItem {
    let key = url.clone().unwrap_or_else(|| entry.clone());
    BacklogItem {
        key,
        payload: BacklogPayload {
            url,
            title,
            html,
            text,
            manifest_entry: Some(entry),
            extra,
        },
    }
}

/// Enqueue the items of one source that were not replayed before.
pub async fn enqueue_items(
    pool: &SqlitePool,
    queue: &Queue,
    source: &BacklogSource,
    items: Vec<BacklogItem>,
) -> Result<PollSummary> {
    let dedup_key = source.dedup_key();
    let mut summary = PollSummary {
        sources: 1,
        ..Default::default()
    };

    for item in items {
        summary.seen += 1;
        let p = &item.payload;
        if p.url.is_none() && p.html.is_none() && p.text.is_none() {
            warn!(source = %source.id, entry = ?p.manifest_entry, "item has no url, html, or text");
            summary.errors += 1;
            continue;
        }
        if has_processed_entry(pool, &dedup_key, &item.key).await? {
            summary.skipped += 1;
            continue;
        }

        queue.create_job(
            JobPayload::Backlog(item.payload),
            source.source(),
            Some(source.id.clone()),
            None,
        )?;
        mark_processed_entry(pool, &dedup_key, &item.key).await?;
        summary.enqueued += 1;
    }

    Ok(summary)
}

/// Replay every source. A source that cannot be read is logged and counted.
pub async fn replay_sources(
    pool: &SqlitePool,
    queue: &Queue,
    root: &Path,
    sources: &[BacklogSource],
) -> PollSummary {
    let mut total = PollSummary::default();

    for source in sources {
        let result: Result<PollSummary> = async {
            let items = read_items(source, root)?;
            enqueue_items(pool, queue, source, items).await
        }
        .await;

        match result {
            Ok(summary) => {
                info!(
                    source = %source.id,
                    seen = summary.seen,
                    enqueued = summary.enqueued,
                    "replayed backlog source"
                );
                total.merge(summary);
            }
            Err(e) => {
                warn!(source = %source.id, "backlog source failed: {:#}", e);
                total.sources += 1;
                total.errors += 1;
            }
        }
    }

    total
}

pub async fn process_backlog(config: &Config) -> Result<PollSummary> {
    let path = config
        .backlog
        .config_path
        .as_ref()
        .ok_or(IngestError::NotConfigured("BACKLOG_CONFIG_PATH"))?;
    let sources = load_manifest(path)?;

    let queue = Queue::open(&config.paths.queue_root)?;
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;

    let summary = replay_sources(&pool, &queue, &config.backlog.root, &sources).await;
    pool.close().await;
    Ok(summary)
}

/// CLI entry point for `atlas process-backlog`.
pub async fn run_process_backlog(config: &Config) -> Result<()> {
    process_backlog(config).await?.print("process-backlog");
    Ok(())
}
