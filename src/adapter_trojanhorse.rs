//! Trojan horse: arbitrary JSON pushed in from outside (shortcuts, scripts,
//! browser extensions).
//!
//! The payload must be a non-empty object carrying at least one of `url`,
//! `html` or `text`. Every other key is kept as-is. The raw body is saved
//! to `RAW_ROOT/trojanhorse/{job id}.json` before the job is enqueued.

use anyhow::{Context, Result};
use serde_json::Value;
use std::io::Read;
use std::path::Path;
use tracing::info;

use crate::adapter_url::normalize_url;
use crate::config::Config;
use crate::ingest::IngestError;
use crate::models::{Job, JobPayload, TrojanHorsePayload};
use crate::queue::Queue;

pub const DEFAULT_SOURCE: &str = "trojanhorse";

/// Check the payload shape and decode it.
pub fn validate_payload(value: &Value) -> Result<TrojanHorsePayload, IngestError> {
    let obj = value
        .as_object()
        .ok_or_else(|| IngestError::InvalidPayload("expected a JSON object".to_string()))?;
    if obj.is_empty() {
        return Err(IngestError::InvalidPayload("payload is empty".to_string()));
    }

    let has = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty())
    };
    if !(has("url") || has("html") || has("text")) {
        return Err(IngestError::InvalidPayload(
            "payload needs at least one of url, html, text".to_string(),
        ));
    }

    let mut payload: TrojanHorsePayload = serde_json::from_value(value.clone())
        .map_err(|e| IngestError::InvalidPayload(e.to_string()))?;
    if let Some(url) = payload.url.take() {
        payload.url = if url.trim().is_empty() {
            None
        } else {
            Some(normalize_url(&url)?)
        };
    }
    Ok(payload)
}

/// Validate, archive the raw body and enqueue a `trojanhorse` job.
pub fn ingest_trojanhorse(
    queue: &Queue,
    raw_root: &Path,
    value: Value,
    source: Option<&str>,
    notes: Option<String>,
) -> Result<Job> {
    let payload = validate_payload(&value)?;
    let source = source
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SOURCE);

    let mut job = Job::new(JobPayload::Trojanhorse(payload), source);
    job.notes = notes.filter(|n| !n.trim().is_empty());

    let dir = raw_root.join("trojanhorse");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let raw_path = dir.join(format!("{}.json", job.id));
    std::fs::write(&raw_path, serde_json::to_vec_pretty(&value)?)
        .with_context(|| format!("Failed to write {}", raw_path.display()))?;

    queue.enqueue(&job)?;
    info!(job_id = %job.id, source = %job.source, "queued trojanhorse payload");
    Ok(job)
}

/// CLI entry point for `atlas ingest-trojanhorse`. Reads the payload from
/// `file`, or from stdin when `file` is absent or `-`.
pub fn run_ingest_trojanhorse(
    config: &Config,
    file: Option<&Path>,
    source: Option<&str>,
    notes: Option<String>,
) -> Result<()> {
    let raw = match file {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read payload from stdin")?;
            buf
        }
    };
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| IngestError::InvalidPayload(format!("not valid JSON: {}", e)))?;

    let queue = Queue::open(&config.paths.queue_root)?;
    let job = ingest_trojanhorse(&queue, &config.paths.raw_root, value, source, notes)?;
    println!("queued {} job {}", job.kind(), job.id);
    Ok(())
}
