//! Manual URL submission (`atlas ingest-url`, `POST /vos/ingest/url`).

use anyhow::Result;
use tracing::info;
use url::Url;

use crate::config::Config;
use crate::ingest::IngestError;
use crate::models::{Job, JobPayload, UrlPayload};
use crate::queue::Queue;

pub const DEFAULT_SOURCE: &str = "manual";

/// Parse and normalize a submitted URL: http(s) only, fragment removed.
pub fn normalize_url(raw: &str) -> Result<String, IngestError> {
    let raw = raw.trim();
    let invalid = |reason: &str| IngestError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw.is_empty() {
        return Err(invalid("url must not be empty"));
    }
    let mut url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    url.set_fragment(None);
    Ok(url.into())
}

/// Enqueue a `url` job.
pub fn ingest_url(queue: &Queue, raw_url: &str, source: Option<&str>) -> Result<Job> {
    let url = normalize_url(raw_url)?;
    let source = source
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SOURCE);

    let payload = JobPayload::Url(UrlPayload {
        url,
        ..Default::default()
    });
    let job = queue.create_job(payload, source, None, None)?;
    info!(job_id = %job.id, source = %job.source, "queued url");
    Ok(job)
}

/// CLI entry point for `atlas ingest-url`.
pub fn run_ingest_url(config: &Config, url: &str, source: Option<&str>) -> Result<()> {
    let queue = Queue::open(&config.paths.queue_root)?;
    let job = ingest_url(&queue, url, source)?;
    println!("queued {} job {}", job.kind(), job.id);
    Ok(())
}
