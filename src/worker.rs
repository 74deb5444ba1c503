//! The processor loop.
//!
//! Each iteration claims the highest-priority job from the inbox and runs it
//! through the pipeline:
//!
//! ```text
//! claim ─▶ resolve content ─▶ archive ─▶ content row ─▶ index ─▶ audit ─▶ completed/
//!              (fetch + extract       │
//!               or inline payload)    └── any error ─▶ audit ─▶ failed/ + .error.txt
//! ```
//!
//! A failing job never stops the loop. There is no automatic retry: failed
//! jobs stay in `failed/` until someone runs `atlas requeue`.

use anyhow::{bail, Result};
use chrono::Utc;
use scraper::Html;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::archive::archive_content;
use crate::config::Config;
use crate::content::{record_audit, upsert_content};
use crate::db;
use crate::extract::{extract_page, extract_title, html_to_text, Fetcher, HttpFetcher};
use crate::migrate::migrate_pool;
use crate::models::{AuditStatus, ContentRecord, Job};
use crate::queue::{Claim, Queue, WorkerLock};
use crate::search::SearchIndex;

/// What a single iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The inbox was empty.
    Idle,
    Completed(String),
    Failed(String),
}

/// Totals reported when [`Worker::run`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub iterations: u64,
    pub completed: u64,
    pub failed: u64,
    pub idle: u64,
    pub errors: u64,
}

/// Content resolved for a job, before it is stored.
struct Resolved {
    title: Option<String>,
    html: Option<String>,
    text: String,
    final_url: Option<String>,
    fetched: bool,
}

pub struct Worker {
    config: Config,
    queue: Queue,
    pool: SqlitePool,
    index: SearchIndex,
    fetcher: Arc<dyn Fetcher>,
}

impl Worker {
    /// Worker that fetches over HTTP.
    pub async fn new(config: &Config) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(&config.worker)?);
        Self::with_fetcher(config, fetcher).await
    }

    /// Worker with a custom [`Fetcher`].
    pub async fn with_fetcher(config: &Config, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let queue = Queue::open(&config.paths.queue_root)?;
        let pool = db::connect(config).await?;
        migrate_pool(&pool).await?;
        let index = SearchIndex::open(&config.search.index_path).await?;

        Ok(Self {
            config: config.clone(),
            queue,
            pool,
            index,
            fetcher,
        })
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }

    pub async fn close(self) {
        self.pool.close().await;
        self.index.close().await;
    }

    /// Run until `max_iterations` iterations have passed (forever when
    /// `None`) or Ctrl-C arrives while idle.
    ///
    /// Holds the queue's [`WorkerLock`] for the whole run and first returns
    /// any stale claims to the inbox.
    pub async fn run(&self, max_iterations: Option<u64>) -> Result<WorkerStats> {
        let _lock = WorkerLock::acquire(&self.queue)?;
        self.queue.recover_stale()?;

        let sleep = Duration::from_secs(self.config.worker.sleep_seconds);
        let mut stats = WorkerStats::default();
        info!(
            queue = %self.queue.root().display(),
            sleep_seconds = self.config.worker.sleep_seconds,
            "worker started"
        );

        loop {
            if let Some(max) = max_iterations {
                if stats.iterations >= max {
                    break;
                }
            }
            stats.iterations += 1;
            let last_iteration = max_iterations.is_some_and(|m| stats.iterations >= m);

            let should_sleep = match self.run_once().await {
                Ok(IterationOutcome::Completed(_)) => {
                    stats.completed += 1;
                    false
                }
                Ok(IterationOutcome::Failed(_)) => {
                    stats.failed += 1;
                    false
                }
                Ok(IterationOutcome::Idle) => {
                    stats.idle += 1;
                    true
                }
                Err(e) => {
                    error!("worker iteration failed: {:#}", e);
                    stats.errors += 1;
                    true
                }
            };

            if should_sleep && !last_iteration {
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutdown requested");
                        break;
                    }
                }
            }
        }

        info!(
            completed = stats.completed,
            failed = stats.failed,
            "worker stopped"
        );
        Ok(stats)
    }

    /// Claim and process at most one job.
    pub async fn run_once(&self) -> Result<IterationOutcome> {
        let Some(claim) = self.queue.claim_next()? else {
            debug!("inbox empty");
            return Ok(IterationOutcome::Idle);
        };

        let result = match &claim.job {
            Ok(job) => {
                info!(job_id = %job.id, kind = %job.kind(), "processing job");
                self.process(job).await
            }
            Err(reason) => Err(anyhow::anyhow!("{}", reason)),
        };

        match result {
            Ok(record) => {
                self.queue.complete(&claim)?;
                info!(job_id = %record.id, title = ?record.title, "job completed");
                Ok(IterationOutcome::Completed(claim.id))
            }
            Err(e) => {
                self.fail_claim(&claim, &e).await?;
                Ok(IterationOutcome::Failed(claim.id))
            }
        }
    }

    async fn fail_claim(&self, claim: &Claim, err: &anyhow::Error) -> Result<()> {
        warn!(job_id = %claim.id, "job failed: {:#}", err);

        if let Err(audit_err) =
            record_audit(&self.pool, &claim.id, AuditStatus::Failed, Some(&format!("{:#}", err)))
                .await
        {
            error!(job_id = %claim.id, "could not record failure audit: {:#}", audit_err);
        }

        self.queue.fail(claim, &failure_report(claim, err))?;
        Ok(())
    }

    async fn process(&self, job: &Job) -> Result<ContentRecord> {
        let resolved = self.resolve_content(job).await?;

        let paths = archive_content(
            &self.config.paths.archive_root,
            &job.id,
            resolved.html.as_deref(),
            &resolved.text,
        )?;

        let record = ContentRecord {
            id: job.id.clone(),
            url: job.payload.resolve_url().map(str::to_string),
            title: resolved.title.clone(),
            source: job.source.clone(),
            content_type: job.kind().as_str().to_string(),
            html_path: paths
                .html_path
                .as_ref()
                .map(|p| p.display().to_string()),
            text_path: Some(paths.text_path.display().to_string()),
            metadata: build_metadata(job, &resolved),
            created_at: Utc::now().to_rfc3339(),
        };

        upsert_content(&self.pool, &record).await?;
        self.index
            .update_document(&job.id, record.title.as_deref(), &resolved.text)
            .await?;
        record_audit(&self.pool, &job.id, AuditStatus::Completed, None).await?;

        Ok(record)
    }

    /// Fetch and extract when the payload resolves to a URL; otherwise use
    /// the payload's inline HTML/text.
    async fn resolve_content(&self, job: &Job) -> Result<Resolved> {
        let payload_title = job.payload.title().map(str::to_string);

        if let Some(url) = job.payload.resolve_url() {
            let page = self.fetcher.fetch(url).await?;
            let extracted = extract_page(&page)?;
            let html = page.is_html().then(|| page.body.clone());
            return Ok(Resolved {
                title: extracted.title.or(payload_title),
                html,
                text: extracted.text,
                final_url: Some(page.url),
                fetched: true,
            });
        }

        let html = job.payload.inline_html().map(str::to_string);
        let text = match (job.payload.inline_text(), html.as_deref()) {
            (Some(text), _) => text.to_string(),
            (None, Some(html)) => html_to_text(html),
            (None, None) => String::new(),
        };
        if text.trim().is_empty() {
            bail!(
                "{} job {} has no url, html, or text to process",
                job.kind(),
                job.id
            );
        }

        let title = payload_title.or_else(|| {
            html.as_deref()
                .and_then(|h| extract_title(&Html::parse_document(h)))
        });

        Ok(Resolved {
            title,
            html,
            text,
            final_url: None,
            fetched: false,
        })
    }
}

fn build_metadata(job: &Job, resolved: &Resolved) -> Value {
    // Payload minus the bulky content fields, which live in the archive.
    let mut payload = serde_json::to_value(&job.payload).unwrap_or(Value::Null);
    if let Some(obj) = payload.as_object_mut() {
        for key in ["html", "text", "summary"] {
            obj.remove(key);
        }
    }

    json!({
        "job_type": job.kind().as_str(),
        "job_created_at": job.created_at.to_rfc3339(),
        "origin_manifest_id": job.origin_manifest_id,
        "notes": job.notes,
        "fetched": resolved.fetched,
        "final_url": resolved.final_url,
        "word_count": resolved.text.split_whitespace().count(),
        "payload": payload,
    })
}

fn failure_report(claim: &Claim, err: &anyhow::Error) -> String {
    let kind = claim
        .job
        .as_ref()
        .map(|j| j.kind().as_str())
        .unwrap_or("unknown");
    format!(
        "job: {}\ntype: {}\nfailed_at: {}\n\n{:?}\n",
        claim.id,
        kind,
        Utc::now().to_rfc3339(),
        err
    )
}

/// CLI entry point for `atlas worker`.
pub async fn run_worker(config: &Config, max_iterations: Option<u64>) -> Result<()> {
    let worker = Worker::new(config).await?;
    let stats = worker.run(max_iterations).await;
    worker.close().await;
    let stats = stats?;

    println!("worker");
    println!("  iterations: {}", stats.iterations);
    println!("  completed: {}", stats.completed);
    println!("  failed: {}", stats.failed);
    println!("  idle: {}", stats.idle);
    if stats.errors > 0 {
        println!("  errors: {}", stats.errors);
    }
    println!("ok");
    Ok(())
}
