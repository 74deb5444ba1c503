//! The `content` table and the `queue_audit` log.
//!
//! Content rows are written with `INSERT OR REPLACE` keyed by job id, so
//! reprocessing a job overwrites its row instead of adding another one.
//! The audit log is append-only: one row per terminal job outcome.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::{AuditStatus, ContentRecord};

pub async fn upsert_content(pool: &SqlitePool, record: &ContentRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO content
            (id, url, title, source, content_type, html_path, text_path, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.url)
    .bind(&record.title)
    .bind(&record.source)
    .bind(&record.content_type)
    .bind(&record.html_path)
    .bind(&record.text_path)
    .bind(record.metadata.to_string())
    .bind(&record.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_content(pool: &SqlitePool, id: &str) -> Result<Option<ContentRecord>> {
    let row = sqlx::query(
        "SELECT id, url, title, source, content_type, html_path, text_path, metadata, created_at \
         FROM content WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| {
        let metadata: String = row.get("metadata");
        ContentRecord {
            id: row.get("id"),
            url: row.get("url"),
            title: row.get("title"),
            source: row.get("source"),
            content_type: row.get("content_type"),
            html_path: row.get("html_path"),
            text_path: row.get("text_path"),
            metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
            created_at: row.get("created_at"),
        }
    }))
}

pub async fn count_content(pool: &SqlitePool) -> Result<i64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// Append one audit row for a job's terminal outcome.
pub async fn record_audit(
    pool: &SqlitePool,
    job_id: &str,
    status: AuditStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO queue_audit (job_id, status, processed_at, error) VALUES (?, ?, ?, ?)",
    )
    .bind(job_id)
    .bind(status.as_str())
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(error)
    .execute(pool)
    .await?;

    Ok(())
}

/// A row of `queue_audit`.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub job_id: String,
    pub status: String,
    pub processed_at: String,
    pub error: Option<String>,
}

/// All audit rows for one job, oldest first.
pub async fn audit_history(pool: &SqlitePool, job_id: &str) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query(
        "SELECT job_id, status, processed_at, error FROM queue_audit WHERE job_id = ? ORDER BY id ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(audit_from_row).collect())
}

/// Most recent failures, newest first.
pub async fn recent_failures(pool: &SqlitePool, limit: i64) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query(
        "SELECT job_id, status, processed_at, error FROM queue_audit \
         WHERE status = 'failed' ORDER BY id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(audit_from_row).collect())
}

fn audit_from_row(row: &sqlx::sqlite::SqliteRow) -> AuditEntry {
    AuditEntry {
        job_id: row.get("job_id"),
        status: row.get("status"),
        processed_at: row.get("processed_at"),
        error: row.get("error"),
    }
}

/// CLI entry point for `atlas get <id>`.
pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let record = get_content(&pool, id).await?;
    let history = audit_history(&pool, id).await?;
    pool.close().await;

    let Some(record) = record else {
        bail!("content not found: {}", id);
    };

    println!("--- Content ---");
    println!("id:           {}", record.id);
    println!(
        "title:        {}",
        record.title.as_deref().unwrap_or("(untitled)")
    );
    println!("source:       {}", record.source);
    println!("content_type: {}", record.content_type);
    if let Some(ref url) = record.url {
        println!("url:          {}", url);
    }
    if let Some(ref p) = record.html_path {
        println!("html_path:    {}", p);
    }
    if let Some(ref p) = record.text_path {
        println!("text_path:    {}", p);
    }
    println!("created_at:   {}", record.created_at);
    println!("metadata:     {}", record.metadata);

    if !history.is_empty() {
        println!();
        println!("--- Audit ---");
        for entry in &history {
            match entry.error {
                Some(ref err) => println!("{}  {}  {}", entry.processed_at, entry.status, err),
                None => println!("{}  {}", entry.processed_at, entry.status),
            }
        }
    }

    if let Some(ref p) = record.text_path {
        if let Ok(text) = std::fs::read_to_string(p) {
            println!();
            println!("--- Text ---");
            println!("{}", text);
        }
    }

    Ok(())
}
