//! Queue and store overview.
//!
//! [`queue_status`] gathers per-directory job counts, content rows and index
//! size; `atlas status`, `GET /vos/status` and the dashboard all render it.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::content::{count_content, recent_failures};
use crate::db;
use crate::migrate::migrate_pool;
use crate::queue::{Queue, QueueCounts};
use crate::search::SearchIndex;

/// Content rows per source.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceCount {
    pub source: String,
    pub content_type: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub queue: QueueCounts,
    pub content_rows: i64,
    pub indexed_documents: i64,
    pub by_source: Vec<SourceCount>,
}

pub async fn queue_status(config: &Config) -> Result<StatusReport> {
    let queue = Queue::open(&config.paths.queue_root)?;
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    let index = SearchIndex::open(&config.search.index_path).await?;

    let report = build_report(&queue, &pool, &index).await;

    pool.close().await;
    index.close().await;
    report
}

pub async fn build_report(
    queue: &Queue,
    pool: &SqlitePool,
    index: &SearchIndex,
) -> Result<StatusReport> {
    let rows = sqlx::query(
        r#"
        SELECT source, content_type, COUNT(*) AS n
        FROM content
        GROUP BY source, content_type
        ORDER BY n DESC, source ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let by_source = rows
        .iter()
        .map(|row| SourceCount {
            source: row.get("source"),
            content_type: row.get("content_type"),
            count: row.get("n"),
        })
        .collect();

    Ok(StatusReport {
        queue: queue.counts()?,
        content_rows: count_content(pool).await?,
        indexed_documents: index.document_count().await?,
        by_source,
    })
}

/// CLI entry point for `atlas status`.
pub async fn run_status(config: &Config) -> Result<()> {
    let report = queue_status(config).await?;

    let pool = db::connect(config).await?;
    let failures = recent_failures(&pool, 5).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Atlas Status");
    println!("============");
    println!();
    println!("  Queue:       {}", config.paths.queue_root.display());
    println!("    inbox:       {}", report.queue.inbox);
    println!("    processing:  {}", report.queue.processing);
    println!("    completed:   {}", report.queue.completed);
    println!("    failed:      {}", report.queue.failed);
    println!();
    println!("  Database:    {} ({})", config.db.path.display(), format_bytes(db_size));
    println!("  Content:     {}", report.content_rows);
    println!("  Indexed:     {}", report.indexed_documents);

    if !report.by_source.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<24} {:<12} {:>6}", "SOURCE", "TYPE", "ROWS");
        println!("  {}", "-".repeat(44));
        for s in &report.by_source {
            println!("  {:<24} {:<12} {:>6}", s.source, s.content_type, s.count);
        }
    }

    if !failures.is_empty() {
        println!();
        println!("  Recent failures:");
        for f in &failures {
            println!(
                "    {}  {}  {}",
                f.processed_at,
                f.job_id,
                f.error.as_deref().unwrap_or("")
            );
        }
    }

    println!();
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BacklogPayload, JobPayload};
    use tempfile::TempDir;

    #[tokio::test]
    async fn fresh_store_reports_zeroes() {
        let tmp = TempDir::new().unwrap();
        let config = Config::rooted_at(tmp.path());
        let report = queue_status(&config).await.unwrap();

        assert_eq!(report.queue.total(), 0);
        assert_eq!(report.content_rows, 0);
        assert_eq!(report.indexed_documents, 0);
        assert!(report.by_source.is_empty());
    }

    #[tokio::test]
    async fn counts_inbox_jobs_and_serializes_flat() {
        let tmp = TempDir::new().unwrap();
        let config = Config::rooted_at(tmp.path());
        let queue = Queue::open(&config.paths.queue_root).unwrap();
        queue
            .create_job(
                JobPayload::Backlog(BacklogPayload {
                    text: Some("x".to_string()),
                    ..Default::default()
                }),
                "backlog",
                None,
                None,
            )
            .unwrap();

        let report = queue_status(&config).await.unwrap();
        assert_eq!(report.queue.inbox, 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["inbox"], 1);
        assert_eq!(json["failed"], 0);
        assert_eq!(json["content_rows"], 0);
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
