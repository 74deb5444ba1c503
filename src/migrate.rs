use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::search::SearchIndex;

/// Create every table Atlas needs. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;

    // The search index lives in its own database file.
    let index = SearchIndex::open(&config.search.index_path).await?;
    index.close().await;
    Ok(())
}

/// Apply the main schema to an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Keyed by job id. url is not unique: two jobs for the same URL give two rows.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content (
            id TEXT PRIMARY KEY,
            url TEXT,
            title TEXT,
            source TEXT NOT NULL,
            content_type TEXT NOT NULL,
            html_path TEXT,
            text_path TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            status TEXT NOT NULL,
            processed_at TEXT NOT NULL,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feed_state (
            feed_url TEXT PRIMARY KEY,
            last_guid TEXT,
            last_polled_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_entries (
            feed_url TEXT NOT NULL,
            guid TEXT NOT NULL,
            processed_at TEXT NOT NULL,
            PRIMARY KEY (feed_url, guid)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_content_url ON content(url)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_content_created_at ON content(created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_audit_job_id ON queue_audit(job_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_audit_status ON queue_audit(status, processed_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
