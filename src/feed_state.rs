//! Dedup state for polling adapters.
//!
//! `processed_entries` is the set of `(feed key, guid)` pairs that have
//! already become jobs; `feed_state` remembers the newest guid seen per feed
//! key. RSS uses the feed URL as key for both. Gmail records Message-IDs under
//! `gmail` and the highest IMAP UID per label under `gmail:{label}`. Backlog
//! replays use `backlog:{manifest id}`.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn has_processed_entry(pool: &SqlitePool, feed_url: &str, guid: &str) -> Result<bool> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM processed_entries WHERE feed_url = ? AND guid = ?")
            .bind(feed_url)
            .bind(guid)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

pub async fn mark_processed_entry(pool: &SqlitePool, feed_url: &str, guid: &str) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO processed_entries (feed_url, guid, processed_at) VALUES (?, ?, ?)",
    )
    .bind(feed_url)
    .bind(guid)
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_last_guid(pool: &SqlitePool, feed_url: &str) -> Result<Option<String>> {
    let guid: Option<Option<String>> =
        sqlx::query_scalar("SELECT last_guid FROM feed_state WHERE feed_url = ?")
            .bind(feed_url)
            .fetch_optional(pool)
            .await?;
    Ok(guid.flatten())
}

/// Record a poll of `feed_url`. `last_guid` is only overwritten when given.
pub async fn set_last_guid(pool: &SqlitePool, feed_url: &str, last_guid: Option<&str>) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO feed_state (feed_url, last_guid, last_polled_at) VALUES (?, ?, ?)
        ON CONFLICT(feed_url) DO UPDATE SET
            last_guid = COALESCE(excluded.last_guid, feed_state.last_guid),
            last_polled_at = excluded.last_polled_at
        "#,
    )
    .bind(feed_url)
    .bind(last_guid)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_processed(pool: &SqlitePool, feed_url: &str) -> Result<i64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_entries WHERE feed_url = ?")
        .bind(feed_url)
        .fetch_one(pool)
        .await?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate::migrate_pool;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_at(&tmp.path().join("atlas.sqlite")).await.unwrap();
        migrate_pool(&pool).await.unwrap();
        (tmp, pool)
    }

    #[tokio::test]
    async fn processed_entries_roundtrip() {
        let (_tmp, pool) = setup().await;
        let feed = "https://example.com/feed.xml";

        assert!(!has_processed_entry(&pool, feed, "g1").await.unwrap());
        mark_processed_entry(&pool, feed, "g1").await.unwrap();
        mark_processed_entry(&pool, feed, "g1").await.unwrap();
        assert!(has_processed_entry(&pool, feed, "g1").await.unwrap());
        assert!(!has_processed_entry(&pool, "https://other.example/rss", "g1")
            .await
            .unwrap());
        assert_eq!(count_processed(&pool, feed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn last_guid_is_kept_when_poll_finds_nothing() {
        let (_tmp, pool) = setup().await;
        let feed = "gmail:INBOX";

        assert_eq!(get_last_guid(&pool, feed).await.unwrap(), None);
        set_last_guid(&pool, feed, Some("42")).await.unwrap();
        set_last_guid(&pool, feed, None).await.unwrap();
        assert_eq!(get_last_guid(&pool, feed).await.unwrap().as_deref(), Some("42"));
        set_last_guid(&pool, feed, Some("57")).await.unwrap();
        assert_eq!(get_last_guid(&pool, feed).await.unwrap().as_deref(), Some("57"));
    }
}
