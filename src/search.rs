//! Full-text search index.
//!
//! Documents are stored in an SQLite FTS5 table inside their own database
//! file (`{index_path}/index.sqlite`), keyed by job id. Writes go through
//! [`SearchIndex::update_document`], which replaces any previous version of
//! the document, so reprocessing a job never produces duplicate hits.
//!
//! Free-text queries are reduced to their word tokens, each quoted and
//! ANDed, so user input containing FTS5 operators or punctuation cannot
//! produce a syntax error.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::models::SearchHit;

const INDEX_FILE: &str = "index.sqlite";

pub struct SearchIndex {
    pool: SqlitePool,
}

impl SearchIndex {
    /// Open (or create) the index stored under `dir`.
    pub async fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create search index dir {}", dir.display()))?;
        let pool = db::connect_at(&dir.join(INDEX_FILE)).await?;

        // FTS5 CREATE is not idempotent natively, so we check first
        let fts_exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
        )
        .fetch_one(&pool)
        .await?;

        if !fts_exists {
            sqlx::query(
                r#"
                CREATE VIRTUAL TABLE documents_fts USING fts5(
                    doc_id UNINDEXED,
                    title,
                    body,
                    tokenize = 'porter unicode61'
                )
                "#,
            )
            .execute(&pool)
            .await?;
        }

        Ok(Self { pool })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Insert or replace the document stored under `id`.
    pub async fn update_document(&self, id: &str, title: Option<&str>, body: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM documents_fts WHERE doc_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO documents_fts (doc_id, title, body) VALUES (?, ?, ?)")
            .bind(id)
            .bind(title.unwrap_or(""))
            .bind(body)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_document(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents_fts WHERE doc_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn document_count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents_fts")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Ranked search. Title matches weigh twice as much as body matches.
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
        let Some(match_expr) = build_match_query(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT doc_id, title,
                   bm25(documents_fts, 0.0, 2.0, 1.0) AS rank,
                   snippet(documents_fts, 2, '>>>', '<<<', '...', 24) AS snippet
            FROM documents_fts
            WHERE documents_fts MATCH ?
            ORDER BY rank, doc_id
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        let hits = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                let title: Option<String> = row.get("title");
                SearchHit {
                    id: row.get("doc_id"),
                    title: title.filter(|t| !t.is_empty()),
                    score: -rank, // negate so higher = better
                    snippet: row.get("snippet"),
                }
            })
            .collect();

        Ok(hits)
    }
}

/// Turn free text into an FTS5 MATCH expression: every word token quoted,
/// implicitly ANDed. Returns `None` when the query has no tokens.
pub fn build_match_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// CLI entry point for `atlas search`.
pub async fn run_search(config: &Config, query: &str, limit: Option<i64>) -> Result<()> {
    let index = SearchIndex::open(&config.search.index_path).await?;
    let hits = index
        .search(query, limit.unwrap_or(config.search.default_limit))
        .await?;
    index.close().await;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}",
            i + 1,
            hit.score,
            hit.title.as_deref().unwrap_or("(untitled)")
        );
        println!(
            "    excerpt: \"{}\"",
            hit.snippet.replace('\n', " ").trim()
        );
        println!("    id: {}", hit.id);
        println!();
    }

    Ok(())
}
