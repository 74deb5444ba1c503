//! Types shared by the ingestion adapters.
//!
//! Every adapter ends in [`Queue::create_job`](crate::queue::Queue::create_job).
//! Input the caller got wrong is reported as an [`IngestError`] so the HTTP
//! layer can answer 400 instead of 500; polling adapters report a
//! [`PollSummary`].

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

/// Outcome of one polling pass over a set of sources (feeds, labels,
/// manifest entries).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    /// Sources visited.
    pub sources: usize,
    /// Items seen across all sources.
    pub seen: usize,
    /// New jobs written to the inbox.
    pub enqueued: usize,
    /// Items skipped because they were already processed.
    pub skipped: usize,
    /// Sources or items that failed; each is logged.
    pub errors: usize,
}

impl PollSummary {
    pub fn merge(&mut self, other: PollSummary) {
        self.sources += other.sources;
        self.seen += other.seen;
        self.enqueued += other.enqueued;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }

    /// Print in the CLI's `key: value` layout.
    pub fn print(&self, title: &str) {
        println!("{}", title);
        println!("  sources: {}", self.sources);
        println!("  seen: {}", self.seen);
        println!("  enqueued: {}", self.enqueued);
        println!("  skipped: {}", self.skipped);
        println!("  errors: {}", self.errors);
        println!("ok");
    }
}
