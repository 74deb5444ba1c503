//! # Atlas
//!
//! A personal content-ingestion pipeline. Producers (manual URLs, RSS and
//! podcast feeds, Gmail newsletters, backlog exports, ad-hoc JSON pushes)
//! drop jobs into a file-based queue; a single worker fetches, extracts,
//! archives and indexes them into SQLite with full-text search.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌───────────┐   ┌──────────┐   ┌──────────────────┐
//! │  Adapters   │──▶│   Queue   │──▶│  Worker  │──▶│ archive + SQLite │
//! │ url/rss/... │   │ inbox/... │   │ fetch+ex │   │ content + FTS5   │
//! └─────────────┘   └───────────┘   └──────────┘   └────────┬─────────┘
//!                                                           │
//!                                       ┌───────────────────┤
//!                                       ▼                   ▼
//!                                  ┌──────────┐       ┌──────────┐
//!                                  │   CLI    │       │   HTTP   │
//!                                  │ (atlas)  │       │  (/vos)  │
//!                                  └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! atlas init                             # create queue dirs, database, index
//! atlas ingest-url https://example.com/post
//! atlas worker --max-iterations 1
//! atlas search "example"
//! atlas serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML + environment configuration |
//! | [`models`] | Jobs, payloads, content records |
//! | [`queue`] | File-based job queue and worker lock |
//! | [`archive`] | On-disk HTML/text archive |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`content`] | Content table and audit log |
//! | [`feed_state`] | Dedup state for polling adapters |
//! | [`search`] | Full-text index |
//! | [`extract`] | Fetching and readable-text extraction |
//! | [`ingest`] | Types shared by the adapters |
//! | `adapter_*` | Ingestion producers |
//! | [`worker`] | Processor loop |
//! | [`status`] | Queue and store overview |
//! | [`server`] | HTTP API |

pub mod adapter_backlog;
pub mod adapter_gmail;
pub mod adapter_rss;
pub mod adapter_trojanhorse;
pub mod adapter_url;
pub mod archive;
pub mod config;
pub mod content;
pub mod db;
pub mod extract;
pub mod feed_state;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod search;
pub mod server;
pub mod status;
pub mod worker;
