//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/vos/health` | Health check (returns version, never needs a key) |
//! | `POST` | `/vos/ingest/url` | Queue a URL: `{url, source?}` |
//! | `POST` | `/vos/trojanhorse/ingest` | Queue an arbitrary JSON payload (`?source=&notes=`) |
//! | `POST` | `/vos/gmail/poll` | Poll the configured Gmail labels |
//! | `POST` | `/vos/rss/poll` | Poll the configured feeds |
//! | `GET`  | `/vos/search` | Full-text search: `?q=&limit=` |
//! | `GET`  | `/vos/content/{id}` | One content row |
//! | `GET`  | `/vos/status` | Queue counts and store totals |
//! | `GET`  | `/vos/dashboard` | HTML overview |
//!
//! # Auth
//!
//! When `server.api_key` (`ATLAS_API_KEY`) is set, every route except
//! health requires an `X-API-Key` header carrying it.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "q must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `internal` (500).

use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::adapter_gmail::poll_gmail;
use crate::adapter_rss::poll_rss;
use crate::adapter_trojanhorse::ingest_trojanhorse;
use crate::adapter_url::ingest_url;
use crate::config::Config;
use crate::content::get_content;
use crate::db;
use crate::ingest::{IngestError, PollSummary};
use crate::migrate::migrate_pool;
use crate::models::{ContentRecord, Job, SearchHit};
use crate::queue::Queue;
use crate::search::SearchIndex;
use crate::status::{build_report, StatusReport};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    queue: Queue,
    pool: SqlitePool,
    index: Arc<SearchIndex>,
}

impl AppState {
    /// Open the queue, database and search index named by `config`.
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let queue = Queue::open(&config.paths.queue_root)?;
        let pool = db::connect(config).await?;
        migrate_pool(&pool).await?;
        let index = SearchIndex::open(&config.search.index_path).await?;

        Ok(Self {
            config: Arc::new(config.clone()),
            queue,
            pool,
            index: Arc::new(index),
        })
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/vos/ingest/url", post(handle_ingest_url))
        .route("/vos/trojanhorse/ingest", post(handle_trojanhorse))
        .route("/vos/gmail/poll", post(handle_gmail_poll))
        .route("/vos/rss/poll", post(handle_rss_poll))
        .route("/vos/search", get(handle_search))
        .route("/vos/content/{id}", get(handle_content))
        .route("/vos/status", get(handle_status))
        .route("/vos/dashboard", get(handle_dashboard))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/vos/health", get(handle_health))
        .merge(protected)
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `server.bind` until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::new(config).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(
        bind = %config.server.bind,
        auth = config.server.api_key.is_some(),
        "atlas API listening"
    );
    println!("Atlas API listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

// ============ Auth ============

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = state.config.server.api_key.as_deref() {
        let given = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if given != Some(expected) {
            return unauthorized("missing or invalid X-API-Key").into_response();
        }
    }
    next.run(request).await
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Caller mistakes ([`IngestError`]) become 400; everything else is 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<IngestError>() {
            return bad_request(e.to_string());
        }
        error!("request failed: {:#}", err);
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: format!("{:#}", err),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

// ============ GET /vos/health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Ingestion ============

#[derive(Serialize)]
struct JobCreated {
    job_id: String,
    #[serde(rename = "type")]
    kind: String,
}

impl From<Job> for JobCreated {
    fn from(job: Job) -> Self {
        Self {
            kind: job.kind().as_str().to_string(),
            job_id: job.id,
        }
    }
}

#[derive(Deserialize)]
struct IngestUrlRequest {
    url: String,
    #[serde(default)]
    source: Option<String>,
}

async fn handle_ingest_url(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<JobCreated>, AppError> {
    let req: IngestUrlRequest = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("invalid request body: {}", e)))?;
    let job = ingest_url(&state.queue, &req.url, req.source.as_deref())?;
    Ok(Json(job.into()))
}

#[derive(Deserialize)]
struct TrojanHorseQuery {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

async fn handle_trojanhorse(
    State(state): State<AppState>,
    Query(params): Query<TrojanHorseQuery>,
    body: Bytes,
) -> Result<Json<JobCreated>, AppError> {
    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("body is not valid JSON: {}", e)))?;
    let job = ingest_trojanhorse(
        &state.queue,
        &state.config.paths.raw_root,
        value,
        params.source.as_deref(),
        params.notes,
    )?;
    Ok(Json(job.into()))
}

async fn handle_gmail_poll(State(state): State<AppState>) -> Result<Json<PollSummary>, AppError> {
    Ok(Json(poll_gmail(&state.config).await?))
}

async fn handle_rss_poll(State(state): State<AppState>) -> Result<Json<PollSummary>, AppError> {
    Ok(Json(poll_rss(&state.config).await?))
}

// ============ GET /vos/search ============

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, AppError> {
    if params.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let limit = params
        .limit
        .unwrap_or(state.config.search.default_limit)
        .clamp(1, 100);
    let results = state.index.search(&params.q, limit).await?;
    Ok(Json(SearchResponse {
        query: params.q,
        results,
    }))
}

// ============ GET /vos/content/{id} ============

async fn handle_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ContentRecord>, AppError> {
    get_content(&state.pool, &id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("content not found: {}", id)))
}

// ============ Status ============

async fn handle_status(State(state): State<AppState>) -> Result<Json<StatusReport>, AppError> {
    Ok(Json(
        build_report(&state.queue, &state.pool, &state.index).await?,
    ))
}

async fn handle_dashboard(State(state): State<AppState>) -> Result<Html<String>, AppError> {
    let report = build_report(&state.queue, &state.pool, &state.index).await?;
    Ok(Html(render_dashboard(&report)))
}

fn render_dashboard(report: &StatusReport) -> String {
    let mut rows = String::new();
    for (name, count) in [
        ("inbox", report.queue.inbox),
        ("processing", report.queue.processing),
        ("completed", report.queue.completed),
        ("failed", report.queue.failed),
    ] {
        rows.push_str(&format!("<tr><td>{}</td><td>{}</td></tr>\n", name, count));
    }

    let mut sources = String::new();
    for s in &report.by_source {
        sources.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(&s.source),
            escape_html(&s.content_type),
            s.count
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Atlas</title>
<style>body{{font-family:sans-serif;margin:2em}}td,th{{padding:.2em 1em;text-align:left}}</style>
</head>
<body>
<h1>Atlas</h1>
<h2>Queue</h2>
<table>
<tr><th>directory</th><th>jobs</th></tr>
{rows}</table>
<p>{content} content rows, {indexed} indexed documents</p>
<h2>Sources</h2>
<table>
<tr><th>source</th><th>type</th><th>rows</th></tr>
{sources}</table>
</body>
</html>
"#,
        rows = rows,
        content = report.content_rows,
        indexed = report.indexed_documents,
        sources = sources,
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueCounts;
    use crate::status::SourceCount;

    #[test]
    fn dashboard_lists_counts_and_escapes_sources() {
        let report = StatusReport {
            queue: QueueCounts {
                inbox: 3,
                processing: 0,
                completed: 12,
                failed: 1,
            },
            content_rows: 12,
            indexed_documents: 12,
            by_source: vec![SourceCount {
                source: "<script>".to_string(),
                content_type: "url".to_string(),
                count: 12,
            }],
        };
        let html = render_dashboard(&report);
        assert!(html.contains("<tr><td>inbox</td><td>3</td></tr>"));
        assert!(html.contains("<tr><td>failed</td><td>1</td></tr>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<td><script>"));
    }

    #[test]
    fn ingest_errors_map_to_bad_request() {
        let err: AppError = anyhow::Error::new(IngestError::InvalidPayload("x".into())).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "bad_request");

        let err: AppError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code, "internal");
    }
}
