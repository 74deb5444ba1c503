//! Gmail polling over IMAP.
//!
//! For each configured label the adapter asks the [`MailSource`] for messages
//! with a UID above the last one seen, saves the raw RFC 822 bytes under
//! `RAW_ROOT/email/`, and enqueues one `email` job per new Message-ID.
//!
//! Dedup state: Message-IDs are recorded in `processed_entries` under the
//! key `gmail`, so a message filed under two labels is ingested once. The
//! highest UID per label lives in `feed_state` under `gmail:{label}`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::config::{Config, GmailSettings};
use crate::db;
use crate::feed_state::{get_last_guid, has_processed_entry, mark_processed_entry, set_last_guid};
use crate::ingest::{IngestError, PollSummary};
use crate::migrate::migrate_pool;
use crate::models::{EmailPayload, JobPayload};
use crate::queue::Queue;

pub const SOURCE: &str = "gmail";
const DEDUP_KEY: &str = "gmail";

/// Validated IMAP connection settings.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub app_password: String,
    pub labels: Vec<String>,
}

impl GmailConfig {
    /// Fails when the username or app password is missing.
    pub fn from_settings(settings: &GmailSettings) -> Result<Self, IngestError> {
        let username = settings
            .username
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or(IngestError::NotConfigured("GMAIL_USERNAME"))?;
        let app_password = settings
            .app_password
            .clone()
            .filter(|s| !s.trim().is_empty())
            .ok_or(IngestError::NotConfigured("GMAIL_APP_PASSWORD"))?;

        Ok(Self {
            host: settings.host.clone(),
            port: settings.port,
            username,
            app_password,
            labels: settings.labels.clone(),
        })
    }
}

/// A message as delivered by the mailbox.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: u32,
    pub bytes: Vec<u8>,
}

/// A mailbox that can list messages newer than a UID.
#[async_trait]
pub trait MailSource: Send + Sync {
    async fn fetch_since(&self, label: &str, after_uid: Option<u32>) -> Result<Vec<RawMessage>>;
}

/// IMAP over TLS.
pub struct ImapMailSource {
    config: GmailConfig,
}

impl ImapMailSource {
    pub fn new(config: GmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailSource for ImapMailSource {
    async fn fetch_since(&self, label: &str, after_uid: Option<u32>) -> Result<Vec<RawMessage>> {
        let config = self.config.clone();
        let label = label.to_string();
        // The imap crate is blocking.
        tokio::task::spawn_blocking(move || imap_fetch(&config, &label, after_uid))
            .await
            .context("IMAP task panicked")?
    }
}

fn imap_fetch(config: &GmailConfig, label: &str, after_uid: Option<u32>) -> Result<Vec<RawMessage>> {
    let tls = native_tls::TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    let client = imap::connect((config.host.as_str(), config.port), config.host.as_str(), &tls)
        .map_err(|e| anyhow!("IMAP connect to {}:{} failed: {}", config.host, config.port, e))?;
    let mut session = client
        .login(&config.username, &config.app_password)
        .map_err(|(e, _)| anyhow!("IMAP login failed: {}", e))?;

    session
        .select(label)
        .map_err(|e| anyhow!("IMAP select '{}' failed: {}", label, e))?;

    let start = after_uid.map(|u| u.saturating_add(1)).unwrap_or(1);
    let found = session
        .uid_search(format!("UID {}:*", start))
        .map_err(|e| anyhow!("IMAP search failed: {}", e))?;

    // "n:*" always matches the newest message, even when its UID is below n.
    let mut uids: Vec<u32> = found
        .into_iter()
        .filter(|uid| after_uid.map_or(true, |last| *uid > last))
        .collect();
    uids.sort_unstable();

    let mut messages = Vec::new();
    if !uids.is_empty() {
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let fetches = session
            .uid_fetch(set, "RFC822")
            .map_err(|e| anyhow!("IMAP fetch failed: {}", e))?;
        for fetch in fetches.iter() {
            if let (Some(uid), Some(body)) = (fetch.uid, fetch.body()) {
                messages.push(RawMessage {
                    uid,
                    bytes: body.to_vec(),
                });
            }
        }
    }

    if let Err(e) = session.logout() {
        debug!("IMAP logout failed: {}", e);
    }
    messages.sort_by_key(|m| m.uid);
    Ok(messages)
}

/// Fields pulled out of an RFC 822 message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedMessage {
    pub message_id: String,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub date: Option<String>,
    pub html: Option<String>,
    pub text: Option<String>,
    pub urls: Vec<String>,
}

pub fn parse_message(bytes: &[u8]) -> Result<ParsedMessage> {
    let mail = mailparse::parse_mail(bytes).context("Failed to parse email")?;
    let headers = mail.get_headers();
    let header = |name: &str| {
        headers
            .get_first_value(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let message_id = header("Message-ID")
        .unwrap_or_else(|| format!("sha256:{:x}", Sha256::digest(bytes)));

    let mut html = None;
    let mut text = None;
    collect_bodies(&mail, &mut html, &mut text)?;

    let mut urls = Vec::new();
    if let Some(t) = &text {
        push_urls(t, &mut urls);
    }
    if let Some(h) = &html {
        push_urls(&h.replace("&amp;", "&"), &mut urls);
    }

    Ok(ParsedMessage {
        message_id,
        subject: header("Subject"),
        from: header("From"),
        date: header("Date"),
        html,
        text,
        urls,
    })
}

/// First `text/html` and `text/plain` leaf parts, attachments skipped.
fn collect_bodies(
    part: &ParsedMail,
    html: &mut Option<String>,
    text: &mut Option<String>,
) -> Result<()> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_bodies(sub, html, text)?;
        }
        return Ok(());
    }

    if part.get_content_disposition().disposition == DispositionType::Attachment {
        return Ok(());
    }

    let slot = match part.ctype.mimetype.as_str() {
        "text/html" => html,
        "text/plain" => text,
        _ => return Ok(()),
    };
    if slot.is_none() {
        let body = part.get_body().context("Failed to decode email body")?;
        if !body.trim().is_empty() {
            *slot = Some(body);
        }
    }
    Ok(())
}

fn url_regex() -> Option<&'static Regex> {
    static URLS: OnceLock<Option<Regex>> = OnceLock::new();
    URLS.get_or_init(|| Regex::new(r#"https?://[^\s<>"'()\[\]]+"#).ok())
        .as_ref()
}

/// Append the http(s) links in `text` to `out`, skipping duplicates.
pub fn push_urls(text: &str, out: &mut Vec<String>) {
    let Some(re) = url_regex() else {
        return;
    };
    for m in re.find_iter(text) {
        let url = m
            .as_str()
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'));
        if !out.iter().any(|u| u == url) {
            out.push(url.to_string());
        }
    }
}

fn save_raw(raw_root: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let dir = raw_root.join("email");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(format!("{:x}.eml", Sha256::digest(bytes)));
    std::fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Enqueue the new messages of one label and advance its UID watermark.
///
/// The watermark only moves up to the last message below the first one that
/// failed to parse, so a broken message is fetched (and reported) again on
/// the next poll. Messages after it are deduplicated by Message-ID.
pub async fn ingest_messages(
    pool: &SqlitePool,
    queue: &Queue,
    raw_root: &Path,
    label: &str,
    mut messages: Vec<RawMessage>,
) -> Result<PollSummary> {
    let mut summary = PollSummary {
        sources: 1,
        ..Default::default()
    };
    messages.sort_by_key(|m| m.uid);
    let mut watermark: Option<u32> = None;
    let mut blocked = false;

    for message in messages {
        summary.seen += 1;
        let parsed = match parse_message(&message.bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(label, uid = message.uid, "skipping unparseable message: {:#}", e);
                summary.errors += 1;
                blocked = true;
                continue;
            }
        };
        if !blocked {
            watermark = Some(message.uid);
        }
        if has_processed_entry(pool, DEDUP_KEY, &parsed.message_id).await? {
            summary.skipped += 1;
            continue;
        }

        let raw_path = save_raw(raw_root, &message.bytes)?;
        let payload = JobPayload::Email(EmailPayload {
            message_id: parsed.message_id.clone(),
            label: Some(label.to_string()),
            subject: parsed.subject,
            from: parsed.from,
            date: parsed.date,
            urls: parsed.urls,
            html: parsed.html,
            text: parsed.text,
            raw_path: Some(raw_path.display().to_string()),
            extra: Default::default(),
        });
        queue.create_job(payload, SOURCE, None, None)?;
        mark_processed_entry(pool, DEDUP_KEY, &parsed.message_id).await?;
        summary.enqueued += 1;
    }

    let uid = watermark.map(|u| u.to_string());
    set_last_guid(pool, &format!("gmail:{}", label), uid.as_deref()).await?;
    Ok(summary)
}

/// Poll every label. A label that fails is logged and counted.
pub async fn poll_labels(
    pool: &SqlitePool,
    queue: &Queue,
    raw_root: &Path,
    source: &dyn MailSource,
    labels: &[String],
) -> PollSummary {
    let mut total = PollSummary::default();

    for label in labels {
        let result: Result<PollSummary> = async {
            let last = get_last_guid(pool, &format!("gmail:{}", label))
                .await?
                .and_then(|s| s.parse::<u32>().ok());
            let messages = source.fetch_since(label, last).await?;
            ingest_messages(pool, queue, raw_root, label, messages).await
        }
        .await;

        match result {
            Ok(summary) => {
                info!(label = %label, enqueued = summary.enqueued, "polled label");
                total.merge(summary);
            }
            Err(e) => {
                warn!(label = %label, "label poll failed: {:#}", e);
                total.sources += 1;
                total.errors += 1;
            }
        }
    }

    total
}

pub async fn poll_gmail(config: &Config) -> Result<PollSummary> {
    let gmail = GmailConfig::from_settings(&config.gmail)?;
    let labels = gmail.labels.clone();
    let source = ImapMailSource::new(gmail);

    let queue = Queue::open(&config.paths.queue_root)?;
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;

    let summary = poll_labels(&pool, &queue, &config.paths.raw_root, &source, &labels).await;
    pool.close().await;
    Ok(summary)
}

/// CLI entry point for `atlas poll-gmail`.
pub async fn run_poll_gmail(config: &Config) -> Result<()> {
    poll_gmail(config).await?.print("poll-gmail");
    Ok(())
}
