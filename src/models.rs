//! Core data models used throughout Atlas.
//!
//! A [`Job`] is the unit of ingestion work. Its payload is a tagged union
//! ([`JobPayload`]) resolved by the job's `type` field, so every producer and
//! the worker agree on the shape of what travels through the queue.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of ingestion job, serialized as the job file's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Url,
    RssItem,
    Email,
    Backlog,
    Trojanhorse,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Url,
        JobKind::RssItem,
        JobKind::Email,
        JobKind::Backlog,
        JobKind::Trojanhorse,
    ];

    /// Static scheduling priority. Lower values are claimed first.
    pub fn priority(self) -> u8 {
        match self {
            JobKind::RssItem | JobKind::Email => 1,
            JobKind::Trojanhorse | JobKind::Url => 2,
            JobKind::Backlog => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Url => "url",
            JobKind::RssItem => "rss_item",
            JobKind::Email => "email",
            JobKind::Backlog => "backlog",
            JobKind::Trojanhorse => "trojanhorse",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown job type: '{}'", s))
    }
}

// ============ Payloads ============

/// A URL submitted by hand or through the API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UrlPayload {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One entry of an RSS/Atom feed (articles and podcast episodes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RssItemPayload {
    pub feed_url: String,
    pub guid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Entry summary or content, usually HTML.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    /// Podcast audio (or other media) attached to the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclosure_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A mail message pulled from a Gmail label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Links found in the message body.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Where the raw RFC 822 message was saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_path: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An item replayed from a backlog manifest (CSV row, JSON item, or file).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacklogPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Row number, array index, or relative file path inside the manifest source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_entry: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An ad-hoc external payload. Only the well-known keys are typed; all
/// other keys are preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrojanHorsePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Job payload, discriminated by [`JobKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Url(UrlPayload),
    RssItem(RssItemPayload),
    Email(EmailPayload),
    Backlog(BacklogPayload),
    Trojanhorse(TrojanHorsePayload),
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Url(_) => JobKind::Url,
            JobPayload::RssItem(_) => JobKind::RssItem,
            JobPayload::Email(_) => JobKind::Email,
            JobPayload::Backlog(_) => JobKind::Backlog,
            JobPayload::Trojanhorse(_) => JobKind::Trojanhorse,
        }
    }

    /// Decode a raw payload object according to `kind`.
    pub fn from_value(kind: JobKind, value: Value) -> serde_json::Result<Self> {
        let value = if value.is_null() {
            Value::Object(Map::new())
        } else {
            value
        };
        Ok(match kind {
            JobKind::Url => JobPayload::Url(serde_json::from_value(value)?),
            JobKind::RssItem => JobPayload::RssItem(serde_json::from_value(value)?),
            JobKind::Email => JobPayload::Email(serde_json::from_value(value)?),
            JobKind::Backlog => JobPayload::Backlog(serde_json::from_value(value)?),
            JobKind::Trojanhorse => JobPayload::Trojanhorse(serde_json::from_value(value)?),
        })
    }

    /// The URL the worker should fetch, if the payload resolves to one.
    /// Email jobs never resolve to a URL: the message itself is the content.
    pub fn resolve_url(&self) -> Option<&str> {
        match self {
            JobPayload::Url(p) => Some(p.url.trim()).filter(|u| !u.is_empty()),
            JobPayload::RssItem(p) => non_empty(&p.url),
            JobPayload::Email(_) => None,
            JobPayload::Backlog(p) => non_empty(&p.url),
            JobPayload::Trojanhorse(p) => non_empty(&p.url),
        }
    }

    /// HTML carried inline in the payload.
    pub fn inline_html(&self) -> Option<&str> {
        match self {
            JobPayload::Url(p) => non_empty(&p.html),
            JobPayload::RssItem(p) => non_empty(&p.summary),
            JobPayload::Email(p) => non_empty(&p.html),
            JobPayload::Backlog(p) => non_empty(&p.html),
            JobPayload::Trojanhorse(p) => non_empty(&p.html),
        }
    }

    /// Plain text carried inline in the payload.
    pub fn inline_text(&self) -> Option<&str> {
        match self {
            JobPayload::Url(p) => non_empty(&p.text),
            JobPayload::RssItem(_) => None,
            JobPayload::Email(p) => non_empty(&p.text),
            JobPayload::Backlog(p) => non_empty(&p.text),
            JobPayload::Trojanhorse(p) => non_empty(&p.text),
        }
    }

    /// Title supplied by the producer, used when extraction finds none.
    pub fn title(&self) -> Option<&str> {
        match self {
            JobPayload::Url(p) => non_empty(&p.title),
            JobPayload::RssItem(p) => non_empty(&p.title),
            JobPayload::Email(p) => non_empty(&p.subject),
            JobPayload::Backlog(p) => non_empty(&p.title),
            JobPayload::Trojanhorse(p) => non_empty(&p.title),
        }
    }
}

impl Serialize for JobPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JobPayload::Url(p) => p.serialize(serializer),
            JobPayload::RssItem(p) => p.serialize(serializer),
            JobPayload::Email(p) => p.serialize(serializer),
            JobPayload::Backlog(p) => p.serialize(serializer),
            JobPayload::Trojanhorse(p) => p.serialize(serializer),
        }
    }
}

// ============ Job ============

/// A unit of ingestion work, stored on disk as `{id}.json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "JobFile")]
pub struct Job {
    pub id: String,
    pub source: String,
    pub payload: JobPayload,
    pub origin_manifest_id: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// On-disk shape of a job file before the payload is resolved.
#[derive(Deserialize)]
struct JobFile {
    id: String,
    #[serde(rename = "type")]
    kind: JobKind,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    origin_manifest_id: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobFile> for Job {
    type Error = String;

    fn try_from(file: JobFile) -> Result<Self, Self::Error> {
        if file.id.trim().is_empty() {
            return Err("job id must not be empty".to_string());
        }
        let payload = JobPayload::from_value(file.kind, file.payload)
            .map_err(|e| format!("invalid {} payload: {}", file.kind, e))?;
        Ok(Job {
            id: file.id,
            source: file
                .source
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| file.kind.as_str().to_string()),
            payload,
            origin_manifest_id: file.origin_manifest_id,
            notes: file.notes,
            // Epoch when absent; `queue::read_job` fills in the file's mtime.
            created_at: file.created_at.unwrap_or_default(),
        })
    }
}

impl Serialize for Job {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Job", 7)?;
        s.serialize_field("id", &self.id)?;
        s.serialize_field("type", &self.kind())?;
        s.serialize_field("source", &self.source)?;
        s.serialize_field("payload", &self.payload)?;
        s.serialize_field("origin_manifest_id", &self.origin_manifest_id)?;
        s.serialize_field("notes", &self.notes)?;
        s.serialize_field("created_at", &self.created_at)?;
        s.end()
    }
}

impl Job {
    /// Build a fresh job with a random UUID and the current timestamp.
    pub fn new(payload: JobPayload, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            payload,
            origin_manifest_id: None,
            notes: None,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }

    pub fn priority(&self) -> u8 {
        self.kind().priority()
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }
}

// ============ Storage records ============

/// Row in the `content` table. `id` is the id of the job that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentRecord {
    pub id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub source: String,
    pub content_type: String,
    pub html_path: Option<String>,
    pub text_path: Option<String>,
    pub metadata: Value,
    pub created_at: String,
}

/// Terminal outcome recorded in `queue_audit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    Completed,
    Failed,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Completed => "completed",
            AuditStatus::Failed => "failed",
        }
    }
}

/// A search result returned from the full-text index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub title: Option<String>,
    pub score: f64,
    pub snippet: String,
}
