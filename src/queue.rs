//! File-based job queue.
//!
//! Each job is one `{id}.json` file living in exactly one of four directories
//! under the queue root:
//!
//! ```text
//! inbox/ ──claim──▶ processing/ ──▶ completed/
//!   ▲                    │
//!   │                    └────────▶ failed/  (+ {id}.error.txt)
//!   └──────────requeue──────────────┘
//! ```
//!
//! Transitions are `rename(2)` calls, which are atomic on a single
//! filesystem. Only one worker may consume the queue at a time; that is
//! enforced by [`WorkerLock`], not by the directory layout.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{Job, JobPayload};

const LOCK_FILE: &str = "worker.lock";
const SIDECAR_SUFFIX: &str = ".error.txt";
/// Sort position of files that could not be parsed: after every real job.
const MALFORMED_PRIORITY: u8 = u8::MAX;

/// Queue directory a job file can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    Inbox,
    Processing,
    Completed,
    Failed,
}

impl QueueState {
    pub const ALL: [QueueState; 4] = [
        QueueState::Inbox,
        QueueState::Processing,
        QueueState::Completed,
        QueueState::Failed,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            QueueState::Inbox => "inbox",
            QueueState::Processing => "processing",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
        }
    }

    /// Whether a job may move from `self` to `to`.
    pub fn can_transition_to(self, to: QueueState) -> bool {
        matches!(
            (self, to),
            (QueueState::Inbox, QueueState::Processing)
                | (QueueState::Processing, QueueState::Completed)
                | (QueueState::Processing, QueueState::Failed)
                | (QueueState::Processing, QueueState::Inbox)
                | (QueueState::Failed, QueueState::Inbox)
        )
    }
}

/// Number of job files per queue directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub inbox: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.inbox + self.processing + self.completed + self.failed
    }
}

/// A job file that has been moved into `processing/`.
#[derive(Debug)]
pub struct Claim {
    /// File stem, equal to the job id for well-formed files.
    pub id: String,
    /// Current location of the file (inside `processing/`).
    pub path: PathBuf,
    /// The parsed job, or the reason the file could not be read.
    pub job: std::result::Result<Job, String>,
}

struct InboxEntry {
    path: PathBuf,
    file_name: String,
    priority: u8,
    modified: SystemTime,
    job: std::result::Result<Job, String>,
}

impl InboxEntry {
    fn sort_key(&self) -> (u8, SystemTime, &str) {
        (self.priority, self.modified, self.file_name.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Queue {
    root: PathBuf,
}

impl Queue {
    /// Open the queue rooted at `root`, creating the state directories.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let queue = Self { root: root.into() };
        for state in QueueState::ALL {
            let dir = queue.dir(state);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create queue directory {}", dir.display()))?;
        }
        Ok(queue)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, state: QueueState) -> PathBuf {
        self.root.join(state.dir_name())
    }

    /// Build a job for `payload` and write it into the inbox.
    ///
    /// This is the single entry point every ingestion adapter goes through.
    pub fn create_job(
        &self,
        payload: JobPayload,
        source: &str,
        origin_manifest_id: Option<String>,
        notes: Option<String>,
    ) -> Result<Job> {
        let mut job = Job::new(payload, source);
        job.origin_manifest_id = origin_manifest_id;
        job.notes = notes;
        self.enqueue(&job)?;
        Ok(job)
    }

    /// Write an already-built job into the inbox.
    ///
    /// Fails if a job with the same id exists in any queue directory.
    pub fn enqueue(&self, job: &Job) -> Result<()> {
        validate_id(&job.id)?;
        if let Some(state) = self.locate(&job.id) {
            bail!(
                "job {} already exists in {}/",
                job.id,
                state.dir_name()
            );
        }

        let inbox = self.dir(QueueState::Inbox);
        let tmp = inbox.join(format!(".{}.json.tmp", job.id));
        let dest = inbox.join(job.file_name());

        let json = serde_json::to_vec_pretty(job)?;
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &dest)
            .with_context(|| format!("Failed to move job into {}", dest.display()))?;

        debug!(job_id = %job.id, kind = %job.kind(), "enqueued job");
        Ok(())
    }

    /// Claim the highest-priority job in the inbox.
    ///
    /// Candidates are ordered by `(priority, mtime, file name)`. The winner is
    /// renamed into `processing/`. Returns `None` when the inbox is empty.
    ///
    /// An inbox file whose id already exists in another queue directory is
    /// left where it is and never claimed.
    pub fn claim_next(&self) -> Result<Option<Claim>> {
        let entries = self.scan_inbox()?;
        let Some(best) = entries
            .into_iter()
            .filter(|entry| match self.locate_outside_inbox(&file_stem(&entry.file_name)) {
                Some(state) => {
                    warn!(
                        file = %entry.file_name,
                        existing = state.dir_name(),
                        "duplicate job id in inbox; not claiming"
                    );
                    false
                }
                None => true,
            })
            .min_by(|a, b| a.sort_key().cmp(&b.sort_key()))
        else {
            return Ok(None);
        };

        let dest = self.dir(QueueState::Processing).join(&best.file_name);
        match fs::rename(&best.path, &dest) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Vanished between scan and claim; the next scan will pick another.
                warn!(file = %best.file_name, "inbox file disappeared before claim");
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to claim {}", best.path.display()))
            }
        }

        Ok(Some(Claim {
            id: file_stem(&best.file_name),
            path: dest,
            job: best.job,
        }))
    }

    /// Move a claimed job to `completed/`.
    pub fn complete(&self, claim: &Claim) -> Result<PathBuf> {
        self.transition(&claim.path, QueueState::Processing, QueueState::Completed)
    }

    /// Move a claimed job to `failed/` and write its error sidecar.
    pub fn fail(&self, claim: &Claim, report: &str) -> Result<PathBuf> {
        let dest = self.transition(&claim.path, QueueState::Processing, QueueState::Failed)?;
        let sidecar = self.sidecar_path(&claim.id);
        fs::write(&sidecar, report)
            .with_context(|| format!("Failed to write {}", sidecar.display()))?;
        Ok(dest)
    }

    /// Manually resubmit a failed job: move it back to the inbox and drop
    /// its error sidecar.
    pub fn requeue(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        let src = self.dir(QueueState::Failed).join(format!("{}.json", id));
        if !src.exists() {
            bail!("no failed job with id {}", id);
        }
        let dest = self.transition(&src, QueueState::Failed, QueueState::Inbox)?;
        match fs::remove_file(self.sidecar_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(job_id = %id, "requeued failed job");
        Ok(dest)
    }

    /// Move every file left in `processing/` back to the inbox.
    ///
    /// Files only stay in `processing/` if a worker died mid-job. Must only be
    /// called while holding the [`WorkerLock`].
    pub fn recover_stale(&self) -> Result<usize> {
        let mut recovered = 0;
        for path in json_files(&self.dir(QueueState::Processing))? {
            self.transition(&path, QueueState::Processing, QueueState::Inbox)?;
            recovered += 1;
        }
        if recovered > 0 {
            warn!(recovered, "returned stale claims to the inbox");
        }
        Ok(recovered)
    }

    /// Which directory currently holds the job with `id`, if any.
    pub fn locate(&self, id: &str) -> Option<QueueState> {
        let name = format!("{}.json", id);
        QueueState::ALL
            .into_iter()
            .find(|state| self.dir(*state).join(&name).exists())
    }

    fn locate_outside_inbox(&self, id: &str) -> Option<QueueState> {
        let name = format!("{}.json", id);
        [
            QueueState::Processing,
            QueueState::Completed,
            QueueState::Failed,
        ]
        .into_iter()
        .find(|state| self.dir(*state).join(&name).exists())
    }

    /// Read the error sidecar written for a failed job.
    pub fn failure_report(&self, id: &str) -> Option<String> {
        fs::read_to_string(self.sidecar_path(id)).ok()
    }

    pub fn counts(&self) -> Result<QueueCounts> {
        Ok(QueueCounts {
            inbox: json_files(&self.dir(QueueState::Inbox))?.len(),
            processing: json_files(&self.dir(QueueState::Processing))?.len(),
            completed: json_files(&self.dir(QueueState::Completed))?.len(),
            failed: json_files(&self.dir(QueueState::Failed))?.len(),
        })
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.dir(QueueState::Failed)
            .join(format!("{}{}", id, SIDECAR_SUFFIX))
    }

    fn transition(&self, path: &Path, from: QueueState, to: QueueState) -> Result<PathBuf> {
        if !from.can_transition_to(to) {
            bail!(
                "illegal queue transition {} -> {}",
                from.dir_name(),
                to.dir_name()
            );
        }
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("not a job file: {}", path.display()))?;
        let dest = self.dir(to).join(file_name);
        if dest.exists() {
            bail!(
                "cannot move {} to {}/: a job with that id is already there",
                path.display(),
                to.dir_name()
            );
        }
        fs::rename(path, &dest).with_context(|| {
            format!(
                "Failed to move {} to {}/",
                path.display(),
                to.dir_name()
            )
        })?;
        Ok(dest)
    }

    fn scan_inbox(&self) -> Result<Vec<InboxEntry>> {
        let mut entries = Vec::new();
        for path in json_files(&self.dir(QueueState::Inbox))? {
            let file_name = match path.file_name() {
                Some(n) => n.to_string_lossy().to_string(),
                None => continue,
            };
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let job = read_job(&path);
            let priority = match &job {
                Ok(job) => job.priority(),
                Err(_) => MALFORMED_PRIORITY,
            };
            entries.push(InboxEntry {
                path,
                file_name,
                priority,
                modified,
                job,
            });
        }
        Ok(entries)
    }
}

/// Parse a job file, flattening IO and JSON errors into a message.
///
/// The job's `id` must be a plain file name equal to the file's stem. A file
/// without `created_at` is stamped with its modification time.
pub fn read_job(path: &Path) -> std::result::Result<Job, String> {
    let bytes = fs::read(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let mut value: Value = serde_json::from_slice(&bytes).map_err(|e| malformed(path, e))?;
    if let Some(obj) = value.as_object_mut() {
        if obj.get("created_at").map_or(true, Value::is_null) {
            let modified = fs::metadata(path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            obj.insert(
                "created_at".to_string(),
                Value::String(DateTime::<Utc>::from(modified).to_rfc3339()),
            );
        }
    }
    let job: Job = serde_json::from_value(value).map_err(|e| malformed(path, e))?;

    validate_id(&job.id).map_err(|e| malformed(path, e))?;
    let stem = path
        .file_name()
        .map(|n| file_stem(&n.to_string_lossy()))
        .unwrap_or_default();
    if job.id != stem {
        return Err(malformed(
            path,
            format!("job id '{}' does not match file name {}.json", job.id, stem),
        ));
    }
    Ok(job)
}

fn malformed(path: &Path, reason: impl std::fmt::Display) -> String {
    format!("malformed job file {}: {}", path.display(), reason)
}

/// Visible `*.json` files in `dir`, sorted by name.
fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let read = match fs::read_dir(dir) {
        Ok(r) => r,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };
    for entry in read {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || !name.ends_with(".json") || !path.is_file() {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

fn file_stem(file_name: &str) -> String {
    file_name
        .strip_suffix(".json")
        .unwrap_or(file_name)
        .to_string()
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.starts_with('.')
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0')
    {
        bail!("invalid job id: '{}'", id);
    }
    Ok(())
}

/// Exclusive right to consume the queue, held for the worker's lifetime.
///
/// The lock file is created with `O_EXCL` and holds the owner's PID. It is
/// removed on drop; a worker that crashed leaves it behind and it has to be
/// deleted by hand.
#[derive(Debug)]
pub struct WorkerLock {
    path: PathBuf,
}

impl WorkerLock {
    pub fn acquire(queue: &Queue) -> Result<Self> {
        let path = queue.root().join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                bail!(
                    "another worker holds the queue lock {} (pid {}); remove the file if that worker is gone",
                    path.display(),
                    holder.trim()
                );
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create {}", path.display()))
            }
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }
}

impl Drop for WorkerLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove worker lock");
        }
    }
}

/// CLI entry point for `atlas requeue <id>`.
pub fn run_requeue(config: &Config, id: &str) -> Result<()> {
    let queue = Queue::open(&config.paths.queue_root)?;
    queue.requeue(id)?;
    println!("requeued {}", id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BacklogPayload, EmailPayload, UrlPayload};
    use tempfile::TempDir;

    fn url_payload(url: &str) -> JobPayload {
        JobPayload::Url(UrlPayload {
            url: url.to_string(),
            ..Default::default()
        })
    }

    fn setup() -> (TempDir, Queue) {
        let tmp = TempDir::new().unwrap();
        let queue = Queue::open(tmp.path().join("queue")).unwrap();
        (tmp, queue)
    }

    #[test]
    fn open_creates_state_dirs() {
        let (_tmp, queue) = setup();
        for state in QueueState::ALL {
            assert!(queue.dir(state).is_dir(), "{} missing", state.dir_name());
        }
        assert_eq!(queue.counts().unwrap(), QueueCounts::default());
    }

    #[test]
    fn create_job_writes_inbox_file() {
        let (_tmp, queue) = setup();
        let job = queue
            .create_job(url_payload("https://example.com"), "manual", None, None)
            .unwrap();

        let path = queue.dir(QueueState::Inbox).join(job.file_name());
        assert!(path.exists());
        assert_eq!(read_job(&path).unwrap(), job);
        assert_eq!(queue.locate(&job.id), Some(QueueState::Inbox));
        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(queue.dir(QueueState::Inbox))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let (_tmp, queue) = setup();
        let job = Job::new(url_payload("https://example.com"), "manual");
        queue.enqueue(&job).unwrap();
        assert!(queue.enqueue(&job).is_err());
    }

    #[test]
    fn path_like_ids_are_rejected() {
        let (_tmp, queue) = setup();
        let mut job = Job::new(url_payload("https://example.com"), "manual");
        job.id = "../escape".to_string();
        assert!(queue.enqueue(&job).is_err());
    }

    #[test]
    fn claim_prefers_lower_priority_value() {
        let (_tmp, queue) = setup();
        let backlog = queue
            .create_job(
                JobPayload::Backlog(BacklogPayload {
                    text: Some("old".to_string()),
                    ..Default::default()
                }),
                "backlog",
                None,
                None,
            )
            .unwrap();
        let email = queue
            .create_job(
                JobPayload::Email(EmailPayload {
                    message_id: "<1@x>".to_string(),
                    text: Some("hi".to_string()),
                    ..Default::default()
                }),
                "gmail",
                None,
                None,
            )
            .unwrap();

        let first = queue.claim_next().unwrap().unwrap();
        assert_eq!(first.id, email.id);
        assert_eq!(queue.locate(&email.id), Some(QueueState::Processing));

        let second = queue.claim_next().unwrap().unwrap();
        assert_eq!(second.id, backlog.id);
        assert!(queue.claim_next().unwrap().is_none());
    }

    #[test]
    fn malformed_files_are_claimed_last() {
        let (_tmp, queue) = setup();
        fs::write(queue.dir(QueueState::Inbox).join("broken.json"), "{not json").unwrap();
        let good = queue
            .create_job(url_payload("https://example.com"), "manual", None, None)
            .unwrap();

        let first = queue.claim_next().unwrap().unwrap();
        assert_eq!(first.id, good.id);

        let second = queue.claim_next().unwrap().unwrap();
        assert_eq!(second.id, "broken");
        assert!(second.job.is_err());
    }

    #[test]
    fn id_must_match_file_name() {
        let (_tmp, queue) = setup();
        fs::write(
            queue.dir(QueueState::Inbox).join("a.json"),
            r#"{"id": "b", "type": "backlog", "payload": {"text": "x"}}"#,
        )
        .unwrap();

        let claim = queue.claim_next().unwrap().unwrap();
        assert_eq!(claim.id, "a");
        let reason = claim.job.unwrap_err();
        assert!(reason.contains("does not match file name a.json"), "{}", reason);
    }

    #[test]
    fn path_like_id_inside_file_is_malformed() {
        let (_tmp, queue) = setup();
        fs::write(
            queue.dir(QueueState::Inbox).join("evil.json"),
            r#"{"id": "../../escaped", "type": "backlog", "payload": {"text": "x"}}"#,
        )
        .unwrap();

        let claim = queue.claim_next().unwrap().unwrap();
        assert_eq!(claim.id, "evil");
        assert!(claim.job.unwrap_err().contains("invalid job id"));
    }

    #[test]
    fn missing_created_at_uses_file_mtime() {
        let (_tmp, queue) = setup();
        let path = queue.dir(QueueState::Inbox).join("t1.json");
        fs::write(&path, r#"{"id": "t1", "type": "backlog", "payload": {"text": "x"}}"#).unwrap();

        let first = read_job(&path).unwrap();
        let second = read_job(&path).unwrap();
        assert_eq!(first.created_at, second.created_at);

        let modified: DateTime<Utc> = fs::metadata(&path).unwrap().modified().unwrap().into();
        assert_eq!(first.created_at.timestamp(), modified.timestamp());
    }

    #[test]
    fn duplicate_id_in_inbox_does_not_replace_finished_job() {
        let (_tmp, queue) = setup();
        let job = queue
            .create_job(url_payload("https://example.com/first"), "manual", None, None)
            .unwrap();
        let claim = queue.claim_next().unwrap().unwrap();
        let done = queue.complete(&claim).unwrap();
        let original = fs::read_to_string(&done).unwrap();

        let again = queue.dir(QueueState::Inbox).join(job.file_name());
        fs::write(
            &again,
            format!(
                r#"{{"id": "{}", "type": "backlog", "payload": {{"text": "second"}}}}"#,
                job.id
            ),
        )
        .unwrap();

        assert!(queue.claim_next().unwrap().is_none());
        assert!(again.exists());
        assert_eq!(fs::read_to_string(&done).unwrap(), original);
        assert_eq!(queue.counts().unwrap().completed, 1);
    }

    #[test]
    fn requeue_refuses_to_overwrite_inbox_file() {
        let (_tmp, queue) = setup();
        let job = queue
            .create_job(url_payload("https://example.com"), "manual", None, None)
            .unwrap();
        let claim = queue.claim_next().unwrap().unwrap();
        queue.fail(&claim, "boom").unwrap();

        fs::write(queue.dir(QueueState::Inbox).join(job.file_name()), "{}").unwrap();
        assert!(queue.requeue(&job.id).is_err());
        assert!(queue.dir(QueueState::Failed).join(job.file_name()).exists());
        assert_eq!(queue.failure_report(&job.id).as_deref(), Some("boom"));
    }

    #[test]
    fn complete_and_fail_move_files() {
        let (_tmp, queue) = setup();
        let a = queue
            .create_job(url_payload("https://a.example"), "manual", None, None)
            .unwrap();
        let b = queue
            .create_job(url_payload("https://b.example"), "manual", None, None)
            .unwrap();

        let claim = queue.claim_next().unwrap().unwrap();
        queue.complete(&claim).unwrap();
        let claim2 = queue.claim_next().unwrap().unwrap();
        queue.fail(&claim2, "boom").unwrap();

        let counts = queue.counts().unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 2);

        let failed_id = if queue.locate(&a.id) == Some(QueueState::Failed) {
            &a.id
        } else {
            &b.id
        };
        assert_eq!(queue.failure_report(failed_id).as_deref(), Some("boom"));
    }

    #[test]
    fn requeue_moves_failed_back_and_drops_sidecar() {
        let (_tmp, queue) = setup();
        let job = queue
            .create_job(url_payload("https://example.com"), "manual", None, None)
            .unwrap();
        let claim = queue.claim_next().unwrap().unwrap();
        queue.fail(&claim, "timeout").unwrap();

        queue.requeue(&job.id).unwrap();
        assert_eq!(queue.locate(&job.id), Some(QueueState::Inbox));
        assert!(queue.failure_report(&job.id).is_none());
        assert!(queue.requeue(&job.id).is_err());
    }

    #[test]
    fn recover_stale_returns_processing_to_inbox() {
        let (_tmp, queue) = setup();
        let job = queue
            .create_job(url_payload("https://example.com"), "manual", None, None)
            .unwrap();
        queue.claim_next().unwrap().unwrap();

        assert_eq!(queue.recover_stale().unwrap(), 1);
        assert_eq!(queue.locate(&job.id), Some(QueueState::Inbox));
    }

    #[test]
    fn transition_table() {
        use QueueState::*;
        assert!(Inbox.can_transition_to(Processing));
        assert!(Failed.can_transition_to(Inbox));
        assert!(!Inbox.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Inbox));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn worker_lock_is_exclusive() {
        let (_tmp, queue) = setup();
        let lock = WorkerLock::acquire(&queue).unwrap();
        assert!(WorkerLock::acquire(&queue).is_err());
        drop(lock);
        assert!(WorkerLock::acquire(&queue).is_ok());
    }
}
