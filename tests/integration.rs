use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Variables that would override the test config if set in the host env.
const ENV_OVERRIDES: [&str; 18] = [
    "QUEUE_ROOT",
    "ARCHIVE_ROOT",
    "RAW_ROOT",
    "BACKLOG_ROOT",
    "BACKLOG_CONFIG_PATH",
    "DATABASE_PATH",
    "SEARCH_INDEX_PATH",
    "WHOOSH_INDEX_PATH",
    "PROCESSOR_SLEEP_SECONDS",
    "ATLAS_API_KEY",
    "ATLAS_BIND",
    "GMAIL_IMAP_HOST",
    "GMAIL_IMAP_PORT",
    "GMAIL_USERNAME",
    "GMAIL_APP_PASSWORD",
    "GMAIL_LABELS",
    "RSS_CONFIG_PATH",
    "RUST_LOG",
];

fn atlas_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("atlas");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[paths]
queue_root = "{root}/data/queue"
archive_root = "{root}/data/archive"
raw_root = "{root}/data/raw"

[db]
path = "{root}/data/atlas.sqlite"

[search]
index_path = "{root}/data/index"

[worker]
sleep_seconds = 1
"#,
        root = root.display()
    );

    let config_path = config_dir.join("atlas.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_atlas(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = atlas_binary();
    let mut cmd = Command::new(&binary);
    // Keep a stray .env in the developer's checkout out of the test.
    cmd.current_dir(config_path.parent().unwrap());
    for var in ENV_OVERRIDES {
        cmd.env_remove(var);
    }
    let output = cmd
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run atlas binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn data_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("data")
}

fn write_job(config_path: &Path, id: &str, body: &str) {
    let inbox = data_dir(config_path).join("queue").join("inbox");
    fs::write(inbox.join(format!("{}.json", id)), body).unwrap();
}

#[test]
fn test_init_creates_layout() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_atlas(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let data = data_dir(&config_path);
    for dir in ["inbox", "processing", "completed", "failed"] {
        assert!(data.join("queue").join(dir).is_dir(), "{} missing", dir);
    }
    assert!(data.join("atlas.sqlite").exists());
    assert!(data.join("index").join("index.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_atlas(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_atlas(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_hand_written_job_is_processed_and_searchable() {
    let (_tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);

    write_job(
        &config_path,
        "t1",
        r#"{"id": "t1", "type": "backlog", "payload": {"html": "<p>test</p>", "text": "test"}}"#,
    );

    let (stdout, stderr, success) =
        run_atlas(&config_path, &["worker", "--max-iterations", "1"]);
    assert!(success, "worker failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("completed: 1"));

    let queue = data_dir(&config_path).join("queue");
    assert!(queue.join("completed").join("t1.json").exists());
    assert!(!queue.join("inbox").join("t1.json").exists());

    let (stdout, _, success) = run_atlas(&config_path, &["search", "test"]);
    assert!(success);
    assert!(stdout.contains("id: t1"), "Expected t1 in results, got: {}", stdout);

    let (stdout, _, success) = run_atlas(&config_path, &["get", "t1"]);
    assert!(success);
    assert!(stdout.contains("content_type: backlog"));
    assert!(stdout.contains("completed"));
}

#[test]
fn test_malformed_job_fails_and_can_be_requeued() {
    let (_tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);

    write_job(&config_path, "broken", "{ not json");
    let (stdout, _, success) = run_atlas(&config_path, &["worker", "--max-iterations", "1"]);
    assert!(success, "worker must survive a malformed job");
    assert!(stdout.contains("failed: 1"));

    let failed = data_dir(&config_path).join("queue").join("failed");
    assert!(failed.join("broken.json").exists());
    assert!(failed.join("broken.error.txt").exists());

    let (stdout, _, success) = run_atlas(&config_path, &["requeue", "broken"]);
    assert!(success);
    assert!(stdout.contains("requeued broken"));
    assert!(!failed.join("broken.error.txt").exists());

    let (_, _, success) = run_atlas(&config_path, &["requeue", "broken"]);
    assert!(!success, "requeue of a job not in failed/ should error");
}

#[test]
fn test_ingest_url_and_status() {
    let (_tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);

    let (stdout, stderr, success) = run_atlas(
        &config_path,
        &["ingest-url", "https://example.com/article#comments", "--source", "cli"],
    );
    assert!(success, "ingest-url failed: {}", stderr);
    assert!(stdout.contains("queued url job"));

    let (stdout, _, success) = run_atlas(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("inbox:       1"), "got: {}", stdout);

    let inbox = data_dir(&config_path).join("queue").join("inbox");
    let file = fs::read_dir(&inbox).unwrap().next().unwrap().unwrap().path();
    let job: serde_json::Value = serde_json::from_str(&fs::read_to_string(file).unwrap()).unwrap();
    assert_eq!(job["type"], "url");
    assert_eq!(job["source"], "cli");
    assert_eq!(job["payload"]["url"], "https://example.com/article");
}

#[test]
fn test_ingest_url_rejects_bad_scheme() {
    let (_tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);

    let (_, stderr, success) = run_atlas(&config_path, &["ingest-url", "ftp://example.com/x"]);
    assert!(!success);
    assert!(stderr.contains("http or https"), "got: {}", stderr);
}

#[test]
fn test_ingest_trojanhorse_from_file() {
    let (tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);

    let payload = tmp.path().join("payload.json");
    fs::write(&payload, r#"{"text": "a note from the phone", "tags": ["idea"]}"#).unwrap();

    let (stdout, stderr, success) = run_atlas(
        &config_path,
        &[
            "ingest-trojanhorse",
            payload.to_str().unwrap(),
            "--notes",
            "quick capture",
        ],
    );
    assert!(success, "ingest-trojanhorse failed: {}", stderr);
    assert!(stdout.contains("queued trojanhorse job"));

    let raw = data_dir(&config_path).join("raw").join("trojanhorse");
    assert_eq!(fs::read_dir(raw).unwrap().count(), 1);

    let (stdout, _, _) = run_atlas(&config_path, &["worker", "--max-iterations", "1"]);
    assert!(stdout.contains("completed: 1"));
    let (stdout, _, _) = run_atlas(&config_path, &["search", "phone"]);
    assert!(stdout.contains("excerpt"), "got: {}", stdout);
}

#[test]
fn test_search_no_results() {
    let (_tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);

    let (stdout, _, success) = run_atlas(&config_path, &["search", "xyznonexistent"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_poll_rss_without_feed_list_errors() {
    let (_tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);

    let (_, stderr, success) = run_atlas(&config_path, &["poll-rss"]);
    assert!(!success);
    assert!(stderr.contains("RSS_CONFIG_PATH"), "got: {}", stderr);
}

#[test]
fn test_poll_gmail_without_credentials_errors() {
    let (_tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);

    let (_, stderr, success) = run_atlas(&config_path, &["poll-gmail"]);
    assert!(!success);
    assert!(stderr.contains("GMAIL_USERNAME"), "got: {}", stderr);
}

#[test]
fn test_process_backlog_directory() {
    let (tmp, config_path) = setup_test_env();
    run_atlas(&config_path, &["init"]);

    let notes = tmp.path().join("notes");
    fs::create_dir_all(&notes).unwrap();
    fs::write(notes.join("one.md"), "first saved note").unwrap();
    fs::write(notes.join("two.txt"), "second saved note").unwrap();

    let manifest = tmp.path().join("backlog.toml");
    fs::write(
        &manifest,
        format!(
            "[[sources]]\nid = \"notes\"\nkind = \"directory\"\npath = \"{}\"\n",
            notes.display()
        ),
    )
    .unwrap();
    let mut config = fs::read_to_string(&config_path).unwrap();
    config.push_str(&format!("\n[backlog]\nconfig_path = \"{}\"\n", manifest.display()));
    fs::write(&config_path, config).unwrap();

    let (stdout, stderr, success) = run_atlas(&config_path, &["process-backlog"]);
    assert!(success, "process-backlog failed: {}", stderr);
    assert!(stdout.contains("enqueued: 2"), "got: {}", stdout);

    let (stdout, _, _) = run_atlas(&config_path, &["process-backlog"]);
    assert!(stdout.contains("enqueued: 0"), "replay must not re-enqueue: {}", stdout);
}
