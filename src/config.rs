//! Configuration loading.
//!
//! Settings come from an optional TOML file and are then overridden by
//! environment variables, so a deployment can run on env vars alone:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `QUEUE_ROOT` | `paths.queue_root` |
//! | `ARCHIVE_ROOT` | `paths.archive_root` |
//! | `RAW_ROOT` | `paths.raw_root` |
//! | `BACKLOG_ROOT` | `backlog.root` |
//! | `BACKLOG_CONFIG_PATH` | `backlog.config_path` |
//! | `DATABASE_PATH` | `db.path` |
//! | `SEARCH_INDEX_PATH` / `WHOOSH_INDEX_PATH` | `search.index_path` |
//! | `PROCESSOR_SLEEP_SECONDS` | `worker.sleep_seconds` |
//! | `ATLAS_API_KEY` | `server.api_key` |
//! | `ATLAS_BIND` | `server.bind` |
//! | `GMAIL_IMAP_HOST` / `GMAIL_IMAP_PORT` | `gmail.host` / `gmail.port` |
//! | `GMAIL_USERNAME` / `GMAIL_APP_PASSWORD` | `gmail.username` / `gmail.app_password` |
//! | `GMAIL_LABELS` | `gmail.labels` (comma separated) |
//! | `RSS_CONFIG_PATH` | `rss.config_path` |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file picked up when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "./config/atlas.toml";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gmail: GmailSettings,
    #[serde(default)]
    pub rss: RssSettings,
    #[serde(default)]
    pub backlog: BacklogSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_queue_root")]
    pub queue_root: PathBuf,
    #[serde(default = "default_archive_root")]
    pub archive_root: PathBuf,
    #[serde(default = "default_raw_root")]
    pub raw_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            queue_root: default_queue_root(),
            archive_root: default_archive_root(),
            raw_root: default_raw_root(),
        }
    }
}

fn default_queue_root() -> PathBuf {
    PathBuf::from("data/queue")
}
fn default_archive_root() -> PathBuf {
    PathBuf::from("data/archive")
}
fn default_raw_root() -> PathBuf {
    PathBuf::from("data/raw")
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/atlas.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Directory holding the full-text index database.
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,
    #[serde(default = "default_search_limit")]
    pub default_limit: i64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            index_path: default_index_path(),
            default_limit: default_search_limit(),
        }
    }
}

fn default_index_path() -> PathBuf {
    PathBuf::from("data/index")
}
fn default_search_limit() -> i64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Seconds to sleep when the inbox is empty.
    #[serde(default = "default_sleep_seconds")]
    pub sleep_seconds: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sleep_seconds: default_sleep_seconds(),
            fetch_timeout_secs: default_fetch_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_sleep_seconds() -> u64 {
    5
}
fn default_fetch_timeout() -> u64 {
    15
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; AtlasIngest/0.3; +https://example.invalid/atlas)".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// When set, every route except health requires a matching `X-API-Key`.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_key: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GmailSettings {
    #[serde(default = "default_imap_host")]
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub app_password: Option<String>,
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
}

impl Default for GmailSettings {
    fn default() -> Self {
        Self {
            host: default_imap_host(),
            port: default_imap_port(),
            username: None,
            app_password: None,
            labels: default_labels(),
        }
    }
}

fn default_imap_host() -> String {
    "imap.gmail.com".to_string()
}
fn default_imap_port() -> u16 {
    993
}
fn default_labels() -> Vec<String> {
    vec!["INBOX".to_string()]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RssSettings {
    /// TOML file listing `[[feeds]]`.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BacklogSettings {
    /// Base directory for relative paths in the backlog manifest.
    #[serde(default = "default_backlog_root")]
    pub root: PathBuf,
    /// TOML manifest listing `[[sources]]`.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

impl Default for BacklogSettings {
    fn default() -> Self {
        Self {
            root: default_backlog_root(),
            config_path: None,
        }
    }
}

fn default_backlog_root() -> PathBuf {
    PathBuf::from("data/backlog")
}

impl Config {
    /// A config with every path placed under `root`. Used by tests and by
    /// `--config`-less runs that want a self-contained data directory.
    pub fn rooted_at(root: &Path) -> Self {
        let mut cfg = Config::default();
        cfg.paths.queue_root = root.join("queue");
        cfg.paths.archive_root = root.join("archive");
        cfg.paths.raw_root = root.join("raw");
        cfg.db.path = root.join("atlas.sqlite");
        cfg.search.index_path = root.join("index");
        cfg.backlog.root = root.join("backlog");
        cfg
    }
}

/// Load configuration from `path` (or [`DEFAULT_CONFIG_PATH`] when present),
/// then apply environment overrides and validate.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => read_config_file(p)?,
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                read_config_file(default_path)?
            } else {
                Config::default()
            }
        }
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content).with_context(|| "Failed to parse config file")
}

/// Apply environment variable overrides. `lookup` abstracts `std::env::var`
/// so the mapping can be tested without touching the process environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = get("QUEUE_ROOT") {
        config.paths.queue_root = PathBuf::from(v);
    }
    if let Some(v) = get("ARCHIVE_ROOT") {
        config.paths.archive_root = PathBuf::from(v);
    }
    if let Some(v) = get("RAW_ROOT") {
        config.paths.raw_root = PathBuf::from(v);
    }
    if let Some(v) = get("BACKLOG_ROOT") {
        config.backlog.root = PathBuf::from(v);
    }
    if let Some(v) = get("BACKLOG_CONFIG_PATH") {
        config.backlog.config_path = Some(PathBuf::from(v));
    }
    if let Some(v) = get("DATABASE_PATH") {
        config.db.path = PathBuf::from(v);
    }
    if let Some(v) = get("SEARCH_INDEX_PATH").or_else(|| get("WHOOSH_INDEX_PATH")) {
        config.search.index_path = PathBuf::from(v);
    }
    if let Some(v) = get("PROCESSOR_SLEEP_SECONDS") {
        config.worker.sleep_seconds = v
            .trim()
            .parse()
            .with_context(|| format!("PROCESSOR_SLEEP_SECONDS must be an integer, got '{}'", v))?;
    }
    if let Some(v) = get("ATLAS_API_KEY") {
        config.server.api_key = Some(v);
    }
    if let Some(v) = get("ATLAS_BIND") {
        config.server.bind = v;
    }
    if let Some(v) = get("GMAIL_IMAP_HOST") {
        config.gmail.host = v;
    }
    if let Some(v) = get("GMAIL_IMAP_PORT") {
        config.gmail.port = v
            .trim()
            .parse()
            .with_context(|| format!("GMAIL_IMAP_PORT must be a port number, got '{}'", v))?;
    }
    if let Some(v) = get("GMAIL_USERNAME") {
        config.gmail.username = Some(v);
    }
    if let Some(v) = get("GMAIL_APP_PASSWORD") {
        config.gmail.app_password = Some(v);
    }
    if let Some(v) = get("GMAIL_LABELS") {
        let labels: Vec<String> = v
            .split(',')
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if !labels.is_empty() {
            config.gmail.labels = labels;
        }
    }
    if let Some(v) = get("RSS_CONFIG_PATH") {
        config.rss.config_path = Some(PathBuf::from(v));
    }

    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    if config.worker.fetch_timeout_secs == 0 {
        bail!("worker.fetch_timeout_secs must be > 0");
    }
    if config.server.bind.trim().is_empty() {
        bail!("server.bind must not be empty");
    }
    if config.search.default_limit < 1 {
        bail!("search.default_limit must be >= 1");
    }
    Ok(())
}
