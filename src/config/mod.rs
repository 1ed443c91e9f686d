use std::env;
use std::path::PathBuf;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::errors::{MigResult, MigrateError};

/// Immutable run configuration, resolved once from the environment (prefix
/// `MIG_`, sections nested with `__`) and passed by reference into each
/// component constructor.
#[derive(Clone, Debug)]
pub struct Config {
    pub imap: ImapConfig,
    pub gmail: GmailConfig,
    pub filter: FilterConfig,
    pub storage: StorageConfig,
    pub concurrency: ConcurrencyConfig,
}

#[derive(Clone, Debug)]
pub struct ImapConfig {
    pub username: String,
    pub app_password: String,
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub connections: usize,
    pub batch_size: usize,
    pub search_query: String,
    pub folder_include: Option<GlobSet>,
    pub folder_exclude: Option<GlobSet>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestMode {
    Import,
    Insert,
}

impl IngestMode {
    pub fn endpoint(&self) -> &'static str {
        match self {
            IngestMode::Import => "import",
            IngestMode::Insert => "insert",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InternalDateSource {
    DateHeader,
    ReceivedTime,
}

impl InternalDateSource {
    pub fn as_api_value(&self) -> &'static str {
        match self {
            InternalDateSource::DateHeader => "dateHeader",
            InternalDateSource::ReceivedTime => "receivedTime",
        }
    }
}

#[derive(Clone, Debug)]
pub struct GmailConfig {
    pub target_user_email: String,
    pub credentials_file: PathBuf,
    pub token_file: PathBuf,
    pub mode: IngestMode,
    pub internal_date_source: InternalDateSource,
    pub label_prefix: String,
}

#[derive(Clone, Debug)]
pub struct FilterConfig {
    /// Lowercased addresses; empty means every message passes.
    pub target_addresses: Vec<String>,
    pub include_sender: bool,
    pub include_recipients: bool,
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub root_dir: PathBuf,
    pub evidence_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub sqlite_path: PathBuf,
    pub fingerprint_body_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct ConcurrencyConfig {
    pub gmail_workers: usize,
    pub imap_fetch_concurrency: usize,
    pub queue_maxsize: usize,
}

impl Config {
    pub fn load() -> MigResult<Self> {
        let imap = ImapConfig::load()?;
        let gmail = GmailConfig::load()?;
        let filter = FilterConfig::load()?;
        let storage = StorageConfig::load()?;
        let concurrency = ConcurrencyConfig::load()?;
        Ok(Self {
            imap,
            gmail,
            filter,
            storage,
            concurrency,
        })
    }
}

impl ImapConfig {
    fn load() -> MigResult<Self> {
        let username = require("MIG_IMAP__USERNAME")?;
        let app_password = require("MIG_IMAP__APP_PASSWORD")?;
        let host = var("MIG_IMAP__HOST").unwrap_or_else(|| "imap.mail.me.com".to_string());
        let port = parse_or("MIG_IMAP__PORT", 993u16)?;
        let ssl = parse_bool_or("MIG_IMAP__SSL", true)?;
        let connections = bounded("MIG_IMAP__CONNECTIONS", 2, 1, 10)?;
        let batch_size = bounded("MIG_IMAP__BATCH_SIZE", 50, 1, 500)?;
        let search_query = var("MIG_IMAP__SEARCH_QUERY").unwrap_or_else(|| "ALL".to_string());
        let folder_include = glob_set("MIG_IMAP__FOLDER_INCLUDE")?;
        let folder_exclude = glob_set("MIG_IMAP__FOLDER_EXCLUDE")?;

        if !ssl {
            return Err(MigrateError::Config(
                "MIG_IMAP__SSL=false is not supported; the fetcher only speaks IMAPS".into(),
            ));
        }

        Ok(Self {
            username,
            app_password,
            host,
            port,
            ssl,
            connections,
            batch_size,
            search_query,
            folder_include,
            folder_exclude,
        })
    }

    /// Applies the include/exclude globs to a folder name.
    pub fn folder_selected(&self, name: &str) -> bool {
        if let Some(include) = &self.folder_include {
            if !include.is_match(name) {
                return false;
            }
        }
        if let Some(exclude) = &self.folder_exclude {
            if exclude.is_match(name) {
                return false;
            }
        }
        true
    }
}

impl GmailConfig {
    pub fn load() -> MigResult<Self> {
        let target_user_email = require("MIG_GMAIL__TARGET_USER_EMAIL")?;
        let credentials_file = PathBuf::from(require("MIG_GMAIL__CREDENTIALS_FILE")?);
        let token_file = PathBuf::from(require("MIG_GMAIL__TOKEN_FILE")?);
        let mode = match var("MIG_GMAIL__MODE").as_deref() {
            None | Some("import") => IngestMode::Import,
            Some("insert") => IngestMode::Insert,
            Some(other) => {
                return Err(MigrateError::Config(format!(
                    "MIG_GMAIL__MODE must be `import` or `insert`, got `{other}`"
                )))
            }
        };
        let internal_date_source = match var("MIG_GMAIL__INTERNAL_DATE_SOURCE").as_deref() {
            None | Some("dateHeader") => InternalDateSource::DateHeader,
            Some("receivedTime") => InternalDateSource::ReceivedTime,
            Some(other) => {
                return Err(MigrateError::Config(format!(
                    "MIG_GMAIL__INTERNAL_DATE_SOURCE must be `dateHeader` or `receivedTime`, got `{other}`"
                )))
            }
        };
        let label_prefix = var("MIG_GMAIL__LABEL_PREFIX").unwrap_or_else(|| "iCloud".to_string());

        Ok(Self {
            target_user_email,
            credentials_file,
            token_file,
            mode,
            internal_date_source,
            label_prefix,
        })
    }
}

impl FilterConfig {
    fn load() -> MigResult<Self> {
        let target_addresses = match var("MIG_FILTER__TARGET_ADDRESSES") {
            Some(raw) => parse_string_list(&raw)
                .into_iter()
                .map(|a| a.to_ascii_lowercase())
                .collect(),
            None => Vec::new(),
        };
        Ok(Self {
            target_addresses,
            include_sender: parse_bool_or("MIG_FILTER__INCLUDE_SENDER", true)?,
            include_recipients: parse_bool_or("MIG_FILTER__INCLUDE_RECIPIENTS", true)?,
        })
    }
}

impl StorageConfig {
    pub fn load() -> MigResult<Self> {
        let root_dir = PathBuf::from(var("MIG_STORAGE__ROOT_DIR").unwrap_or_else(|| "./data".into()));
        let evidence_dir = var("MIG_STORAGE__EVIDENCE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root_dir.join("evidence"));
        let reports_dir = var("MIG_STORAGE__REPORTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root_dir.join("reports"));
        let sqlite_path = var("MIG_STORAGE__SQLITE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| root_dir.join("state.sqlite3"));
        let fingerprint_body_bytes =
            bounded("MIG_STORAGE__FINGERPRINT_BODY_BYTES", 4096, 0, 1_048_576)?;

        Ok(Self {
            root_dir,
            evidence_dir,
            reports_dir,
            sqlite_path,
            fingerprint_body_bytes,
        })
    }
}

impl ConcurrencyConfig {
    fn load() -> MigResult<Self> {
        Ok(Self {
            gmail_workers: bounded("MIG_CONCURRENCY__GMAIL_WORKERS", 10, 1, 50)?,
            imap_fetch_concurrency: bounded("MIG_CONCURRENCY__IMAP_FETCH_CONCURRENCY", 5, 1, 50)?,
            queue_maxsize: bounded("MIG_CONCURRENCY__QUEUE_MAXSIZE", 1000, 1, 1_000_000)?,
        })
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn require(name: &str) -> MigResult<String> {
    var(name).ok_or_else(|| MigrateError::Config(format!("{name} is required")))
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> MigResult<T> {
    match var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| MigrateError::Config(format!("{name} has an invalid value: `{raw}`"))),
        None => Ok(default),
    }
}

fn parse_bool_or(name: &str, default: bool) -> MigResult<bool> {
    match var(name) {
        Some(raw) => match raw.as_str() {
            "1" | "true" | "TRUE" | "True" | "yes" => Ok(true),
            "0" | "false" | "FALSE" | "False" | "no" => Ok(false),
            _ => Err(MigrateError::Config(format!(
                "{name} must be a boolean, got `{raw}`"
            ))),
        },
        None => Ok(default),
    }
}

fn bounded(name: &str, default: usize, min: usize, max: usize) -> MigResult<usize> {
    let value = parse_or(name, default)?;
    if value < min || value > max {
        return Err(MigrateError::Config(format!(
            "{name} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(value)
}

/// Accepts either a JSON string list or a comma-separated list.
fn parse_string_list(raw: &str) -> Vec<String> {
    if let Ok(list) = serde_json::from_str::<Vec<String>>(raw) {
        return list
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn glob_set(name: &str) -> MigResult<Option<GlobSet>> {
    let Some(raw) = var(name) else {
        return Ok(None);
    };
    let mut builder = GlobSetBuilder::new();
    for pattern in parse_string_list(&raw) {
        let glob = Glob::new(&pattern).map_err(|e| {
            MigrateError::Config(format!("{name} has an invalid glob `{pattern}`: {e}"))
        })?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| MigrateError::Config(format!("{name} glob set failed to build: {e}")))?;
    Ok(Some(set))
}
