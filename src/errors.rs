use std::time::Duration;

use thiserror::Error;

pub type MigResult<T> = Result<T, MigrateError>;

/// Abstract failure kinds carried alongside every failure record in the
/// state database. Stored as a short stable string in the `last_error`
/// column, so variants must not be renamed casually.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigInvalid,
    AuthFailed,
    NetworkTransient,
    QuotaExceeded,
    ImapProtocol,
    ParseError,
    EvidenceIo,
    EvidenceCorruption,
    RemoteRejected,
    Interrupted,
    Database,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::AuthFailed => "AuthFailed",
            ErrorKind::NetworkTransient => "NetworkTransient",
            ErrorKind::QuotaExceeded => "QuotaExceeded",
            ErrorKind::ImapProtocol => "IMAPProtocol",
            ErrorKind::ParseError => "ParseError",
            ErrorKind::EvidenceIo => "EvidenceIO",
            ErrorKind::EvidenceCorruption => "EvidenceCorruption",
            ErrorKind::RemoteRejected => "RemoteRejected",
            ErrorKind::Interrupted => "Interrupted",
            ErrorKind::Database => "Database",
            ErrorKind::Unexpected => "Unexpected",
        }
    }

    /// Kinds that may succeed on a later attempt. Everything else is
    /// terminal for the row it failed on.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTransient | ErrorKind::QuotaExceeded | ErrorKind::ImapProtocol
        )
    }
}

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("transient network error: {0}")]
    Network(String),
    #[error("gmail quota exceeded (retry-after {retry_after:?})")]
    Quota { retry_after: Option<Duration> },
    #[error("imap protocol error: {0}")]
    Imap(String),
    #[error("unparseable message: {0}")]
    Parse(String),
    #[error("evidence io error: {0}")]
    EvidenceIo(#[source] std::io::Error),
    #[error("evidence corruption for {fingerprint}: stored {stored}, found {found}")]
    EvidenceCorruption {
        fingerprint: String,
        stored: String,
        found: String,
    },
    #[error("gmail rejected the message: http {status}: {body}")]
    RemoteRejected { status: u16, body: String },
    #[error("interrupted by shutdown signal")]
    Interrupted,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl MigrateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::Config(_) => ErrorKind::ConfigInvalid,
            MigrateError::Auth(_) => ErrorKind::AuthFailed,
            MigrateError::Network(_) => ErrorKind::NetworkTransient,
            MigrateError::Quota { .. } => ErrorKind::QuotaExceeded,
            MigrateError::Imap(_) => ErrorKind::ImapProtocol,
            MigrateError::Parse(_) => ErrorKind::ParseError,
            MigrateError::EvidenceIo(_) => ErrorKind::EvidenceIo,
            MigrateError::EvidenceCorruption { .. } => ErrorKind::EvidenceCorruption,
            MigrateError::RemoteRejected { .. } => ErrorKind::RemoteRejected,
            MigrateError::Interrupted => ErrorKind::Interrupted,
            MigrateError::Database(_) => ErrorKind::Database,
            MigrateError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<reqwest::Error> for MigrateError {
    fn from(e: reqwest::Error) -> Self {
        MigrateError::Network(e.to_string())
    }
}
