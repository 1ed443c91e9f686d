//! IMAP connector and session pool (TLS + LOGIN with an app-specific
//! password) using async-imap 0.11 with tokio-rustls.

use std::sync::Arc;

use async_imap::types::NameAttribute;
use async_imap::{Client, Session};
use deadpool::managed::{self, Metrics, RecycleError, RecycleResult};
use futures::StreamExt;
use rustls_native_certs::load_native_certs;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, warn};

use crate::config::ImapConfig;
use crate::errors::{MigResult, MigrateError};
use crate::retry::jittered_backoff;

pub type ImapSession =
    Session<tokio_util::compat::Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

const CONNECT_ATTEMPTS: u32 = 4;

/// One discovered mailbox as reported by LIST.
#[derive(Clone, Debug)]
pub struct MailboxEntry {
    pub name: String,
    pub delimiter: Option<String>,
}

/// Snapshot taken on SELECT.
#[derive(Clone, Copy, Debug)]
pub struct MailboxSnapshot {
    pub uidvalidity: u32,
    pub exists: u32,
}

/// Header-stage fetch result for one UID.
#[derive(Clone, Debug)]
pub struct HeaderFetch {
    pub uid: u32,
    pub internal_date_epoch: Option<i64>,
    pub header_bytes: Vec<u8>,
}

pub async fn connect(config: &ImapConfig) -> MigResult<ImapSession> {
    // TLS config with native root certificates
    let mut root_store = RootCertStore::empty();
    for cert in load_native_certs()
        .map_err(|e| MigrateError::Network(format!("failed to load native certs: {e}")))?
    {
        root_store
            .add(&tokio_rustls::rustls::Certificate(cert.0))
            .map_err(|e| MigrateError::Network(format!("failed to add cert to root store: {e}")))?;
    }

    let tls_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let tcp = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|e| MigrateError::Network(format!("connecting to {}:{}: {e}", config.host, config.port)))?;

    let server_name = ServerName::try_from(config.host.as_str())
        .map_err(|e| MigrateError::Config(format!("invalid IMAP host name {}: {e}", config.host)))?;
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| MigrateError::Network(format!("starting TLS for IMAP: {e}")))?;

    // async-imap wants futures-io streams
    let compat_stream = tls_stream.compat();
    let mut client = Client::new(compat_stream);

    let _greeting = client
        .read_response()
        .await
        .map_err(|e| MigrateError::Imap(format!("reading IMAP greeting: {e}")))?
        .ok_or_else(|| MigrateError::Imap("unexpected end of stream, expected greeting".into()))?;

    let session = client
        .login(&config.username, &config.app_password)
        .await
        .map_err(|(err, _client)| MigrateError::Auth(format!("IMAP LOGIN failed: {err}")))?;

    debug!(host = %config.host, user = %config.username, "IMAP session established");
    Ok(session)
}

/// Connects with bounded, jittered exponential backoff. Authentication
/// failures are permanent and abort immediately.
pub async fn connect_with_retry(config: &ImapConfig) -> MigResult<ImapSession> {
    let mut attempt = 0u32;
    loop {
        match connect(config).await {
            Ok(session) => return Ok(session),
            Err(err @ MigrateError::Auth(_)) => return Err(err),
            Err(err) if attempt + 1 < CONNECT_ATTEMPTS => {
                let delay = jittered_backoff(attempt);
                warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "IMAP connect failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub struct ImapManager {
    config: ImapConfig,
}

impl managed::Manager for ImapManager {
    type Type = ImapSession;
    type Error = MigrateError;

    async fn create(&self) -> Result<ImapSession, MigrateError> {
        connect_with_retry(&self.config).await
    }

    async fn recycle(
        &self,
        session: &mut ImapSession,
        _metrics: &Metrics,
    ) -> RecycleResult<MigrateError> {
        // A NOOP probe is cheap and detects sessions the server dropped
        // while they sat in the pool.
        session
            .noop()
            .await
            .map_err(|e| RecycleError::Message(format!("imap noop failed: {e}").into()))
    }
}

pub type ImapPool = managed::Pool<ImapManager>;

pub fn build_pool(config: &ImapConfig) -> MigResult<ImapPool> {
    ImapPool::builder(ImapManager {
        config: config.clone(),
    })
    .max_size(config.connections)
    .build()
    .map_err(|e| MigrateError::Unexpected(format!("building IMAP pool: {e}")))
}

/// Lists selectable mailboxes with their hierarchy delimiters.
pub async fn list_folders(session: &mut ImapSession) -> MigResult<Vec<MailboxEntry>> {
    let mut entries = Vec::new();
    {
        let mut stream = session
            .list(Some(""), Some("*"))
            .await
            .map_err(imap_err)?;
        while let Some(item) = stream.next().await {
            let name = match item {
                Ok(name) => name,
                Err(e) => {
                    warn!(error = %e, "LIST item failed to parse, skipping");
                    continue;
                }
            };
            if name
                .attributes()
                .iter()
                .any(|a| matches!(a, NameAttribute::NoSelect))
            {
                debug!(folder = name.name(), "skipping \\Noselect mailbox");
                continue;
            }
            entries.push(MailboxEntry {
                name: name.name().to_string(),
                delimiter: name.delimiter().map(|d| d.to_string()),
            });
        }
    }
    Ok(entries)
}

pub async fn select_folder(session: &mut ImapSession, folder: &str) -> MigResult<MailboxSnapshot> {
    let mailbox = session.select(folder).await.map_err(imap_err)?;
    Ok(MailboxSnapshot {
        uidvalidity: mailbox.uid_validity.unwrap_or(0),
        exists: mailbox.exists,
    })
}

/// Resolves the configured search criteria to a sorted UID list.
pub async fn uid_search(session: &mut ImapSession, query: &str) -> MigResult<Vec<u32>> {
    let uid_set = session.uid_search(query).await.map_err(imap_err)?;
    let mut uids: Vec<u32> = uid_set.iter().cloned().collect();
    uids.sort_unstable();
    Ok(uids)
}

/// Fetches the minimal envelope needed for filter evaluation: size,
/// internal date, and the raw header block.
pub async fn fetch_headers(session: &mut ImapSession, uids: &[u32]) -> MigResult<Vec<HeaderFetch>> {
    if uids.is_empty() {
        return Ok(Vec::new());
    }
    let sequence = build_uid_sequence(uids);
    let mut out = Vec::with_capacity(uids.len());
    {
        let mut stream = session
            .uid_fetch(&sequence, "(UID INTERNALDATE BODY.PEEK[HEADER])")
            .await
            .map_err(imap_err)?;
        while let Some(item) = stream.next().await {
            let fetch = item.map_err(imap_err)?;
            let Some(uid) = fetch.uid else {
                continue;
            };
            let header_bytes = fetch.header().unwrap_or_default().to_vec();
            out.push(HeaderFetch {
                uid,
                internal_date_epoch: fetch.internal_date().map(|dt| dt.timestamp()),
                header_bytes,
            });
        }
    }
    Ok(out)
}

/// Fetches the verbatim RFC 5322 bytes for one UID.
pub async fn fetch_body(session: &mut ImapSession, uid: u32) -> MigResult<Vec<u8>> {
    let sequence = uid.to_string();
    let mut body: Option<Vec<u8>> = None;
    {
        let mut stream = session
            .uid_fetch(&sequence, "(UID BODY.PEEK[])")
            .await
            .map_err(imap_err)?;
        while let Some(item) = stream.next().await {
            let fetch = item.map_err(imap_err)?;
            if fetch.uid == Some(uid) {
                body = fetch.body().map(|b| b.to_vec());
            }
        }
    }
    body.ok_or_else(|| MigrateError::Imap(format!("UID FETCH returned no body for uid {uid}")))
}

/// Compresses a sorted UID list into an IMAP sequence set ("1:5,7,9:12").
pub fn build_uid_sequence(uids: &[u32]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut iter = uids.iter().copied();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    for uid in iter {
        if uid == end + 1 {
            end = uid;
        } else {
            parts.push(range_part(start, end));
            start = uid;
            end = uid;
        }
    }
    parts.push(range_part(start, end));
    parts.join(",")
}

fn range_part(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}:{end}")
    }
}

fn imap_err(e: async_imap::error::Error) -> MigrateError {
    use async_imap::error::Error;
    match &e {
        Error::Io(_) | Error::ConnectionLost => MigrateError::Network(e.to_string()),
        _ => MigrateError::Imap(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::build_uid_sequence;

    #[test]
    fn uid_sequence_compression() {
        assert_eq!(build_uid_sequence(&[]), "");
        assert_eq!(build_uid_sequence(&[7]), "7");
        assert_eq!(build_uid_sequence(&[1, 2, 3, 4, 5]), "1:5");
        assert_eq!(build_uid_sequence(&[1, 2, 3, 7, 9, 10]), "1:3,7,9:10");
    }
}
