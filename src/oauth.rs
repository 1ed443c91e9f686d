//! Google OAuth for the Gmail ingestion side: a one-time loopback consent
//! flow (`gmail-auth`) and transparent refresh for every later run. Tokens
//! persist in the configured token file with owner-only permissions.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::GmailConfig;
use crate::errors::{MigResult, MigrateError};

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// messages.import/insert plus label management; nothing broader.
const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.insert",
    "https://www.googleapis.com/auth/gmail.labels",
];

#[derive(Clone, Debug)]
pub struct TokenBundle {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    refresh_token: String,
    access_token: Option<String>,
    expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    installed: Option<InstalledCreds>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct InstalledCreds {
    client_id: String,
    client_secret: String,
}

/// Runs the full browser consent flow and persists the resulting token.
pub async fn authorize(gmail: &GmailConfig) -> MigResult<TokenBundle> {
    let creds = load_credentials(&gmail.credentials_file)?;
    let store = TokenStore::new(&gmail.token_file);

    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| MigrateError::Unexpected(format!("failed to bind loopback port: {e}")))?;
    let local_port = listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| MigrateError::Unexpected(format!("failed to read local addr: {e}")))?;

    let redirect = format!("http://127.0.0.1:{local_port}");
    let client = build_client(&creds, &redirect)?;

    let (auth_url, verifier, csrf) = build_auth_url(&client);
    info!(redirect = %redirect, "opening browser for Google OAuth consent");
    open_in_browser(&auth_url);

    let code = listen_for_code(listener).await?;
    if code.state != *csrf.secret() {
        return Err(MigrateError::Auth("OAuth state mismatch".into()));
    }

    let token_res = client
        .exchange_code(AuthorizationCode::new(code.code))
        .set_pkce_verifier(verifier)
        .request_async(async_http_client)
        .await
        .map_err(|e| MigrateError::Auth(format!("token exchange failed: {e}")))?;

    let refresh = token_res
        .refresh_token()
        .map(|r| r.secret().to_string())
        .ok_or_else(|| MigrateError::Auth("Google did not return a refresh token".into()))?;
    let bundle = TokenBundle {
        access_token: token_res.access_token().secret().to_string(),
        expires_at: expiry_from(token_res.expires_in()),
        refresh_token: Some(refresh.clone()),
    };
    store.save(&StoredToken {
        refresh_token: refresh,
        access_token: Some(bundle.access_token.clone()),
        expires_at: bundle.expires_at.map(|t| t.timestamp()),
    })?;
    Ok(bundle)
}

/// Returns a live access token without user interaction: the cached one if
/// it has not expired, otherwise a refresh-token exchange. `force` skips
/// the cache (used once after an HTTP 401).
pub async fn access_token(gmail: &GmailConfig, force_refresh: bool) -> MigResult<TokenBundle> {
    let creds = load_credentials(&gmail.credentials_file)?;
    let store = TokenStore::new(&gmail.token_file);
    let stored = store.load()?.ok_or_else(|| {
        MigrateError::Auth(format!(
            "no stored token at {}; run `gmail-auth` first",
            gmail.token_file.display()
        ))
    })?;

    if !force_refresh {
        if let (Some(access), Some(expires_at)) = (&stored.access_token, stored.expires_at) {
            // A minute of slack keeps a token from expiring mid-request.
            if expires_at - 60 > Utc::now().timestamp() {
                return Ok(TokenBundle {
                    access_token: access.clone(),
                    expires_at: DateTime::from_timestamp(expires_at, 0),
                    refresh_token: Some(stored.refresh_token.clone()),
                });
            }
        }
    }

    let client = build_client(&creds, "http://127.0.0.1")?;
    let token_res = client
        .exchange_refresh_token(&RefreshToken::new(stored.refresh_token.clone()))
        .request_async(async_http_client)
        .await
        .map_err(|e| MigrateError::Auth(format!("refresh token exchange failed: {e}")))?;

    let bundle = TokenBundle {
        access_token: token_res.access_token().secret().to_string(),
        expires_at: expiry_from(token_res.expires_in()),
        refresh_token: Some(stored.refresh_token.clone()),
    };
    store.save(&StoredToken {
        refresh_token: stored.refresh_token,
        access_token: Some(bundle.access_token.clone()),
        expires_at: bundle.expires_at.map(|t| t.timestamp()),
    })?;
    Ok(bundle)
}

fn expiry_from(expires_in: Option<std::time::Duration>) -> Option<DateTime<Utc>> {
    expires_in.map(|d| {
        Utc::now() + ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::seconds(0))
    })
}

fn load_credentials(path: &Path) -> MigResult<InstalledCreds> {
    let raw = fs::read_to_string(path).map_err(|e| {
        MigrateError::Config(format!("reading credentials file {}: {e}", path.display()))
    })?;
    let parsed: CredentialsFile = serde_json::from_str(&raw).map_err(|e| {
        MigrateError::Config(format!("parsing credentials file {}: {e}", path.display()))
    })?;
    if let Some(installed) = parsed.installed {
        return Ok(installed);
    }
    match (parsed.client_id, parsed.client_secret) {
        (Some(client_id), Some(client_secret)) => Ok(InstalledCreds {
            client_id,
            client_secret,
        }),
        _ => Err(MigrateError::Config(format!(
            "credentials file {} lacks client_id/client_secret",
            path.display()
        ))),
    }
}

fn build_client(creds: &InstalledCreds, redirect: &str) -> MigResult<BasicClient> {
    let client = BasicClient::new(
        ClientId::new(creds.client_id.clone()),
        Some(ClientSecret::new(creds.client_secret.clone())),
        AuthUrl::new(AUTH_URL.to_string())
            .map_err(|e| MigrateError::Unexpected(format!("auth url: {e}")))?,
        Some(
            TokenUrl::new(TOKEN_URL.to_string())
                .map_err(|e| MigrateError::Unexpected(format!("token url: {e}")))?,
        ),
    )
    .set_redirect_uri(
        RedirectUrl::new(redirect.to_string())
            .map_err(|e| MigrateError::Config(format!("invalid redirect uri {redirect}: {e}")))?,
    )
    .set_auth_type(oauth2::AuthType::RequestBody);

    Ok(client)
}

fn build_auth_url(client: &BasicClient) -> (String, PkceCodeVerifier, CsrfToken) {
    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
    let mut req = client
        .authorize_url(CsrfToken::new_random)
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent")
        .set_pkce_challenge(challenge);
    for scope in SCOPES {
        req = req.add_scope(Scope::new(scope.to_string()));
    }
    let (url, csrf) = req.url();
    (url.to_string(), verifier, csrf)
}

struct CodeResponse {
    code: String,
    state: String,
}

async fn listen_for_code(listener: TcpListener) -> MigResult<CodeResponse> {
    let (mut stream, _) = listener
        .accept()
        .await
        .map_err(|e| MigrateError::Unexpected(format!("redirect accept failed: {e}")))?;

    let mut buf = [0u8; 4096];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| MigrateError::Unexpected(format!("reading auth callback failed: {e}")))?;
    let req = String::from_utf8_lossy(&buf[..n]);
    let first_line = req.lines().next().unwrap_or("");
    let path = first_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| MigrateError::Unexpected("invalid HTTP request on loopback".into()))?;
    let full_url = format!("http://localhost{path}");
    let parsed = url::Url::parse(&full_url)
        .map_err(|e| MigrateError::Unexpected(format!("failed to parse callback url: {e}")))?;

    let code = parsed
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.to_string())
        .ok_or_else(|| MigrateError::Auth("callback missing code parameter".into()))?;
    let state = parsed
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.to_string())
        .unwrap_or_default();

    let response =
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nAuth complete. You can close this tab.";
    let _ = stream.write_all(response.as_bytes()).await;
    Ok(CodeResponse { code, state })
}

fn open_in_browser(url: &str) {
    let attempt = if cfg!(target_os = "macos") {
        std::process::Command::new("open").arg(url).status()
    } else if cfg!(target_os = "windows") {
        std::process::Command::new("rundll32.exe")
            .args(["url.dll,FileProtocolHandler", url])
            .status()
    } else {
        std::process::Command::new("xdg-open").arg(url).status()
    };
    if let Err(e) = attempt {
        warn!("could not auto-open browser: {e}. Open this URL manually:\n{url}");
    } else {
        println!("If your browser did not open, navigate to:\n{url}");
    }
}

struct TokenStore {
    path: std::path::PathBuf,
}

impl TokenStore {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn load(&self) -> MigResult<Option<StoredToken>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| self.io_auth_err("reading", e))?;
        let token = serde_json::from_str(&raw)
            .map_err(|e| MigrateError::Auth(format!("token file did not parse: {e}")))?;
        Ok(Some(token))
    }

    fn save(&self, token: &StoredToken) -> MigResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| self.io_auth_err("creating the directory for", e))?;
        }
        let serialized = serde_json::to_string_pretty(token)
            .map_err(|e| MigrateError::Unexpected(format!("serializing token: {e}")))?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| self.io_auth_err("opening", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
        }

        file.write_all(serialized.as_bytes())
            .map_err(|e| self.io_auth_err("writing", e))?;
        file.sync_all().map_err(|e| self.io_auth_err("syncing", e))?;
        Ok(())
    }

    /// Token-file disk faults are credential problems from the operator's
    /// point of view, never evidence-store ones.
    fn io_auth_err(&self, doing: &str, e: std::io::Error) -> MigrateError {
        MigrateError::Auth(format!(
            "{doing} token file {}: {e}",
            self.path.display()
        ))
    }
}
