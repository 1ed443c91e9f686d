//! Thin Gmail REST wrapper for archival ingestion: `users.messages.import`
//! or `users.messages.insert`, plus lazy label resolution.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{GmailConfig, IngestMode, InternalDateSource};
use crate::errors::{MigResult, MigrateError};
use crate::labels::LabelMapping;
use crate::oauth::{self, TokenBundle};
use crate::storage::StateDb;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

#[derive(Debug, Deserialize)]
struct GmailLabelsResponse {
    labels: Option<Vec<GmailLabel>>,
}

#[derive(Debug, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct IngestResponse {
    id: String,
}

pub struct GmailClient {
    http: reqwest::Client,
    config: GmailConfig,
    db: StateDb,
    token: Mutex<Option<TokenBundle>>,
    /// path -> label id, seeded from the `labels` table and the one remote
    /// listing a run performs on its first cache miss.
    label_cache: Mutex<HashMap<String, String>>,
    listed_remote: Mutex<bool>,
}

impl GmailClient {
    pub fn new(config: GmailConfig, db: StateDb) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            db,
            token: Mutex::new(None),
            label_cache: Mutex::new(HashMap::new()),
            listed_remote: Mutex::new(false),
        }
    }

    /// Uploads one message. Returns the remote Gmail message id.
    ///
    /// This is a single attempt; the pipeline owns the retry loop so each
    /// attempt is visible in the row's retry counter.
    pub async fn ingest(
        &self,
        raw: &[u8],
        label_ids: &[String],
        date_source: InternalDateSource,
    ) -> MigResult<String> {
        let url = format!(
            "{GMAIL_API_BASE}/users/{}/messages/{}",
            self.config.target_user_email,
            self.config.mode.endpoint()
        );
        let mut query: Vec<(&str, String)> = vec![(
            "internalDateSource",
            date_source.as_api_value().to_string(),
        )];
        if self.config.mode == IngestMode::Import {
            // Archival ingestion: bypass inbox filters and spam
            // classification for the migrated copy.
            query.push(("neverMarkSpam", "true".to_string()));
            query.push(("processForCalendar", "false".to_string()));
        }

        let body = json!({
            "raw": URL_SAFE.encode(raw),
            "labelIds": label_ids,
        });

        let value = self.post_json(&url, &query, &body).await?;
        let parsed: IngestResponse = serde_json::from_value(value)
            .map_err(|e| MigrateError::Unexpected(format!("ingest response did not parse: {e}")))?;
        Ok(parsed.id)
    }

    /// Resolves the full label id set for a folder mapping: the custom
    /// label (created on miss, ancestors included) plus the system label.
    pub async fn resolve_labels(&self, mapping: &LabelMapping) -> MigResult<Vec<String>> {
        let mut ids = Vec::with_capacity(2);
        ids.push(self.ensure_label(&mapping.custom_label).await?);
        if let Some(system) = mapping.system_label {
            ids.push(system.gmail_id().to_string());
        }
        Ok(ids)
    }

    /// Looks a custom label up through the cache layers (memory, state
    /// database, one remote listing) and creates it when truly absent.
    /// Ancestor labels are created first so nesting renders properly.
    async fn ensure_label(&self, path: &str) -> MigResult<String> {
        let mut ancestor = String::new();
        let mut last_id = String::new();
        for segment in path.split('/') {
            if !ancestor.is_empty() {
                ancestor.push('/');
            }
            ancestor.push_str(segment);
            last_id = self.ensure_single_label(&ancestor).await?;
        }
        Ok(last_id)
    }

    async fn ensure_single_label(&self, path: &str) -> MigResult<String> {
        {
            let cache = self.label_cache.lock().await;
            if let Some(id) = cache.get(path) {
                return Ok(id.clone());
            }
        }

        if let Some(id) = self.db.label_id(path).await? {
            self.label_cache.lock().await.insert(path.to_string(), id.clone());
            return Ok(id);
        }

        // One remote listing per run before we start creating labels; a
        // prior partial run may have created labels the table missed.
        {
            let mut listed = self.listed_remote.lock().await;
            if !*listed {
                self.refresh_remote_labels().await?;
                *listed = true;
            }
        }
        {
            let cache = self.label_cache.lock().await;
            if let Some(id) = cache.get(path) {
                self.db.store_label(path, id).await?;
                return Ok(id.clone());
            }
        }

        let url = format!(
            "{GMAIL_API_BASE}/users/{}/labels",
            self.config.target_user_email
        );
        let body = json!({
            "name": path,
            "labelListVisibility": "labelShow",
            "messageListVisibility": "show",
        });
        let value = self.post_json(&url, &[], &body).await?;
        let created: GmailLabel = serde_json::from_value(value)
            .map_err(|e| MigrateError::Unexpected(format!("label response did not parse: {e}")))?;

        info!(label = path, id = %created.id, "created Gmail label");
        self.db.store_label(path, &created.id).await?;
        self.label_cache
            .lock()
            .await
            .insert(path.to_string(), created.id.clone());
        Ok(created.id)
    }

    async fn refresh_remote_labels(&self) -> MigResult<()> {
        let url = format!(
            "{GMAIL_API_BASE}/users/{}/labels",
            self.config.target_user_email
        );
        let value = self.get_json(&url).await?;
        let parsed: GmailLabelsResponse = serde_json::from_value(value)
            .map_err(|e| MigrateError::Unexpected(format!("labels response did not parse: {e}")))?;

        let mut cache = self.label_cache.lock().await;
        for label in parsed.labels.unwrap_or_default() {
            cache.insert(label.name, label.id);
        }
        debug!(count = cache.len(), "hydrated Gmail label cache");
        Ok(())
    }

    async fn get_json(&self, url: &str) -> MigResult<serde_json::Value> {
        self.request(reqwest::Method::GET, url, &[], None).await
    }

    async fn post_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        body: &serde_json::Value,
    ) -> MigResult<serde_json::Value> {
        self.request(reqwest::Method::POST, url, query, Some(body))
            .await
    }

    /// One HTTP attempt with transparent 401 handling: an expired access
    /// token gets exactly one forced refresh before the call counts as
    /// failed.
    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> MigResult<serde_json::Value> {
        let mut forced_refresh = false;
        loop {
            let token = self.bearer(forced_refresh).await?;
            let mut req = self
                .http
                .request(method.clone(), url)
                .query(query)
                .bearer_auth(&token);
            if let Some(body) = body {
                req = req.json(body);
            }
            let res = req.send().await?;
            let status = res.status();

            if status == StatusCode::UNAUTHORIZED && !forced_refresh {
                debug!(url, "gmail returned 401, forcing one token refresh");
                forced_refresh = true;
                continue;
            }
            if status.is_success() {
                return Ok(res.json::<serde_json::Value>().await?);
            }

            let retry_after = parse_retry_after(res.headers());
            let text = res.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, text));
        }
    }

    async fn bearer(&self, force_refresh: bool) -> MigResult<String> {
        let mut guard = self.token.lock().await;
        if !force_refresh {
            if let Some(bundle) = guard.as_ref() {
                let still_valid = bundle
                    .expires_at
                    .map(|t| t.timestamp() - 60 > chrono::Utc::now().timestamp())
                    .unwrap_or(false);
                if still_valid {
                    return Ok(bundle.access_token.clone());
                }
            }
        }
        let bundle = oauth::access_token(&self.config, force_refresh).await?;
        let access = bundle.access_token.clone();
        *guard = Some(bundle);
        Ok(access)
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Maps a non-success Gmail status onto the error taxonomy: 429 is quota,
/// 5xx transient, 401 auth, any other 4xx a permanent rejection.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> MigrateError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return MigrateError::Quota { retry_after };
    }
    if status.is_server_error() {
        return MigrateError::Network(format!("gmail http {status}: {body}"));
    }
    if status == StatusCode::UNAUTHORIZED {
        return MigrateError::Auth(format!("gmail http 401: {body}"));
    }
    MigrateError::RemoteRejected {
        status: status.as_u16(),
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn quota_and_server_errors_are_retryable() {
        let quota = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(1)),
            String::new(),
        );
        assert_eq!(quota.kind(), ErrorKind::QuotaExceeded);
        assert!(quota.is_retryable());

        let server = classify_status(StatusCode::SERVICE_UNAVAILABLE, None, String::new());
        assert_eq!(server.kind(), ErrorKind::NetworkTransient);
        assert!(server.is_retryable());
    }

    #[test]
    fn other_client_errors_are_permanent() {
        let rejected = classify_status(StatusCode::BAD_REQUEST, None, "bad raw".into());
        assert_eq!(rejected.kind(), ErrorKind::RemoteRejected);
        assert!(!rejected.is_retryable());

        let auth = classify_status(StatusCode::UNAUTHORIZED, None, String::new());
        assert_eq!(auth.kind(), ErrorKind::AuthFailed);
        assert!(!auth.is_retryable());
    }
}
