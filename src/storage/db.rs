use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::errors::{ErrorKind, MigResult, MigrateError};
use crate::fingerprint::normalize_message_id;
use crate::types::{
    now_ts, CheckpointStatus, FolderCheckpoint, HeaderSummary, MessageStatus, Reservation,
    WorkItem,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetScope {
    SkippedAndFailed,
    FolderCheckpoints,
    All,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub discovered: i64,
    pub downloaded: i64,
    pub imported: i64,
    pub skipped: i64,
    pub failed: i64,
}

/// Durable single-writer state store. Every lifecycle transition is one
/// transaction touching one message, committed after the side effect it
/// records, so a crash costs re-work but never consistency.
#[derive(Clone)]
pub struct StateDb {
    pool: SqlitePool,
    path: PathBuf,
}

impl StateDb {
    pub async fn connect(path: &Path) -> MigResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MigrateError::Config(format!(
                    "creating state database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(MigrateError::Database)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = StateDb {
            pool,
            path: path.to_path_buf(),
        };
        db.migrate().await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> MigResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT UNIQUE,
                message_id TEXT UNIQUE,
                duplicate_of TEXT,
                folder TEXT NOT NULL,
                uid INTEGER NOT NULL,
                uidvalidity INTEGER NOT NULL,
                subject TEXT,
                from_addr TEXT,
                to_addrs TEXT,
                cc_addrs TEXT,
                bcc_addrs TEXT,
                date_header TEXT,
                date_epoch INTEGER,
                received_at INTEGER,
                evidence_path TEXT,
                evidence_sha256 TEXT,
                size_bytes INTEGER,
                status TEXT NOT NULL,
                skip_reason TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                gmail_id TEXT,
                notes TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);
            CREATE INDEX IF NOT EXISTS idx_messages_folder_uid ON messages(folder, uidvalidity, uid);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_skip_sighting
                ON messages(folder, uidvalidity, uid)
                WHERE fingerprint IS NULL AND duplicate_of IS NULL;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_duplicate_sighting
                ON messages(duplicate_of, folder, uidvalidity, uid) WHERE duplicate_of IS NOT NULL;

            CREATE TABLE IF NOT EXISTS folder_checkpoints (
                folder TEXT NOT NULL,
                uidvalidity INTEGER NOT NULL,
                highest_uid_done INTEGER NOT NULL DEFAULT 0,
                last_scan_ts INTEGER,
                message_count INTEGER,
                status TEXT NOT NULL,
                PRIMARY KEY (folder, uidvalidity)
            );

            CREATE TABLE IF NOT EXISTS labels (
                path TEXT PRIMARY KEY,
                gmail_id TEXT,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts or resolves the row for a freshly fingerprinted discovery.
    ///
    /// The same `(folder, uid)` seen again resolves to `Resumed` so crash
    /// recovery can pick up where it left off; a fingerprint collision from
    /// a different sighting site records one `skipped` reference row and
    /// resolves to `Duplicate`.
    pub async fn reserve_discovery(
        &self,
        folder: &str,
        uid: u32,
        uidvalidity: u32,
        fingerprint: &str,
        headers: &HeaderSummary,
    ) -> MigResult<Reservation> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT id, status, folder, uid FROM messages WHERE fingerprint = ?1",
        )
        .bind(fingerprint)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let row_id: i64 = row.get(0);
            let status_raw: String = row.get(1);
            let row_folder: String = row.get(2);
            let row_uid: i64 = row.get(3);

            if row_folder == folder && row_uid == uid as i64 {
                // Same sighting site: continue whatever was in flight and
                // keep the stored uidvalidity current.
                sqlx::query(
                    "UPDATE messages SET uidvalidity = ?1, updated_at = ?2 WHERE id = ?3",
                )
                .bind(uidvalidity as i64)
                .bind(now)
                .bind(row_id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                let status = MessageStatus::from_str(&status_raw).ok_or_else(|| {
                    MigrateError::Unexpected(format!("unknown status `{status_raw}` in row {row_id}"))
                })?;
                return Ok(Reservation::Resumed { row_id, status });
            }

            sqlx::query(
                r#"
                INSERT OR IGNORE INTO messages
                    (duplicate_of, folder, uid, uidvalidity, status, skip_reason, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, 'skipped', 'duplicate', ?5, ?5)
                "#,
            )
            .bind(fingerprint)
            .bind(folder)
            .bind(uid as i64)
            .bind(uidvalidity as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            debug!(fingerprint, folder, uid, "duplicate sighting recorded");
            return Ok(Reservation::Duplicate);
        }

        // Message-Id stays unique where non-null; a second physical message
        // claiming an already-stored id keeps NULL here and is keyed by
        // fingerprint alone.
        let message_id = match headers.message_id.as_deref().and_then(normalize_message_id) {
            Some(mid) => {
                let taken = sqlx::query("SELECT 1 FROM messages WHERE message_id = ?1")
                    .bind(&mid)
                    .fetch_optional(&mut *tx)
                    .await?;
                if taken.is_some() {
                    warn!(message_id = %mid, folder, uid, "message-id already claimed, keying by fingerprint only");
                    None
                } else {
                    Some(mid)
                }
            }
            None => None,
        };

        let row_id = sqlx::query(
            r#"
            INSERT INTO messages
                (fingerprint, message_id, folder, uid, uidvalidity,
                 subject, from_addr, to_addrs, cc_addrs, bcc_addrs,
                 date_header, date_epoch, received_at, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 'discovered', ?14, ?14)
            "#,
        )
        .bind(fingerprint)
        .bind(&message_id)
        .bind(folder)
        .bind(uid as i64)
        .bind(uidvalidity as i64)
        .bind(&headers.subject)
        .bind(&headers.from)
        .bind(&headers.to)
        .bind(&headers.cc)
        .bind(&headers.bcc)
        .bind(&headers.date_raw)
        .bind(headers.date_epoch)
        .bind(headers.received_epoch.unwrap_or(now))
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;
        Ok(Reservation::New { row_id })
    }

    /// Records a skip (filter miss or parse error): the UID is accounted
    /// for without a fingerprint or evidence file. Idempotent per
    /// `(folder, uidvalidity, uid)`.
    pub async fn record_skipped(
        &self,
        folder: &str,
        uid: u32,
        uidvalidity: u32,
        headers: &HeaderSummary,
        reason: &str,
    ) -> MigResult<()> {
        let now = now_ts();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages
                (folder, uid, uidvalidity, subject, from_addr, to_addrs, date_epoch,
                 status, skip_reason, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'skipped', ?8, ?9, ?9)
            "#,
        )
        .bind(folder)
        .bind(uid as i64)
        .bind(uidvalidity as i64)
        .bind(&headers.subject)
        .bind(&headers.from)
        .bind(&headers.to)
        .bind(headers.date_epoch)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `discovered → downloaded`, committed only after the evidence file is
    /// durably in place.
    pub async fn record_downloaded(
        &self,
        row_id: i64,
        evidence_path: &str,
        sha256: &str,
        size: u64,
    ) -> MigResult<()> {
        let res = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'downloaded', evidence_path = ?1, evidence_sha256 = ?2,
                size_bytes = ?3, updated_at = ?4
            WHERE id = ?5 AND status = 'discovered'
            "#,
        )
        .bind(evidence_path)
        .bind(sha256)
        .bind(size as i64)
        .bind(now_ts())
        .bind(row_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() != 1 {
            return Err(MigrateError::Unexpected(format!(
                "row {row_id} was not in `discovered` when recording download"
            )));
        }
        Ok(())
    }

    /// `downloaded → imported`. The status gate is what enforces at-most-once
    /// ingestion across restarts; a `false` return means the gate refused
    /// because the row had already left `downloaded`.
    pub async fn record_imported(
        &self,
        row_id: i64,
        remote_id: &str,
        note: Option<&str>,
    ) -> MigResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'imported', gmail_id = ?1, last_error = NULL,
                notes = COALESCE(?2, notes), updated_at = ?3
            WHERE id = ?4 AND status = 'downloaded'
            "#,
        )
        .bind(remote_id)
        .bind(note)
        .bind(now_ts())
        .bind(row_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    pub async fn row_status(&self, row_id: i64) -> MigResult<Option<MessageStatus>> {
        let row = sqlx::query("SELECT status FROM messages WHERE id = ?1")
            .bind(row_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let raw: String = row.get(0);
                let status = MessageStatus::from_str(&raw).ok_or_else(|| {
                    MigrateError::Unexpected(format!("unknown status `{raw}` in row {row_id}"))
                })?;
                Ok(Some(status))
            }
        }
    }

    /// Bumps the retry counter and marks the row `failed` when the error is
    /// permanent or the retry budget is spent. Returns the resulting status.
    pub async fn record_failure(
        &self,
        row_id: i64,
        kind: ErrorKind,
        permanent: bool,
        max_retries: i64,
    ) -> MigResult<MessageStatus> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT retry_count, status FROM messages WHERE id = ?1")
            .bind(row_id)
            .fetch_one(&mut *tx)
            .await?;
        let retries: i64 = row.get(0);
        let current_raw: String = row.get(1);

        let new_count = retries + 1;
        let exhausted = permanent || new_count >= max_retries;

        if exhausted {
            sqlx::query(
                r#"
                UPDATE messages
                SET status = 'failed', retry_count = ?1, last_error = ?2, updated_at = ?3
                WHERE id = ?4
                "#,
            )
            .bind(new_count)
            .bind(kind.as_str())
            .bind(now_ts())
            .bind(row_id)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE messages SET retry_count = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
            )
            .bind(new_count)
            .bind(kind.as_str())
            .bind(now_ts())
            .bind(row_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        if exhausted {
            return Ok(MessageStatus::Failed);
        }
        MessageStatus::from_str(&current_raw).ok_or_else(|| {
            MigrateError::Unexpected(format!("unknown status `{current_raw}` in row {row_id}"))
        })
    }

    /// Upserts a folder checkpoint. `highest_uid_done` only ever moves
    /// forward for a given `(folder, uidvalidity)`.
    pub async fn checkpoint_folder(
        &self,
        folder: &str,
        uidvalidity: u32,
        highest_uid_done: u32,
        message_count: Option<u32>,
        status: CheckpointStatus,
    ) -> MigResult<()> {
        sqlx::query(
            r#"
            INSERT INTO folder_checkpoints
                (folder, uidvalidity, highest_uid_done, last_scan_ts, message_count, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(folder, uidvalidity) DO UPDATE SET
                highest_uid_done = MAX(folder_checkpoints.highest_uid_done, excluded.highest_uid_done),
                last_scan_ts = excluded.last_scan_ts,
                message_count = COALESCE(excluded.message_count, folder_checkpoints.message_count),
                status = excluded.status
            "#,
        )
        .bind(folder)
        .bind(uidvalidity as i64)
        .bind(highest_uid_done as i64)
        .bind(now_ts())
        .bind(message_count.map(|c| c as i64))
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn checkpoint(
        &self,
        folder: &str,
        uidvalidity: u32,
    ) -> MigResult<Option<FolderCheckpoint>> {
        let row = sqlx::query(
            r#"
            SELECT folder, uidvalidity, highest_uid_done, last_scan_ts, message_count, status
            FROM folder_checkpoints
            WHERE folder = ?1 AND uidvalidity = ?2
            "#,
        )
        .bind(folder)
        .bind(uidvalidity as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(checkpoint_from_row).transpose()
    }

    /// Drops progress recorded under other UIDVALIDITY epochs for a folder.
    /// Called when the server reports a new epoch, which invalidates every
    /// stored UID.
    pub async fn invalidate_stale_checkpoints(
        &self,
        folder: &str,
        current_uidvalidity: u32,
    ) -> MigResult<u64> {
        let res = sqlx::query(
            "DELETE FROM folder_checkpoints WHERE folder = ?1 AND uidvalidity != ?2",
        )
        .bind(folder)
        .bind(current_uidvalidity as i64)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() > 0 {
            warn!(
                folder,
                uidvalidity = current_uidvalidity,
                "UIDVALIDITY changed, stored UID progress discarded"
            );
        }
        Ok(res.rows_affected())
    }

    pub async fn all_checkpoints(&self) -> MigResult<Vec<FolderCheckpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT folder, uidvalidity, highest_uid_done, last_scan_ts, message_count, status
            FROM folder_checkpoints
            ORDER BY folder ASC, uidvalidity ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(checkpoint_from_row).collect()
    }

    /// Administrative reset. Never touches evidence files and never demotes
    /// `imported` rows.
    pub async fn reset(&self, scope: ResetScope) -> MigResult<u64> {
        let mut affected = 0u64;

        if matches!(scope, ResetScope::SkippedAndFailed | ResetScope::All) {
            let mut tx = self.pool.begin().await?;
            // Skip rows are sightings with no earlier state: remove them so
            // a rescan re-evaluates the UID.
            let skipped = sqlx::query("DELETE FROM messages WHERE status = 'skipped'")
                .execute(&mut *tx)
                .await?;
            // Failed rows return to the state their evidence supports.
            let failed = sqlx::query(
                r#"
                UPDATE messages
                SET status = CASE WHEN evidence_path IS NOT NULL THEN 'downloaded' ELSE 'discovered' END,
                    retry_count = 0, last_error = NULL, updated_at = ?1
                WHERE status = 'failed'
                "#,
            )
            .bind(now_ts())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            affected += skipped.rows_affected() + failed.rows_affected();
        }

        if matches!(scope, ResetScope::FolderCheckpoints | ResetScope::All) {
            let res = sqlx::query("DELETE FROM folder_checkpoints")
                .execute(&self.pool)
                .await?;
            affected += res.rows_affected();
        }

        Ok(affected)
    }

    /// Rows that reached `downloaded` but not `imported`: the resume feed
    /// for the ingestion queue.
    pub async fn pending_imports(&self) -> MigResult<Vec<WorkItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, fingerprint, folder, evidence_path, date_epoch
            FROM messages
            WHERE status = 'downloaded'
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(WorkItem {
                row_id: row.get(0),
                fingerprint: row.get::<Option<String>, _>(1).unwrap_or_default(),
                folder: row.get(2),
                evidence_path: row.get::<Option<String>, _>(3).ok_or_else(|| {
                    MigrateError::Unexpected("downloaded row without evidence path".into())
                })?,
                date_epoch: row.get(4),
            });
        }
        Ok(out)
    }

    pub async fn status_counts(&self) -> MigResult<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) FROM messages GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.get(0);
            let count: i64 = row.get(1);
            match status.as_str() {
                "discovered" => counts.discovered = count,
                "downloaded" => counts.downloaded = count,
                "imported" => counts.imported = count,
                "skipped" => counts.skipped = count,
                "failed" => counts.failed = count,
                other => warn!(status = other, "unknown status in messages table"),
            }
        }
        Ok(counts)
    }

    /// `(fingerprint, kind, retries)` for every terminally failed row.
    pub async fn failed_rows(&self) -> MigResult<Vec<(String, String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT COALESCE(fingerprint, ''), COALESCE(last_error, 'Unexpected'), retry_count
            FROM messages
            WHERE status = 'failed'
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get(0), row.get(1), row.get(2)))
            .collect())
    }

    /// `(fingerprint, evidence_path, sha256, size)` for every row that holds
    /// an evidence file, regardless of status. Drives `verify`.
    pub async fn evidence_rows(&self) -> MigResult<Vec<(String, String, String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT COALESCE(fingerprint, ''), evidence_path, evidence_sha256, COALESCE(size_bytes, 0)
            FROM messages
            WHERE evidence_path IS NOT NULL AND evidence_sha256 IS NOT NULL
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get(0), row.get(1), row.get(2), row.get(3)))
            .collect())
    }

    pub async fn gmail_id(&self, row_id: i64) -> MigResult<Option<String>> {
        let row = sqlx::query("SELECT gmail_id FROM messages WHERE id = ?1")
            .bind(row_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>(0)))
    }

    pub async fn label_id(&self, path: &str) -> MigResult<Option<String>> {
        let row = sqlx::query("SELECT gmail_id FROM labels WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>(0)))
    }

    pub async fn store_label(&self, path: &str, gmail_id: &str) -> MigResult<()> {
        sqlx::query(
            r#"
            INSERT INTO labels (path, gmail_id, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(path) DO UPDATE SET gmail_id = excluded.gmail_id
            "#,
        )
        .bind(path)
        .bind(gmail_id)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn checkpoint_from_row(row: sqlx::sqlite::SqliteRow) -> MigResult<FolderCheckpoint> {
    let status_raw: String = row.get(5);
    let status = CheckpointStatus::from_str(&status_raw)
        .ok_or_else(|| MigrateError::Unexpected(format!("unknown checkpoint status `{status_raw}`")))?;
    Ok(FolderCheckpoint {
        folder: row.get(0),
        uidvalidity: row.get::<i64, _>(1) as u32,
        highest_uid_done: row.get::<i64, _>(2) as u32,
        last_scan_ts: row.get(3),
        message_count: row.get::<Option<i64>, _>(4).map(|c| c as u32),
        status,
    })
}
