//! JSON run summary written under `reports/`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::errors::{MigResult, MigrateError};
use crate::storage::StateDb;

#[derive(Debug, Serialize)]
pub struct ReportSummary {
    pub generated_at: String,
    pub counts: ReportCounts,
    pub folders: Vec<ReportFolder>,
    pub failures: Vec<ReportFailure>,
}

#[derive(Debug, Serialize)]
pub struct ReportCounts {
    pub discovered: i64,
    pub downloaded: i64,
    pub imported: i64,
    pub skipped: i64,
    pub failed: i64,
}

#[derive(Debug, Serialize)]
pub struct ReportFolder {
    pub name: String,
    pub uidvalidity: u32,
    pub highest_uid_done: u32,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ReportFailure {
    pub fingerprint: String,
    pub kind: String,
    pub retries: i64,
}

pub async fn build(db: &StateDb) -> MigResult<ReportSummary> {
    let counts = db.status_counts().await?;
    let folders = db
        .all_checkpoints()
        .await?
        .into_iter()
        .map(|cp| ReportFolder {
            name: cp.folder,
            uidvalidity: cp.uidvalidity,
            highest_uid_done: cp.highest_uid_done,
            status: cp.status.as_str().to_string(),
        })
        .collect();
    let failures = db
        .failed_rows()
        .await?
        .into_iter()
        .map(|(fingerprint, kind, retries)| ReportFailure {
            fingerprint,
            kind,
            retries,
        })
        .collect();

    Ok(ReportSummary {
        generated_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        counts: ReportCounts {
            discovered: counts.discovered,
            downloaded: counts.downloaded,
            imported: counts.imported,
            skipped: counts.skipped,
            failed: counts.failed,
        },
        folders,
        failures,
    })
}

/// Writes the summary as `<iso-timestamp>.json` and returns the path.
pub fn write(reports_dir: &Path, summary: &ReportSummary) -> MigResult<PathBuf> {
    fs::create_dir_all(reports_dir).map_err(|e| {
        MigrateError::Unexpected(format!(
            "creating reports directory {}: {e}",
            reports_dir.display()
        ))
    })?;
    let file_name = format!(
        "{}.json",
        Utc::now().format("%Y-%m-%dT%H-%M-%SZ")
    );
    let path = reports_dir.join(file_name);
    let serialized = serde_json::to_string_pretty(summary)
        .map_err(|e| MigrateError::Unexpected(format!("serializing report: {e}")))?;
    fs::write(&path, serialized)
        .map_err(|e| MigrateError::Unexpected(format!("writing report {}: {e}", path.display())))?;

    info!(
        path = %path.display(),
        imported = summary.counts.imported,
        skipped = summary.counts.skipped,
        failed = summary.counts.failed,
        "report written"
    );
    Ok(path)
}
