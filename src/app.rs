//! Command dispatch and exit-code policy.
//!
//! Exit codes: 0 success, 1 user/config error, 2 run finished with rows in
//! `failed`, 3 verification mismatch.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{Cli, Command};
use crate::config::{Config, GmailConfig, StorageConfig};
use crate::errors::MigrateError;
use crate::evidence::EvidenceStore;
use crate::gmail::GmailClient;
use crate::pipeline::Pipeline;
use crate::storage::{ResetScope, StateDb};
use crate::{imap, oauth, report, verify};

pub const EXIT_OK: i32 = 0;
pub const EXIT_USER_ERROR: i32 = 1;
pub const EXIT_PARTIAL_FAILURE: i32 = 2;
pub const EXIT_VERIFY_MISMATCH: i32 = 3;

pub async fn run(cli: Cli) -> i32 {
    let result = match cli.command {
        Command::GmailAuth => gmail_auth().await,
        Command::Migrate { dry_run, reset } => migrate(dry_run, reset).await,
        Command::Verify => run_verify().await,
        Command::Report => run_report().await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            EXIT_USER_ERROR
        }
    }
}

/// Only the Gmail section is needed to mint a token.
async fn gmail_auth() -> Result<i32, MigrateError> {
    let gmail = GmailConfig::load()?;
    let bundle = oauth::authorize(&gmail).await?;
    info!(
        token_file = %gmail.token_file.display(),
        expires_at = ?bundle.expires_at,
        "Gmail authorization complete"
    );
    Ok(EXIT_OK)
}

async fn migrate(dry_run: bool, reset: bool) -> Result<i32, MigrateError> {
    let config = Arc::new(Config::load()?);
    let db = StateDb::connect(&config.storage.sqlite_path).await?;

    if reset {
        let affected = db.reset(ResetScope::All).await?;
        info!(rows = affected, "reset applied before discovery");
    }

    let evidence = EvidenceStore::new(&config.storage.evidence_dir);
    let gmail = if dry_run {
        info!("dry run: evidence and state only, no Gmail calls");
        None
    } else {
        // Fail fast on missing/expired credentials before any IMAP traffic.
        oauth::access_token(&config.gmail, false).await?;
        Some(Arc::new(GmailClient::new(config.gmail.clone(), db.clone())))
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let pool = imap::build_pool(&config.imap)?;
    let pipeline = Pipeline::new(Arc::clone(&config), db.clone(), evidence, gmail, cancel);
    let outcome = pipeline.run(pool).await;

    // The state database is flushed and closed last, whatever happened.
    let counts = match outcome {
        Ok(counts) => counts,
        Err(e) => {
            db.close().await;
            return Err(e);
        }
    };
    db.close().await;

    info!(
        discovered = counts.discovered,
        downloaded = counts.downloaded,
        imported = counts.imported,
        skipped = counts.skipped,
        failed = counts.failed,
        "migration finished"
    );
    if counts.failed > 0 {
        warn!(failed = counts.failed, "run finished with failed rows; see `report`");
        return Ok(EXIT_PARTIAL_FAILURE);
    }
    Ok(EXIT_OK)
}

async fn run_verify() -> Result<i32, MigrateError> {
    let storage = StorageConfig::load()?;
    let db = StateDb::connect(&storage.sqlite_path).await?;
    let evidence = EvidenceStore::new(&storage.evidence_dir);
    let outcome = verify::run(&db, &evidence).await;
    db.close().await;

    let outcome = outcome?;
    if outcome.issues.is_empty() {
        Ok(EXIT_OK)
    } else {
        Ok(EXIT_VERIFY_MISMATCH)
    }
}

async fn run_report() -> Result<i32, MigrateError> {
    let storage = StorageConfig::load()?;
    let db = StateDb::connect(&storage.sqlite_path).await?;
    let summary = report::build(&db).await;
    db.close().await;

    let summary = summary?;
    let path = report::write(&storage.reports_dir, &summary)?;
    println!("{}", path.display());
    Ok(EXIT_OK)
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received, finishing in-flight items");
            cancel.cancel();
        }
    });
}
