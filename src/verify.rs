//! Evidence audit: recompute the SHA-256 and size of every stored `.eml`
//! and compare against the state database. Read-only; a mismatch is
//! reported, never repaired.

use tracing::{error, info};

use crate::errors::MigResult;
use crate::evidence::{EvidenceCheck, EvidenceStore};
use crate::storage::StateDb;

#[derive(Clone, Debug)]
pub struct VerifyIssue {
    pub fingerprint: String,
    pub path: String,
    pub detail: String,
}

#[derive(Clone, Debug, Default)]
pub struct VerifyOutcome {
    pub checked: usize,
    pub issues: Vec<VerifyIssue>,
}

pub async fn run(db: &StateDb, evidence: &EvidenceStore) -> MigResult<VerifyOutcome> {
    let rows = db.evidence_rows().await?;
    let mut outcome = VerifyOutcome::default();

    for (fingerprint, path, sha256, size) in rows {
        outcome.checked += 1;
        let detail = match evidence.check(&path, &sha256, size.max(0) as u64)? {
            EvidenceCheck::Ok => continue,
            EvidenceCheck::Missing => "evidence file missing".to_string(),
            EvidenceCheck::Mismatch {
                found_sha256,
                found_size,
            } => format!(
                "expected sha256={sha256} size={size}, found sha256={found_sha256} size={found_size}"
            ),
        };
        error!(fingerprint = %fingerprint, path = %path, %detail, "evidence verification failed");
        outcome.issues.push(VerifyIssue {
            fingerprint,
            path,
            detail,
        });
    }

    info!(
        checked = outcome.checked,
        mismatches = outcome.issues.len(),
        "verification finished"
    );
    Ok(outcome)
}
