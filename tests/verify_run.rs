use std::fs;

use icloud2gmail::evidence::EvidenceStore;
use icloud2gmail::storage::StateDb;
use icloud2gmail::types::{HeaderSummary, MessageStatus, Reservation};
use icloud2gmail::verify;

const FINGERPRINT: &str = "0102030405060708091011121314151617181920212223242526272829303132";

#[tokio::test]
async fn verify_reports_corruption_without_mutating_state() {
    let dir = tempfile::tempdir().unwrap();
    let db = StateDb::connect(&dir.path().join("state.sqlite3"))
        .await
        .unwrap();
    let evidence = EvidenceStore::new(dir.path().join("evidence"));

    let raw = b"Subject: audit me\r\n\r\nbody\r\n";
    let stored = evidence.store(FINGERPRINT, raw).unwrap();
    let Reservation::New { row_id } = db
        .reserve_discovery("INBOX", 1, 100, FINGERPRINT, &HeaderSummary::default())
        .await
        .unwrap()
    else {
        panic!("expected New");
    };
    db.record_downloaded(row_id, &stored.relative_path, &stored.sha256, stored.size)
        .await
        .unwrap();

    // A clean tree verifies clean.
    let outcome = verify::run(&db, &evidence).await.unwrap();
    assert_eq!(outcome.checked, 1);
    assert!(outcome.issues.is_empty());

    // Corrupt a single byte on disk.
    let path = dir
        .path()
        .join("evidence")
        .join(&stored.relative_path);
    let mut perms = fs::metadata(&path).unwrap().permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    fs::set_permissions(&path, perms).unwrap();
    let mut bytes = fs::read(&path).unwrap();
    bytes[0] ^= 0x80;
    fs::write(&path, &bytes).unwrap();

    let outcome = verify::run(&db, &evidence).await.unwrap();
    assert_eq!(outcome.issues.len(), 1);
    assert_eq!(outcome.issues[0].fingerprint, FINGERPRINT);

    // Verification never mutates the state database.
    assert_eq!(
        db.row_status(row_id).await.unwrap(),
        Some(MessageStatus::Downloaded)
    );
}
