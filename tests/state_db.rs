use icloud2gmail::errors::ErrorKind;
use icloud2gmail::storage::{ResetScope, StateDb};
use icloud2gmail::types::{CheckpointStatus, HeaderSummary, MessageStatus, Reservation};

fn fp(seed: u8) -> String {
    format!("{seed:02x}").repeat(32)
}

fn headers(message_id: Option<&str>) -> HeaderSummary {
    HeaderSummary {
        message_id: message_id.map(|m| m.to_string()),
        subject: Some("hi".into()),
        from: Some("a@d.com".into()),
        to: Some("b@d.com".into()),
        date_epoch: Some(1_704_067_200),
        ..Default::default()
    }
}

async fn open_db(dir: &tempfile::TempDir) -> StateDb {
    StateDb::connect(&dir.path().join("state.sqlite3"))
        .await
        .expect("state db opens")
}

#[tokio::test]
async fn lifecycle_promotes_through_imported() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    let reservation = db
        .reserve_discovery("INBOX", 1, 100, &fp(0xaa), &headers(Some("<abc@d.com>")))
        .await
        .unwrap();
    let row_id = match reservation {
        Reservation::New { row_id } => row_id,
        other => panic!("expected New, got {other:?}"),
    };
    assert_eq!(
        db.row_status(row_id).await.unwrap(),
        Some(MessageStatus::Discovered)
    );

    db.record_downloaded(row_id, "aa/aa/x.eml", &fp(0xbb), 1200)
        .await
        .unwrap();
    assert_eq!(
        db.row_status(row_id).await.unwrap(),
        Some(MessageStatus::Downloaded)
    );

    let committed = db.record_imported(row_id, "gmail-1", None).await.unwrap();
    assert!(committed);
    assert_eq!(
        db.row_status(row_id).await.unwrap(),
        Some(MessageStatus::Imported)
    );

    // The downloaded->imported gate refuses a second commit, which is what
    // keeps ingestion at-most-once across restarts.
    let again = db.record_imported(row_id, "gmail-2", None).await.unwrap();
    assert!(!again);
    assert_eq!(db.gmail_id(row_id).await.unwrap(), Some("gmail-1".into()));
}

#[tokio::test]
async fn download_requires_prior_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    let Reservation::New { row_id } = db
        .reserve_discovery("INBOX", 1, 100, &fp(0x01), &headers(None))
        .await
        .unwrap()
    else {
        panic!("expected New");
    };
    db.record_downloaded(row_id, "p", "s", 1).await.unwrap();
    assert!(db.record_downloaded(row_id, "p", "s", 1).await.is_err());
}

#[tokio::test]
async fn duplicate_sighting_records_one_skipped_row() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    let Reservation::New { .. } = db
        .reserve_discovery("INBOX", 1, 100, &fp(0x02), &headers(Some("<dup@d.com>")))
        .await
        .unwrap()
    else {
        panic!("expected New");
    };

    // The same physical message surfaces in Archive as well.
    let second = db
        .reserve_discovery("Archive", 9, 77, &fp(0x02), &headers(Some("<dup@d.com>")))
        .await
        .unwrap();
    assert!(matches!(second, Reservation::Duplicate));

    // A rescan of Archive does not stack further reference rows.
    let third = db
        .reserve_discovery("Archive", 9, 77, &fp(0x02), &headers(Some("<dup@d.com>")))
        .await
        .unwrap();
    assert!(matches!(third, Reservation::Duplicate));

    let counts = db.status_counts().await.unwrap();
    assert_eq!(counts.discovered, 1);
    assert_eq!(counts.skipped, 1);
}

#[tokio::test]
async fn same_site_rediscovery_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    let Reservation::New { row_id } = db
        .reserve_discovery("INBOX", 4, 100, &fp(0x03), &headers(None))
        .await
        .unwrap()
    else {
        panic!("expected New");
    };

    // Crash before the evidence write: the next scan sees the same
    // (folder, uid) and picks the row back up instead of flagging a
    // duplicate.
    let resumed = db
        .reserve_discovery("INBOX", 4, 100, &fp(0x03), &headers(None))
        .await
        .unwrap();
    match resumed {
        Reservation::Resumed { row_id: id, status } => {
            assert_eq!(id, row_id);
            assert_eq!(status, MessageStatus::Discovered);
        }
        other => panic!("expected Resumed, got {other:?}"),
    }
}

#[tokio::test]
async fn duplicated_message_id_keys_by_fingerprint() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    let first = db
        .reserve_discovery("INBOX", 1, 100, &fp(0x04), &headers(Some("<same@d.com>")))
        .await
        .unwrap();
    assert!(matches!(first, Reservation::New { .. }));

    // Different content, same Message-Id: still accepted as a new row.
    let second = db
        .reserve_discovery("INBOX", 2, 100, &fp(0x05), &headers(Some("<same@d.com>")))
        .await
        .unwrap();
    assert!(matches!(second, Reservation::New { .. }));

    let counts = db.status_counts().await.unwrap();
    assert_eq!(counts.discovered, 2);
}

#[tokio::test]
async fn skipped_rows_are_idempotent_per_uid() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    db.record_skipped("INBOX", 7, 100, &headers(None), "filtered")
        .await
        .unwrap();
    db.record_skipped("INBOX", 7, 100, &headers(None), "filtered")
        .await
        .unwrap();

    let counts = db.status_counts().await.unwrap();
    assert_eq!(counts.skipped, 1);
}

#[tokio::test]
async fn failure_marks_failed_only_when_exhausted_or_permanent() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    let Reservation::New { row_id } = db
        .reserve_discovery("INBOX", 1, 100, &fp(0x06), &headers(None))
        .await
        .unwrap()
    else {
        panic!("expected New");
    };
    db.record_downloaded(row_id, "aa/bb/x.eml", "sha", 10)
        .await
        .unwrap();

    // Three transient quota errors, budget of five: row stays retryable.
    for _ in 0..3 {
        let status = db
            .record_failure(row_id, ErrorKind::QuotaExceeded, false, 5)
            .await
            .unwrap();
        assert_eq!(status, MessageStatus::Downloaded);
    }
    assert_eq!(
        db.row_status(row_id).await.unwrap(),
        Some(MessageStatus::Downloaded)
    );

    // ...and the retry counter is visible once the row finally fails.
    let status = db
        .record_failure(row_id, ErrorKind::RemoteRejected, true, 5)
        .await
        .unwrap();
    assert_eq!(status, MessageStatus::Failed);
    let failures = db.failed_rows().await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].1, "RemoteRejected");
    assert_eq!(failures[0].2, 4);
}

#[tokio::test]
async fn pending_imports_returns_only_downloaded_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    let Reservation::New { row_id: downloaded } = db
        .reserve_discovery("INBOX", 1, 100, &fp(0x07), &headers(None))
        .await
        .unwrap()
    else {
        panic!()
    };
    db.record_downloaded(downloaded, "aa/bb/a.eml", "sha-a", 10)
        .await
        .unwrap();

    let Reservation::New { row_id: imported } = db
        .reserve_discovery("INBOX", 2, 100, &fp(0x08), &headers(None))
        .await
        .unwrap()
    else {
        panic!()
    };
    db.record_downloaded(imported, "aa/bb/b.eml", "sha-b", 10)
        .await
        .unwrap();
    assert!(db.record_imported(imported, "g-1", None).await.unwrap());

    let pending = db.pending_imports().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].row_id, downloaded);
    assert_eq!(pending[0].evidence_path, "aa/bb/a.eml");
}

#[tokio::test]
async fn checkpoints_advance_monotonically_and_die_with_uidvalidity() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    db.checkpoint_folder("INBOX", 100, 50, Some(120), CheckpointStatus::Scanning)
        .await
        .unwrap();
    // An out-of-order commit cannot move the frontier backwards.
    db.checkpoint_folder("INBOX", 100, 30, Some(120), CheckpointStatus::Scanning)
        .await
        .unwrap();
    let cp = db.checkpoint("INBOX", 100).await.unwrap().unwrap();
    assert_eq!(cp.highest_uid_done, 50);

    db.checkpoint_folder("INBOX", 100, 120, Some(120), CheckpointStatus::Done)
        .await
        .unwrap();
    let cp = db.checkpoint("INBOX", 100).await.unwrap().unwrap();
    assert_eq!(cp.status, CheckpointStatus::Done);
    assert_eq!(cp.highest_uid_done, 120);

    // The server reports a new epoch: all stored progress is discarded and
    // the folder rescans from UID 1.
    db.invalidate_stale_checkpoints("INBOX", 101).await.unwrap();
    assert!(db.checkpoint("INBOX", 100).await.unwrap().is_none());
    assert!(db.checkpoint("INBOX", 101).await.unwrap().is_none());
}

#[tokio::test]
async fn reset_reopens_terminal_rows_without_touching_imports() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    db.record_skipped("INBOX", 1, 100, &headers(None), "filtered")
        .await
        .unwrap();

    let Reservation::New { row_id: failed } = db
        .reserve_discovery("INBOX", 2, 100, &fp(0x09), &headers(None))
        .await
        .unwrap()
    else {
        panic!()
    };
    db.record_downloaded(failed, "aa/bb/f.eml", "sha-f", 10)
        .await
        .unwrap();
    db.record_failure(failed, ErrorKind::RemoteRejected, true, 5)
        .await
        .unwrap();

    let Reservation::New { row_id: imported } = db
        .reserve_discovery("INBOX", 3, 100, &fp(0x0a), &headers(None))
        .await
        .unwrap()
    else {
        panic!()
    };
    db.record_downloaded(imported, "aa/bb/i.eml", "sha-i", 10)
        .await
        .unwrap();
    assert!(db.record_imported(imported, "g-keep", None).await.unwrap());

    db.checkpoint_folder("INBOX", 100, 3, None, CheckpointStatus::Done)
        .await
        .unwrap();

    db.reset(ResetScope::All).await.unwrap();

    let counts = db.status_counts().await.unwrap();
    assert_eq!(counts.skipped, 0);
    assert_eq!(counts.failed, 0);
    // The failed row keeps its evidence and waits in `downloaded` again.
    assert_eq!(
        db.row_status(failed).await.unwrap(),
        Some(MessageStatus::Downloaded)
    );
    assert_eq!(
        db.row_status(imported).await.unwrap(),
        Some(MessageStatus::Imported)
    );
    assert!(db.all_checkpoints().await.unwrap().is_empty());
}

#[tokio::test]
async fn label_mappings_persist() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir).await;

    assert!(db.label_id("iCloud/Inbox").await.unwrap().is_none());
    db.store_label("iCloud/Inbox", "Label_7").await.unwrap();
    assert_eq!(
        db.label_id("iCloud/Inbox").await.unwrap(),
        Some("Label_7".to_string())
    );
}
