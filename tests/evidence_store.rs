use std::fs;

use sha2::{Digest, Sha256};

use icloud2gmail::errors::MigrateError;
use icloud2gmail::evidence::{EvidenceCheck, EvidenceStore};

const FINGERPRINT: &str = "aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899";

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[test]
fn store_writes_read_only_content_addressed_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = EvidenceStore::new(dir.path());

    let raw = b"From: a@d.com\r\nSubject: hi\r\n\r\nbody\r\n";
    let stored = store.store(FINGERPRINT, raw).unwrap();

    assert_eq!(stored.relative_path, format!("aa/bb/{FINGERPRINT}.eml"));
    assert_eq!(stored.sha256, sha256_hex(raw));
    assert_eq!(stored.size, raw.len() as u64);

    let path = dir.path().join(&stored.relative_path);
    assert_eq!(fs::read(&path).unwrap(), raw);
    assert!(fs::metadata(&path).unwrap().permissions().readonly());
    // The tmp staging file never survives a successful commit.
    assert!(!path.with_extension("eml.tmp").exists());
}

#[test]
fn concurrent_identical_writes_converge() {
    let dir = tempfile::tempdir().unwrap();
    let store = EvidenceStore::new(dir.path());

    let raw = b"identical bytes";
    let first = store.store(FINGERPRINT, raw).unwrap();
    let second = store.store(FINGERPRINT, raw).unwrap();

    assert_eq!(first.sha256, second.sha256);
    assert_eq!(first.relative_path, second.relative_path);
}

#[test]
fn conflicting_content_is_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let store = EvidenceStore::new(dir.path());

    store.store(FINGERPRINT, b"original bytes").unwrap();
    let err = store.store(FINGERPRINT, b"different bytes").unwrap_err();
    assert!(matches!(err, MigrateError::EvidenceCorruption { .. }));

    // The original evidence is untouched.
    let path = dir.path().join(EvidenceStore::relative_path(FINGERPRINT));
    assert_eq!(fs::read(path).unwrap(), b"original bytes");
}

#[test]
fn check_detects_bit_flips() {
    let dir = tempfile::tempdir().unwrap();
    let store = EvidenceStore::new(dir.path());

    let raw = b"pristine message bytes";
    let stored = store.store(FINGERPRINT, raw).unwrap();
    assert_eq!(
        store
            .check(&stored.relative_path, &stored.sha256, stored.size)
            .unwrap(),
        EvidenceCheck::Ok
    );

    // Flip one byte under the store's feet.
    let path = dir.path().join(&stored.relative_path);
    let mut perms = fs::metadata(&path).unwrap().permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    fs::set_permissions(&path, perms).unwrap();
    let mut bytes = fs::read(&path).unwrap();
    bytes[0] ^= 0x01;
    fs::write(&path, &bytes).unwrap();

    match store
        .check(&stored.relative_path, &stored.sha256, stored.size)
        .unwrap()
    {
        EvidenceCheck::Mismatch { found_sha256, .. } => {
            assert_ne!(found_sha256, stored.sha256);
        }
        other => panic!("expected mismatch, got {other:?}"),
    }
}

#[test]
fn missing_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = EvidenceStore::new(dir.path());
    assert_eq!(
        store.check("aa/bb/missing.eml", "deadbeef", 4).unwrap(),
        EvidenceCheck::Missing
    );
}

#[test]
fn load_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = EvidenceStore::new(dir.path());
    let raw = b"verbatim rfc5322 bytes, no trailing newline normalization";
    let stored = store.store(FINGERPRINT, raw).unwrap();
    assert_eq!(store.load(&stored.relative_path).unwrap(), raw);
}
