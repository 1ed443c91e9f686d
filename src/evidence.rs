//! Content-addressed evidence store: every message observed on the source
//! is persisted verbatim as a read-only `.eml` before anything else is
//! allowed to happen to it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::{MigResult, MigrateError};

#[derive(Clone, Debug)]
pub struct StoredEvidence {
    /// Path relative to the evidence root, stored in the state database.
    pub relative_path: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvidenceCheck {
    Ok,
    Missing,
    Mismatch { found_sha256: String, found_size: u64 },
}

#[derive(Clone, Debug)]
pub struct EvidenceStore {
    root: PathBuf,
}

impl EvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<aa>/<bb>/<fingerprint>.eml`, splitting the tree on the first two
    /// byte pairs of the fingerprint to bound per-directory fanout.
    pub fn relative_path(fingerprint: &str) -> String {
        format!(
            "{}/{}/{}.eml",
            &fingerprint[..2],
            &fingerprint[2..4],
            fingerprint
        )
    }

    /// Writes the raw RFC 5322 bytes under their fingerprint.
    ///
    /// The write goes to `<path>.tmp`, is fsynced, then renamed into place,
    /// so a partially written file is never observable under the final
    /// name. A pre-existing file with the same fingerprint is accepted when
    /// its content hash matches and is `EvidenceCorruption` otherwise.
    pub fn store(&self, fingerprint: &str, raw: &[u8]) -> MigResult<StoredEvidence> {
        let relative = Self::relative_path(fingerprint);
        let final_path = self.root.join(&relative);
        let tmp_path = final_path.with_extension("eml.tmp");

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut hasher = Sha256::new();
        let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
        hasher.update(raw);
        file.write_all(raw).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        let sha256 = hex::encode(hasher.finalize());

        if final_path.exists() {
            let existing = sha256_of_file(&final_path)?;
            let _ = fs::remove_file(&tmp_path);
            if existing == sha256 {
                debug!(fingerprint, "evidence already present, converging on existing file");
                return Ok(StoredEvidence {
                    relative_path: relative,
                    sha256,
                    size: raw.len() as u64,
                });
            }
            return Err(MigrateError::EvidenceCorruption {
                fingerprint: fingerprint.to_string(),
                stored: existing,
                found: sha256,
            });
        }

        fs::rename(&tmp_path, &final_path).map_err(io_err)?;
        make_read_only(&final_path)?;

        Ok(StoredEvidence {
            relative_path: relative,
            sha256,
            size: raw.len() as u64,
        })
    }

    pub fn load(&self, relative_path: &str) -> MigResult<Vec<u8>> {
        fs::read(self.root.join(relative_path)).map_err(io_err)
    }

    /// Recomputes hash and size for a stored file, for `verify`.
    pub fn check(
        &self,
        relative_path: &str,
        expected_sha256: &str,
        expected_size: u64,
    ) -> MigResult<EvidenceCheck> {
        let path = self.root.join(relative_path);
        if !path.exists() {
            return Ok(EvidenceCheck::Missing);
        }
        let found_size = fs::metadata(&path).map_err(io_err)?.len();
        let found_sha256 = sha256_of_file(&path)?;
        if found_sha256 == expected_sha256 && found_size == expected_size {
            Ok(EvidenceCheck::Ok)
        } else {
            Ok(EvidenceCheck::Mismatch {
                found_sha256,
                found_size,
            })
        }
    }
}

fn sha256_of_file(path: &Path) -> MigResult<String> {
    let bytes = fs::read(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(unix)]
fn make_read_only(path: &Path) -> MigResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o444)).map_err(io_err)
}

#[cfg(not(unix))]
fn make_read_only(path: &Path) -> MigResult<()> {
    let mut perms = fs::metadata(path).map_err(io_err)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms).map_err(io_err)
}

/// Disk faults inside the evidence store are the one place `EvidenceIO`
/// is the honest failure kind.
fn io_err(e: std::io::Error) -> MigrateError {
    MigrateError::EvidenceIo(e)
}
