//! Crash-safe immutable `.eml` evidence storage (spec.md §4.2). Grounded on
//! `original_source/storage/eml_store.py`: write-temp, fsync, atomic rename,
//! fsync the containing directory, then chmod read-only.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::{AppError, AppResult};
use crate::mail::{sha256_hex, sha256_file_hex};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Result of writing (or verifying) an evidence file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmlWriteResult {
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Normalize a folder name into a filesystem-safe directory component
/// (spec.md §4.2): path separators and anything outside `[A-Za-z0-9._-]`
/// become `_`, leading/trailing `._-` are trimmed, empty falls back to
/// `"folder"`.
pub fn safe_folder(folder: &str) -> String {
    let mut out = String::with_capacity(folder.len());
    for ch in folder.trim().chars() {
        if ch == '/' || ch == std::path::MAIN_SEPARATOR {
            out.push('_');
        } else if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches(|c| c == '.' || c == '_' || c == '-');
    if trimmed.is_empty() {
        "folder".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Writes and validates immutable `.eml` evidence files under a root directory.
#[derive(Clone, Debug)]
pub struct EvidenceStore {
    evidence_dir: PathBuf,
}

impl EvidenceStore {
    pub fn new(evidence_dir: PathBuf) -> Self {
        Self { evidence_dir }
    }

    pub fn evidence_dir(&self) -> &Path {
        &self.evidence_dir
    }

    /// Write `raw_rfc822` to `{evidence_dir}/{safe_folder}/{uidvalidity}-{uid}.eml`.
    ///
    /// If the target already exists its hash is compared against the bytes
    /// being written; a mismatch is an [`AppError::EvidenceMismatch`]. A match
    /// returns the existing file's details without rewriting it (idempotent
    /// re-runs, spec.md §4.2).
    pub fn write_immutable(
        &self,
        folder: &str,
        uidvalidity: Option<u32>,
        uid: u32,
        raw_rfc822: &[u8],
    ) -> AppResult<EmlWriteResult> {
        std::fs::create_dir_all(&self.evidence_dir)?;
        let folder_dir = self.evidence_dir.join(safe_folder(folder));
        std::fs::create_dir_all(&folder_dir)?;

        let uv = uidvalidity.unwrap_or(0);
        let target = folder_dir.join(format!("{uv}-{uid}.eml"));
        let expected_sha = sha256_hex(raw_rfc822);

        if target.exists() {
            let actual_sha = sha256_file_hex(&target)?;
            if actual_sha != expected_sha {
                return Err(AppError::EvidenceMismatch(format!(
                    "evidence file already exists but differs: {}",
                    target.display()
                )));
            }
            let size_bytes = std::fs::metadata(&target)?.len();
            return Ok(EmlWriteResult {
                path: target,
                sha256: actual_sha,
                size_bytes,
            });
        }

        let tmp_name = format!(
            "{}.{}.{}.tmp",
            target.file_name().and_then(|n| n.to_str()).unwrap_or("evidence"),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let tmp_path = folder_dir.join(tmp_name);

        let write_result = (|| -> AppResult<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(raw_rfc822)?;
            file.flush()?;
            file.sync_all()?;
            drop(file);

            std::fs::rename(&tmp_path, &target)?;

            let dir = File::open(&folder_dir)?;
            dir.sync_all()?;

            let mut perms = std::fs::metadata(&target)?.permissions();
            perms.set_mode(0o444);
            std::fs::set_permissions(&target, perms)?;
            Ok(())
        })();

        if write_result.is_err() && tmp_path.exists() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        write_result?;

        Ok(EmlWriteResult {
            path: target,
            sha256: expected_sha,
            size_bytes: raw_rfc822.len() as u64,
        })
    }
}

// Crash-safety and idempotent-rewrite behavior for write_immutable are
// covered in tests/evidence_store_crash_safety.rs.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_folder_sanitizes_path_separators() {
        assert_eq!(safe_folder("INBOX"), "INBOX");
        assert_eq!(safe_folder("Sent Items"), "Sent_Items");
        assert_eq!(safe_folder("a/b/c"), "a_b_c");
        assert_eq!(safe_folder("  ..weird//name.. "), "weird__name");
        assert_eq!(safe_folder(""), "folder");
        assert_eq!(safe_folder("///"), "folder");
    }
}
