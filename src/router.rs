//! Fan-out routing: append-only copies from staging into per-person
//! (or group) output folders, driven by the commit log.
//!
//! Every row walks pending -> written -> verified. The copy itself is
//! temp-file + rename with an fsync of both the file and its
//! directory, so a destination path is only ever absent or complete.
//! Existing identical files are skipped; differing content is never
//! overwritten.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{COMMIT_RETRY_ATTEMPTS, COMMIT_RETRY_BACKOFF_SECS};
use crate::db::jobs::{CommitRow, CommitStatus};
use crate::db::Database;
use crate::ingest::compute_sha256;

/// Deterministic output filename: dense ordering index plus a hash
/// prefix, so re-runs and duplicate bytes stay collision-free.
pub fn output_filename(ordering_idx: i64, sha256: &str) -> String {
    format!("{:06}_{}.jpg", ordering_idx, &sha256[..12])
}

/// What reconciliation found on disk for one commit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEvidence {
    /// Destination file present and complete.
    Delivered,
    /// No destination, but the staged artifact exists to copy from.
    StagedOnly,
    /// Neither destination nor staged artifact.
    Missing,
}

pub struct Router {
    output_root: PathBuf,
}

impl Router {
    pub fn new(output_root: PathBuf) -> Self {
        Self { output_root }
    }

    pub fn destination(&self, target_folder: &str, filename: &str) -> PathBuf {
        self.output_root.join(target_folder).join(filename)
    }

    /// Drive one commit row to verified, advancing its status in the
    /// store after each durable step.
    pub fn deliver_row(&self, db: &Database, row: &CommitRow, staged: &Path) -> Result<()> {
        let dest = PathBuf::from(&row.output_path);

        if row.status == CommitStatus::Pending {
            with_retry(|| self.copy_staged(staged, &dest))
                .with_context(|| format!("copying to {}", dest.display()))?;
            db.advance_commit_status(row.commit_id, CommitStatus::Written)?;
        }

        with_retry(|| self.verify(&dest, Some(staged)))
            .with_context(|| format!("verifying {}", dest.display()))?;
        db.advance_commit_status(row.commit_id, CommitStatus::Verified)?;
        Ok(())
    }

    /// Append-only copy: identical destinations are accepted as already
    /// delivered, differing ones are a hard error.
    pub fn copy_staged(&self, staged: &Path, dest: &Path) -> Result<()> {
        if dest.exists() {
            if files_identical(staged, dest)? {
                return Ok(());
            }
            bail!(
                "destination {} exists with different content; refusing to overwrite",
                dest.display()
            );
        }

        let parent = dest
            .parent()
            .with_context(|| format!("destination {} has no parent", dest.display()))?;
        std::fs::create_dir_all(parent)?;

        let partial = partial_path(dest);
        // A crash may have left a stale partial behind; start clean
        if partial.exists() {
            std::fs::remove_file(&partial)?;
        }
        std::fs::copy(staged, &partial)?;
        let file = std::fs::File::open(&partial)?;
        file.sync_all()?;
        std::fs::rename(&partial, dest)?;
        fsync_dir(parent)?;
        Ok(())
    }

    /// Check a delivered file: present, non-empty, and matching the
    /// staged artifact when one is available to compare against.
    pub fn verify(&self, dest: &Path, staged: Option<&Path>) -> Result<()> {
        let metadata = std::fs::metadata(dest)
            .with_context(|| format!("destination missing: {}", dest.display()))?;
        if metadata.len() == 0 {
            bail!("destination is empty: {}", dest.display());
        }
        if let Some(staged) = staged {
            if staged.exists() && !files_identical(staged, dest)? {
                bail!(
                    "destination {} does not match its staged artifact",
                    dest.display()
                );
            }
        }
        Ok(())
    }

    /// Classify the on-disk evidence for a row during reconciliation.
    pub fn inspect_row(&self, row: &CommitRow, staged: &Path) -> RowEvidence {
        let dest = PathBuf::from(&row.output_path);
        let delivered = std::fs::metadata(&dest)
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if delivered {
            RowEvidence::Delivered
        } else if staged.exists() {
            RowEvidence::StagedOnly
        } else {
            RowEvidence::Missing
        }
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

fn fsync_dir(dir: &Path) -> Result<()> {
    // Directory fsync makes the rename itself durable
    let handle = std::fs::File::open(dir)?;
    handle.sync_all()?;
    Ok(())
}

pub fn files_identical(a: &Path, b: &Path) -> Result<bool> {
    let meta_a = std::fs::metadata(a)?;
    let meta_b = std::fs::metadata(b)?;
    if meta_a.len() != meta_b.len() {
        return Ok(false);
    }
    Ok(compute_sha256(a)? == compute_sha256(b)?)
}

/// Retry transient I/O a fixed number of times with a flat backoff.
pub fn with_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "commit write attempt failed");
                if attempt >= COMMIT_RETRY_ATTEMPTS {
                    return Err(e);
                }
                attempt += 1;
                std::thread::sleep(std::time::Duration::from_secs(COMMIT_RETRY_BACKOFF_SECS));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn filename_is_pure_function_of_idx_and_hash() {
        let sha = "abcdef0123456789".repeat(4);
        assert_eq!(output_filename(42, &sha), "000042_abcdef012345.jpg");
        assert_eq!(output_filename(0, &sha), "000000_abcdef012345.jpg");
        // Stable across calls
        assert_eq!(output_filename(42, &sha), output_filename(42, &sha));
    }

    #[test]
    fn copy_creates_folder_and_skips_identical() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("staged.jpg");
        std::fs::write(&staged, b"artifact-bytes").unwrap();

        let router = Router::new(dir.path().join("out"));
        let dest = router.destination("Alice", "000001_abc.jpg");

        router.copy_staged(&staged, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"artifact-bytes");

        // Second copy of identical content is a no-op
        router.copy_staged(&staged, &dest).unwrap();
    }

    #[test]
    fn differing_destination_is_never_overwritten() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("staged.jpg");
        std::fs::write(&staged, b"new-bytes").unwrap();

        let router = Router::new(dir.path().join("out"));
        let dest = router.destination("Alice", "000001_abc.jpg");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, b"old-bytes").unwrap();

        assert!(router.copy_staged(&staged, &dest).is_err());
        assert_eq!(std::fs::read(&dest).unwrap(), b"old-bytes");
    }

    #[test]
    fn verify_rejects_missing_and_empty() {
        let dir = tempdir().unwrap();
        let router = Router::new(dir.path().to_path_buf());

        let missing = dir.path().join("gone.jpg");
        assert!(router.verify(&missing, None).is_err());

        let empty = dir.path().join("empty.jpg");
        std::fs::write(&empty, b"").unwrap();
        assert!(router.verify(&empty, None).is_err());

        let good = dir.path().join("good.jpg");
        std::fs::write(&good, b"data").unwrap();
        router.verify(&good, None).unwrap();
    }

    #[test]
    fn no_partial_file_remains_after_copy() {
        let dir = tempdir().unwrap();
        let staged = dir.path().join("staged.jpg");
        std::fs::write(&staged, b"bytes").unwrap();

        let router = Router::new(dir.path().join("out"));
        let dest = router.destination("Bob", "000002_def.jpg");
        router.copy_staged(&staged, &dest).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
