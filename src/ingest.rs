//! Image discovery and inventory ingest.
//!
//! Discovery is one-shot per job and fully deterministic: the source
//! tree is walked, filtered by extension, sorted byte-wise on the
//! absolute path, and assigned a dense ordering index.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{ATOMIC_BATCH_SIZE, HASH_CHUNK_SIZE};
use crate::db::Database;

pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "arw"];

/// One inventory entry produced by discovery.
#[derive(Debug, Clone)]
pub struct DiscoveredImage {
    pub source_path: String,
    pub filename: String,
    pub extension: String,
    pub sha256: String,
    pub ordering_idx: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestSummary {
    pub image_count: i64,
    pub batch_count: i64,
    pub skipped_unreadable: usize,
}

pub fn is_supported_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            SUPPORTED_EXTENSIONS.iter().any(|s| *s == ext)
        })
        .unwrap_or(false)
}

/// Walk the source tree and return matching files in byte-wise path order.
pub fn discover_paths(source_root: &Path) -> Result<Vec<PathBuf>> {
    let root = std::path::absolute(source_root)?;
    let mut paths: Vec<PathBuf> = WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter(|e| is_supported_extension(e.path()))
        .map(|e| e.into_path())
        .collect();

    paths.sort_by(|a, b| a.as_os_str().as_encoded_bytes().cmp(b.as_os_str().as_encoded_bytes()));
    Ok(paths)
}

/// Streaming SHA-256 over the file contents.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Discover, hash, and catalog the source tree for a job, then
/// partition the inventory into batches.
pub fn run_ingest(db: &Database, job_id: i64, source_root: &Path) -> Result<IngestSummary> {
    let paths = discover_paths(source_root)?;
    tracing::info!(count = paths.len(), root = ?source_root, "discovered source images");

    let mut images = Vec::new();
    let mut skipped_unreadable = 0usize;
    let mut ordering_idx: i64 = 0;
    for path in paths {
        let sha256 = match compute_sha256(&path) {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "unreadable during ingest, skipping");
                skipped_unreadable += 1;
                continue;
            }
        };
        let filename = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|s| format!(".{}", s.to_string_lossy().to_lowercase()))
            .unwrap_or_default();

        images.push(DiscoveredImage {
            source_path: path.to_string_lossy().to_string(),
            filename,
            extension,
            sha256,
            ordering_idx,
        });
        ordering_idx += 1;

        // Chunked inserts keep transactions short on large corpora
        if images.len() >= 500 {
            db.insert_images(job_id, &images)?;
            images.clear();
        }
    }
    if !images.is_empty() {
        db.insert_images(job_id, &images)?;
    }

    let image_count = db.image_count(job_id)?;
    db.set_job_total_images(job_id, image_count)?;
    let batch_count = db.create_batches(job_id, ATOMIC_BATCH_SIZE)?;

    tracing::info!(image_count, batch_count, "ingest complete");
    Ok(IngestSummary {
        image_count,
        batch_count,
        skipped_unreadable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discovery_filters_and_sorts() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.JPG"), b"b").unwrap();
        fs::write(dir.path().join("a.jpeg"), b"a").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/c.ArW"), b"c").unwrap();

        let paths = discover_paths(dir.path()).unwrap();
        assert_eq!(paths.len(), 3);
        let names: Vec<String> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpeg", "b.JPG", "c.ArW"]);
    }

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.jpg");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            compute_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn ingest_assigns_dense_ordering_and_batches() {
        let dir = tempdir().unwrap();
        for i in 0..7 {
            fs::write(dir.path().join(format!("img_{i}.jpg")), format!("{i}")).unwrap();
        }

        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let job_id = db.create_job("/src", "/out").unwrap();
        let summary = run_ingest(&db, job_id, dir.path()).unwrap();

        assert_eq!(summary.image_count, 7);
        assert_eq!(summary.batch_count, 1);
        assert_eq!(summary.skipped_unreadable, 0);

        let batch = db.lease_next_batch(job_id).unwrap().unwrap();
        let images = db.images_for_batch(&batch).unwrap();
        let indices: Vec<i64> = images.iter().map(|i| i.ordering_idx).collect();
        assert_eq!(indices, (0..7).collect::<Vec<i64>>());
        assert!(images.iter().all(|i| i.extension == ".jpg"));
    }

    #[test]
    fn duplicate_bytes_get_distinct_indices_same_hash() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"same").unwrap();
        fs::write(dir.path().join("b.jpg"), b"same").unwrap();

        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let job_id = db.create_job("/src", "/out").unwrap();
        run_ingest(&db, job_id, dir.path()).unwrap();

        let batch = db.lease_next_batch(job_id).unwrap().unwrap();
        let images = db.images_for_batch(&batch).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].sha256, images[1].sha256);
        assert_ne!(images[0].ordering_idx, images[1].ordering_idx);
    }
}
