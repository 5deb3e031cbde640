//! SQLite-backed transactional store: the single source of truth
//! shared between the worker and the control plane.

mod schema;

pub mod jobs;
pub mod registry;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;

pub use schema::SCHEMA;

pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // journal_mode returns the resulting mode as a row
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Concurrent control-plane writers back off instead of erroring
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn })
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

// ============================================================================
// Embedding blob codecs
// ============================================================================

/// Serialize an f32 vector as little-endian bytes for BLOB storage.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Deserialize a BLOB back to an f32 vector.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap();
            f32::from_le_bytes(arr)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_roundtrip() {
        let v = vec![0.25f32, -1.0, 3.5];
        assert_eq!(bytes_to_embedding(&embedding_to_bytes(&v)), v);
    }

    #[test]
    fn schema_applies_cleanly() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        // Re-running must be a no-op (IF NOT EXISTS everywhere)
        db.initialize().unwrap();
    }
}
