//! Person registry: persons, bounded embedding sets, derived centroids.
//!
//! Every mutation runs in one transaction that inserts the embedding,
//! applies FIFO trimming (never evicting the last reference seed), and
//! recomputes the centroid, so the matcher always sees a coherent pair.

use anyhow::{anyhow, bail, Result};

use super::{bytes_to_embedding, embedding_to_bytes, Database};
use crate::config::MAX_EMBEDDINGS_PER_PERSON;

/// A registered identity.
#[derive(Debug, Clone)]
pub struct Person {
    pub person_id: i64,
    pub display_name: String,
    pub output_folder_rel: String,
    pub embedding_count: i64,
}

/// Snapshot row the matcher scores against.
#[derive(Debug, Clone)]
pub struct CentroidEntry {
    pub person_id: i64,
    pub display_name: String,
    pub output_folder_rel: String,
    pub centroid: Vec<f32>,
}

/// L2-normalise a vector; zero vectors pass through unchanged.
pub fn normalize_embedding(embedding: &[f32]) -> Vec<f32> {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        embedding.iter().map(|x| x / norm).collect()
    } else {
        embedding.to_vec()
    }
}

/// Output folders are single path components under output_root.
fn validate_folder_rel(folder_rel: &str) -> Result<()> {
    if folder_rel.is_empty() {
        bail!("output folder name must not be empty");
    }
    if folder_rel == "." || folder_rel == ".." {
        bail!("output folder name must not be a relative traversal");
    }
    if folder_rel.contains('/') || folder_rel.contains('\\') {
        bail!("output folder name must be a single path component: {folder_rel}");
    }
    Ok(())
}

impl Database {
    /// Register a person, seeded with one reference embedding.
    pub fn add_person(
        &self,
        display_name: &str,
        output_folder_rel: &str,
        reference: &[f32],
    ) -> Result<i64> {
        validate_folder_rel(output_folder_rel)?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO persons (display_name, output_folder_rel) VALUES (?, ?)",
            rusqlite::params![display_name, output_folder_rel],
        )?;
        let person_id = tx.last_insert_rowid();
        insert_embedding_tx(&tx, person_id, reference, "reference")?;
        tx.commit()?;
        Ok(person_id)
    }

    /// Add a further curated reference embedding to a person.
    pub fn add_reference(&self, person_id: i64, embedding: &[f32]) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        let embedding_id = insert_embedding_tx(&tx, person_id, embedding, "reference")?;
        tx.commit()?;
        Ok(embedding_id)
    }

    /// Record a learned embedding from a STRICT match.
    pub fn learn(&self, person_id: i64, embedding: &[f32]) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        let embedding_id = insert_embedding_tx(&tx, person_id, embedding, "learned")?;
        tx.commit()?;
        Ok(embedding_id)
    }

    pub fn get_person(&self, person_id: i64) -> Result<Option<Person>> {
        let result = self.conn.query_row(
            r#"
            SELECT p.person_id, p.display_name, p.output_folder_rel,
                   COUNT(pe.embedding_id)
            FROM persons p
            LEFT JOIN person_embeddings pe ON pe.person_id = p.person_id
            WHERE p.person_id = ?
            GROUP BY p.person_id
            "#,
            [person_id],
            |row| {
                Ok(Person {
                    person_id: row.get(0)?,
                    display_name: row.get(1)?,
                    output_folder_rel: row.get(2)?,
                    embedding_count: row.get(3)?,
                })
            },
        );
        match result {
            Ok(person) => Ok(Some(person)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_persons(&self) -> Result<Vec<Person>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT p.person_id, p.display_name, p.output_folder_rel,
                   COUNT(pe.embedding_id)
            FROM persons p
            LEFT JOIN person_embeddings pe ON pe.person_id = p.person_id
            GROUP BY p.person_id
            ORDER BY p.display_name
            "#,
        )?;
        let persons = stmt
            .query_map([], |row| {
                Ok(Person {
                    person_id: row.get(0)?,
                    display_name: row.get(1)?,
                    output_folder_rel: row.get(2)?,
                    embedding_count: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(persons)
    }

    /// Delete a person. Refused while any commit-log row references them,
    /// since that would orphan delivered output files.
    pub fn delete_person(&self, person_id: i64) -> Result<()> {
        let references: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM commit_log WHERE person_id = ?",
            [person_id],
            |row| row.get(0),
        )?;
        if references > 0 {
            bail!("person {person_id} has {references} committed output(s) and cannot be deleted");
        }
        let deleted = self
            .conn
            .execute("DELETE FROM persons WHERE person_id = ?", [person_id])?;
        if deleted == 0 {
            bail!("person {person_id} not found");
        }
        Ok(())
    }

    /// Load centroids for matching, optionally restricted to a selection.
    pub fn load_centroids(&self, selected: Option<&[i64]>) -> Result<Vec<CentroidEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT p.person_id, p.display_name, p.output_folder_rel, pc.centroid
            FROM persons p
            INNER JOIN person_centroids pc ON pc.person_id = p.person_id
            ORDER BY p.person_id
            "#,
        )?;
        let entries: Vec<CentroidEntry> = stmt
            .query_map([], |row| {
                let blob: Vec<u8> = row.get(3)?;
                Ok(CentroidEntry {
                    person_id: row.get(0)?,
                    display_name: row.get(1)?,
                    output_folder_rel: row.get(2)?,
                    centroid: bytes_to_embedding(&blob),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(match selected {
            Some(ids) => entries
                .into_iter()
                .filter(|e| ids.contains(&e.person_id))
                .collect(),
            None => entries,
        })
    }

    pub fn get_centroid(&self, person_id: i64) -> Result<Option<(Vec<f32>, i64)>> {
        let result = self.conn.query_row(
            "SELECT centroid, embedding_count FROM person_centroids WHERE person_id = ?",
            [person_id],
            |row| {
                let blob: Vec<u8> = row.get(0)?;
                Ok((bytes_to_embedding(&blob), row.get::<_, i64>(1)?))
            },
        );
        match result {
            Ok(pair) => Ok(Some(pair)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(test)]
    pub fn embeddings_for_person(&self, person_id: i64) -> Result<Vec<(String, Vec<f32>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_type, embedding FROM person_embeddings
             WHERE person_id = ? ORDER BY embedding_id",
        )?;
        let rows = stmt
            .query_map([person_id], |row| {
                let blob: Vec<u8> = row.get(1)?;
                Ok((row.get::<_, String>(0)?, bytes_to_embedding(&blob)))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

/// Insert an embedding, trim to the cap, recompute the centroid.
/// Runs inside the caller's transaction.
fn insert_embedding_tx(
    tx: &rusqlite::Transaction<'_>,
    person_id: i64,
    embedding: &[f32],
    source_type: &str,
) -> Result<i64> {
    let exists: bool = tx
        .query_row("SELECT 1 FROM persons WHERE person_id = ?", [person_id], |_| Ok(true))
        .unwrap_or(false);
    if !exists {
        bail!("person {person_id} not found");
    }

    let normalized = normalize_embedding(embedding);
    tx.execute(
        "INSERT INTO person_embeddings (person_id, embedding, source_type) VALUES (?, ?, ?)",
        rusqlite::params![person_id, embedding_to_bytes(&normalized), source_type],
    )?;
    let embedding_id = tx.last_insert_rowid();

    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM person_embeddings WHERE person_id = ?",
        [person_id],
        |row| row.get(0),
    )?;
    let excess = count - MAX_EMBEDDINGS_PER_PERSON as i64;
    if excess > 0 {
        // Only learned entries are eligible for eviction; references
        // stay for the life of the person.
        tx.execute(
            r#"
            DELETE FROM person_embeddings
            WHERE embedding_id IN (
                SELECT embedding_id FROM person_embeddings
                WHERE person_id = ? AND source_type = 'learned'
                ORDER BY embedding_id ASC
                LIMIT ?
            )
            "#,
            rusqlite::params![person_id, excess],
        )?;
    }

    update_centroid_tx(tx, person_id)?;
    tx.execute(
        "UPDATE persons SET updated_at = CURRENT_TIMESTAMP WHERE person_id = ?",
        [person_id],
    )?;
    Ok(embedding_id)
}

/// Recompute the unit-norm mean centroid from current embeddings.
fn update_centroid_tx(tx: &rusqlite::Transaction<'_>, person_id: i64) -> Result<()> {
    let mut stmt = tx.prepare(
        "SELECT embedding FROM person_embeddings WHERE person_id = ? ORDER BY embedding_id",
    )?;
    let embeddings: Vec<Vec<f32>> = stmt
        .query_map([person_id], |row| {
            let blob: Vec<u8> = row.get(0)?;
            Ok(bytes_to_embedding(&blob))
        })?
        .filter_map(|r| r.ok())
        .collect();

    if embeddings.is_empty() {
        tx.execute("DELETE FROM person_centroids WHERE person_id = ?", [person_id])?;
        return Ok(());
    }

    let dim = embeddings[0].len();
    let mut mean = vec![0.0f32; dim];
    for emb in &embeddings {
        if emb.len() != dim {
            return Err(anyhow!(
                "embedding dimension mismatch for person {person_id}: {} vs {dim}",
                emb.len()
            ));
        }
        for (acc, v) in mean.iter_mut().zip(emb) {
            *acc += v;
        }
    }
    let n = embeddings.len() as f32;
    for acc in mean.iter_mut() {
        *acc /= n;
    }

    let norm: f32 = mean.iter().map(|x| x * x).sum::<f32>().sqrt();
    let centroid = if norm < 1e-12 {
        // Degenerate mean: fall back to the most recent embedding
        embeddings.last().unwrap().clone()
    } else {
        mean.iter().map(|x| x / norm).collect()
    };

    tx.execute(
        r#"
        INSERT INTO person_centroids (person_id, centroid, embedding_count, updated_at)
        VALUES (?, ?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(person_id) DO UPDATE SET
            centroid = excluded.centroid,
            embedding_count = excluded.embedding_count,
            updated_at = CURRENT_TIMESTAMP
        "#,
        rusqlite::params![person_id, embedding_to_bytes(&centroid), embeddings.len() as i64],
    )?;
    Ok(())
}
