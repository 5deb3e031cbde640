//! Job store: singleton config, jobs, image inventory, batches,
//! image results, and the commit log.

use anyhow::{bail, Result};
use std::path::PathBuf;

use super::Database;
use crate::ingest::DiscoveredImage;

/// Batch state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Processing,
    Committing,
    Committed,
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "PENDING",
            BatchState::Processing => "PROCESSING",
            BatchState::Committing => "COMMITTING",
            BatchState::Committed => "COMMITTED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "PENDING" => BatchState::Pending,
            "PROCESSING" => BatchState::Processing,
            "COMMITTING" => BatchState::Committing,
            "COMMITTED" => BatchState::Committed,
            other => bail!("unknown batch state: {other}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Stopped => "stopped",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "created" => JobStatus::Created,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "stopped" => JobStatus::Stopped,
            "failed" => JobStatus::Failed,
            other => bail!("unknown job status: {other}"),
        })
    }
}

/// Control signal written by the operator, polled at safe points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Stop,
    Terminate,
}

impl Control {
    pub fn as_str(&self) -> &'static str {
        match self {
            Control::Run => "run",
            Control::Stop => "stop",
            Control::Terminate => "terminate",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "run" => Control::Run,
            "stop" => Control::Stop,
            "terminate" => Control::Terminate,
            other => bail!("unknown control signal: {other}"),
        })
    }
}

/// Commit-log row status. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommitStatus {
    Pending,
    Written,
    Verified,
    Failed,
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatus::Pending => "pending",
            CommitStatus::Written => "written",
            CommitStatus::Verified => "verified",
            CommitStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => CommitStatus::Pending,
            "written" => CommitStatus::Written,
            "verified" => CommitStatus::Verified,
            "failed" => CommitStatus::Failed,
            other => bail!("unknown commit status: {other}"),
        })
    }
}

/// The singleton configuration row shared with the control plane.
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    pub source_root: Option<PathBuf>,
    pub output_root: Option<PathBuf>,
    pub selected_person_ids: Option<Vec<i64>>,
    pub group_mode: bool,
    pub group_folder_name: Option<String>,
    pub control: Option<Control>,
}

impl JobConfig {
    pub fn is_complete(&self) -> bool {
        self.source_root.is_some() && self.output_root.is_some()
    }

    /// Group mode needs at least two selected persons and a folder name.
    pub fn validate(&self) -> Result<()> {
        if self.group_mode {
            let selected = self.selected_person_ids.as_deref().unwrap_or(&[]);
            if selected.len() < 2 {
                bail!("group mode requires at least two selected persons");
            }
            match self.group_folder_name.as_deref() {
                Some(name) if !name.is_empty() => {}
                _ => bail!("group mode requires a group folder name"),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: i64,
    pub source_root: String,
    pub output_root: String,
    pub total_images: i64,
    pub processed_images: i64,
    pub status: JobStatus,
}

#[derive(Debug, Clone)]
pub struct ImageRow {
    pub image_id: i64,
    pub job_id: i64,
    pub source_path: String,
    pub filename: String,
    pub extension: String,
    pub sha256: String,
    pub ordering_idx: i64,
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_id: i64,
    pub job_id: i64,
    pub start_idx: i64,
    pub end_idx: i64,
    pub state: BatchState,
}

impl Batch {
    pub fn width(&self) -> i64 {
        self.end_idx - self.start_idx + 1
    }
}

/// An image result joined with its inventory row, as needed for commit.
#[derive(Debug, Clone)]
pub struct ImageResultRow {
    pub image_id: i64,
    pub batch_id: i64,
    pub face_count: i64,
    pub matched_count: i64,
    pub unknown_count: i64,
    pub matched_person_ids: Vec<i64>,
    pub source_path: String,
    pub filename: String,
    pub extension: String,
    pub sha256: String,
    pub ordering_idx: i64,
}

#[derive(Debug, Clone)]
pub struct CommitRow {
    pub commit_id: i64,
    pub batch_id: i64,
    pub image_id: i64,
    pub person_id: Option<i64>,
    pub target_folder: String,
    pub output_filename: String,
    pub output_path: String,
    pub status: CommitStatus,
}

/// A fan-out target computed during the COMMITTING transition.
#[derive(Debug, Clone)]
pub struct NewCommitRow {
    pub image_id: i64,
    pub person_id: Option<i64>,
    pub target_folder: String,
    pub output_filename: String,
    pub output_path: String,
}

fn row_to_batch(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, i64, i64, i64, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

impl Database {
    // ========================================================================
    // Job configuration + control
    // ========================================================================

    pub fn get_job_config(&self) -> Result<JobConfig> {
        let (source, output, selected, group_mode, group_name, control): (
            Option<String>,
            Option<String>,
            Option<String>,
            i64,
            Option<String>,
            String,
        ) = self.conn.query_row(
            "SELECT source_root, output_root, selected_person_ids,
                    group_mode, group_folder_name, control
             FROM job_config WHERE config_id = 1",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )?;

        let selected_person_ids = match selected {
            Some(json) => Some(serde_json::from_str::<Vec<i64>>(&json)?),
            None => None,
        };

        Ok(JobConfig {
            source_root: source.map(PathBuf::from),
            output_root: output.map(PathBuf::from),
            selected_person_ids,
            group_mode: group_mode != 0,
            group_folder_name: group_name,
            control: Some(Control::parse(&control)?),
        })
    }

    pub fn save_job_config(&self, config: &JobConfig) -> Result<()> {
        let selected_json = config
            .selected_person_ids
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            "UPDATE job_config
             SET source_root = ?, output_root = ?, selected_person_ids = ?,
                 group_mode = ?, group_folder_name = ?,
                 updated_at = CURRENT_TIMESTAMP
             WHERE config_id = 1",
            rusqlite::params![
                config.source_root.as_ref().map(|p| p.to_string_lossy().to_string()),
                config.output_root.as_ref().map(|p| p.to_string_lossy().to_string()),
                selected_json,
                config.group_mode as i64,
                config.group_folder_name,
            ],
        )?;
        Ok(())
    }

    pub fn get_control(&self) -> Result<Control> {
        let control: String = self.conn.query_row(
            "SELECT control FROM job_config WHERE config_id = 1",
            [],
            |row| row.get(0),
        )?;
        Control::parse(&control)
    }

    pub fn set_control(&self, control: Control) -> Result<()> {
        self.conn.execute(
            "UPDATE job_config SET control = ?, updated_at = CURRENT_TIMESTAMP
             WHERE config_id = 1",
            [control.as_str()],
        )?;
        Ok(())
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub fn create_job(&self, source_root: &str, output_root: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO jobs (source_root, output_root) VALUES (?, ?)",
            rusqlite::params![source_root, output_root],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<Job>> {
        let result = self.conn.query_row(
            "SELECT job_id, source_root, output_root, total_images, processed_images, status
             FROM jobs WHERE job_id = ?",
            [job_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        );
        match result {
            Ok((job_id, source_root, output_root, total, processed, status)) => Ok(Some(Job {
                job_id,
                source_root,
                output_root,
                total_images: total,
                processed_images: processed,
                status: JobStatus::parse(&status)?,
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Most recent job regardless of status.
    pub fn latest_job(&self) -> Result<Option<Job>> {
        let result = self.conn.query_row(
            "SELECT job_id FROM jobs ORDER BY job_id DESC LIMIT 1",
            [],
            |row| row.get::<_, i64>(0),
        );
        match result {
            Ok(job_id) => self.get_job(job_id),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_job_status(&self, job_id: i64, status: JobStatus) -> Result<()> {
        match status {
            JobStatus::Running => self.conn.execute(
                "UPDATE jobs SET status = ?, started_at = COALESCE(started_at, CURRENT_TIMESTAMP)
                 WHERE job_id = ?",
                rusqlite::params![status.as_str(), job_id],
            )?,
            JobStatus::Completed => self.conn.execute(
                "UPDATE jobs SET status = ?, completed_at = CURRENT_TIMESTAMP WHERE job_id = ?",
                rusqlite::params![status.as_str(), job_id],
            )?,
            _ => self.conn.execute(
                "UPDATE jobs SET status = ? WHERE job_id = ?",
                rusqlite::params![status.as_str(), job_id],
            )?,
        };
        Ok(())
    }

    pub fn set_job_total_images(&self, job_id: i64, total: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET total_images = ? WHERE job_id = ?",
            rusqlite::params![total, job_id],
        )?;
        Ok(())
    }

    /// Delete all rows of previous jobs. Used when a fresh job replaces a
    /// finished or reconfigured one; cascades through images, batches,
    /// results, and commit rows.
    pub fn clear_job_data(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM jobs", [])?;
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // Images
    // ========================================================================

    /// Insert discovered images, skipping paths already ingested for
    /// this job.
    pub fn insert_images(&self, job_id: i64, images: &[DiscoveredImage]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO images
                 (job_id, source_path, filename, extension, sha256, ordering_idx)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for img in images {
                stmt.execute(rusqlite::params![
                    job_id,
                    img.source_path,
                    img.filename,
                    img.extension,
                    img.sha256,
                    img.ordering_idx,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn image_count(&self, job_id: i64) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM images WHERE job_id = ?",
            [job_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn images_for_batch(&self, batch: &Batch) -> Result<Vec<ImageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT image_id, job_id, source_path, filename, extension, sha256, ordering_idx
             FROM images
             WHERE job_id = ? AND ordering_idx >= ? AND ordering_idx <= ?
             ORDER BY ordering_idx",
        )?;
        let images = stmt
            .query_map(
                rusqlite::params![batch.job_id, batch.start_idx, batch.end_idx],
                |row| {
                    Ok(ImageRow {
                        image_id: row.get(0)?,
                        job_id: row.get(1)?,
                        source_path: row.get(2)?,
                        filename: row.get(3)?,
                        extension: row.get(4)?,
                        sha256: row.get(5)?,
                        ordering_idx: row.get(6)?,
                    })
                },
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(images)
    }

    // ========================================================================
    // Batches
    // ========================================================================

    /// Partition the job's inventory into fixed-width batches.
    pub fn create_batches(&self, job_id: i64, batch_size: i64) -> Result<i64> {
        let max_idx: Option<i64> = self.conn.query_row(
            "SELECT MAX(ordering_idx) FROM images WHERE job_id = ?",
            [job_id],
            |row| row.get(0),
        )?;
        let Some(max_idx) = max_idx else {
            return Ok(0);
        };

        let tx = self.conn.unchecked_transaction()?;
        let mut batch_count = 0;
        let mut start_idx = 0;
        while start_idx <= max_idx {
            let end_idx = (start_idx + batch_size - 1).min(max_idx);
            tx.execute(
                "INSERT INTO batches (job_id, start_idx, end_idx) VALUES (?, ?, ?)",
                rusqlite::params![job_id, start_idx, end_idx],
            )?;
            batch_count += 1;
            start_idx = end_idx + 1;
        }
        tx.commit()?;
        Ok(batch_count)
    }

    /// Lease the next PENDING batch: flip it to PROCESSING and stamp
    /// started_at in one transaction.
    pub fn lease_next_batch(&self, job_id: i64) -> Result<Option<Batch>> {
        let tx = self.conn.unchecked_transaction()?;
        let result = tx.query_row(
            "SELECT batch_id, job_id, start_idx, end_idx, state
             FROM batches WHERE job_id = ? AND state = 'PENDING'
             ORDER BY batch_id LIMIT 1",
            [job_id],
            row_to_batch,
        );
        let (batch_id, job_id, start_idx, end_idx, _) = match result {
            Ok(tuple) => tuple,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        tx.execute(
            "UPDATE batches SET state = 'PROCESSING', started_at = CURRENT_TIMESTAMP
             WHERE batch_id = ?",
            [batch_id],
        )?;
        tx.commit()?;
        Ok(Some(Batch {
            batch_id,
            job_id,
            start_idx,
            end_idx,
            state: BatchState::Processing,
        }))
    }

    pub fn get_batch(&self, batch_id: i64) -> Result<Option<Batch>> {
        let result = self.conn.query_row(
            "SELECT batch_id, job_id, start_idx, end_idx, state FROM batches WHERE batch_id = ?",
            [batch_id],
            row_to_batch,
        );
        match result {
            Ok((batch_id, job_id, start_idx, end_idx, state)) => Ok(Some(Batch {
                batch_id,
                job_id,
                start_idx,
                end_idx,
                state: BatchState::parse(&state)?,
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn batches_by_state(&self, state: BatchState) -> Result<Vec<Batch>> {
        let mut stmt = self.conn.prepare(
            "SELECT batch_id, job_id, start_idx, end_idx, state
             FROM batches WHERE state = ? ORDER BY batch_id",
        )?;
        let batches = stmt
            .query_map([state.as_str()], row_to_batch)?
            .filter_map(|r| r.ok())
            .map(|(batch_id, job_id, start_idx, end_idx, _)| Batch {
                batch_id,
                job_id,
                start_idx,
                end_idx,
                state,
            })
            .collect();
        Ok(batches)
    }

    /// Reset an interrupted PROCESSING batch: drop its image results
    /// and put it back in line.
    pub fn reset_batch_to_pending(&self, batch_id: i64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM image_results WHERE batch_id = ?", [batch_id])?;
        tx.execute(
            "UPDATE batches SET state = 'PENDING', started_at = NULL WHERE batch_id = ?",
            [batch_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Count of batches that still need work for a job.
    pub fn unfinished_batch_count(&self, job_id: i64) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM batches WHERE job_id = ? AND state != 'COMMITTED'",
            [job_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========================================================================
    // Image results
    // ========================================================================

    pub fn upsert_image_result(
        &self,
        image_id: i64,
        batch_id: i64,
        face_count: i64,
        matched_count: i64,
        unknown_count: i64,
        matched_person_ids: &[i64],
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO image_results
             (image_id, batch_id, face_count, matched_count, unknown_count, matched_person_ids)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(image_id) DO UPDATE SET
                 batch_id = excluded.batch_id,
                 face_count = excluded.face_count,
                 matched_count = excluded.matched_count,
                 unknown_count = excluded.unknown_count,
                 matched_person_ids = excluded.matched_person_ids,
                 processed_at = CURRENT_TIMESTAMP",
            rusqlite::params![
                image_id,
                batch_id,
                face_count,
                matched_count,
                unknown_count,
                serde_json::to_string(matched_person_ids)?,
            ],
        )?;
        Ok(())
    }

    pub fn results_for_batch(&self, batch_id: i64) -> Result<Vec<ImageResultRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT ir.image_id, ir.batch_id, ir.face_count, ir.matched_count,
                    ir.unknown_count, ir.matched_person_ids,
                    i.source_path, i.filename, i.extension, i.sha256, i.ordering_idx
             FROM image_results ir
             INNER JOIN images i ON i.image_id = ir.image_id
             WHERE ir.batch_id = ?
             ORDER BY i.ordering_idx",
        )?;
        let rows: Vec<rusqlite::Result<(ImageResultRow, String)>> = stmt
            .query_map([batch_id], |row| {
                Ok((
                    ImageResultRow {
                        image_id: row.get(0)?,
                        batch_id: row.get(1)?,
                        face_count: row.get(2)?,
                        matched_count: row.get(3)?,
                        unknown_count: row.get(4)?,
                        matched_person_ids: Vec::new(),
                        source_path: row.get(6)?,
                        filename: row.get(7)?,
                        extension: row.get(8)?,
                        sha256: row.get(9)?,
                        ordering_idx: row.get(10)?,
                    },
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect();

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let (mut result, ids_json) = row?;
            result.matched_person_ids = serde_json::from_str(&ids_json)?;
            results.push(result);
        }
        Ok(results)
    }

    // ========================================================================
    // Commit log
    // ========================================================================

    /// Flip a batch to COMMITTING and insert its pending commit rows in
    /// the same transaction, so a crash can never observe one without
    /// the other. Existing rows are reused (idempotent resume).
    pub fn begin_committing(&self, batch_id: i64, rows: &[NewCommitRow]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE batches SET state = 'COMMITTING' WHERE batch_id = ?",
            [batch_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO commit_log
                 (batch_id, image_id, person_id, target_folder, output_filename, output_path)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for row in rows {
                stmt.execute(rusqlite::params![
                    batch_id,
                    row.image_id,
                    row.person_id,
                    row.target_folder,
                    row.output_filename,
                    row.output_path,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn commit_rows_for_batch(&self, batch_id: i64) -> Result<Vec<CommitRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT commit_id, batch_id, image_id, person_id, target_folder,
                    output_filename, output_path, status
             FROM commit_log WHERE batch_id = ? ORDER BY commit_id",
        )?;
        let rows: Vec<rusqlite::Result<(CommitRow, String)>> = stmt
            .query_map([batch_id], |row| {
                Ok((
                    CommitRow {
                        commit_id: row.get(0)?,
                        batch_id: row.get(1)?,
                        image_id: row.get(2)?,
                        person_id: row.get(3)?,
                        target_folder: row.get(4)?,
                        output_filename: row.get(5)?,
                        output_path: row.get(6)?,
                        status: CommitStatus::Pending,
                    },
                    row.get::<_, String>(7)?,
                ))
            })?
            .collect();

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let (mut commit_row, status) = row?;
            commit_row.status = CommitStatus::parse(&status)?;
            out.push(commit_row);
        }
        Ok(out)
    }

    /// Set a row's status. Verified is terminal and can never be
    /// reclassified; unverified rows may be reclassified by
    /// reconciliation.
    pub fn advance_commit_status(&self, commit_id: i64, status: CommitStatus) -> Result<()> {
        let current: String = self.conn.query_row(
            "SELECT status FROM commit_log WHERE commit_id = ?",
            [commit_id],
            |row| row.get(0),
        )?;
        let current = CommitStatus::parse(&current)?;
        if current == CommitStatus::Verified {
            if status != CommitStatus::Verified {
                bail!("commit row {commit_id} is verified and cannot be reclassified");
            }
            return Ok(());
        }

        if status == CommitStatus::Verified {
            self.conn.execute(
                "UPDATE commit_log SET status = 'verified', verified_at = CURRENT_TIMESTAMP
                 WHERE commit_id = ?",
                [commit_id],
            )?;
        } else {
            self.conn.execute(
                "UPDATE commit_log SET status = ? WHERE commit_id = ?",
                rusqlite::params![status.as_str(), commit_id],
            )?;
        }
        Ok(())
    }

    /// Mark a batch COMMITTED and bump the job's processed counter in
    /// one transaction.
    pub fn complete_batch(&self, batch: &Batch) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE batches SET state = 'COMMITTED', committed_at = CURRENT_TIMESTAMP
             WHERE batch_id = ?",
            [batch.batch_id],
        )?;
        tx.execute(
            "UPDATE jobs SET processed_images = processed_images + ? WHERE job_id = ?",
            rusqlite::params![batch.width(), batch.job_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::DiscoveredImage;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn seed_images(db: &Database, job_id: i64, count: usize) {
        let images: Vec<DiscoveredImage> = (0..count)
            .map(|i| DiscoveredImage {
                source_path: format!("/src/img_{i:04}.jpg"),
                filename: format!("img_{i:04}.jpg"),
                extension: ".jpg".into(),
                sha256: format!("{i:064x}"),
                ordering_idx: i as i64,
            })
            .collect();
        db.insert_images(job_id, &images).unwrap();
    }

    #[test]
    fn config_roundtrip_with_selection() {
        let db = test_db();
        let config = JobConfig {
            source_root: Some("/src".into()),
            output_root: Some("/out".into()),
            selected_person_ids: Some(vec![3, 7]),
            group_mode: true,
            group_folder_name: Some("TeamPhoto".into()),
            control: None,
        };
        db.save_job_config(&config).unwrap();

        let loaded = db.get_job_config().unwrap();
        assert_eq!(loaded.selected_person_ids, Some(vec![3, 7]));
        assert!(loaded.group_mode);
        assert_eq!(loaded.group_folder_name.as_deref(), Some("TeamPhoto"));
        assert_eq!(loaded.control, Some(Control::Run));
    }

    #[test]
    fn group_mode_validation() {
        let mut config = JobConfig {
            group_mode: true,
            group_folder_name: Some("Team".into()),
            selected_person_ids: Some(vec![1]),
            ..JobConfig::default()
        };
        assert!(config.validate().is_err());
        config.selected_person_ids = Some(vec![1, 2]);
        assert!(config.validate().is_ok());
        config.group_folder_name = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn batches_partition_without_gaps() {
        let db = test_db();
        let job_id = db.create_job("/src", "/out").unwrap();
        seed_images(&db, job_id, 120);

        let count = db.create_batches(job_id, 50).unwrap();
        assert_eq!(count, 3);

        let pending = db.batches_by_state(BatchState::Pending).unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!((pending[0].start_idx, pending[0].end_idx), (0, 49));
        assert_eq!((pending[1].start_idx, pending[1].end_idx), (50, 99));
        assert_eq!((pending[2].start_idx, pending[2].end_idx), (100, 119));
        assert_eq!(pending[2].width(), 20);
    }

    #[test]
    fn lease_takes_lowest_pending_batch() {
        let db = test_db();
        let job_id = db.create_job("/src", "/out").unwrap();
        seed_images(&db, job_id, 100);
        db.create_batches(job_id, 50).unwrap();

        let first = db.lease_next_batch(job_id).unwrap().unwrap();
        assert_eq!(first.start_idx, 0);
        assert_eq!(first.state, BatchState::Processing);

        let second = db.lease_next_batch(job_id).unwrap().unwrap();
        assert_eq!(second.start_idx, 50);
        assert!(db.lease_next_batch(job_id).unwrap().is_none());
    }

    #[test]
    fn reset_clears_image_results() {
        let db = test_db();
        let job_id = db.create_job("/src", "/out").unwrap();
        seed_images(&db, job_id, 10);
        db.create_batches(job_id, 50).unwrap();
        let batch = db.lease_next_batch(job_id).unwrap().unwrap();
        let images = db.images_for_batch(&batch).unwrap();
        db.upsert_image_result(images[0].image_id, batch.batch_id, 2, 1, 1, &[1])
            .unwrap();

        db.reset_batch_to_pending(batch.batch_id).unwrap();
        assert!(db.results_for_batch(batch.batch_id).unwrap().is_empty());
        let reloaded = db.get_batch(batch.batch_id).unwrap().unwrap();
        assert_eq!(reloaded.state, BatchState::Pending);
    }

    #[test]
    fn commit_rows_are_idempotent_and_monotonic() {
        let db = test_db();
        let job_id = db.create_job("/src", "/out").unwrap();
        seed_images(&db, job_id, 1);
        db.create_batches(job_id, 50).unwrap();
        let batch = db.lease_next_batch(job_id).unwrap().unwrap();
        let image = &db.images_for_batch(&batch).unwrap()[0];
        let person = db
            .add_person("Alice", "Alice", &[1.0, 0.0, 0.0, 0.0])
            .unwrap();

        let new_row = NewCommitRow {
            image_id: image.image_id,
            person_id: Some(person),
            target_folder: "Alice".into(),
            output_filename: "000000_abc.jpg".into(),
            output_path: "/out/Alice/000000_abc.jpg".into(),
        };
        db.begin_committing(batch.batch_id, &[new_row.clone()]).unwrap();
        // Re-entering COMMITTING reuses the existing row
        db.begin_committing(batch.batch_id, &[new_row]).unwrap();

        let rows = db.commit_rows_for_batch(batch.batch_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, CommitStatus::Pending);

        db.advance_commit_status(rows[0].commit_id, CommitStatus::Written)
            .unwrap();
        db.advance_commit_status(rows[0].commit_id, CommitStatus::Verified)
            .unwrap();
        // A verified row can never be reclassified
        assert!(db
            .advance_commit_status(rows[0].commit_id, CommitStatus::Failed)
            .is_err());
        let rows = db.commit_rows_for_batch(batch.batch_id).unwrap();
        assert_eq!(rows[0].status, CommitStatus::Verified);
    }

    #[test]
    fn complete_batch_bumps_processed_by_width() {
        let db = test_db();
        let job_id = db.create_job("/src", "/out").unwrap();
        seed_images(&db, job_id, 70);
        db.set_job_total_images(job_id, 70).unwrap();
        db.create_batches(job_id, 50).unwrap();

        let first = db.lease_next_batch(job_id).unwrap().unwrap();
        db.complete_batch(&first).unwrap();
        assert_eq!(db.get_job(job_id).unwrap().unwrap().processed_images, 50);

        let second = db.lease_next_batch(job_id).unwrap().unwrap();
        db.complete_batch(&second).unwrap();
        assert_eq!(db.get_job(job_id).unwrap().unwrap().processed_images, 70);
        assert_eq!(db.unfinished_batch_count(job_id).unwrap(), 0);
    }

    #[test]
    fn duplicate_source_paths_are_skipped() {
        let db = test_db();
        let job_id = db.create_job("/src", "/out").unwrap();
        seed_images(&db, job_id, 5);
        seed_images(&db, job_id, 5); // same paths again
        assert_eq!(db.image_count(job_id).unwrap(), 5);
    }
}
