//! The batch state machine: PENDING -> PROCESSING -> COMMITTING ->
//! COMMITTED, with crash-safe resume.
//!
//! PROCESSING runs detection and matching with no writes outside hot
//! storage and no staged files. The COMMITTING flip and the insertion
//! of pending commit rows share one transaction, so restart always
//! finds either a replayable PROCESSING batch or a reconcilable
//! COMMITTING one. Learned embeddings belong to the registry's own
//! transactional history and are persisted immediately during
//! PROCESSING.

use anyhow::{anyhow, bail, Result};
use image::DynamicImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::analyzer::{DetectedFace, FaceAnalyzer};
use crate::compress;
use crate::config::Config;
use crate::db::jobs::{
    Batch, CommitStatus, Control, ImageResultRow, ImageRow, JobConfig, JobStatus, NewCommitRow,
};
use crate::db::Database;
use crate::decode::{self, TempBatchDir};
use crate::matcher::Matcher;
use crate::progress::ProgressWriter;
use crate::router::{output_filename, with_retry, Router, RowEvidence};

/// Per-image pipeline result, consumed by a single routing step.
pub enum ImageOutcome {
    Decoded(DynamicImage),
    DecodeFailed(String),
    Analyzed { faces: Vec<DetectedFace> },
    AnalyzeFailed(String),
}

/// How a batch run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Committed,
    /// A terminate signal arrived during PROCESSING; the batch was
    /// reset to PENDING.
    Terminated,
}

/// Group-mode routing: a single folder that receives images whose
/// matched set covers every selected person.
struct GroupRouting {
    folder_name: String,
    selected: Vec<i64>,
}

pub struct BatchEngine<'a> {
    db: &'a Database,
    config: &'a Config,
    analyzer: &'a mut dyn FaceAnalyzer,
    matcher: Matcher<'a>,
    progress: &'a mut ProgressWriter,
    output_root: PathBuf,
    group: Option<GroupRouting>,
    warning_count: u64,
}

impl<'a> BatchEngine<'a> {
    pub fn new(
        db: &'a Database,
        config: &'a Config,
        analyzer: &'a mut dyn FaceAnalyzer,
        progress: &'a mut ProgressWriter,
        job_config: &JobConfig,
    ) -> Result<Self> {
        job_config.validate()?;
        let output_root = job_config
            .output_root
            .clone()
            .ok_or_else(|| anyhow!("job config has no output_root"))?;

        let group = if job_config.group_mode {
            let folder_name = job_config
                .group_folder_name
                .clone()
                .ok_or_else(|| anyhow!("group mode without a group folder name"))?;
            let selected = job_config
                .selected_person_ids
                .clone()
                .ok_or_else(|| anyhow!("group mode without selected persons"))?;
            Some(GroupRouting {
                folder_name,
                selected,
            })
        } else {
            None
        };

        let matcher = Matcher::new(db, job_config.selected_person_ids.clone(), &config.matching)?;
        Ok(Self {
            db,
            config,
            analyzer,
            matcher,
            progress,
            output_root,
            group,
            warning_count: 0,
        })
    }

    pub fn warning_count(&self) -> u64 {
        self.warning_count
    }

    /// Drive one leased batch through the full state machine.
    pub fn process_batch(&mut self, batch: &Batch) -> Result<BatchOutcome> {
        let images = self.db.images_for_batch(batch)?;
        let image_range = image_range_label(&images);
        let started = Instant::now();

        // RAW intermediates for this batch live until the batch ends,
        // then the guard removes them on every exit path.
        let temp_dir = TempBatchDir::create(self.config.temp_batch_dir(batch.batch_id))?;

        self.progress.batch_transition(
            batch.batch_id,
            "PROCESSING",
            batch.start_idx,
            batch.end_idx,
            image_range.as_deref(),
        )?;

        for image in &images {
            if self.db.get_control()? == Control::Terminate {
                tracing::info!(batch_id = batch.batch_id, "terminate observed mid-processing");
                self.db.reset_batch_to_pending(batch.batch_id)?;
                self.progress.batch_transition(
                    batch.batch_id,
                    "PENDING",
                    batch.start_idx,
                    batch.end_idx,
                    image_range.as_deref(),
                )?;
                return Ok(BatchOutcome::Terminated);
            }

            let outcome = self.evaluate_image(image, &temp_dir);
            self.record_outcome(batch, image, outcome)?;
            self.progress.image_processed()?;
        }

        self.enter_committing(batch)?;
        self.progress.batch_transition(
            batch.batch_id,
            "COMMITTING",
            batch.start_idx,
            batch.end_idx,
            image_range.as_deref(),
        )?;

        commit_phase(self.db, self.config, self.progress, &self.output_root, batch)?;

        finish_batch(self.db, self.config, self.progress, batch, image_range.as_deref())?;
        self.progress
            .batch_committed(batch.width(), started.elapsed().as_secs_f64())?;
        Ok(BatchOutcome::Committed)
    }

    /// Decode then analyze one image, folding failures into outcomes.
    fn evaluate_image(&mut self, image: &ImageRow, temp_dir: &TempBatchDir) -> ImageOutcome {
        let decoded = match decode::load_for_analysis(
            Path::new(&image.source_path),
            &image.extension,
            image.image_id,
            temp_dir,
        ) {
            Ok(img) => ImageOutcome::Decoded(img),
            Err(e) => return ImageOutcome::DecodeFailed(e.to_string()),
        };

        let ImageOutcome::Decoded(img) = decoded else {
            unreachable!();
        };
        match self.analyzer.analyze(&img) {
            Ok(faces) => ImageOutcome::Analyzed { faces },
            Err(e) => ImageOutcome::AnalyzeFailed(e.to_string()),
        }
    }

    /// The single routing step for per-image outcomes: match faces and
    /// upsert the image result. Failures count as unmatched images.
    fn record_outcome(
        &mut self,
        batch: &Batch,
        image: &ImageRow,
        outcome: ImageOutcome,
    ) -> Result<()> {
        let (face_count, matched_ids, unknown_count) = match outcome {
            ImageOutcome::Analyzed { faces } => {
                let mut matched_ids: Vec<i64> = Vec::new();
                let mut unknown_count = 0i64;
                let face_count = faces.len() as i64;
                for face in &faces {
                    match self.matcher.match_face(&face.embedding)? {
                        Some(m) => {
                            if !matched_ids.contains(&m.person_id) {
                                matched_ids.push(m.person_id);
                            }
                        }
                        None => unknown_count += 1,
                    }
                }
                matched_ids.sort_unstable();
                (face_count, matched_ids, unknown_count)
            }
            ImageOutcome::DecodeFailed(reason) => {
                tracing::warn!(path = %image.source_path, %reason, "decode failed, image skipped");
                self.warning_count += 1;
                (0, Vec::new(), 0)
            }
            ImageOutcome::AnalyzeFailed(reason) => {
                tracing::warn!(path = %image.source_path, %reason, "analysis failed, image skipped");
                self.warning_count += 1;
                (0, Vec::new(), 0)
            }
            ImageOutcome::Decoded(_) => unreachable!("decoded images are analyzed before routing"),
        };

        // matched_count counts faces that resolved to some person
        let matched_count = face_count - unknown_count;
        self.db.upsert_image_result(
            image.image_id,
            batch.batch_id,
            face_count,
            matched_count,
            unknown_count,
            &matched_ids,
        )
    }

    /// Compute fan-out targets and flip the batch to COMMITTING with
    /// its pending rows in one transaction.
    fn enter_committing(&mut self, batch: &Batch) -> Result<()> {
        let results = self.db.results_for_batch(batch.batch_id)?;
        let mut rows = Vec::new();
        for result in results.iter().filter(|r| !r.matched_person_ids.is_empty()) {
            rows.extend(self.routing_targets(result)?);
        }
        self.db.begin_committing(batch.batch_id, &rows)
    }

    fn routing_targets(&self, result: &ImageResultRow) -> Result<Vec<NewCommitRow>> {
        let filename = output_filename(result.ordering_idx, &result.sha256);

        if let Some(group) = &self.group {
            // Group mode delivers only images covering every selected
            // person, as one copy in the group folder.
            let covers_all = group
                .selected
                .iter()
                .all(|id| result.matched_person_ids.contains(id));
            if !covers_all {
                return Ok(Vec::new());
            }
            let output_path = self.output_root.join(&group.folder_name).join(&filename);
            return Ok(vec![NewCommitRow {
                image_id: result.image_id,
                person_id: None,
                target_folder: group.folder_name.clone(),
                output_filename: filename,
                output_path: output_path.to_string_lossy().to_string(),
            }]);
        }

        let mut rows = Vec::with_capacity(result.matched_person_ids.len());
        for &person_id in &result.matched_person_ids {
            let person = self
                .db
                .get_person(person_id)?
                .ok_or_else(|| anyhow!("matched person {person_id} vanished from registry"))?;
            let output_path = self
                .output_root
                .join(&person.output_folder_rel)
                .join(&filename);
            rows.push(NewCommitRow {
                image_id: result.image_id,
                person_id: Some(person_id),
                target_folder: person.output_folder_rel,
                output_filename: filename.clone(),
                output_path: output_path.to_string_lossy().to_string(),
            });
        }
        Ok(rows)
    }
}

/// First/last filename stems, for operators watching progress.
fn image_range_label(images: &[ImageRow]) -> Option<String> {
    let first = images.first()?;
    let last = images.last()?;
    let stem = |name: &str| {
        Path::new(name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| name.to_string())
    };
    Some(format!("{} - {}", stem(&first.filename), stem(&last.filename)))
}

/// Drive every unfinished commit row of a COMMITTING batch to
/// verified. Also used verbatim on the resume path: staged artifacts
/// are regenerated deterministically when missing, existing identical
/// destinations are accepted, and verified rows are untouched.
fn commit_phase(
    db: &Database,
    config: &Config,
    progress: &mut ProgressWriter,
    output_root: &Path,
    batch: &Batch,
) -> Result<()> {
    let results = db.results_for_batch(batch.batch_id)?;
    let by_image: HashMap<i64, &ImageResultRow> =
        results.iter().map(|r| (r.image_id, r)).collect();
    let router = Router::new(output_root.to_path_buf());
    let staging_dir = config.staging_batch_dir(batch.batch_id);

    for row in db.commit_rows_for_batch(batch.batch_id)? {
        match row.status {
            CommitStatus::Verified => continue,
            CommitStatus::Failed => bail!(
                "commit row {} for image {} is failed; reconciliation required",
                row.commit_id,
                row.image_id
            ),
            CommitStatus::Pending | CommitStatus::Written => {}
        }

        // Control is polled between row transitions; both stop and
        // terminate let rows that are already pending or written reach
        // verified, so the signal only takes effect after the batch.
        let _ = db.get_control()?;

        let result = by_image
            .get(&row.image_id)
            .ok_or_else(|| anyhow!("commit row without image result: image {}", row.image_id))?;
        let staged = staging_dir.join(format!("{}.jpg", row.image_id));
        if !staged.exists() {
            with_retry(|| {
                compress::stage_artifact(
                    Path::new(&result.source_path),
                    &result.extension,
                    &staged,
                    &config.output,
                )
            })?;
        }

        router.deliver_row(db, &row, &staged)?;

        let person_name = match row.person_id {
            Some(person_id) => db.get_person(person_id)?.map(|p| p.display_name),
            None => Some(row.target_folder.clone()),
        };
        progress.commit_advanced(person_name.as_deref(), &row.output_filename)?;
    }
    Ok(())
}

/// COMMITTED transition: stamp the batch, bump the job counter, and
/// clear this batch's staging and temp directories.
fn finish_batch(
    db: &Database,
    config: &Config,
    progress: &mut ProgressWriter,
    batch: &Batch,
    image_range: Option<&str>,
) -> Result<()> {
    db.complete_batch(batch)?;
    remove_dir_if_present(&config.staging_batch_dir(batch.batch_id))?;
    remove_dir_if_present(&config.temp_batch_dir(batch.batch_id))?;
    progress.batch_transition(
        batch.batch_id,
        "COMMITTED",
        batch.start_idx,
        batch.end_idx,
        image_range,
    )?;
    tracing::info!(batch_id = batch.batch_id, width = batch.width(), "batch committed");
    Ok(())
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Resume-time reconciliation for a batch found in COMMITTING: advance
/// every commit row to the highest status the on-disk evidence
/// supports, then finish the batch through the normal commit phase.
pub fn reconcile_batch(
    db: &Database,
    config: &Config,
    progress: &mut ProgressWriter,
    output_root: &Path,
    batch: &Batch,
) -> Result<()> {
    let router = Router::new(output_root.to_path_buf());
    let staging_dir = config.staging_batch_dir(batch.batch_id);

    for row in db.commit_rows_for_batch(batch.batch_id)? {
        if row.status == CommitStatus::Verified {
            continue;
        }
        let staged = staging_dir.join(format!("{}.jpg", row.image_id));
        match router.inspect_row(&row, &staged) {
            RowEvidence::Delivered => {
                // Output already on disk: advance through written so
                // the commit phase only has to verify.
                if row.status == CommitStatus::Pending {
                    db.advance_commit_status(row.commit_id, CommitStatus::Written)?;
                }
            }
            RowEvidence::StagedOnly => {
                // The copy never happened (or vanished before the
                // rename); rewind the claim so it is re-copied.
                if row.status == CommitStatus::Written {
                    tracing::warn!(
                        commit_id = row.commit_id,
                        "written row has no destination; staged artifact will be re-copied"
                    );
                }
            }
            RowEvidence::Missing => {
                if row.status == CommitStatus::Written {
                    // The row claims a copy happened but there is no
                    // file anywhere: evidence disagreement.
                    db.advance_commit_status(row.commit_id, CommitStatus::Failed)?;
                    bail!(
                        "commit row {} claims written but neither destination nor staged file exists",
                        row.commit_id
                    );
                }
                // Pending with nothing staged is the normal crash
                // point; the commit phase regenerates the artifact.
            }
        }
    }

    // Rows a written-claim rewind applies to must re-copy: deliver_row
    // only copies from pending, so reset those rows first.
    for row in db.commit_rows_for_batch(batch.batch_id)? {
        if row.status == CommitStatus::Written {
            let dest = PathBuf::from(&row.output_path);
            if !dest.exists() {
                db.advance_commit_status(row.commit_id, CommitStatus::Pending)?;
            }
        }
    }

    commit_phase(db, config, progress, output_root, batch)?;
    finish_batch(db, config, progress, batch, None)
}

/// Startup resume: replay interrupted batches per the resume table,
/// then complete the job if nothing is left.
pub fn resume_interrupted(
    db: &Database,
    config: &Config,
    progress: &mut ProgressWriter,
) -> Result<()> {
    use crate::db::jobs::BatchState;

    for batch in db.batches_by_state(BatchState::Processing)? {
        tracing::info!(batch_id = batch.batch_id, "resetting interrupted PROCESSING batch");
        db.reset_batch_to_pending(batch.batch_id)?;
        // A PROCESSING batch never staged anything, but a crash may
        // have left temp RAW intermediates behind.
        remove_dir_if_present(&config.temp_batch_dir(batch.batch_id))?;
        progress.batch_transition(
            batch.batch_id,
            "PENDING",
            batch.start_idx,
            batch.end_idx,
            None,
        )?;
    }

    for batch in db.batches_by_state(BatchState::Committing)? {
        tracing::info!(batch_id = batch.batch_id, "reconciling interrupted COMMITTING batch");
        let job = db
            .get_job(batch.job_id)?
            .ok_or_else(|| anyhow!("batch {} references missing job", batch.batch_id))?;
        reconcile_batch(db, config, progress, Path::new(&job.output_root), &batch)?;
    }

    if let Some(job) = db.latest_job()? {
        if matches!(job.status, JobStatus::Created | JobStatus::Running)
            && db.unfinished_batch_count(job.job_id)? == 0
            && job.total_images > 0
        {
            tracing::info!(job_id = job.job_id, "no unfinished batches after resume");
            db.update_job_status(job.job_id, JobStatus::Completed)?;
        }
    }
    Ok(())
}
