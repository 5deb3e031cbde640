//! The long-running worker process.
//!
//! Owns the single execution lane of the batch state machine, polls
//! the control flag at safe points, and keeps the heartbeat file fresh
//! from a dedicated thread. All coordination with the control plane
//! happens through the store and the state files.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::analyzer::FaceAnalyzer;
use crate::config::Config;
use crate::db::jobs::{Control, Job, JobConfig, JobStatus};
use crate::db::Database;
use crate::engine::{self, BatchEngine, BatchOutcome};
use crate::ingest;
use crate::progress::{self, ProgressWriter};

const IDLE_POLL: Duration = Duration::from_secs(3);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub struct Worker {
    config: Config,
    db: Database,
    status: Arc<Mutex<String>>,
    running: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(config: Config, db: Database) -> Self {
        Self {
            config,
            db,
            status: Arc::new(Mutex::new("starting".to_string())),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    fn set_status(&self, status: &str) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status.to_string();
        }
    }

    /// Run until the job completes or a stop/terminate signal halts the
    /// worker. Exit is always through here so the heartbeat thread is
    /// joined on every path.
    pub fn run(&self, analyzer: &mut dyn FaceAnalyzer) -> Result<()> {
        self.config.ensure_directories()?;
        let mut progress = ProgressWriter::new(self.config.state_dir())?;

        let heartbeat = self.spawn_heartbeat();
        let result = self.run_loop(analyzer, &mut progress);

        self.running.store(false, Ordering::Relaxed);
        let _ = heartbeat.join();
        result
    }

    /// Heartbeat: once per second regardless of batch activity.
    fn spawn_heartbeat(&self) -> thread::JoinHandle<()> {
        let running = self.running.clone();
        let status = self.status.clone();
        let state_dir = self.config.state_dir();
        thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                let current = status
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string());
                if let Err(e) = progress::write_heartbeat(&state_dir, &current) {
                    tracing::warn!(error = %e, "heartbeat write failed");
                }
                thread::sleep(HEARTBEAT_INTERVAL);
            }
        })
    }

    fn run_loop(&self, analyzer: &mut dyn FaceAnalyzer, progress: &mut ProgressWriter) -> Result<()> {
        self.set_status("resuming");
        engine::resume_interrupted(&self.db, &self.config, progress)?;

        loop {
            let job_config = self.db.get_job_config()?;
            if !job_config.is_complete() {
                self.set_status("waiting_for_config");
                thread::sleep(IDLE_POLL);
                continue;
            }
            if let Err(e) = job_config.validate() {
                tracing::warn!(error = %e, "job configuration rejected");
                self.set_status("waiting_for_config");
                thread::sleep(IDLE_POLL);
                continue;
            }

            // Safe point: between batches / before starting a job
            match self.db.get_control()? {
                Control::Run => {}
                Control::Stop | Control::Terminate => {
                    self.halt_stopped()?;
                    return Ok(());
                }
            }

            let job = self.acquire_job(&job_config, progress)?;
            progress.begin_job(job.total_images, job.processed_images)?;

            if job.total_images == 0 {
                tracing::warn!(root = %job.source_root, "no images found under source root");
                self.db.update_job_status(job.job_id, JobStatus::Completed)?;
                self.set_status("completed");
                return Ok(());
            }

            let mut engine =
                BatchEngine::new(&self.db, &self.config, analyzer, progress, &job_config)?;
            loop {
                match self.db.get_control()? {
                    Control::Run => {}
                    Control::Stop | Control::Terminate => break,
                }

                let Some(batch) = self.db.lease_next_batch(job.job_id)? else {
                    self.db.update_job_status(job.job_id, JobStatus::Completed)?;
                    self.set_status("completed");
                    tracing::info!(job_id = job.job_id, "all batches committed; job complete");
                    return Ok(());
                };

                self.set_status(&format!("processing_batch_{}", batch.batch_id));
                match engine.process_batch(&batch) {
                    Ok(BatchOutcome::Committed) => {}
                    Ok(BatchOutcome::Terminated) => break,
                    Err(e) => {
                        tracing::error!(batch_id = batch.batch_id, error = %e, "batch failed");
                        self.db.update_job_status(job.job_id, JobStatus::Failed)?;
                        self.set_status("failed");
                        return Err(e);
                    }
                }
            }

            // Fell out on a control signal: next iteration halts.
        }
    }

    fn halt_stopped(&self) -> Result<()> {
        if let Some(job) = self.db.latest_job()? {
            if matches!(job.status, JobStatus::Running | JobStatus::Created) {
                self.db.update_job_status(job.job_id, JobStatus::Stopped)?;
            }
        }
        self.set_status("stopped");
        tracing::info!("control signal observed; worker halting");
        Ok(())
    }

    /// Pick up the job matching the current configuration, resuming a
    /// stopped or interrupted one when its roots still match, otherwise
    /// clearing old job data and ingesting fresh.
    fn acquire_job(&self, job_config: &JobConfig, progress: &mut ProgressWriter) -> Result<Job> {
        let source_root = job_config
            .source_root
            .as_ref()
            .ok_or_else(|| anyhow!("job config has no source_root"))?
            .to_string_lossy()
            .to_string();
        let output_root = job_config
            .output_root
            .as_ref()
            .ok_or_else(|| anyhow!("job config has no output_root"))?
            .to_string_lossy()
            .to_string();

        if let Some(job) = self.db.latest_job()? {
            let same_roots = job.source_root == source_root && job.output_root == output_root;
            let resumable = matches!(
                job.status,
                JobStatus::Running | JobStatus::Created | JobStatus::Stopped
            );
            if same_roots && resumable && self.db.unfinished_batch_count(job.job_id)? > 0 {
                tracing::info!(job_id = job.job_id, "resuming existing job");
                self.db.update_job_status(job.job_id, JobStatus::Running)?;
                return self
                    .db
                    .get_job(job.job_id)?
                    .ok_or_else(|| anyhow!("job {} vanished during resume", job.job_id));
            }
        }

        // Fresh job: discovery is one-shot, so prior job data goes
        self.set_status("discovering_images");
        self.db.clear_job_data()?;
        progress.clear_batch_states()?;

        let job_id = self.db.create_job(&source_root, &output_root)?;
        self.db.update_job_status(job_id, JobStatus::Running)?;
        let summary = ingest::run_ingest(&self.db, job_id, std::path::Path::new(&source_root))?;
        tracing::info!(
            job_id,
            images = summary.image_count,
            batches = summary.batch_count,
            skipped = summary.skipped_unreadable,
            "job ingested"
        );
        self.db
            .get_job(job_id)?
            .ok_or_else(|| anyhow!("job {job_id} vanished after ingest"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _hot: TempDir,
        _source: TempDir,
        worker: Worker,
        source_root: std::path::PathBuf,
        output_root: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let hot = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let config = Config {
            hot_root: hot.path().to_path_buf(),
            ..Config::default()
        };
        config.ensure_directories().unwrap();
        let db = Database::open(&config.db_path()).unwrap();
        db.initialize().unwrap();
        let source_root = source.path().to_path_buf();
        let output_root = hot.path().join("out");
        Fixture {
            worker: Worker::new(config, db),
            _hot: hot,
            _source: source,
            source_root,
            output_root,
        }
    }

    fn job_config(f: &Fixture) -> JobConfig {
        JobConfig {
            source_root: Some(f.source_root.clone()),
            output_root: Some(f.output_root.clone()),
            selected_person_ids: None,
            group_mode: false,
            group_folder_name: None,
            control: Some(Control::Run),
        }
    }

    fn add_image(f: &Fixture, name: &str) {
        let img = image::RgbImage::from_pixel(60, 40, image::Rgb([10, 20, 30]));
        img.save(f.source_root.join(name)).unwrap();
    }

    #[test]
    fn acquire_creates_and_ingests_a_fresh_job() {
        let f = fixture();
        add_image(&f, "a.jpg");
        add_image(&f, "b.jpg");

        let mut progress = ProgressWriter::new(f.worker.config.state_dir()).unwrap();
        let job = f.worker.acquire_job(&job_config(&f), &mut progress).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.total_images, 2);
        assert_eq!(f.worker.db.unfinished_batch_count(job.job_id).unwrap(), 1);
    }

    #[test]
    fn acquire_resumes_a_stopped_job_with_matching_roots() {
        let f = fixture();
        add_image(&f, "a.jpg");

        let mut progress = ProgressWriter::new(f.worker.config.state_dir()).unwrap();
        let first = f.worker.acquire_job(&job_config(&f), &mut progress).unwrap();
        f.worker
            .db
            .update_job_status(first.job_id, JobStatus::Stopped)
            .unwrap();

        let second = f.worker.acquire_job(&job_config(&f), &mut progress).unwrap();
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.status, JobStatus::Running);
    }

    #[test]
    fn acquire_starts_over_when_roots_change() {
        let f = fixture();
        add_image(&f, "a.jpg");

        let mut progress = ProgressWriter::new(f.worker.config.state_dir()).unwrap();
        let first = f.worker.acquire_job(&job_config(&f), &mut progress).unwrap();

        let other_source = TempDir::new().unwrap();
        let img = image::RgbImage::from_pixel(60, 40, image::Rgb([1, 2, 3]));
        img.save(other_source.path().join("z.jpg")).unwrap();
        let changed = JobConfig {
            source_root: Some(other_source.path().to_path_buf()),
            ..job_config(&f)
        };
        let second = f.worker.acquire_job(&changed, &mut progress).unwrap();
        assert_ne!(second.job_id, first.job_id);
        // Old job data is cleared, only the new inventory remains
        assert_eq!(f.worker.db.image_count(second.job_id).unwrap(), 1);
        assert!(f.worker.db.get_job(first.job_id).unwrap().is_none());
    }

    #[test]
    fn completed_job_with_same_roots_is_not_resumed() {
        let f = fixture();
        add_image(&f, "a.jpg");

        let mut progress = ProgressWriter::new(f.worker.config.state_dir()).unwrap();
        let first = f.worker.acquire_job(&job_config(&f), &mut progress).unwrap();
        // Mark everything done
        while let Some(batch) = f.worker.db.lease_next_batch(first.job_id).unwrap() {
            f.worker
                .db
                .begin_committing(batch.batch_id, &[])
                .unwrap();
            f.worker.db.complete_batch(&batch).unwrap();
        }
        f.worker
            .db
            .update_job_status(first.job_id, JobStatus::Completed)
            .unwrap();

        let second = f.worker.acquire_job(&job_config(&f), &mut progress).unwrap();
        assert_ne!(second.job_id, first.job_id);
    }
}
