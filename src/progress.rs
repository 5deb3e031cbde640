//! State files for external observers.
//!
//! The worker mirrors its progress into JSON files under hot
//! `state/`, each replaced atomically (write to temp, rename) so a
//! reader never sees a torn write. The heartbeat file is written once
//! per second from its own thread.

use anyhow::Result;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::{RATE_EWMA_ALPHA, RECENT_BATCH_RING};

#[derive(Debug, Clone, Serialize)]
pub struct RecentBatch {
    pub batch_id: i64,
    pub state: String,
    pub image_range: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
struct ProgressFile<'a> {
    total_images: i64,
    processed_images: i64,
    completion_percent: f64,
    current_batch_id: Option<i64>,
    current_image_range: Option<&'a str>,
    current_batch_state: Option<&'a str>,
    last_committed_person: Option<&'a str>,
    last_committed_image: Option<&'a str>,
    last_committed_time: Option<&'a str>,
    recent_batches: &'a VecDeque<RecentBatch>,
    elapsed_seconds: Option<f64>,
    images_per_second: Option<f64>,
    eta_seconds: Option<f64>,
    updated_at: String,
}

#[derive(Debug, Serialize)]
struct BatchStateFile<'a> {
    batch_id: i64,
    state: &'a str,
    start_idx: i64,
    end_idx: i64,
    image_range: Option<&'a str>,
    updated_at: String,
}

#[derive(Debug, Serialize)]
struct HeartbeatFile<'a> {
    pid: u32,
    status: &'a str,
    timestamp: String,
}

pub struct ProgressWriter {
    state_dir: PathBuf,
    batches_dir: PathBuf,
    total_images: i64,
    processed_images: i64,
    current_batch_id: Option<i64>,
    current_batch_state: Option<String>,
    current_image_range: Option<String>,
    last_committed_person: Option<String>,
    last_committed_image: Option<String>,
    last_committed_time: Option<String>,
    recent: VecDeque<RecentBatch>,
    started_at: Option<Instant>,
    rate_ewma: Option<f64>,
}

impl ProgressWriter {
    pub fn new(state_dir: PathBuf) -> Result<Self> {
        let batches_dir = state_dir.join("batches");
        std::fs::create_dir_all(&state_dir)?;
        std::fs::create_dir_all(&batches_dir)?;
        Ok(Self {
            state_dir,
            batches_dir,
            total_images: 0,
            processed_images: 0,
            current_batch_id: None,
            current_batch_state: None,
            current_image_range: None,
            last_committed_person: None,
            last_committed_image: None,
            last_committed_time: None,
            recent: VecDeque::new(),
            started_at: None,
            rate_ewma: None,
        })
    }

    /// Reset counters for a (new or resumed) job and start the clock.
    pub fn begin_job(&mut self, total_images: i64, processed_images: i64) -> Result<()> {
        self.total_images = total_images;
        self.processed_images = processed_images;
        self.started_at = Some(Instant::now());
        self.write_progress()
    }

    /// Record a batch state transition: updates the progress file, the
    /// per-batch state file, and the recent-batch ring.
    pub fn batch_transition(
        &mut self,
        batch_id: i64,
        state: &str,
        start_idx: i64,
        end_idx: i64,
        image_range: Option<&str>,
    ) -> Result<()> {
        self.current_batch_id = Some(batch_id);
        self.current_batch_state = Some(state.to_string());
        self.current_image_range = image_range.map(str::to_string);

        let entry = RecentBatch {
            batch_id,
            state: state.to_string(),
            image_range: image_range.map(str::to_string),
            updated_at: now_rfc3339(),
        };
        if let Some(existing) = self.recent.iter_mut().find(|b| b.batch_id == batch_id) {
            *existing = entry;
        } else {
            self.recent.push_front(entry);
            self.recent.truncate(RECENT_BATCH_RING);
        }

        atomic_write_json(
            &self.batches_dir.join(format!("{batch_id}.json")),
            &BatchStateFile {
                batch_id,
                state,
                start_idx,
                end_idx,
                image_range,
                updated_at: now_rfc3339(),
            },
        )?;
        self.write_progress()
    }

    /// Refresh after a single image finished PROCESSING.
    pub fn image_processed(&mut self) -> Result<()> {
        self.write_progress()
    }

    /// Record a commit-log row reaching verified.
    pub fn commit_advanced(&mut self, person: Option<&str>, filename: &str) -> Result<()> {
        self.last_committed_person = person.map(str::to_string);
        self.last_committed_image = Some(filename.to_string());
        self.last_committed_time = Some(now_rfc3339());
        self.write_progress()
    }

    /// Fold a committed batch into the counters and the rate estimate.
    pub fn batch_committed(&mut self, width: i64, batch_seconds: f64) -> Result<()> {
        self.processed_images += width;
        if batch_seconds > 0.0 {
            let sample = width as f64 / batch_seconds;
            self.rate_ewma = Some(match self.rate_ewma {
                Some(prev) => RATE_EWMA_ALPHA * sample + (1.0 - RATE_EWMA_ALPHA) * prev,
                None => sample,
            });
        }
        self.write_progress()
    }

    pub fn write_progress(&self) -> Result<()> {
        let completion_percent = if self.total_images > 0 {
            (self.processed_images as f64 / self.total_images as f64) * 100.0
        } else {
            0.0
        };
        let elapsed_seconds = self.started_at.map(|t| t.elapsed().as_secs_f64());
        let eta_seconds = self.rate_ewma.and_then(|rate| {
            if rate > 0.0 {
                Some((self.total_images - self.processed_images).max(0) as f64 / rate)
            } else {
                None
            }
        });

        atomic_write_json(
            &self.state_dir.join("progress.json"),
            &ProgressFile {
                total_images: self.total_images,
                processed_images: self.processed_images,
                completion_percent: (completion_percent * 100.0).round() / 100.0,
                current_batch_id: self.current_batch_id,
                current_image_range: self.current_image_range.as_deref(),
                current_batch_state: self.current_batch_state.as_deref(),
                last_committed_person: self.last_committed_person.as_deref(),
                last_committed_image: self.last_committed_image.as_deref(),
                last_committed_time: self.last_committed_time.as_deref(),
                recent_batches: &self.recent,
                elapsed_seconds,
                images_per_second: self.rate_ewma,
                eta_seconds,
                updated_at: now_rfc3339(),
            },
        )
    }

    /// Remove per-batch state files when a fresh job replaces the old one.
    pub fn clear_batch_states(&mut self) -> Result<()> {
        self.recent.clear();
        for entry in std::fs::read_dir(&self.batches_dir)? {
            let entry = entry?;
            if entry.path().extension().is_some_and(|e| e == "json") {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn recent_batches(&self) -> &VecDeque<RecentBatch> {
        &self.recent
    }
}

/// Write the worker heartbeat. Called from the heartbeat thread.
pub fn write_heartbeat(state_dir: &Path, status: &str) -> Result<()> {
    atomic_write_json(
        &state_dir.join("worker_heartbeat.json"),
        &HeartbeatFile {
            pid: std::process::id(),
            status,
            timestamp: now_rfc3339(),
        },
    )
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Temp-file + rename so readers only ever see a complete document.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut tmp = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp.push(".tmp");
    let tmp_path = path.with_file_name(tmp);

    let json = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
