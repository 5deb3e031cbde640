use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Atomic batch width: the crash boundary of the state machine.
pub const ATOMIC_BATCH_SIZE: i64 = 50;

/// STRICT threshold: auto-match + learn. Euclidean distance on
/// unit-norm 512-dim embeddings, range 0-2.
pub const THRESHOLD_STRICT: f32 = 0.80;
/// LOOSE threshold: match only, no learning.
pub const THRESHOLD_LOOSE: f32 = 1.00;

/// Embeddings stored per person; oldest learned entries are trimmed
/// first, the seed reference is never trimmed.
pub const MAX_EMBEDDINGS_PER_PERSON: usize = 10;

/// Minimum detector score for a face to be considered at all.
pub const MIN_DETECTION_SCORE: f32 = 0.5;

/// Locked output policy for deliverable JPEGs.
pub const OUTPUT_MAX_LONG_EDGE: u32 = 2048;
pub const OUTPUT_JPEG_QUALITY: u8 = 85;

/// Commit-write retry policy.
pub const COMMIT_RETRY_ATTEMPTS: u32 = 3;
pub const COMMIT_RETRY_BACKOFF_SECS: u64 = 1;

/// Smoothing factor for the images-per-second rate in progress.json.
pub const RATE_EWMA_ALPHA: f64 = 0.2;
/// Number of recently finished batches kept in progress.json.
pub const RECENT_BATCH_RING: usize = 20;

/// Streaming hash chunk size for ingest.
pub const HASH_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of hot storage: database, staging, temp, state, models, logs.
    #[serde(default = "default_hot_root")]
    pub hot_root: PathBuf,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_threshold_strict")]
    pub threshold_strict: f32,

    #[serde(default = "default_threshold_loose")]
    pub threshold_loose: f32,

    #[serde(default = "default_min_detection_score")]
    pub min_detection_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_max_long_edge")]
    pub max_long_edge: u32,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_hot_root() -> PathBuf {
    PathBuf::from("./hot_storage")
}

fn default_threshold_strict() -> f32 {
    THRESHOLD_STRICT
}

fn default_threshold_loose() -> f32 {
    THRESHOLD_LOOSE
}

fn default_min_detection_score() -> f32 {
    MIN_DETECTION_SCORE
}

fn default_max_long_edge() -> u32 {
    OUTPUT_MAX_LONG_EDGE
}

fn default_jpeg_quality() -> u8 {
    OUTPUT_JPEG_QUALITY
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            threshold_strict: default_threshold_strict(),
            threshold_loose: default_threshold_loose(),
            min_detection_score: default_min_detection_score(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_long_edge: default_max_long_edge(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hot_root: default_hot_root(),
            matching: MatchingConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Write a default config so the operator has something to edit
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    fn config_path() -> PathBuf {
        std::env::var_os("FACESORT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("facesort.toml"))
    }

    // ========================================================================
    // Hot storage layout
    // ========================================================================

    pub fn db_path(&self) -> PathBuf {
        self.hot_root.join("registry.db")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.hot_root.join("state")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.hot_root.join("staging")
    }

    pub fn staging_batch_dir(&self, batch_id: i64) -> PathBuf {
        self.staging_dir().join(batch_id.to_string())
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.hot_root.join("temp")
    }

    pub fn temp_batch_dir(&self, batch_id: i64) -> PathBuf {
        self.temp_dir().join(batch_id.to_string())
    }

    pub fn models_dir(&self) -> PathBuf {
        self.hot_root.join("models")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.hot_root.join("logs")
    }

    /// Create the full hot-storage tree.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.hot_root)?;
        std::fs::create_dir_all(self.state_dir())?;
        std::fs::create_dir_all(self.staging_dir())?;
        std::fs::create_dir_all(self.temp_dir())?;
        std::fs::create_dir_all(self.models_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
