//! Checkpoint save/restore and best-model persistence.
//!
//! Two kinds of files are written, both as JSON:
//!
//! - **Periodic checkpoints** (`checkpoint_epoch_NNNNNN.json`): configuration,
//!   progress counters, algorithm state and the best-model record, enough to
//!   resume with [`Trainer::restore_checkpoint`](crate::Trainer::restore_checkpoint).
//!   Only the last `keep_last_n` are kept.
//! - **Best model** (`best_model.json`): the [`BestModelRecord`], rewritten
//!   every time the best score strictly improves.
//!
//! # What's NOT Checkpointed
//!
//! Collector and replay-buffer contents. The trainer does not own them; a
//! resumed off-policy run refills its buffer (and warms up again if a
//! warm-up size is configured).
//!
//! # Usage
//!
//! ```rust,ignore
//! let config = TrainerConfig::builder(Regime::OnPolicy)
//!     .checkpoint(CheckpointConfig {
//!         dir: Some("runs/ppo".into()),
//!         save_interval: 10,
//!         keep_last_n: 3,
//!         save_best: true,
//!     })
//!     .build();
//!
//! // Later: resume from the newest checkpoint
//! let manager = CheckpointManager::new("runs/ppo", 10, 3)?;
//! if let Some(checkpoint) = manager.load_latest()? {
//!     trainer.reset(true, true)?;
//!     trainer.restore_checkpoint(&checkpoint)?;
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::{CheckpointConfig, TrainerConfig};
use crate::error::{TrainerError, TrainerResult};
use crate::state::TrainingState;

/// Current checkpoint format version.
const CHECKPOINT_VERSION: u32 = 1;

const CHECKPOINT_PREFIX: &str = "checkpoint_epoch_";

/// File name of the best-model snapshot inside the checkpoint directory.
pub const BEST_MODEL_FILE: &str = "best_model.json";

/// Snapshot of the algorithm taken when the best score improved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestModelRecord {
    /// The score that set the record.
    #[serde(with = "crate::state::unset_score")]
    pub score: f64,
    /// Epoch that produced the score.
    pub epoch: u64,
    /// Update step at the end of that epoch.
    pub update_step: u64,
    /// Env step at the end of that epoch; `None` offline.
    pub env_step: Option<u64>,
    /// The algorithm's [`state_dict`](crate::Algorithm::state_dict).
    pub state: serde_json::Value,
}

impl BestModelRecord {
    /// Writes the record to `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> TrainerResult<()> {
        write_json(self, path.as_ref())
    }

    /// Reads a record written by [`BestModelRecord::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> TrainerResult<Self> {
        read_json(path.as_ref())
    }
}

/// Everything needed to resume a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingCheckpoint {
    /// Checkpoint format version for compatibility checking.
    pub version: u32,

    /// Configuration the run was started with (checked on restore).
    pub config: TrainerConfig,

    /// Progress counters.
    pub training_state: TrainingState,

    /// The algorithm's state dict.
    pub algorithm_state: serde_json::Value,

    /// Best-model record at the time of the checkpoint.
    pub best: Option<BestModelRecord>,

    /// Metadata about the checkpoint.
    pub metadata: CheckpointMetadata,
}

impl TrainingCheckpoint {
    /// Creates a checkpoint stamped with the current time.
    #[must_use]
    pub fn new(
        config: TrainerConfig,
        training_state: TrainingState,
        algorithm_state: serde_json::Value,
        best: Option<BestModelRecord>,
    ) -> Self {
        let metadata = CheckpointMetadata::new()
            .with_progress(training_state.epoch, training_state.update_step);
        Self {
            version: CHECKPOINT_VERSION,
            config,
            training_state,
            algorithm_state,
            best,
            metadata,
        }
    }

    /// Saves the checkpoint to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if file creation or serialization fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> TrainerResult<()> {
        write_json(self, path.as_ref())
    }

    /// Loads a checkpoint from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file doesn't exist, is corrupted, or has an
    /// incompatible version.
    pub fn load<P: AsRef<Path>>(path: P) -> TrainerResult<Self> {
        let checkpoint: Self = read_json(path.as_ref())?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(TrainerError::checkpoint(format!(
                "Incompatible checkpoint version: {} (expected {})",
                checkpoint.version, CHECKPOINT_VERSION
            )));
        }
        Ok(checkpoint)
    }
}

/// Metadata about a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Epoch when the checkpoint was created.
    pub epoch: u64,

    /// Update step when the checkpoint was created.
    pub update_step: u64,

    /// Wall-clock timestamp (RFC 3339 format).
    pub timestamp: String,

    /// User-provided notes.
    pub notes: String,
}

impl CheckpointMetadata {
    /// Creates new metadata with the current timestamp.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: 0,
            update_step: 0,
            timestamp: chrono::Utc::now().to_rfc3339(),
            notes: String::new(),
        }
    }

    /// Sets the progress the checkpoint was taken at.
    #[must_use]
    pub fn with_progress(mut self, epoch: u64, update_step: u64) -> Self {
        self.epoch = epoch;
        self.update_step = update_step;
        self
    }

    /// Sets user notes.
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

impl Default for CheckpointMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes periodic checkpoints and the best-model file into one directory.
#[derive(Debug)]
pub struct CheckpointManager {
    /// Directory where checkpoints are saved.
    checkpoint_dir: PathBuf,

    /// Save a checkpoint every N epochs (0 = never).
    save_interval: u64,

    /// Number of periodic checkpoints to keep.
    keep_last_n: usize,

    /// Write `best_model.json` on improvement.
    save_best: bool,

    /// Checkpoint files, oldest first.
    checkpoints: Vec<PathBuf>,
}

impl CheckpointManager {
    /// Creates a manager, creating the directory if needed and picking up
    /// checkpoints already in it.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation or scanning fails.
    pub fn new(
        checkpoint_dir: impl AsRef<Path>,
        save_interval: u64,
        keep_last_n: usize,
    ) -> TrainerResult<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&checkpoint_dir).map_err(|e| {
            TrainerError::checkpoint(format!("Failed to create checkpoint directory: {e}"))
        })?;
        let checkpoints = Self::scan_checkpoints(&checkpoint_dir)?;

        Ok(Self {
            checkpoint_dir,
            save_interval,
            keep_last_n,
            save_best: true,
            checkpoints,
        })
    }

    /// Builds the manager described by `config`, or `None` if checkpointing
    /// is disabled.
    pub fn from_config(config: &CheckpointConfig) -> TrainerResult<Option<Self>> {
        match &config.dir {
            Some(dir) if config.is_enabled() => {
                let mut manager = Self::new(dir, config.save_interval, config.keep_last_n)?;
                manager.save_best = config.save_best;
                Ok(Some(manager))
            }
            _ => Ok(None),
        }
    }

    /// Checks if a checkpoint is due after `epoch`.
    #[must_use]
    pub fn should_save(&self, epoch: u64) -> bool {
        self.save_interval > 0 && epoch > 0 && epoch % self.save_interval == 0
    }

    /// Saves a checkpoint and deletes the oldest beyond `keep_last_n`.
    ///
    /// # Returns
    ///
    /// The path written.
    pub fn save(&mut self, checkpoint: &TrainingCheckpoint) -> TrainerResult<PathBuf> {
        let epoch = checkpoint.training_state.epoch;
        let path = self
            .checkpoint_dir
            .join(format!("{CHECKPOINT_PREFIX}{epoch:06}.json"));
        checkpoint.save(&path)?;

        // A restored run may write the same epoch twice.
        self.checkpoints.retain(|p| p != &path);
        self.checkpoints.push(path.clone());
        self.rotate_checkpoints()?;
        Ok(path)
    }

    /// Writes the best-model record, if enabled.
    ///
    /// # Returns
    ///
    /// The path written, or `None` when best-model saving is disabled.
    pub fn save_best(&self, record: &BestModelRecord) -> TrainerResult<Option<PathBuf>> {
        if !self.save_best {
            return Ok(None);
        }
        let path = self.best_model_path();
        record.save(&path)?;
        Ok(Some(path))
    }

    /// Path of the best-model file.
    #[must_use]
    pub fn best_model_path(&self) -> PathBuf {
        self.checkpoint_dir.join(BEST_MODEL_FILE)
    }

    /// Loads the best-model file, if one was written.
    pub fn load_best(&self) -> TrainerResult<Option<BestModelRecord>> {
        let path = self.best_model_path();
        if path.exists() {
            BestModelRecord::load(path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Loads the most recent checkpoint, or `None` if there is none.
    pub fn load_latest(&self) -> TrainerResult<Option<TrainingCheckpoint>> {
        self.checkpoints
            .last()
            .map(TrainingCheckpoint::load)
            .transpose()
    }

    /// Returns the path to the most recent checkpoint.
    #[must_use]
    pub fn latest_checkpoint_path(&self) -> Option<&Path> {
        self.checkpoints.last().map(PathBuf::as_path)
    }

    fn epoch_of(path: &Path) -> Option<u64> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|s| s.parse().ok())
    }

    fn scan_checkpoints(dir: &Path) -> TrainerResult<Vec<PathBuf>> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            TrainerError::checkpoint(format!("Failed to read checkpoint directory: {e}"))
        })?;

        let mut checkpoints = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| {
                    TrainerError::checkpoint(format!("Failed to read directory entry: {e}"))
                })?
                .path();
            if path.extension().and_then(|s| s.to_str()) == Some("json")
                && Self::epoch_of(&path).is_some()
            {
                checkpoints.push(path);
            }
        }
        checkpoints.sort_by_key(|path| Self::epoch_of(path).unwrap_or(0));
        Ok(checkpoints)
    }

    fn rotate_checkpoints(&mut self) -> TrainerResult<()> {
        while self.checkpoints.len() > self.keep_last_n {
            let oldest = self.checkpoints.remove(0);
            std::fs::remove_file(&oldest).map_err(|e| {
                TrainerError::checkpoint(format!(
                    "Failed to delete old checkpoint {}: {e}",
                    oldest.display()
                ))
            })?;
        }
        Ok(())
    }
}

/// Writes through a temporary file so a crash never leaves a truncated file.
fn write_json<T: Serialize>(value: &T, path: &Path) -> TrainerResult<()> {
    let tmp = path.with_extension("json.tmp");
    let file = File::create(&tmp)
        .map_err(|e| TrainerError::checkpoint(format!("Failed to create {}: {e}", tmp.display())))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| TrainerError::checkpoint(format!("Failed to serialize: {e}")))?;
    writer
        .flush()
        .map_err(|e| TrainerError::checkpoint(format!("Failed to write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| TrainerError::checkpoint(format!("Failed to move {}: {e}", path.display())))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> TrainerResult<T> {
    let file = File::open(path)
        .map_err(|e| TrainerError::checkpoint(format!("Failed to open {}: {e}", path.display())))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| TrainerError::checkpoint(format!("Failed to deserialize: {e}")))
}
