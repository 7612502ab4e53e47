//! Configuration types for the training orchestrator.
//!
//! A single flat [`TrainerConfig`] describes every regime. Regime-specific
//! parameters are optional fields, and [`TrainerConfig::validate`] rejects any
//! parameter that does not apply to the selected [`Regime`] instead of
//! silently ignoring it.
//!
//! # Example
//!
//! ```rust
//! use rl_trainer_rs::config::{Regime, TrainerConfig};
//!
//! // Off-policy: 10 env steps per collection, one update per 10 steps
//! let config = TrainerConfig::builder(Regime::OffPolicy)
//!     .max_epochs(10)
//!     .epoch_num_steps(10_000)
//!     .collection_step_num_env_steps(10)
//!     .update_per_step(0.1)
//!     .batch_size(64)
//!     .warmup_buffer_size(1000)
//!     .build();
//! assert!(config.validate().is_ok());
//!
//! // Loading from file
//! // let config = TrainerConfig::from_file("trainer.toml")?;
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{TrainerError, TrainerResult};

/// Training regime, fixed for the lifetime of a trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    /// Collected data is consumed by the update passes once, then discarded.
    OnPolicy,
    /// Collected data is kept in a replay buffer and resampled.
    OffPolicy,
    /// No collection at all; updates sample a fixed dataset.
    Offline,
}

impl Regime {
    /// Returns a human-readable name for the regime.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Regime::OnPolicy => "on_policy",
            Regime::OffPolicy => "off_policy",
            Regime::Offline => "offline",
        }
    }

    /// Returns whether the regime gathers live experience.
    #[must_use]
    pub fn collects(&self) -> bool {
        !matches!(self, Regime::Offline)
    }
}

/// Main configuration for the trainer.
///
/// # Defaults
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `max_epochs` | 100 | Epochs run by `run` when no count is given |
/// | `epoch_num_steps` | 30000 | Env steps (or updates, offline) per epoch |
/// | `update_step_num_repetitions` | unset | On-policy update passes per collection (1 if unset) |
/// | `update_per_step` | unset | Off-policy updates per collected step (1.0 if unset) |
/// | `test_interval` | 1 | Test every N epochs |
/// | `test_step_num_episodes` | 10 | Episodes per test pass |
/// | `test_in_train` | false | Early test when training returns look good |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// The training regime.
    pub regime: Regime,

    /// Number of epochs `run` executes when no explicit count is given.
    #[serde(default = "default_max_epochs")]
    pub max_epochs: u64,

    /// Per-epoch budget.
    ///
    /// Environment steps for the on-/off-policy regimes, update calls for the
    /// offline regime.
    #[serde(default = "default_epoch_num_steps")]
    pub epoch_num_steps: u64,

    /// Mini-batch size handed to the algorithm.
    ///
    /// Required off-policy and offline. On-policy, `None` means the whole
    /// collected batch is one mini-batch.
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Env steps gathered per collection call (on-/off-policy).
    #[serde(default)]
    pub collection_step_num_env_steps: Option<usize>,

    /// Full episodes gathered per collection call (on-policy only).
    #[serde(default)]
    pub collection_step_num_episodes: Option<usize>,

    /// Update calls issued over each collected batch (on-policy only).
    #[serde(default)]
    pub update_step_num_repetitions: Option<usize>,

    /// Update calls per collected env step (off-policy only).
    #[serde(default)]
    pub update_per_step: Option<f64>,

    /// Buffer size below which collection runs without updates (off-policy only).
    #[serde(default)]
    pub warmup_buffer_size: Option<usize>,

    /// Run a test pass every N epochs.
    #[serde(default = "default_test_interval")]
    pub test_interval: u64,

    /// Episodes collected per test pass.
    #[serde(default = "default_test_step_num_episodes")]
    pub test_step_num_episodes: usize,

    /// Test as soon as training returns satisfy the stop criterion.
    #[serde(default)]
    pub test_in_train: bool,

    /// Checkpoint configuration.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

fn default_max_epochs() -> u64 {
    100
}
fn default_epoch_num_steps() -> u64 {
    30_000
}
fn default_test_interval() -> u64 {
    1
}
fn default_test_step_num_episodes() -> usize {
    10
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self::for_regime(Regime::OffPolicy)
    }
}

impl TrainerConfig {
    /// Creates a configuration for `regime` with defaults that pass validation.
    #[must_use]
    pub fn for_regime(regime: Regime) -> Self {
        let mut config = Self {
            regime,
            max_epochs: default_max_epochs(),
            epoch_num_steps: default_epoch_num_steps(),
            batch_size: None,
            collection_step_num_env_steps: None,
            collection_step_num_episodes: None,
            update_step_num_repetitions: None,
            update_per_step: None,
            warmup_buffer_size: None,
            test_interval: default_test_interval(),
            test_step_num_episodes: default_test_step_num_episodes(),
            test_in_train: false,
            checkpoint: CheckpointConfig::default(),
        };
        match regime {
            Regime::OnPolicy => {
                config.collection_step_num_env_steps = Some(2048);
                config.update_step_num_repetitions = Some(1);
            }
            Regime::OffPolicy => {
                config.collection_step_num_env_steps = Some(10);
                config.update_per_step = Some(1.0);
                config.batch_size = Some(64);
            }
            Regime::Offline => {
                config.batch_size = Some(64);
            }
        }
        config
    }

    /// Creates a new configuration builder for the given regime.
    #[must_use]
    pub fn builder(regime: Regime) -> TrainerConfigBuilder {
        TrainerConfigBuilder::new(regime)
    }

    /// Loads configuration from a TOML file.
    ///
    /// The loaded configuration is validated before it is returned.
    pub fn from_file<P: AsRef<Path>>(path: P) -> TrainerResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TrainerError::config(format!("Failed to read config file: {e}")))?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> TrainerResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TrainerError::config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> TrainerResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TrainerError::config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| TrainerError::config(format!("Failed to write config file: {e}")))
    }

    /// Update calls per on-policy collection.
    #[must_use]
    pub fn repetitions(&self) -> usize {
        self.update_step_num_repetitions.unwrap_or(1)
    }

    /// Off-policy update ratio.
    #[must_use]
    pub fn updates_per_step(&self) -> f64 {
        self.update_per_step.unwrap_or(1.0)
    }

    /// Validates the configuration.
    ///
    /// Checks value ranges and rejects every parameter that does not apply
    /// to the configured regime.
    pub fn validate(&self) -> TrainerResult<()> {
        if self.max_epochs == 0 {
            return Err(TrainerError::config("max_epochs must be > 0"));
        }
        if self.epoch_num_steps == 0 {
            return Err(TrainerError::config("epoch_num_steps must be > 0"));
        }
        if self.test_interval == 0 {
            return Err(TrainerError::config("test_interval must be > 0"));
        }
        if self.test_step_num_episodes == 0 {
            return Err(TrainerError::config("test_step_num_episodes must be > 0"));
        }
        if self.batch_size == Some(0) {
            return Err(TrainerError::config("batch_size must be > 0 when set"));
        }

        match self.regime {
            Regime::OnPolicy => self.validate_on_policy(),
            Regime::OffPolicy => self.validate_off_policy(),
            Regime::Offline => self.validate_offline(),
        }?;

        self.checkpoint.validate()
    }

    fn validate_on_policy(&self) -> TrainerResult<()> {
        match (
            self.collection_step_num_env_steps,
            self.collection_step_num_episodes,
        ) {
            (Some(_), Some(_)) => {
                return Err(TrainerError::config(
                    "on_policy: set only one of collection_step_num_env_steps and collection_step_num_episodes",
                ))
            }
            (None, None) => {
                return Err(TrainerError::config(
                    "on_policy: one of collection_step_num_env_steps or collection_step_num_episodes is required",
                ))
            }
            (Some(0), None) | (None, Some(0)) => {
                return Err(TrainerError::config(
                    "on_policy: collection size must be > 0",
                ))
            }
            _ => {}
        }
        if self.update_step_num_repetitions == Some(0) {
            return Err(TrainerError::config(
                "on_policy: update_step_num_repetitions must be > 0",
            ));
        }
        self.reject(self.update_per_step.is_some(), "update_per_step")?;
        self.reject(self.warmup_buffer_size.is_some(), "warmup_buffer_size")
    }

    fn validate_off_policy(&self) -> TrainerResult<()> {
        match self.collection_step_num_env_steps {
            None => {
                return Err(TrainerError::config(
                    "off_policy: collection_step_num_env_steps is required",
                ))
            }
            Some(0) => {
                return Err(TrainerError::config(
                    "off_policy: collection_step_num_env_steps must be > 0",
                ))
            }
            Some(_) => {}
        }
        if self.batch_size.is_none() {
            return Err(TrainerError::config("off_policy: batch_size is required"));
        }
        if let Some(ratio) = self.update_per_step {
            if !(ratio > 0.0 && ratio.is_finite()) {
                return Err(TrainerError::config(
                    "off_policy: update_per_step must be a positive finite number",
                ));
            }
        }
        self.reject(
            self.collection_step_num_episodes.is_some(),
            "collection_step_num_episodes",
        )?;
        self.reject(
            self.update_step_num_repetitions.is_some(),
            "update_step_num_repetitions",
        )
    }

    fn validate_offline(&self) -> TrainerResult<()> {
        if self.batch_size.is_none() {
            return Err(TrainerError::config("offline: batch_size is required"));
        }
        self.reject(
            self.collection_step_num_env_steps.is_some(),
            "collection_step_num_env_steps",
        )?;
        self.reject(
            self.collection_step_num_episodes.is_some(),
            "collection_step_num_episodes",
        )?;
        self.reject(
            self.update_step_num_repetitions.is_some(),
            "update_step_num_repetitions",
        )?;
        self.reject(self.update_per_step.is_some(), "update_per_step")?;
        self.reject(self.warmup_buffer_size.is_some(), "warmup_buffer_size")?;
        self.reject(self.test_in_train, "test_in_train")
    }

    fn reject(&self, present: bool, parameter: &str) -> TrainerResult<()> {
        if present {
            Err(TrainerError::config(format!(
                "{parameter} does not apply to the {} regime",
                self.regime.name()
            )))
        } else {
            Ok(())
        }
    }
}

/// Builder for [`TrainerConfig`].
///
/// Starts from [`TrainerConfig::for_regime`]. Setting a collection parameter
/// replaces the regime's default collection mode.
#[derive(Debug)]
pub struct TrainerConfigBuilder {
    config: TrainerConfig,
}

impl TrainerConfigBuilder {
    fn new(regime: Regime) -> Self {
        Self {
            config: TrainerConfig::for_regime(regime),
        }
    }

    /// Sets the number of epochs.
    #[must_use]
    pub fn max_epochs(mut self, epochs: u64) -> Self {
        self.config.max_epochs = epochs;
        self
    }

    /// Sets the per-epoch budget.
    #[must_use]
    pub fn epoch_num_steps(mut self, steps: u64) -> Self {
        self.config.epoch_num_steps = steps;
        self
    }

    /// Sets the mini-batch size.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = Some(size);
        self
    }

    /// Collects `steps` env steps per collection call.
    #[must_use]
    pub fn collection_step_num_env_steps(mut self, steps: usize) -> Self {
        self.config.collection_step_num_env_steps = Some(steps);
        self.config.collection_step_num_episodes = None;
        self
    }

    /// Collects `episodes` full episodes per collection call.
    #[must_use]
    pub fn collection_step_num_episodes(mut self, episodes: usize) -> Self {
        self.config.collection_step_num_episodes = Some(episodes);
        self.config.collection_step_num_env_steps = None;
        self
    }

    /// Sets the on-policy update passes per collection.
    #[must_use]
    pub fn update_step_num_repetitions(mut self, repetitions: usize) -> Self {
        self.config.update_step_num_repetitions = Some(repetitions);
        self
    }

    /// Sets the off-policy update ratio.
    #[must_use]
    pub fn update_per_step(mut self, ratio: f64) -> Self {
        self.config.update_per_step = Some(ratio);
        self
    }

    /// Sets the off-policy warm-up buffer size.
    #[must_use]
    pub fn warmup_buffer_size(mut self, size: usize) -> Self {
        self.config.warmup_buffer_size = Some(size);
        self
    }

    /// Tests every `interval` epochs.
    #[must_use]
    pub fn test_interval(mut self, interval: u64) -> Self {
        self.config.test_interval = interval;
        self
    }

    /// Sets the number of episodes per test pass.
    #[must_use]
    pub fn test_step_num_episodes(mut self, episodes: usize) -> Self {
        self.config.test_step_num_episodes = episodes;
        self
    }

    /// Enables or disables test-in-train.
    #[must_use]
    pub fn test_in_train(mut self, enabled: bool) -> Self {
        self.config.test_in_train = enabled;
        self
    }

    /// Sets the checkpoint configuration.
    #[must_use]
    pub fn checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.config.checkpoint = checkpoint;
        self
    }

    /// Builds the configuration. Call [`TrainerConfig::validate`] (or build a
    /// trainer, which validates) to check it.
    #[must_use]
    pub fn build(self) -> TrainerConfig {
        self.config
    }
}

/// Configuration for checkpointing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory for checkpoint files. Nothing is written when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Save a checkpoint every N epochs (0 disables periodic checkpoints).
    #[serde(default)]
    pub save_interval: u64,

    /// Number of periodic checkpoints to keep.
    #[serde(default = "default_keep_last_n")]
    pub keep_last_n: usize,

    /// Write `best_model.json` whenever the best score improves.
    #[serde(default = "default_save_best")]
    pub save_best: bool,
}

fn default_keep_last_n() -> usize {
    3
}
fn default_save_best() -> bool {
    true
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: None,
            save_interval: 0,
            keep_last_n: default_keep_last_n(),
            save_best: default_save_best(),
        }
    }
}

impl CheckpointConfig {
    /// Checkpoints written to `dir`.
    #[must_use]
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Returns whether anything will be written to disk.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.dir.is_some() && (self.save_interval > 0 || self.save_best)
    }

    fn validate(&self) -> TrainerResult<()> {
        if self.dir.is_none() && self.save_interval > 0 {
            return Err(TrainerError::config(
                "checkpoint.save_interval requires checkpoint.dir",
            ));
        }
        if self.save_interval > 0 && self.keep_last_n == 0 {
            return Err(TrainerError::config(
                "checkpoint.keep_last_n must be > 0 when periodic checkpoints are enabled",
            ));
        }
        Ok(())
    }
}
