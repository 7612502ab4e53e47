//! # rl-trainer-rs
//!
//! Epoch-based training orchestrator for reinforcement learning agents under
//! three regimes: on-policy, off-policy and offline.
//!
//! ## Overview
//!
//! The trainer alternates between gathering experience and updating model
//! parameters. It owns the progress counters, decides when to collect, when
//! to update, when to test and when to stop, and keeps a snapshot of the best
//! model seen so far. The learning algorithm, the environment collectors and
//! the experience container are supplied by the caller through the
//! [`Algorithm`], [`Collector`] and [`ExperienceSource`] traits.
//!
//! ## Lifecycle
//!
//! ```text
//!   build ──▶ reset ──▶ execute_epoch ──▶ execute_epoch ──▶ ...
//!                          │
//!                          ▼
//!              ┌───────────────────────┐
//!              │ regime inner loop     │  on-policy : collect ─▶ N updates ─▶ discard
//!              │ (EpochRunner)         │  off-policy: collect ─▶ sample ─▶ update
//!              │                       │  offline   : sample ─▶ update
//!              └──────────┬────────────┘
//!                         ▼
//!                  test (scheduled) ──▶ score ──▶ best model?
//! ```
//!
//! [`Trainer::run`] drives the loop and stops early once the stop criterion
//! accepts a freshly computed score. [`Trainer::execute_epoch`] never stops on
//! its own; manual callers check [`Trainer::stop_criterion_met`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rl_trainer_rs::prelude::*;
//!
//! let config = TrainerConfig::builder(Regime::OffPolicy)
//!     .max_epochs(10)
//!     .epoch_num_steps(10_000)
//!     .collection_step_num_env_steps(10)
//!     .update_per_step(0.1)
//!     .batch_size(64)
//!     .build();
//!
//! let mut trainer = Trainer::builder(config, algorithm)
//!     .train_collector(train_collector)
//!     .test_collector(test_collector)
//!     .stop_fn(scoring::reward_threshold(195.0))
//!     .build()?;
//!
//! let stats = trainer.run(RunOptions::default())?;
//! println!("best: {:?}", stats.best);
//! ```
//!
//! ## Architecture
//!
//! - [`config`] - Trainer configuration and validation
//! - [`error`] - Error types
//! - [`state`] - Progress counters and the update context
//! - [`metrics`] - Collection/update statistics and their aggregation
//! - [`scoring`] - Score functions and stop criteria
//! - [`regime`] - Per-regime epoch state machines
//! - [`trainer`] - The orchestrator
//! - [`checkpoint`] - Best-model records and checkpoint files
//! - [`logger`] - Scalar logging sinks

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod regime;
pub mod scoring;
pub mod state;
pub mod trainer;

pub use checkpoint::{BestModelRecord, CheckpointManager, TrainingCheckpoint};
pub use config::{CheckpointConfig, Regime, TrainerConfig};
pub use error::{TrainerError, TrainerResult};
pub use logger::{LogRecord, LogScope, MemoryLogger, TracingLogger, TrainingLogger};
pub use metrics::{
    CollectStats, CollectSummary, EpochResult, FinalStats, SequenceSummary, UpdateStats,
    UpdateSummary,
};
pub use scoring::{ScoreFn, StopFn};
pub use state::{CollectMode, TrainingState, UpdateContext};
pub use trainer::{RunOptions, Trainer, TrainerBuilder};

use serde::{Deserialize, Serialize};

/// How much experience a single collection call should gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectRequest {
    /// Take this many env steps; episodes may be left unfinished.
    Steps(usize),
    /// Run this many full episodes.
    Episodes(usize),
}

/// Gathers experience by stepping environments with the current policy.
///
/// # Contract
///
/// - `collect` blocks until the requested amount is gathered. In
///   [`CollectMode::Train`] the experience is added to the collector's buffer.
/// - The returned [`CollectStats`] must report absent return/length summaries
///   when no episode finished during the call.
/// - Errors are returned as [`TrainerError::Collection`] (see
///   [`TrainerError::collection`]); the trainer propagates them unchanged.
///
/// Collectors may step many environments in parallel internally; the trainer
/// only ever sees one synchronous call at a time.
pub trait Collector: Send {
    /// Gathers experience.
    fn collect(&mut self, request: CollectRequest, mode: CollectMode) -> TrainerResult<CollectStats>;

    /// Resets environment state and/or discards buffered experience.
    fn reset(&mut self, reset_env: bool, reset_buffer: bool) -> TrainerResult<()>;

    /// Releases environment resources.
    fn close(&mut self) -> TrainerResult<()> {
        Ok(())
    }
}

/// A store of experience that batches can be drawn from.
///
/// Implemented by training collectors (their replay buffer) and by the
/// fixed datasets of the offline regime.
pub trait ExperienceSource<B>: Send {
    /// Draws a batch. `None` returns everything currently stored.
    fn sample(&mut self, batch_size: Option<usize>) -> TrainerResult<B>;

    /// Number of stored transitions.
    fn len(&self) -> usize;

    /// Returns whether nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A collector whose buffer can also be sampled.
pub trait TrainCollector<B>: Collector + ExperienceSource<B> {}

impl<B, T> TrainCollector<B> for T where T: Collector + ExperienceSource<B> {}

/// The learning algorithm driven by the trainer.
///
/// # Why Three Calls?
///
/// `preprocess_batch` computes per-batch quantities (returns, advantages,
/// n-step targets) once, `update` performs one parameter update, and
/// `postprocess_batch` writes back anything the buffer needs (e.g. priority
/// weights). Each `update` call counts as exactly one update step no matter
/// how many gradient steps the algorithm takes inside it.
///
/// # Example
///
/// ```rust,ignore
/// impl Algorithm<MyBatch> for MyDqn {
///     fn update(&mut self, batch: &MyBatch, ctx: &UpdateContext) -> TrainerResult<UpdateStats> {
///         let loss = self.learn(batch, ctx.minibatch_size).map_err(TrainerError::update)?;
///         Ok(UpdateStats::new().with("loss", loss))
///     }
///
///     fn state_dict(&self) -> TrainerResult<serde_json::Value> { ... }
///     fn load_state_dict(&mut self, state: &serde_json::Value) -> TrainerResult<()> { ... }
/// }
/// ```
pub trait Algorithm<B>: Send {
    /// Prepares a freshly drawn batch.
    fn preprocess_batch(&mut self, batch: B, _ctx: &UpdateContext) -> TrainerResult<B> {
        Ok(batch)
    }

    /// Performs one update on `batch`.
    ///
    /// `ctx.pass`/`ctx.num_passes` tell the algorithm which of the repeated
    /// passes over the same batch this is; `ctx.minibatch_size` the requested
    /// mini-batch size.
    fn update(&mut self, batch: &B, ctx: &UpdateContext) -> TrainerResult<UpdateStats>;

    /// Finishes with a batch after all its updates.
    fn postprocess_batch(&mut self, _batch: B, _ctx: &UpdateContext) -> TrainerResult<()> {
        Ok(())
    }

    /// Serializable snapshot of parameters and optimizer state.
    fn state_dict(&self) -> TrainerResult<serde_json::Value>;

    /// Restores a snapshot produced by [`Algorithm::state_dict`].
    fn load_state_dict(&mut self, state: &serde_json::Value) -> TrainerResult<()>;
}

/// Prelude module for convenient imports.
///
/// ```rust
/// use rl_trainer_rs::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        scoring, Algorithm, BestModelRecord, CollectMode, CollectRequest, CollectStats, Collector,
        EpochResult, ExperienceSource, FinalStats, Regime, RunOptions, TrainCollector, Trainer,
        TrainerConfig, TrainerError, TrainerResult, TrainingState, UpdateContext, UpdateStats,
    };
}
