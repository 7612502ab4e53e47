//! Write-only logging sinks for training scalars.
//!
//! The trainer emits one [`LogRecord`] per training collection, update call,
//! test pass and epoch. Records are keyed by `update_step`, the progress
//! measure shared by every regime. The trainer never reads a logger back.
//!
//! Absent statistics (e.g. the mean return of a collection that finished no
//! episode) are left out of the record rather than written as zero.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::metrics::{CollectStats, EpochResult, UpdateStats};

/// Where a record comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogScope {
    /// A training collection call.
    TrainCollect,
    /// An update call.
    Update,
    /// A test pass.
    Test,
    /// End-of-epoch summary.
    Epoch,
}

impl fmt::Display for LogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogScope::TrainCollect => "train",
            LogScope::Update => "update",
            LogScope::Test => "test",
            LogScope::Epoch => "epoch",
        };
        f.write_str(name)
    }
}

/// One batch of scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Origin of the scalars.
    pub scope: LogScope,
    /// Update step the record is keyed by.
    pub update_step: u64,
    /// Epoch in progress.
    pub epoch: u64,
    /// Named values.
    pub scalars: BTreeMap<String, f64>,
}

impl LogRecord {
    fn new(scope: LogScope, epoch: u64, update_step: u64) -> Self {
        Self {
            scope,
            update_step,
            epoch,
            scalars: BTreeMap::new(),
        }
    }

    fn put(&mut self, name: &str, value: Option<f64>) {
        if let Some(value) = value {
            self.scalars.insert(name.to_string(), value);
        }
    }

    /// Record for a collection call (training or test).
    #[must_use]
    pub fn from_collect(scope: LogScope, epoch: u64, update_step: u64, stats: &CollectStats) -> Self {
        let mut record = Self::new(scope, epoch, update_step);
        record.put("n_collected_steps", Some(stats.n_collected_steps as f64));
        record.put("n_collected_episodes", Some(stats.n_collected_episodes as f64));
        record.put("returns_mean", stats.returns.map(|r| r.mean));
        record.put("returns_std", stats.returns.map(|r| r.std));
        record.put("lens_mean", stats.lens.map(|l| l.mean));
        record
    }

    /// Record for an update call.
    #[must_use]
    pub fn from_update(epoch: u64, update_step: u64, stats: &UpdateStats) -> Self {
        let mut record = Self::new(LogScope::Update, epoch, update_step);
        record.scalars.extend(stats.scalars.clone());
        record
    }

    /// Record for an epoch summary.
    #[must_use]
    pub fn from_epoch(result: &EpochResult) -> Self {
        let mut record = Self::new(LogScope::Epoch, result.epoch, result.update_step);
        record.put("env_step", result.env_step.map(|s| s as f64));
        record.put("num_updates", Some(result.update.num_updates as f64));
        record.put(
            "train_returns_mean",
            result.train_collect.as_ref().and_then(|c| c.returns_mean()),
        );
        record.put("score", result.score);
        record.put("epoch_secs", Some(result.timing.total_secs));
        record
    }
}

/// Sink for training scalars.
pub trait TrainingLogger: Send {
    /// Writes one record.
    fn write(&mut self, record: &LogRecord);

    /// Flushes buffered output. Called at the end of every epoch.
    fn flush(&mut self) {}
}

/// Emits records as `tracing` events under the `rl_trainer_rs::scalars` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl TrainingLogger for TracingLogger {
    fn write(&mut self, record: &LogRecord) {
        match record.scope {
            LogScope::Epoch | LogScope::Test => tracing::info!(
                target: "rl_trainer_rs::scalars",
                scope = %record.scope,
                epoch = record.epoch,
                update_step = record.update_step,
                scalars = ?record.scalars,
            ),
            LogScope::TrainCollect | LogScope::Update => tracing::trace!(
                target: "rl_trainer_rs::scalars",
                scope = %record.scope,
                epoch = record.epoch,
                update_step = record.update_step,
                scalars = ?record.scalars,
            ),
        }
    }
}

/// Keeps every record in memory; clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogger {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryLogger {
    /// Creates an empty logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all records so far.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Returns the records of one scope.
    #[must_use]
    pub fn records_for(&self, scope: LogScope) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.scope == scope)
            .cloned()
            .collect()
    }

    /// Exports all records as a JSON array.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.records.lock())
    }
}

impl TrainingLogger for MemoryLogger {
    fn write(&mut self, record: &LogRecord) {
        self.records.lock().push(record.clone());
    }
}
