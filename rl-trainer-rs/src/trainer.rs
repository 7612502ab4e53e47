//! The training orchestrator.
//!
//! [`Trainer`] owns the progress counters, the best-model record and the
//! epoch schedule. Everything regime-specific lives in the
//! [`EpochRunner`](crate::regime::EpochRunner) it was built with.
//!
//! # Epoch Commit
//!
//! An epoch runs against a working copy of the [`TrainingState`]. The copy is
//! committed only once the whole epoch (including its test pass) succeeded,
//! so a failing collector or algorithm leaves the counters of the last
//! completed epoch untouched. Updates already applied by the algorithm are
//! not rolled back; the algorithm owns its parameters.
//!
//! # Stopping
//!
//! [`Trainer::run`] stops after the epoch whose score satisfies the stop
//! criterion. [`Trainer::execute_epoch`] never stops on its own: callers
//! driving epochs by hand ask [`Trainer::stop_criterion_met`].

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::checkpoint::{BestModelRecord, CheckpointManager, TrainingCheckpoint};
use crate::config::{Regime, TrainerConfig};
use crate::error::{TrainerError, TrainerResult};
use crate::logger::{LogRecord, TracingLogger, TrainingLogger};
use crate::metrics::{BestSummary, CollectStats, EpochResult, FinalStats, TimingStats};
use crate::regime::{EpochRunner, EpochSession, Tester};
use crate::scoring::{self, ScoreFn, StopFn};
use crate::state::TrainingState;
use crate::{Algorithm, Collector, ExperienceSource, TrainCollector};

/// Callback invoked with every new best-model record.
pub type SaveBestFn = Box<dyn FnMut(&BestModelRecord) -> TrainerResult<()> + Send>;

/// Hook called with `(epoch, env_step)` ahead of training or test
/// collection, e.g. to anneal exploration. `env_step` is `None` offline.
pub type EpochHookFn = Box<dyn FnMut(u64, Option<u64>) + Send>;

/// Options for [`Trainer::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Reset collector environments before the first epoch.
    pub reset_collectors: bool,
    /// Discard buffered experience before the first epoch.
    pub reset_collector_buffers: bool,
    /// Epochs to run; `None` uses `max_epochs` from the configuration.
    pub num_epochs: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            reset_collectors: true,
            reset_collector_buffers: true,
            num_epochs: None,
        }
    }
}

impl RunOptions {
    /// Default options running exactly `num_epochs` epochs.
    #[must_use]
    pub fn epochs(num_epochs: u64) -> Self {
        Self {
            num_epochs: Some(num_epochs),
            ..Self::default()
        }
    }
}

/// Epoch-based training orchestrator.
///
/// # Example
///
/// ```rust,ignore
/// let mut trainer = Trainer::builder(config, algorithm)
///     .train_collector(train_collector)
///     .test_collector(test_collector)
///     .stop_fn(scoring::reward_threshold(195.0))
///     .build()?;
///
/// // Drive epochs manually
/// trainer.reset(true, true)?;
/// for _ in 0..10 {
///     let result = trainer.execute_epoch()?;
///     if trainer.stop_criterion_met(&result)? {
///         break;
///     }
/// }
/// ```
pub struct Trainer<A, B> {
    /// The algorithm being trained.
    ///
    /// Shared so collectors can act with the current policy; the trainer
    /// locks it only around its own algorithm calls.
    algorithm: Arc<Mutex<A>>,

    /// Validated configuration.
    config: TrainerConfig,

    /// Regime-specific inner loop and the training experience it owns.
    runner: EpochRunner<B>,

    /// Test collector and score function.
    tester: Option<Tester>,

    /// Stop criterion.
    stop_fn: Option<StopFn>,

    /// Best-model callback.
    save_best_fn: Option<SaveBestFn>,

    /// Hook run before every training collection (offline: every update).
    train_fn: Option<EpochHookFn>,

    /// Scalar sink.
    logger: Box<dyn TrainingLogger>,

    /// Checkpoint writer (optional).
    checkpoint_manager: Option<CheckpointManager>,

    /// Progress counters; `None` until `reset`.
    state: Option<TrainingState>,

    /// Best model seen since the last `reset`.
    best: Option<BestModelRecord>,

    /// Whether test-in-train is active for the current run.
    test_in_train: bool,

    /// Timing accumulated since the last `reset`.
    timing: TimingStats,

    /// Most recent test pass since the last `reset`.
    last_test: Option<CollectStats>,
}

impl<A, B> Trainer<A, B>
where
    A: Algorithm<B>,
{
    /// Starts building a trainer for `algorithm`.
    #[must_use]
    pub fn builder(config: TrainerConfig, algorithm: A) -> TrainerBuilder<A, B> {
        TrainerBuilder::new(config, Arc::new(Mutex::new(algorithm)))
    }

    /// Starts building a trainer around an algorithm that is already shared,
    /// typically with the collectors.
    #[must_use]
    pub fn builder_shared(config: TrainerConfig, algorithm: Arc<Mutex<A>>) -> TrainerBuilder<A, B> {
        TrainerBuilder::new(config, algorithm)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Returns the training regime.
    #[must_use]
    pub fn regime(&self) -> Regime {
        self.config.regime
    }

    /// Returns the progress counters, or `None` before the first `reset`.
    #[must_use]
    pub fn state(&self) -> Option<&TrainingState> {
        self.state.as_ref()
    }

    /// Returns the best-model record since the last `reset`.
    #[must_use]
    pub fn best(&self) -> Option<&BestModelRecord> {
        self.best.as_ref()
    }

    /// Returns whether test-in-train is active for the current run.
    #[must_use]
    pub fn test_in_train_active(&self) -> bool {
        self.test_in_train
    }

    /// Locks and returns the algorithm.
    pub fn algorithm(&self) -> MutexGuard<'_, A> {
        self.algorithm.lock()
    }

    /// Returns a shared handle to the algorithm.
    #[must_use]
    pub fn algorithm_handle(&self) -> Arc<Mutex<A>> {
        Arc::clone(&self.algorithm)
    }

    /// Prepares a new run.
    ///
    /// Resets the collectors as requested, zeroes the counters, clears the
    /// best-model record and decides whether test-in-train is active. With
    /// `reset_collectors == false` no collector environment is reset.
    pub fn reset(&mut self, reset_collectors: bool, reset_collector_buffers: bool) -> TrainerResult<()> {
        if reset_collectors || reset_collector_buffers {
            self.runner.reset(reset_collectors, reset_collector_buffers)?;
            if let Some(tester) = self.tester.as_mut() {
                tester.reset(reset_collectors, reset_collector_buffers)?;
            }
        }

        self.state = Some(TrainingState::new(self.config.regime));
        self.best = None;
        self.timing = TimingStats::default();
        self.last_test = None;
        self.test_in_train = self.resolve_test_in_train();

        info!(
            regime = self.config.regime.name(),
            reset_collectors,
            reset_collector_buffers,
            test_in_train = self.test_in_train,
            "trainer reset"
        );
        Ok(())
    }

    /// Runs exactly one epoch and returns its statistics.
    ///
    /// # Errors
    ///
    /// - [`TrainerError::Config`] if called before [`Trainer::reset`]
    /// - Any collector or algorithm error, unchanged. The counters then stay
    ///   at the last completed epoch.
    pub fn execute_epoch(&mut self) -> TrainerResult<EpochResult> {
        let Some(mut state) = self.state.clone() else {
            return Err(TrainerError::config(
                "execute_epoch called before reset",
            ));
        };
        state.epoch += 1;

        let in_train_stop = if self.test_in_train {
            self.stop_fn.as_ref()
        } else {
            None
        };
        let session = EpochSession::new(
            &self.config,
            &mut state,
            &self.algorithm,
            self.tester.as_mut(),
            in_train_stop,
            self.train_fn.as_mut(),
            self.logger.as_mut(),
        );
        let mut result = self.runner.run_epoch(session)?;

        let mut new_best = None;
        if let Some(score) = result.score {
            if state.offer_score(score) {
                result.is_new_best = true;
                new_best = Some(BestModelRecord {
                    score,
                    epoch: state.epoch,
                    update_step: state.update_step,
                    env_step: state.env_step,
                    state: self.algorithm.lock().state_dict()?,
                });
            }
        }

        // Commit
        let epoch = state.epoch;
        self.state = Some(state);
        self.timing.accumulate(&result.timing);
        if result.test.is_some() {
            self.last_test.clone_from(&result.test);
        }

        if let Some(record) = new_best {
            info!(epoch, score = record.score, "new best model");
            let record = self.best.insert(record);
            if let Some(save_best) = self.save_best_fn.as_mut() {
                save_best(record)?;
            }
            if let Some(manager) = self.checkpoint_manager.as_ref() {
                manager.save_best(record)?;
            }
        }

        if self
            .checkpoint_manager
            .as_ref()
            .is_some_and(|m| m.should_save(epoch))
        {
            let checkpoint = self.checkpoint()?;
            if let Some(manager) = self.checkpoint_manager.as_mut() {
                let path = manager.save(&checkpoint)?;
                info!(epoch, path = %path.display(), "checkpoint saved");
            }
        }

        self.logger.write(&LogRecord::from_epoch(&result));
        self.logger.flush();
        info!(
            epoch,
            env_step = ?result.env_step,
            update_step = result.update_step,
            num_updates = result.update.num_updates,
            train_returns = ?result.train_collect.as_ref().and_then(|c| c.returns_mean()),
            score = ?result.score,
            best = ?self.best.as_ref().map(|b| (b.score, b.epoch)),
            secs = result.timing.total_secs,
            "epoch complete"
        );
        Ok(result)
    }

    /// Resets, then runs epochs until the budget is spent or the stop
    /// criterion accepts an epoch's score.
    pub fn run(&mut self, options: RunOptions) -> TrainerResult<FinalStats> {
        self.reset(options.reset_collectors, options.reset_collector_buffers)?;
        let num_epochs = options.num_epochs.unwrap_or(self.config.max_epochs);

        let mut epochs_completed = 0;
        let mut stopped_early = false;
        while epochs_completed < num_epochs {
            let result = self.execute_epoch()?;
            epochs_completed += 1;
            if result.stopped_in_train || self.score_meets_stop(result.score) {
                info!(
                    epoch = result.epoch,
                    score = ?result.score,
                    "stop criterion met"
                );
                stopped_early = true;
                break;
            }
        }

        let stats = self.final_stats(epochs_completed, stopped_early);
        info!(
            epochs = stats.epochs_completed,
            update_step = stats.update_step,
            stopped_early,
            best = ?stats.best.map(|b| b.score),
            "run finished"
        );
        Ok(stats)
    }

    /// Evaluates the stop criterion on an epoch's score.
    ///
    /// Always `Ok(false)` without a stop criterion.
    ///
    /// # Errors
    ///
    /// [`TrainerError::ScoringUnavailable`] if the epoch ran no test pass.
    pub fn stop_criterion_met(&self, result: &EpochResult) -> TrainerResult<bool> {
        let Some(stop) = self.stop_fn.as_ref() else {
            return Ok(false);
        };
        let score = result
            .score
            .ok_or(TrainerError::ScoringUnavailable { epoch: result.epoch })?;
        Ok(stop(score))
    }

    /// Builds a checkpoint of the current progress and algorithm state.
    ///
    /// # Errors
    ///
    /// [`TrainerError::Config`] before the first `reset`, or the algorithm's
    /// `state_dict` error.
    pub fn checkpoint(&self) -> TrainerResult<TrainingCheckpoint> {
        let state = self
            .state
            .clone()
            .ok_or_else(|| TrainerError::config("no training state before reset"))?;
        let algorithm_state = self.algorithm.lock().state_dict()?;
        Ok(TrainingCheckpoint::new(
            self.config.clone(),
            state,
            algorithm_state,
            self.best.clone(),
        ))
    }

    /// Writes a checkpoint of the current progress to `path`.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> TrainerResult<()> {
        self.checkpoint()?.save(path)
    }

    /// Resumes from a checkpoint.
    ///
    /// Restores the counters, the best-model record and the algorithm state.
    /// Collectors are left alone; call [`Trainer::reset`] first if they need
    /// resetting. Continue with [`Trainer::execute_epoch`].
    ///
    /// # Errors
    ///
    /// [`TrainerError::Config`] if the checkpoint was written for another
    /// regime, or the algorithm's `load_state_dict` error.
    pub fn restore_checkpoint(&mut self, checkpoint: &TrainingCheckpoint) -> TrainerResult<()> {
        if checkpoint.config.regime != self.config.regime {
            return Err(TrainerError::config(format!(
                "checkpoint was written for the {} regime, trainer runs {}",
                checkpoint.config.regime.name(),
                self.config.regime.name()
            )));
        }
        if checkpoint.config != self.config {
            warn!("checkpoint was written with a different configuration; keeping the current one");
        }

        self.algorithm
            .lock()
            .load_state_dict(&checkpoint.algorithm_state)?;
        self.state = Some(checkpoint.training_state.clone());
        self.best = checkpoint.best.clone();
        self.test_in_train = self.resolve_test_in_train();

        info!(
            epoch = checkpoint.training_state.epoch,
            update_step = checkpoint.training_state.update_step,
            timestamp = %checkpoint.metadata.timestamp,
            "restored checkpoint"
        );
        Ok(())
    }

    /// Closes every collector.
    pub fn close(&mut self) -> TrainerResult<()> {
        self.runner.close()?;
        if let Some(tester) = self.tester.as_mut() {
            tester.close()?;
        }
        Ok(())
    }

    fn score_meets_stop(&self, score: Option<f64>) -> bool {
        match (score, self.stop_fn.as_ref()) {
            (Some(score), Some(stop)) => stop(score),
            _ => false,
        }
    }

    fn resolve_test_in_train(&self) -> bool {
        if !self.config.test_in_train {
            return false;
        }
        if self.tester.is_some() && self.stop_fn.is_some() {
            return true;
        }
        warn!(
            has_test_collector = self.tester.is_some(),
            has_stop_fn = self.stop_fn.is_some(),
            "test_in_train needs both a test collector and a stop criterion; disabled for this run"
        );
        false
    }

    fn final_stats(&self, epochs_completed: u64, stopped_early: bool) -> FinalStats {
        let state = self
            .state
            .clone()
            .unwrap_or_else(|| TrainingState::new(self.config.regime));
        FinalStats {
            epochs_completed,
            epoch: state.epoch,
            env_step: state.env_step,
            env_episode: state.env_episode,
            update_step: state.update_step,
            best: self.best.as_ref().map(|b| BestSummary {
                score: b.score,
                epoch: b.epoch,
                update_step: b.update_step,
            }),
            stopped_early,
            last_test: self.last_test.clone(),
            timing: self.timing,
        }
    }
}

/// Builder for [`Trainer`].
///
/// [`TrainerBuilder::build`] validates the configuration and checks that the
/// supplied collaborators match the regime:
///
/// | Regime | Training collector | Dataset |
/// |--------|--------------------|---------|
/// | on-policy / off-policy | required | rejected |
/// | offline | rejected | required |
///
/// A stop criterion, a custom score function, a best-model callback and a
/// test hook all need a test collector, since only test passes produce
/// scores.
pub struct TrainerBuilder<A, B> {
    config: TrainerConfig,
    algorithm: Arc<Mutex<A>>,
    train_collector: Option<Box<dyn TrainCollector<B>>>,
    dataset: Option<Box<dyn ExperienceSource<B>>>,
    test_collector: Option<Box<dyn Collector>>,
    score_fn: Option<ScoreFn>,
    stop_fn: Option<StopFn>,
    save_best_fn: Option<SaveBestFn>,
    train_fn: Option<EpochHookFn>,
    test_fn: Option<EpochHookFn>,
    logger: Option<Box<dyn TrainingLogger>>,
}

impl<A, B> TrainerBuilder<A, B>
where
    A: Algorithm<B>,
{
    fn new(config: TrainerConfig, algorithm: Arc<Mutex<A>>) -> Self {
        Self {
            config,
            algorithm,
            train_collector: None,
            dataset: None,
            test_collector: None,
            score_fn: None,
            stop_fn: None,
            save_best_fn: None,
            train_fn: None,
            test_fn: None,
            logger: None,
        }
    }

    /// Sets the training collector (on-/off-policy).
    #[must_use]
    pub fn train_collector(mut self, collector: impl TrainCollector<B> + 'static) -> Self {
        self.train_collector = Some(Box::new(collector));
        self
    }

    /// Sets the fixed dataset (offline).
    #[must_use]
    pub fn dataset(mut self, dataset: impl ExperienceSource<B> + 'static) -> Self {
        self.dataset = Some(Box::new(dataset));
        self
    }

    /// Sets the test collector.
    #[must_use]
    pub fn test_collector(mut self, collector: impl Collector + 'static) -> Self {
        self.test_collector = Some(Box::new(collector));
        self
    }

    /// Sets the score function (default: [`scoring::mean_return`]).
    #[must_use]
    pub fn score_fn(mut self, score_fn: ScoreFn) -> Self {
        self.score_fn = Some(score_fn);
        self
    }

    /// Sets the stop criterion.
    #[must_use]
    pub fn stop_fn(mut self, stop_fn: StopFn) -> Self {
        self.stop_fn = Some(stop_fn);
        self
    }

    /// Sets a callback invoked with every new best-model record.
    #[must_use]
    pub fn save_best_fn(
        mut self,
        save_best: impl FnMut(&BestModelRecord) -> TrainerResult<()> + Send + 'static,
    ) -> Self {
        self.save_best_fn = Some(Box::new(save_best));
        self
    }

    /// Sets a hook called with `(epoch, env_step)` before every training
    /// collection. Offline there is no collection; the hook runs before
    /// every update instead, with `env_step == None`.
    #[must_use]
    pub fn train_fn(mut self, train_fn: impl FnMut(u64, Option<u64>) + Send + 'static) -> Self {
        self.train_fn = Some(Box::new(train_fn));
        self
    }

    /// Sets a hook called with `(epoch, env_step)` before every test pass,
    /// including test-in-train passes.
    #[must_use]
    pub fn test_fn(mut self, test_fn: impl FnMut(u64, Option<u64>) + Send + 'static) -> Self {
        self.test_fn = Some(Box::new(test_fn));
        self
    }

    /// Sets the scalar logger (default: [`TracingLogger`]).
    #[must_use]
    pub fn logger(mut self, logger: impl TrainingLogger + 'static) -> Self {
        self.logger = Some(Box::new(logger));
        self
    }

    /// Validates everything and builds the trainer.
    ///
    /// # Errors
    ///
    /// [`TrainerError::Config`] for an invalid configuration, collaborators
    /// that do not match the regime, or scoring hooks without a test
    /// collector. Checkpoint directory creation errors are returned as
    /// [`TrainerError::Checkpoint`].
    pub fn build(self) -> TrainerResult<Trainer<A, B>> {
        self.config.validate()?;

        if self.test_collector.is_none() {
            if self.stop_fn.is_some() {
                return Err(TrainerError::config(
                    "a stop criterion needs a test collector",
                ));
            }
            if self.score_fn.is_some() {
                return Err(TrainerError::config(
                    "a score function needs a test collector",
                ));
            }
            if self.save_best_fn.is_some() {
                return Err(TrainerError::config(
                    "a best-model callback needs a test collector",
                ));
            }
            if self.test_fn.is_some() {
                return Err(TrainerError::config("a test hook needs a test collector"));
            }
        }

        let runner = match (self.train_collector, self.dataset) {
            (Some(_), Some(_)) => {
                return Err(TrainerError::config(
                    "supply either a training collector or a dataset, not both",
                ))
            }
            (Some(collector), None) => EpochRunner::collecting(&self.config, collector)?,
            (None, Some(dataset)) => EpochRunner::offline(&self.config, dataset)?,
            (None, None) => {
                return Err(TrainerError::config(format!(
                    "the {} regime needs a {}",
                    self.config.regime.name(),
                    if self.config.regime.collects() {
                        "training collector"
                    } else {
                        "dataset"
                    }
                )))
            }
        };

        let score_fn = self.score_fn.unwrap_or_else(scoring::mean_return);
        let test_fn = self.test_fn;
        let tester = self
            .test_collector
            .map(|collector| Tester::new(collector, &self.config, score_fn, test_fn));
        let checkpoint_manager = CheckpointManager::from_config(&self.config.checkpoint)?;

        Ok(Trainer {
            algorithm: self.algorithm,
            config: self.config,
            runner,
            tester,
            stop_fn: self.stop_fn,
            save_best_fn: self.save_best_fn,
            train_fn: self.train_fn,
            logger: self.logger.unwrap_or_else(|| Box::new(TracingLogger)),
            checkpoint_manager,
            state: None,
            best: None,
            test_in_train: false,
            timing: TimingStats::default(),
            last_test: None,
        })
    }
}
