//! Per-regime epoch state machines.
//!
//! An [`EpochRunner`] owns the experience side of a trainer (the training
//! collector or the offline dataset) and drives one epoch's inner loop. The
//! three regimes differ only in what happens between collections:
//!
//! ```text
//! ON-POLICY   ┌─▶ COLLECT ──▶ UPDATE ×repetitions ──▶ DISCARD ─┐
//!             └──────────────(budget left)─────────────────────┘
//!
//! OFF-POLICY  ┌─▶ COLLECT ──(buffer < warmup)─────────────────┐
//!             │      │                                         │
//!             │      └──▶ UPDATE ×round(ratio·steps) ──────────┤
//!             └──────────────(budget left)─────────────────────┘
//!
//! OFFLINE     ┌─▶ SAMPLE ──▶ UPDATE ─┐
//!             └─(budget left)────────┘
//! ```
//!
//! Every runner ends the epoch with the scheduled test pass (shared through
//! [`EpochSession`]). On-/off-policy runners can also end the epoch early
//! through test-in-train.
//!
//! # Budget Accounting
//!
//! The per-epoch budget counts env steps for the collecting regimes and
//! update calls offline. A collection always runs to completion, so the
//! env-step total of an epoch may overshoot the budget by less than one
//! collection.

use parking_lot::Mutex;
use std::marker::PhantomData;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Regime, TrainerConfig};
use crate::error::{TrainerError, TrainerResult};
use crate::logger::{LogRecord, LogScope, TrainingLogger};
use crate::metrics::{CollectStats, EpochResult, StatsAggregator, UpdateStats};
use crate::scoring::{ScoreFn, StopFn};
use crate::state::{CollectMode, TrainingState};
use crate::trainer::EpochHookFn;
use crate::{Algorithm, CollectRequest, Collector, ExperienceSource, TrainCollector};

/// Activity in progress inside an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EpochPhase {
    /// Gathering training experience.
    Collect,
    /// Calling the algorithm.
    Update,
    /// Evaluating with the test collector.
    Test,
}

impl EpochPhase {
    /// Returns a human-readable name for the phase.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            EpochPhase::Collect => "collect",
            EpochPhase::Update => "update",
            EpochPhase::Test => "test",
        }
    }
}

/// The test collector together with how test passes are run and scored.
pub(crate) struct Tester {
    collector: Box<dyn Collector>,
    num_episodes: usize,
    interval: u64,
    score_fn: ScoreFn,
    test_fn: Option<EpochHookFn>,
}

impl Tester {
    pub(crate) fn new(
        collector: Box<dyn Collector>,
        config: &TrainerConfig,
        score_fn: ScoreFn,
        test_fn: Option<EpochHookFn>,
    ) -> Self {
        Self {
            collector,
            num_episodes: config.test_step_num_episodes,
            interval: config.test_interval,
            score_fn,
            test_fn,
        }
    }

    fn is_scheduled(&self, epoch: u64) -> bool {
        epoch % self.interval == 0
    }

    pub(crate) fn score(&self, stats: &CollectStats) -> f64 {
        (self.score_fn)(stats)
    }

    /// Runs one test pass from freshly reset environments. The test hook
    /// sees the progress at the time of the pass.
    fn run(&mut self, epoch: u64, env_step: Option<u64>) -> TrainerResult<(CollectStats, f64)> {
        self.collector.reset(true, true)?;
        if let Some(test_fn) = self.test_fn.as_mut() {
            test_fn(epoch, env_step);
        }
        let stats = self
            .collector
            .collect(CollectRequest::Episodes(self.num_episodes), CollectMode::Test)?;
        let score = self.score(&stats);
        Ok((stats, score))
    }

    pub(crate) fn reset(&mut self, reset_env: bool, reset_buffer: bool) -> TrainerResult<()> {
        self.collector.reset(reset_env, reset_buffer)
    }

    pub(crate) fn close(&mut self) -> TrainerResult<()> {
        self.collector.close()
    }
}

/// Everything one epoch touches, borrowed from the trainer for its duration.
///
/// The algorithm lock is held only around algorithm calls, so collectors
/// that share the algorithm (to act with its policy) can lock it in between.
pub(crate) struct EpochSession<'a, A, B> {
    state: &'a mut TrainingState,
    algorithm: &'a Mutex<A>,
    tester: Option<&'a mut Tester>,
    in_train_stop: Option<&'a StopFn>,
    train_fn: Option<&'a mut EpochHookFn>,
    logger: &'a mut dyn TrainingLogger,
    budget: u64,
    started: Instant,
    agg: StatsAggregator,
    _batch: PhantomData<fn(B)>,
}

impl<'a, A, B> EpochSession<'a, A, B>
where
    A: Algorithm<B>,
{
    /// `in_train_stop` is the stop criterion when test-in-train is active for
    /// this run, `None` otherwise.
    pub(crate) fn new(
        config: &TrainerConfig,
        state: &'a mut TrainingState,
        algorithm: &'a Mutex<A>,
        tester: Option<&'a mut Tester>,
        in_train_stop: Option<&'a StopFn>,
        train_fn: Option<&'a mut EpochHookFn>,
        logger: &'a mut dyn TrainingLogger,
    ) -> Self {
        Self {
            state,
            algorithm,
            tester,
            in_train_stop,
            train_fn,
            logger,
            budget: config.epoch_num_steps,
            started: Instant::now(),
            agg: StatsAggregator::new(config.regime.collects()),
            _batch: PhantomData,
        }
    }

    /// Calls the training hook ahead of a collection (or, offline, ahead of
    /// each sampled update).
    fn before_train_step(&mut self) {
        if let Some(train_fn) = self.train_fn.as_mut() {
            train_fn(self.state.epoch, self.state.env_step);
        }
    }

    /// One training collection call, with counters and stats recorded.
    fn collect(
        &mut self,
        collector: &mut dyn TrainCollector<B>,
        request: CollectRequest,
    ) -> TrainerResult<CollectStats> {
        self.before_train_step();
        let started = Instant::now();
        let stats = collector.collect(request, CollectMode::Train)?;
        self.state
            .record_env_steps(stats.n_collected_steps, stats.n_collected_episodes);
        self.agg.record_collect(&stats, started.elapsed());
        self.logger.write(&LogRecord::from_collect(
            LogScope::TrainCollect,
            self.state.epoch,
            self.state.update_step,
            &stats,
        ));
        debug!(
            phase = EpochPhase::Collect.name(),
            epoch = self.state.epoch,
            env_step = ?self.state.env_step,
            n_steps = stats.n_collected_steps,
            n_episodes = stats.n_collected_episodes,
            returns_mean = ?stats.returns_mean(),
            "collected"
        );
        if stats.n_collected_steps == 0 {
            return Err(TrainerError::collection(
                "training collector reported zero env steps",
            ));
        }
        Ok(stats)
    }

    /// Preprocesses `batch`, makes `num_passes` update calls over it and
    /// postprocesses it.
    ///
    /// `update_step` advances once per successful update call. A failing call
    /// is propagated immediately and is not counted.
    fn update(
        &mut self,
        batch: B,
        num_passes: usize,
        minibatch_size: Option<usize>,
    ) -> TrainerResult<()> {
        let started = Instant::now();
        let state = &mut *self.state;
        let mut algorithm = self.algorithm.lock();

        let batch = state.within_pass(0, num_passes, minibatch_size, |ctx| {
            algorithm.preprocess_batch(batch, ctx)
        })?;

        for pass in 0..num_passes {
            let stats: UpdateStats = state.within_pass(pass, num_passes, minibatch_size, |ctx| {
                algorithm.update(&batch, ctx)
            })?;
            state.record_update();
            self.agg.record_update(&stats);
            self.logger
                .write(&LogRecord::from_update(state.epoch, state.update_step, &stats));
        }

        let last_pass = num_passes.saturating_sub(1);
        state.within_pass(last_pass, num_passes, minibatch_size, |ctx| {
            algorithm.postprocess_batch(batch, ctx)
        })?;

        self.agg.record_update_time(started.elapsed());
        debug!(
            phase = EpochPhase::Update.name(),
            epoch = state.epoch,
            update_step = state.update_step,
            passes = num_passes,
            "updated"
        );
        Ok(())
    }

    fn run_test(&mut self) -> TrainerResult<Option<f64>> {
        let Some(tester) = self.tester.as_deref_mut() else {
            return Ok(None);
        };
        debug_assert!(!self.state.is_training_step_active);
        let started = Instant::now();
        let (stats, score) = tester.run(self.state.epoch, self.state.env_step)?;
        self.agg.record_test(&stats, score, started.elapsed());
        self.logger.write(&LogRecord::from_collect(
            LogScope::Test,
            self.state.epoch,
            self.state.update_step,
            &stats,
        ));
        debug!(
            phase = EpochPhase::Test.name(),
            epoch = self.state.epoch,
            n_episodes = stats.n_collected_episodes,
            score,
            "tested"
        );
        Ok(Some(score))
    }

    /// Test-in-train check after a training collection.
    ///
    /// When the training episodes already satisfy the stop criterion, a test
    /// pass runs immediately. Returns `true` if that test satisfies it too,
    /// in which case the epoch must end now.
    fn test_in_train(&mut self, stats: &CollectStats) -> TrainerResult<bool> {
        let Some(stop) = self.in_train_stop else {
            return Ok(false);
        };
        if stats.n_collected_episodes == 0 {
            return Ok(false);
        }
        let Some(tester) = self.tester.as_deref() else {
            return Ok(false);
        };
        let train_score = tester.score(stats);
        if !stop(train_score) {
            return Ok(false);
        }
        debug!(
            epoch = self.state.epoch,
            train_score, "training returns meet the stop criterion; testing"
        );
        match self.run_test()? {
            Some(score) if stop(score) => {
                self.agg.mark_stopped_in_train();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Runs the scheduled end-of-epoch test, unless test-in-train already
    /// ended the epoch with one.
    fn run_scheduled_test(&mut self, stopped_in_train: bool) -> TrainerResult<()> {
        if stopped_in_train {
            return Ok(());
        }
        let scheduled = self
            .tester
            .as_deref()
            .is_some_and(|t| t.is_scheduled(self.state.epoch));
        if scheduled {
            self.run_test()?;
        }
        Ok(())
    }

    fn finish(self) -> EpochResult {
        self.agg.finish(
            self.state.epoch,
            self.state.env_step,
            self.state.update_step,
            self.started.elapsed(),
        )
    }
}

/// On-policy: collect, update a fixed number of times, discard.
pub struct OnPolicyRunner<B> {
    collector: Box<dyn TrainCollector<B>>,
    request: CollectRequest,
    repetitions: usize,
    minibatch_size: Option<usize>,
}

impl<B> OnPolicyRunner<B> {
    fn run<A: Algorithm<B>>(
        &mut self,
        session: &mut EpochSession<'_, A, B>,
    ) -> TrainerResult<bool> {
        let mut steps = 0u64;
        while steps < session.budget {
            let step = self.collect_and_update(session);
            // On-policy data is never reused, however the step ended.
            let discarded = self.collector.reset(false, true);
            let (n_steps, stopped) = step?;
            discarded?;
            if stopped {
                return Ok(true);
            }
            steps += n_steps;
        }
        Ok(false)
    }

    /// One collection and the updates over it. Returns the collected env
    /// steps and whether test-in-train ended the epoch.
    fn collect_and_update<A: Algorithm<B>>(
        &mut self,
        session: &mut EpochSession<'_, A, B>,
    ) -> TrainerResult<(u64, bool)> {
        let stats = session.collect(self.collector.as_mut(), self.request)?;
        if session.test_in_train(&stats)? {
            return Ok((stats.n_collected_steps, true));
        }
        let batch = self.collector.sample(None)?;
        session.update(batch, self.repetitions, self.minibatch_size)?;
        Ok((stats.n_collected_steps, false))
    }
}

/// Off-policy: collect into the replay buffer, then sample and update.
pub struct OffPolicyRunner<B> {
    collector: Box<dyn TrainCollector<B>>,
    steps_per_collect: usize,
    update_per_step: f64,
    batch_size: usize,
    warmup_buffer_size: usize,
}

impl<B> OffPolicyRunner<B> {
    fn updates_for(&self, n_steps: u64) -> u64 {
        (self.update_per_step * n_steps as f64).round() as u64
    }

    fn run<A: Algorithm<B>>(
        &mut self,
        session: &mut EpochSession<'_, A, B>,
    ) -> TrainerResult<bool> {
        let mut steps = 0u64;
        while steps < session.budget {
            let warming_up = self.collector.len() < self.warmup_buffer_size;
            let stats = session.collect(
                self.collector.as_mut(),
                CollectRequest::Steps(self.steps_per_collect),
            )?;
            steps += stats.n_collected_steps;
            if warming_up {
                continue;
            }
            if session.test_in_train(&stats)? {
                return Ok(true);
            }
            for _ in 0..self.updates_for(stats.n_collected_steps) {
                let batch = self.collector.sample(Some(self.batch_size))?;
                session.update(batch, 1, Some(self.batch_size))?;
            }
        }
        Ok(false)
    }
}

/// Offline: sample the fixed dataset and update, no collection.
pub struct OfflineRunner<B> {
    dataset: Box<dyn ExperienceSource<B>>,
    batch_size: usize,
}

impl<B> OfflineRunner<B> {
    fn run<A: Algorithm<B>>(
        &mut self,
        session: &mut EpochSession<'_, A, B>,
    ) -> TrainerResult<bool> {
        for _ in 0..session.budget {
            session.before_train_step();
            let batch = self.dataset.sample(Some(self.batch_size))?;
            session.update(batch, 1, Some(self.batch_size))?;
        }
        Ok(false)
    }
}

/// Regime-tagged inner loop of an epoch.
pub enum EpochRunner<B> {
    /// See [`OnPolicyRunner`].
    OnPolicy(OnPolicyRunner<B>),
    /// See [`OffPolicyRunner`].
    OffPolicy(OffPolicyRunner<B>),
    /// See [`OfflineRunner`].
    Offline(OfflineRunner<B>),
}

impl<B> EpochRunner<B> {
    /// Builds the runner for a collecting regime.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for the offline regime or an invalid
    /// configuration.
    pub fn collecting(
        config: &TrainerConfig,
        collector: Box<dyn TrainCollector<B>>,
    ) -> TrainerResult<Self> {
        config.validate()?;
        match config.regime {
            Regime::OnPolicy => {
                let request = match (
                    config.collection_step_num_env_steps,
                    config.collection_step_num_episodes,
                ) {
                    (Some(steps), _) => CollectRequest::Steps(steps),
                    (None, Some(episodes)) => CollectRequest::Episodes(episodes),
                    (None, None) => {
                        return Err(TrainerError::config(
                            "on_policy: no collection size configured",
                        ))
                    }
                };
                Ok(Self::OnPolicy(OnPolicyRunner {
                    collector,
                    request,
                    repetitions: config.repetitions(),
                    minibatch_size: config.batch_size,
                }))
            }
            Regime::OffPolicy => Ok(Self::OffPolicy(OffPolicyRunner {
                collector,
                steps_per_collect: config.collection_step_num_env_steps.unwrap_or_default(),
                update_per_step: config.updates_per_step(),
                batch_size: config.batch_size.unwrap_or_default(),
                warmup_buffer_size: config.warmup_buffer_size.unwrap_or(0),
            })),
            Regime::Offline => Err(TrainerError::config(
                "a training collector does not apply to the offline regime; supply a dataset",
            )),
        }
    }

    /// Builds the runner for the offline regime.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a collecting regime or an invalid
    /// configuration.
    pub fn offline(
        config: &TrainerConfig,
        dataset: Box<dyn ExperienceSource<B>>,
    ) -> TrainerResult<Self> {
        config.validate()?;
        match config.regime {
            Regime::Offline => Ok(Self::Offline(OfflineRunner {
                dataset,
                batch_size: config.batch_size.unwrap_or_default(),
            })),
            regime => Err(TrainerError::config(format!(
                "a dataset does not apply to the {} regime; supply a training collector",
                regime.name()
            ))),
        }
    }

    fn collector(&mut self) -> Option<&mut dyn TrainCollector<B>> {
        match self {
            Self::OnPolicy(r) => Some(r.collector.as_mut()),
            Self::OffPolicy(r) => Some(r.collector.as_mut()),
            Self::Offline(_) => None,
        }
    }

    /// Resets the training collector. No-op offline.
    pub fn reset(&mut self, reset_env: bool, reset_buffer: bool) -> TrainerResult<()> {
        match self.collector() {
            Some(collector) => collector.reset(reset_env, reset_buffer),
            None => Ok(()),
        }
    }

    /// Closes the training collector. No-op offline.
    pub fn close(&mut self) -> TrainerResult<()> {
        match self.collector() {
            Some(collector) => collector.close(),
            None => Ok(()),
        }
    }

    /// Runs one epoch: the regime's inner loop, then the scheduled test.
    pub(crate) fn run_epoch<A: Algorithm<B>>(
        &mut self,
        mut session: EpochSession<'_, A, B>,
    ) -> TrainerResult<EpochResult> {
        let stopped_in_train = match self {
            Self::OnPolicy(runner) => runner.run(&mut session)?,
            Self::OffPolicy(runner) => runner.run(&mut session)?,
            Self::Offline(runner) => runner.run(&mut session)?,
        };
        session.run_scheduled_test(stopped_in_train)?;
        Ok(session.finish())
    }
}
