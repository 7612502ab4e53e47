//! Training statistics and their aggregation.
//!
//! Collectors report [`CollectStats`] per call, algorithms report
//! [`UpdateStats`] per update call. The [`StatsAggregator`] folds them, along
//! with the optional test pass, into one [`EpochResult`] per epoch, and
//! [`FinalStats`] summarizes a whole run.
//!
//! # Absent vs. Zero
//!
//! A collection step that completes no episode has no mean return and no
//! mean length. Those fields are `None`, never `0.0` and never the value of
//! an earlier step, so downstream consumers cannot mistake "no data" for a
//! real measurement.
//!
//! # Output Formats
//!
//! Every type here is `Serialize`, so results can be exported as JSON for
//! programmatic analysis or written to logs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Count, mean, standard deviation and range of a set of values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequenceSummary {
    /// Number of values summarized.
    pub count: u64,
    /// Mean value.
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
}

impl SequenceSummary {
    /// Summarizes `values`, or returns `None` if there are none.
    #[must_use]
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let (first, rest) = values.split_first()?;
        // Welford's online algorithm
        let mut summary = Self::single(*first);
        let mut m2 = 0.0;
        for &value in rest {
            summary.count += 1;
            let delta = value - summary.mean;
            summary.mean += delta / summary.count as f64;
            m2 += delta * (value - summary.mean);
            summary.min = summary.min.min(value);
            summary.max = summary.max.max(value);
        }
        summary.std = (m2 / summary.count as f64).sqrt();
        Some(summary)
    }

    /// Summary of a single value.
    #[must_use]
    pub fn single(value: f64) -> Self {
        Self {
            count: 1,
            mean: value,
            std: 0.0,
            min: value,
            max: value,
        }
    }

    /// Combines two summaries as if their values had been summarized together.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let n = (self.count + other.count) as f64;
        let (na, nb) = (self.count as f64, other.count as f64);
        let delta = other.mean - self.mean;
        let mean = self.mean + delta * nb / n;
        let m2 = self.std.powi(2) * na + other.std.powi(2) * nb + delta.powi(2) * na * nb / n;
        Self {
            count: self.count + other.count,
            mean,
            std: (m2 / n).sqrt(),
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    fn merge_into(target: &mut Option<Self>, other: Option<&Self>) {
        if let Some(other) = other {
            *target = Some(match target {
                Some(current) => current.merge(other),
                None => *other,
            });
        }
    }
}

/// Statistics reported by one collection call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectStats {
    /// Env steps taken during the call (the env-step delta).
    pub n_collected_steps: u64,
    /// Episodes that finished during the call.
    pub n_collected_episodes: u64,
    /// Returns of the finished episodes; `None` if none finished.
    pub returns: Option<SequenceSummary>,
    /// Lengths of the finished episodes; `None` if none finished.
    pub lens: Option<SequenceSummary>,
}

impl CollectStats {
    /// Stats for a call that finished the given episodes.
    ///
    /// `returns` and `lens` describe the finished episodes and must have the
    /// same length. Empty slices yield absent summaries.
    #[must_use]
    pub fn from_episodes(n_collected_steps: u64, returns: &[f64], lens: &[u64]) -> Self {
        debug_assert_eq!(returns.len(), lens.len());
        let lens: Vec<f64> = lens.iter().map(|&len| len as f64).collect();
        Self {
            n_collected_steps,
            n_collected_episodes: returns.len() as u64,
            returns: SequenceSummary::from_values(returns),
            lens: SequenceSummary::from_values(&lens),
        }
    }

    /// Stats for a call that took steps without finishing any episode.
    #[must_use]
    pub fn without_episodes(n_collected_steps: u64) -> Self {
        Self::from_episodes(n_collected_steps, &[], &[])
    }

    /// Mean episode return, if any episode finished.
    #[must_use]
    pub fn returns_mean(&self) -> Option<f64> {
        self.returns.map(|r| r.mean)
    }

    /// Mean episode length, if any episode finished.
    #[must_use]
    pub fn lens_mean(&self) -> Option<f64> {
        self.lens.map(|l| l.mean)
    }
}

/// Aggregate of every training collection within an epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectSummary {
    /// Number of collection calls.
    pub num_collections: u64,
    /// Total env steps.
    pub n_collected_steps: u64,
    /// Total finished episodes.
    pub n_collected_episodes: u64,
    /// Returns over all finished episodes; `None` if none finished.
    pub returns: Option<SequenceSummary>,
    /// Lengths over all finished episodes; `None` if none finished.
    pub lens: Option<SequenceSummary>,
}

impl CollectSummary {
    /// Folds one collection call into the summary.
    pub fn add(&mut self, stats: &CollectStats) {
        self.num_collections += 1;
        self.n_collected_steps += stats.n_collected_steps;
        self.n_collected_episodes += stats.n_collected_episodes;
        SequenceSummary::merge_into(&mut self.returns, stats.returns.as_ref());
        SequenceSummary::merge_into(&mut self.lens, stats.lens.as_ref());
    }

    /// Mean return over the epoch's finished episodes.
    #[must_use]
    pub fn returns_mean(&self) -> Option<f64> {
        self.returns.map(|r| r.mean)
    }
}

/// Scalars reported by one update call (losses, entropies, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateStats {
    /// Named scalar values.
    pub scalars: BTreeMap<String, f64>,
}

impl UpdateStats {
    /// Creates empty update stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named scalar (builder pattern).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.scalars.insert(name.into(), value);
        self
    }

    /// Returns a scalar by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).copied()
    }
}

/// Aggregate of every update call within an epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateSummary {
    /// Number of update calls.
    pub num_updates: u64,
    /// Per-scalar summaries over the calls that reported the scalar.
    pub scalars: BTreeMap<String, SequenceSummary>,
}

impl UpdateSummary {
    /// Folds one update call into the summary.
    pub fn add(&mut self, stats: &UpdateStats) {
        self.num_updates += 1;
        for (name, &value) in &stats.scalars {
            let single = SequenceSummary::single(value);
            self.scalars
                .entry(name.clone())
                .and_modify(|s| *s = s.merge(&single))
                .or_insert(single);
        }
    }

    /// Mean of a scalar over the epoch.
    #[must_use]
    pub fn mean(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).map(|s| s.mean)
    }
}

/// Wall-clock time spent in each activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    /// Seconds spent in training collection calls.
    pub collect_secs: f64,
    /// Seconds spent in algorithm calls (pre/post-processing included).
    pub update_secs: f64,
    /// Seconds spent in test passes.
    pub test_secs: f64,
    /// Total seconds.
    pub total_secs: f64,
}

impl TimingStats {
    /// Adds another timing record to this one.
    pub fn accumulate(&mut self, other: &Self) {
        self.collect_secs += other.collect_secs;
        self.update_secs += other.update_secs;
        self.test_secs += other.test_secs;
        self.total_secs += other.total_secs;
    }

    pub(crate) fn add_collect(&mut self, elapsed: Duration) {
        self.collect_secs += elapsed.as_secs_f64();
    }

    pub(crate) fn add_update(&mut self, elapsed: Duration) {
        self.update_secs += elapsed.as_secs_f64();
    }

    pub(crate) fn add_test(&mut self, elapsed: Duration) {
        self.test_secs += elapsed.as_secs_f64();
    }
}

/// Everything that happened during one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochResult {
    /// The epoch number (1-based).
    pub epoch: u64,
    /// Env steps after the epoch; `None` offline.
    pub env_step: Option<u64>,
    /// Update steps after the epoch.
    pub update_step: u64,
    /// Training collection aggregate; `None` offline.
    pub train_collect: Option<CollectSummary>,
    /// Stats of the epoch's last training collection call.
    pub last_train_collect: Option<CollectStats>,
    /// Update aggregate.
    pub update: UpdateSummary,
    /// Test pass stats, if a test ran.
    pub test: Option<CollectStats>,
    /// Score computed from `test`, if a test ran.
    pub score: Option<f64>,
    /// Whether `score` replaced the best record.
    pub is_new_best: bool,
    /// Whether the epoch ended early because a test-in-train pass met the
    /// stop criterion.
    pub stopped_in_train: bool,
    /// Time spent in this epoch.
    pub timing: TimingStats,
}

/// Folds the statistics of one epoch without mutating its inputs.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    collect: Option<CollectSummary>,
    last_collect: Option<CollectStats>,
    update: UpdateSummary,
    test: Option<CollectStats>,
    score: Option<f64>,
    stopped_in_train: bool,
    timing: TimingStats,
}

impl StatsAggregator {
    /// Creates an aggregator for a regime that collects (`collects = true`)
    /// or trains from a fixed dataset.
    #[must_use]
    pub fn new(collects: bool) -> Self {
        Self {
            collect: collects.then(CollectSummary::default),
            ..Self::default()
        }
    }

    /// Records a training collection call.
    pub fn record_collect(&mut self, stats: &CollectStats, elapsed: Duration) {
        if let Some(collect) = self.collect.as_mut() {
            collect.add(stats);
        }
        self.last_collect = Some(stats.clone());
        self.timing.add_collect(elapsed);
    }

    /// Records one update call.
    pub fn record_update(&mut self, stats: &UpdateStats) {
        self.update.add(stats);
    }

    /// Records time spent in algorithm calls.
    pub fn record_update_time(&mut self, elapsed: Duration) {
        self.timing.add_update(elapsed);
    }

    /// Records a test pass and its score. A later test replaces an earlier one.
    pub fn record_test(&mut self, stats: &CollectStats, score: f64, elapsed: Duration) {
        self.test = Some(stats.clone());
        self.score = Some(score);
        self.timing.add_test(elapsed);
    }

    /// Marks the epoch as ended by test-in-train.
    pub fn mark_stopped_in_train(&mut self) {
        self.stopped_in_train = true;
    }

    /// Produces the epoch result.
    #[must_use]
    pub fn finish(
        self,
        epoch: u64,
        env_step: Option<u64>,
        update_step: u64,
        total: Duration,
    ) -> EpochResult {
        let mut timing = self.timing;
        timing.total_secs = total.as_secs_f64();
        EpochResult {
            epoch,
            env_step,
            update_step,
            train_collect: self.collect,
            last_train_collect: self.last_collect,
            update: self.update,
            test: self.test,
            score: self.score,
            is_new_best: false,
            stopped_in_train: self.stopped_in_train,
            timing,
        }
    }
}

/// Best-score summary reported at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestSummary {
    /// The best score.
    pub score: f64,
    /// Epoch that produced it.
    pub epoch: u64,
    /// Update step at the end of that epoch.
    pub update_step: u64,
}

/// Statistics of a complete `run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalStats {
    /// Epochs executed by this run.
    pub epochs_completed: u64,
    /// Epoch counter at the end of the run.
    pub epoch: u64,
    /// Env steps at the end of the run; `None` offline.
    pub env_step: Option<u64>,
    /// Finished training episodes; `None` offline.
    pub env_episode: Option<u64>,
    /// Update steps at the end of the run.
    pub update_step: u64,
    /// Best score record, if any test produced a score.
    pub best: Option<BestSummary>,
    /// Whether the stop criterion ended the run.
    pub stopped_early: bool,
    /// Stats of the last test pass.
    pub last_test: Option<CollectStats>,
    /// Accumulated timing.
    pub timing: TimingStats,
}

impl FinalStats {
    /// Update calls per second of update time.
    #[must_use]
    pub fn update_speed(&self) -> Option<f64> {
        (self.timing.update_secs > 0.0).then(|| self.update_step as f64 / self.timing.update_secs)
    }
}
