//! Training progress counters.
//!
//! [`TrainingState`] is the mutable progress record owned by the trainer. It
//! is created by `reset`, advanced only by the trainer and its epoch runner,
//! and serialized into checkpoints.
//!
//! # Counter Semantics
//!
//! - `epoch` is 1-based once the first epoch has run (0 right after `reset`)
//! - `env_step` counts environment steps observed while collecting for
//!   training; it stays `None` for the offline regime
//! - `update_step` counts calls to the algorithm's update routine, one per
//!   call, whatever the algorithm does internally
//!
//! # Example
//!
//! ```rust
//! use rl_trainer_rs::config::Regime;
//! use rl_trainer_rs::state::TrainingState;
//!
//! let mut state = TrainingState::new(Regime::OffPolicy);
//! state.record_env_steps(10, 1);
//! let stats = state.within_training_step(|ctx| {
//!     assert!(ctx.is_training_step);
//!     ctx.update_step
//! });
//! state.record_update();
//! assert_eq!(stats, 0);
//! assert_eq!(state.update_step, 1);
//! assert!(!state.is_training_step_active);
//! ```

use serde::{Deserialize, Serialize};

use crate::config::Regime;

/// Mode passed to a collector so it can switch between exploratory and
/// evaluation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectMode {
    /// Gathering experience for training.
    Train,
    /// Evaluation pass; the policy should act deterministically enough.
    Test,
}

/// Snapshot of the progress record handed to the algorithm with every update.
///
/// This is the explicit form of the "within training step" flag: an
/// algorithm reads it from the call arguments instead of from shared state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateContext {
    /// Always `true`: the context only exists during an update call.
    pub is_training_step: bool,
    /// Current epoch.
    pub epoch: u64,
    /// Update calls completed before this one.
    pub update_step: u64,
    /// Env steps observed so far (`None` offline).
    pub env_step: Option<u64>,
    /// Zero-based index of this pass over the current batch.
    pub pass: usize,
    /// Total passes that will be made over the current batch.
    pub num_passes: usize,
    /// Requested mini-batch size (`None` means the whole batch).
    pub minibatch_size: Option<usize>,
}

/// Complete progress state of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch (0 after `reset`, 1 during/after the first epoch).
    pub epoch: u64,

    /// Cumulative env steps collected for training; `None` offline.
    pub env_step: Option<u64>,

    /// Cumulative completed episodes in training collection; `None` offline.
    pub env_episode: Option<u64>,

    /// Cumulative update calls.
    pub update_step: u64,

    /// Best score seen so far (`-inf` until a score beats it).
    #[serde(with = "unset_score")]
    pub best_score: f64,

    /// Epoch that produced `best_score`.
    pub best_epoch: Option<u64>,

    /// True only while an update call is in flight.
    #[serde(skip)]
    pub is_training_step_active: bool,
}

impl TrainingState {
    /// Creates a fresh state for the given regime.
    #[must_use]
    pub fn new(regime: Regime) -> Self {
        let collects = regime.collects();
        Self {
            epoch: 0,
            env_step: collects.then_some(0),
            env_episode: collects.then_some(0),
            update_step: 0,
            best_score: f64::NEG_INFINITY,
            best_epoch: None,
            is_training_step_active: false,
        }
    }

    /// Records env steps and completed episodes from a training collection.
    ///
    /// No-op for a state created for the offline regime.
    pub fn record_env_steps(&mut self, steps: u64, episodes: u64) {
        if let Some(env_step) = self.env_step.as_mut() {
            *env_step += steps;
        }
        if let Some(env_episode) = self.env_episode.as_mut() {
            *env_episode += episodes;
        }
    }

    /// Records one successful update call.
    pub fn record_update(&mut self) {
        self.update_step += 1;
    }

    /// Runs `f` with the training-step flag raised.
    ///
    /// The flag is lowered again before this returns, whether `f` succeeds or
    /// reports an error through its return value.
    pub fn within_training_step<T>(&mut self, f: impl FnOnce(&UpdateContext) -> T) -> T {
        self.within_pass(0, 1, None, f)
    }

    /// Like [`Self::within_training_step`] for pass `pass` of `num_passes`
    /// over a batch split into mini-batches of `minibatch_size`.
    pub fn within_pass<T>(
        &mut self,
        pass: usize,
        num_passes: usize,
        minibatch_size: Option<usize>,
        f: impl FnOnce(&UpdateContext) -> T,
    ) -> T {
        let ctx = UpdateContext {
            is_training_step: true,
            epoch: self.epoch,
            update_step: self.update_step,
            env_step: self.env_step,
            pass,
            num_passes,
            minibatch_size,
        };
        self.is_training_step_active = true;
        let out = f(&ctx);
        self.is_training_step_active = false;
        out
    }

    /// Replaces the best score if `score` is strictly greater.
    ///
    /// # Returns
    ///
    /// `true` if the record was replaced.
    pub fn offer_score(&mut self, score: f64) -> bool {
        if score > self.best_score {
            self.best_score = score;
            self.best_epoch = Some(self.epoch);
            true
        } else {
            false
        }
    }

    /// Returns the best score, if any epoch produced one.
    #[must_use]
    pub fn best(&self) -> Option<(f64, u64)> {
        self.best_epoch.map(|epoch| (self.best_score, epoch))
    }
}

/// JSON has no infinities. An unset best score (`-inf`) is stored as
/// `null` and `+inf` as the string `"inf"`; NaN is rejected.
pub(crate) mod unset_score {
    use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};

    const POSITIVE_INFINITY: &str = "inf";

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Stored {
        Finite(f64),
        Special(String),
    }

    pub fn serialize<S: Serializer>(score: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        let stored = if *score == f64::NEG_INFINITY {
            None
        } else if *score == f64::INFINITY {
            Some(Stored::Special(POSITIVE_INFINITY.to_owned()))
        } else if score.is_nan() {
            return Err(ser::Error::custom("cannot store a NaN score"));
        } else {
            Some(Stored::Finite(*score))
        };
        stored.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Option::<Stored>::deserialize(deserializer)? {
            None => Ok(f64::NEG_INFINITY),
            Some(Stored::Finite(score)) => Ok(score),
            Some(Stored::Special(text)) if text == POSITIVE_INFINITY => Ok(f64::INFINITY),
            Some(Stored::Special(text)) => Err(de::Error::custom(format!(
                "invalid score {text:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let state = TrainingState::new(Regime::OnPolicy);
        assert_eq!(state.epoch, 0);
        assert_eq!(state.env_step, Some(0));
        assert_eq!(state.update_step, 0);
        assert_eq!(state.best_score, f64::NEG_INFINITY);
        assert_eq!(state.best_epoch, None);
        assert!(!state.is_training_step_active);
    }

    #[test]
    fn test_offline_has_no_env_step() {
        let mut state = TrainingState::new(Regime::Offline);
        assert_eq!(state.env_step, None);
        state.record_env_steps(100, 2);
        assert_eq!(state.env_step, None);
        assert_eq!(state.env_episode, None);
    }

    #[test]
    fn test_training_step_flag_is_scoped() {
        let mut state = TrainingState::new(Regime::OffPolicy);
        state.epoch = 2;
        let result: Result<(), &str> = state.within_pass(1, 4, Some(32), |ctx| {
            assert!(ctx.is_training_step);
            assert_eq!(ctx.epoch, 2);
            assert_eq!(ctx.pass, 1);
            assert_eq!(ctx.num_passes, 4);
            assert_eq!(ctx.minibatch_size, Some(32));
            Err("boom")
        });
        assert!(result.is_err());
        assert!(!state.is_training_step_active);
    }

    #[test]
    fn test_offer_score_is_strict() {
        let mut state = TrainingState::new(Regime::OffPolicy);
        state.epoch = 1;
        assert!(state.offer_score(10.0));
        state.epoch = 2;
        assert!(!state.offer_score(10.0));
        assert_eq!(state.best(), Some((10.0, 1)));
        state.epoch = 3;
        assert!(state.offer_score(10.5));
        assert_eq!(state.best_epoch, Some(3));
    }

    #[test]
    fn test_negative_infinity_never_becomes_best() {
        let mut state = TrainingState::new(Regime::OffPolicy);
        state.epoch = 1;
        assert!(!state.offer_score(f64::NEG_INFINITY));
        assert!(!state.offer_score(f64::NAN));
        assert_eq!(state.best(), None);
    }

    #[test]
    fn test_json_roundtrip_keeps_negative_infinity() {
        let state = TrainingState::new(Regime::OnPolicy);
        let text = serde_json::to_string(&state).unwrap();
        let parsed: TrainingState = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, state);
        assert_eq!(parsed.best_score, f64::NEG_INFINITY);
    }

    #[test]
    fn test_json_roundtrip_keeps_positive_infinity() {
        let mut state = TrainingState::new(Regime::OffPolicy);
        state.epoch = 4;
        assert!(state.offer_score(f64::INFINITY));

        let text = serde_json::to_string(&state).unwrap();
        assert!(text.contains("\"inf\""));
        let parsed: TrainingState = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.best_score, f64::INFINITY);
        assert_eq!(parsed.best(), Some((f64::INFINITY, 4)));
    }

    #[test]
    fn test_nan_score_is_not_stored() {
        let mut state = TrainingState::new(Regime::OffPolicy);
        state.best_score = f64::NAN;
        assert!(serde_json::to_string(&state).is_err());

        let text = serde_json::to_string(&TrainingState::new(Regime::OffPolicy))
            .unwrap()
            .replace("\"best_score\":null", "\"best_score\":\"nan\"");
        assert!(serde_json::from_str::<TrainingState>(&text).is_err());
    }
}
