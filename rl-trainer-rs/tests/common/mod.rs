//! Shared test fixtures: scripted collectors, a counting algorithm and a
//! fixed dataset, all reporting into one event log.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use rl_trainer_rs::prelude::*;

// ============================================================================
// Event Log
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Train,
    Test,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Collect {
        role: Role,
        request: CollectRequest,
        mode: CollectMode,
        buffer_len_before: usize,
    },
    Reset {
        role: Role,
        reset_env: bool,
        reset_buffer: bool,
    },
    Sample {
        batch_size: Option<usize>,
    },
    Update {
        update_step: u64,
        pass: usize,
        num_passes: usize,
        batch_size: usize,
    },
    Close {
        role: Role,
    },
}

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    pub fn train_collects(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Collect { role: Role::Train, .. }))
            .collect()
    }

    pub fn test_collects(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Collect { role: Role::Test, .. }))
            .count()
    }

    pub fn updates(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, Event::Update { .. }))
            .collect()
    }

    pub fn update_batch_sizes(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Update { batch_size, .. } => Some(batch_size),
                _ => None,
            })
            .collect()
    }

    pub fn train_buffer_lens(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Collect {
                    role: Role::Train,
                    buffer_len_before,
                    ..
                } => Some(buffer_len_before),
                _ => None,
            })
            .collect()
    }

    pub fn resets(&self, role: Role) -> Vec<(bool, bool)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Reset {
                    role: r,
                    reset_env,
                    reset_buffer,
                } if r == role => Some((reset_env, reset_buffer)),
                _ => None,
            })
            .collect()
    }
}

// ============================================================================
// Batch
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestBatch {
    pub size: usize,
}

// ============================================================================
// Collector
// ============================================================================

/// Collector with scripted episode returns.
///
/// Episodes last `episode_len` steps. A `Steps(n)` request finishes
/// `n / episode_len` episodes; an `Episodes(n)` request takes
/// `n * episode_len` steps. Call `i` reports every episode with return
/// `returns[i]` (the last entry repeats). `without_episodes` makes every
/// call finish no episode at all.
pub struct ScriptedCollector {
    role: Role,
    log: EventLog,
    buffer: usize,
    episode_len: u64,
    returns: Vec<f64>,
    calls: usize,
    fail_on_call: Option<usize>,
    finishes_episodes: bool,
}

impl ScriptedCollector {
    pub fn train(log: &EventLog) -> Self {
        Self::new(Role::Train, log)
    }

    pub fn test(log: &EventLog, returns: Vec<f64>) -> Self {
        Self::new(Role::Test, log).returns(returns)
    }

    fn new(role: Role, log: &EventLog) -> Self {
        Self {
            role,
            log: log.clone(),
            buffer: 0,
            episode_len: 10,
            returns: vec![0.0],
            calls: 0,
            fail_on_call: None,
            finishes_episodes: true,
        }
    }

    pub fn episode_len(mut self, len: u64) -> Self {
        self.episode_len = len;
        self
    }

    pub fn returns(mut self, returns: Vec<f64>) -> Self {
        self.returns = returns;
        self
    }

    pub fn without_episodes(mut self) -> Self {
        self.finishes_episodes = false;
        self
    }

    /// Fails on the given zero-based collect call.
    pub fn fail_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    fn return_for(&self, call: usize) -> f64 {
        self.returns
            .get(call)
            .or(self.returns.last())
            .copied()
            .unwrap_or(0.0)
    }
}

impl Collector for ScriptedCollector {
    fn collect(&mut self, request: CollectRequest, mode: CollectMode) -> TrainerResult<CollectStats> {
        self.log.push(Event::Collect {
            role: self.role,
            request,
            mode,
            buffer_len_before: self.buffer,
        });
        let call = self.calls;
        self.calls += 1;
        if self.fail_on_call == Some(call) {
            return Err(TrainerError::collection(format!(
                "environment crashed on call {call}"
            )));
        }

        let (steps, episodes) = match request {
            CollectRequest::Steps(n) => {
                let n = n as u64;
                let episodes = if self.finishes_episodes {
                    n / self.episode_len
                } else {
                    0
                };
                (n, episodes)
            }
            CollectRequest::Episodes(n) if self.finishes_episodes => {
                (n as u64 * self.episode_len, n as u64)
            }
            CollectRequest::Episodes(n) => (n as u64 * self.episode_len, 0),
        };
        if mode == CollectMode::Train {
            self.buffer += steps as usize;
        }

        let ret = self.return_for(call);
        let returns = vec![ret; episodes as usize];
        let lens = vec![self.episode_len; episodes as usize];
        Ok(CollectStats::from_episodes(steps, &returns, &lens))
    }

    fn reset(&mut self, reset_env: bool, reset_buffer: bool) -> TrainerResult<()> {
        self.log.push(Event::Reset {
            role: self.role,
            reset_env,
            reset_buffer,
        });
        if reset_buffer {
            self.buffer = 0;
        }
        Ok(())
    }

    fn close(&mut self) -> TrainerResult<()> {
        self.log.push(Event::Close { role: self.role });
        Ok(())
    }
}

impl ExperienceSource<TestBatch> for ScriptedCollector {
    fn sample(&mut self, batch_size: Option<usize>) -> TrainerResult<TestBatch> {
        self.log.push(Event::Sample { batch_size });
        Ok(TestBatch {
            size: batch_size.unwrap_or(self.buffer),
        })
    }

    fn len(&self) -> usize {
        self.buffer
    }
}

// ============================================================================
// Dataset
// ============================================================================

pub struct FixedDataset {
    log: EventLog,
    len: usize,
}

impl FixedDataset {
    pub fn new(log: &EventLog, len: usize) -> Self {
        Self {
            log: log.clone(),
            len,
        }
    }
}

impl ExperienceSource<TestBatch> for FixedDataset {
    fn sample(&mut self, batch_size: Option<usize>) -> TrainerResult<TestBatch> {
        self.log.push(Event::Sample { batch_size });
        Ok(TestBatch {
            size: batch_size.unwrap_or(self.len),
        })
    }

    fn len(&self) -> usize {
        self.len
    }
}

// ============================================================================
// Algorithm
// ============================================================================

/// Counts update calls and optionally fails at a given update step.
pub struct CountingAlgorithm {
    log: EventLog,
    pub updates: u64,
    pub preprocessed: u64,
    pub postprocessed: u64,
    fail_at_update_step: Option<u64>,
}

impl CountingAlgorithm {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            updates: 0,
            preprocessed: 0,
            postprocessed: 0,
            fail_at_update_step: None,
        }
    }

    pub fn fail_at_update_step(mut self, step: u64) -> Self {
        self.fail_at_update_step = Some(step);
        self
    }
}

impl Algorithm<TestBatch> for CountingAlgorithm {
    fn preprocess_batch(&mut self, batch: TestBatch, ctx: &UpdateContext) -> TrainerResult<TestBatch> {
        assert!(ctx.is_training_step);
        self.preprocessed += 1;
        Ok(batch)
    }

    fn update(&mut self, batch: &TestBatch, ctx: &UpdateContext) -> TrainerResult<UpdateStats> {
        assert!(ctx.is_training_step);
        if self.fail_at_update_step == Some(ctx.update_step) {
            return Err(TrainerError::update("loss became NaN"));
        }
        self.log.push(Event::Update {
            update_step: ctx.update_step,
            pass: ctx.pass,
            num_passes: ctx.num_passes,
            batch_size: batch.size,
        });
        self.updates += 1;
        Ok(UpdateStats::new()
            .with("loss", 1.0 / (self.updates as f64))
            .with("batch_size", batch.size as f64))
    }

    fn postprocess_batch(&mut self, _batch: TestBatch, _ctx: &UpdateContext) -> TrainerResult<()> {
        self.postprocessed += 1;
        Ok(())
    }

    fn state_dict(&self) -> TrainerResult<serde_json::Value> {
        Ok(serde_json::json!({ "updates": self.updates }))
    }

    fn load_state_dict(&mut self, state: &serde_json::Value) -> TrainerResult<()> {
        self.updates = state["updates"]
            .as_u64()
            .ok_or_else(|| TrainerError::update("state dict without an update count"))?;
        Ok(())
    }
}

// ============================================================================
// Configs
// ============================================================================

pub fn off_policy_config() -> TrainerConfig {
    TrainerConfig::builder(Regime::OffPolicy)
        .max_epochs(5)
        .epoch_num_steps(100)
        .collection_step_num_env_steps(10)
        .update_per_step(0.1)
        .batch_size(32)
        .test_step_num_episodes(2)
        .build()
}

pub fn on_policy_config() -> TrainerConfig {
    TrainerConfig::builder(Regime::OnPolicy)
        .max_epochs(5)
        .epoch_num_steps(2000)
        .collection_step_num_env_steps(2000)
        .update_step_num_repetitions(4)
        .test_step_num_episodes(2)
        .build()
}

pub fn offline_config() -> TrainerConfig {
    TrainerConfig::builder(Regime::Offline)
        .max_epochs(10)
        .epoch_num_steps(50)
        .batch_size(16)
        .test_step_num_episodes(2)
        .build()
}
