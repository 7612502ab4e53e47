//! Tabular Q-learning on a chain walk, under any of the three regimes.
//!
//! The agent starts at the left end of a chain and is rewarded for reaching
//! the right end. Collectors act with the learner's current Q-table, shared
//! through the trainer's algorithm handle. Exploration is annealed by the
//! training hook.
//!
//! Usage:
//!   cargo run --example chain_walk -- --regime off-policy --epochs 20
//!   cargo run --example chain_walk -- --regime offline --checkpoint-dir ./runs/chain
//!   RUST_LOG=rl_trainer_rs=debug cargo run --example chain_walk -- --regime on-policy

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use rl_trainer_rs::config::CheckpointConfig;
use rl_trainer_rs::prelude::*;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RegimeArg {
    OnPolicy,
    OffPolicy,
    Offline,
}

#[derive(Parser)]
#[command(name = "chain-walk")]
#[command(about = "Train a tabular Q-learner on a chain walk")]
struct Args {
    /// Training regime
    #[arg(short, long, value_enum, default_value = "off-policy")]
    regime: RegimeArg,

    /// Trainer configuration (TOML); overrides the regime defaults below
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of epochs
    #[arg(short, long, default_value_t = 20)]
    epochs: u64,

    /// Number of states in the chain
    #[arg(long, default_value_t = 12)]
    chain_len: usize,

    /// Stop once the mean test return reaches this value
    #[arg(long, default_value_t = 0.85)]
    target_return: f64,

    /// Directory for checkpoints and the best model
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Random seed
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

// ============================================================================
// Environment
// ============================================================================

const STEP_PENALTY: f64 = -0.01;
const GOAL_REWARD: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
struct Transition {
    state: usize,
    action: usize,
    reward: f64,
    next_state: usize,
    done: bool,
}

#[derive(Debug, Clone)]
struct Chain {
    len: usize,
    position: usize,
    steps: usize,
}

impl Chain {
    fn new(len: usize) -> Self {
        Self {
            len,
            position: 0,
            steps: 0,
        }
    }

    fn reset(&mut self) -> usize {
        self.position = 0;
        self.steps = 0;
        self.position
    }

    /// Action 0 moves left, 1 moves right. Episodes are truncated after
    /// `4 * len` steps.
    fn step(&mut self, action: usize) -> Transition {
        let state = self.position;
        self.position = if action == 1 {
            (self.position + 1).min(self.len - 1)
        } else {
            self.position.saturating_sub(1)
        };
        self.steps += 1;
        let reached = self.position == self.len - 1;
        Transition {
            state,
            action,
            reward: if reached { GOAL_REWARD } else { STEP_PENALTY },
            next_state: self.position,
            done: reached || self.steps >= 4 * self.len,
        }
    }
}

// ============================================================================
// Algorithm
// ============================================================================

const EPSILON_START: f64 = 0.5;
const EPSILON_END: f64 = 0.05;
const EPSILON_DECAY_STEPS: f64 = 5000.0;

struct QLearner {
    q: Vec<[f64; 2]>,
    lr: f64,
    gamma: f64,
    /// Exploration rate of training collection.
    epsilon: f64,
}

impl QLearner {
    fn new(num_states: usize) -> Self {
        Self {
            q: vec![[0.0; 2]; num_states],
            lr: 0.2,
            gamma: 0.95,
            epsilon: EPSILON_START,
        }
    }

    fn greedy(&self, state: usize, rng: &mut StdRng) -> usize {
        let [left, right] = self.q[state];
        if (left - right).abs() < f64::EPSILON {
            rng.gen_range(0..2)
        } else if right > left {
            1
        } else {
            0
        }
    }
}

impl Algorithm<Vec<Transition>> for QLearner {
    fn update(&mut self, batch: &Vec<Transition>, _ctx: &UpdateContext) -> TrainerResult<UpdateStats> {
        if batch.is_empty() {
            return Err(TrainerError::update("empty batch"));
        }
        let mut td_sum = 0.0;
        for t in batch {
            let bootstrap = if t.done {
                0.0
            } else {
                let [l, r] = self.q[t.next_state];
                self.gamma * l.max(r)
            };
            let td = t.reward + bootstrap - self.q[t.state][t.action];
            self.q[t.state][t.action] += self.lr * td;
            td_sum += td.abs();
        }
        Ok(UpdateStats::new().with("td_error", td_sum / batch.len() as f64))
    }

    fn state_dict(&self) -> TrainerResult<serde_json::Value> {
        Ok(serde_json::json!({ "q": self.q }))
    }

    fn load_state_dict(&mut self, state: &serde_json::Value) -> TrainerResult<()> {
        self.q = serde_json::from_value(state["q"].clone()).map_err(TrainerError::update)?;
        Ok(())
    }
}

// ============================================================================
// Collector
// ============================================================================

struct ChainCollector {
    env: Chain,
    state: usize,
    policy: Arc<Mutex<QLearner>>,
    buffer: VecDeque<Transition>,
    capacity: usize,
    episode_return: f64,
    episode_len: u64,
    rng: StdRng,
}

impl ChainCollector {
    fn new(chain_len: usize, policy: Arc<Mutex<QLearner>>, seed: u64) -> Self {
        Self {
            env: Chain::new(chain_len),
            state: 0,
            policy,
            buffer: VecDeque::new(),
            capacity: 20_000,
            episode_return: 0.0,
            episode_len: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn act(&mut self, mode: CollectMode) -> usize {
        let policy = self.policy.lock();
        if mode == CollectMode::Train && self.rng.gen::<f64>() < policy.epsilon {
            return self.rng.gen_range(0..2);
        }
        policy.greedy(self.state, &mut self.rng)
    }
}

impl Collector for ChainCollector {
    fn collect(&mut self, request: CollectRequest, mode: CollectMode) -> TrainerResult<CollectStats> {
        let (max_steps, max_episodes) = match request {
            CollectRequest::Steps(n) => (n, usize::MAX),
            CollectRequest::Episodes(n) => (usize::MAX, n),
        };
        let mut steps = 0;
        let mut returns = Vec::new();
        let mut lens = Vec::new();

        while steps < max_steps && returns.len() < max_episodes {
            let action = self.act(mode);
            let transition = self.env.step(action);
            steps += 1;
            self.episode_return += transition.reward;
            self.episode_len += 1;
            self.state = transition.next_state;
            if mode == CollectMode::Train {
                if self.buffer.len() == self.capacity {
                    self.buffer.pop_front();
                }
                self.buffer.push_back(transition);
            }
            if transition.done {
                returns.push(self.episode_return);
                lens.push(self.episode_len);
                self.episode_return = 0.0;
                self.episode_len = 0;
                self.state = self.env.reset();
            }
        }
        Ok(CollectStats::from_episodes(steps as u64, &returns, &lens))
    }

    fn reset(&mut self, reset_env: bool, reset_buffer: bool) -> TrainerResult<()> {
        if reset_env {
            self.state = self.env.reset();
            self.episode_return = 0.0;
            self.episode_len = 0;
        }
        if reset_buffer {
            self.buffer.clear();
        }
        Ok(())
    }
}

impl ExperienceSource<Vec<Transition>> for ChainCollector {
    fn sample(&mut self, batch_size: Option<usize>) -> TrainerResult<Vec<Transition>> {
        if self.buffer.is_empty() {
            return Err(TrainerError::collection("replay buffer is empty"));
        }
        Ok(match batch_size {
            None => self.buffer.iter().copied().collect(),
            Some(n) => (0..n)
                .map(|_| self.buffer[self.rng.gen_range(0..self.buffer.len())])
                .collect(),
        })
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }
}

/// Transitions logged by a uniformly random policy.
struct RandomWalkDataset {
    transitions: Vec<Transition>,
    rng: StdRng,
}

impl RandomWalkDataset {
    fn generate(chain_len: usize, num_transitions: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut env = Chain::new(chain_len);
        let mut transitions = Vec::with_capacity(num_transitions);
        while transitions.len() < num_transitions {
            let t = env.step(rng.gen_range(0..2));
            if t.done {
                env.reset();
            }
            transitions.push(t);
        }
        Self { transitions, rng }
    }
}

impl ExperienceSource<Vec<Transition>> for RandomWalkDataset {
    fn sample(&mut self, batch_size: Option<usize>) -> TrainerResult<Vec<Transition>> {
        let n = batch_size.unwrap_or(self.transitions.len());
        Ok((0..n)
            .map(|_| self.transitions[self.rng.gen_range(0..self.transitions.len())])
            .collect())
    }

    fn len(&self) -> usize {
        self.transitions.len()
    }
}

// ============================================================================
// Main
// ============================================================================

fn default_config(regime: RegimeArg, epochs: u64) -> TrainerConfig {
    let builder = match regime {
        RegimeArg::OnPolicy => TrainerConfig::builder(Regime::OnPolicy)
            .epoch_num_steps(2000)
            .collection_step_num_episodes(4)
            .update_step_num_repetitions(2),
        RegimeArg::OffPolicy => TrainerConfig::builder(Regime::OffPolicy)
            .epoch_num_steps(1000)
            .collection_step_num_env_steps(10)
            .update_per_step(0.2)
            .batch_size(32)
            .warmup_buffer_size(200)
            .test_in_train(true),
        RegimeArg::Offline => TrainerConfig::builder(Regime::Offline)
            .epoch_num_steps(200)
            .batch_size(64),
    };
    builder.max_epochs(epochs).test_step_num_episodes(5).build()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let mut config = match &args.config {
        Some(path) => TrainerConfig::from_file(path)?,
        None => default_config(args.regime, args.epochs),
    };
    if let Some(dir) = &args.checkpoint_dir {
        config.checkpoint = CheckpointConfig {
            save_interval: 5,
            ..CheckpointConfig::in_dir(dir)
        };
    }

    let learner = Arc::new(Mutex::new(QLearner::new(args.chain_len)));
    let test_collector = ChainCollector::new(args.chain_len, Arc::clone(&learner), args.seed + 1);
    let builder = Trainer::builder_shared(config.clone(), Arc::clone(&learner))
        .test_collector(test_collector)
        .stop_fn(scoring::reward_threshold(args.target_return));
    let builder = if config.regime.collects() {
        let annealed = Arc::clone(&learner);
        builder
            .train_collector(ChainCollector::new(args.chain_len, Arc::clone(&learner), args.seed))
            .train_fn(move |_epoch, env_step| {
                let progress = (env_step.unwrap_or(0) as f64 / EPSILON_DECAY_STEPS).min(1.0);
                annealed.lock().epsilon = EPSILON_START + (EPSILON_END - EPSILON_START) * progress;
            })
    } else {
        builder.dataset(RandomWalkDataset::generate(args.chain_len, 5000, args.seed))
    };
    let mut trainer = builder.build()?;

    let stats = trainer.run(RunOptions::default())?;
    trainer.close()?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    if let Some(best) = trainer.best() {
        println!(
            "best test return {:.3} at epoch {} ({} updates)",
            best.score, best.epoch, best.update_step
        );
    }
    Ok(())
}
