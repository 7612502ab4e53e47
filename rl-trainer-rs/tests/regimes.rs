//! Epoch loop behavior of the three training regimes.

mod common;

use common::*;
use rl_trainer_rs::logger::{LogScope, MemoryLogger};
use rl_trainer_rs::prelude::*;

// ============================================================================
// Off-policy
// ============================================================================

#[test]
fn off_policy_epoch_advances_update_step_by_ratio() {
    let log = EventLog::new();
    let mut trainer = Trainer::builder(off_policy_config(), CountingAlgorithm::new(&log))
        .train_collector(ScriptedCollector::train(&log))
        .build()
        .unwrap();

    trainer.reset(true, true).unwrap();
    let result = trainer.execute_epoch().unwrap();

    // 100 steps in collections of 10, one update per 10 steps
    assert_eq!(log.train_collects().len(), 10);
    assert_eq!(result.update.num_updates, 10);
    assert_eq!(result.update_step, 10);
    assert_eq!(result.env_step, Some(100));

    let result = trainer.execute_epoch().unwrap();
    assert_eq!(result.epoch, 2);
    assert_eq!(result.update_step, 20);
    assert_eq!(trainer.state().unwrap().update_step, 20);
    assert!(!trainer.state().unwrap().is_training_step_active);
}

#[test]
fn off_policy_samples_configured_batch_size() {
    let log = EventLog::new();
    let mut trainer = Trainer::builder(off_policy_config(), CountingAlgorithm::new(&log))
        .train_collector(ScriptedCollector::train(&log))
        .build()
        .unwrap();
    trainer.reset(true, true).unwrap();
    trainer.execute_epoch().unwrap();

    for event in log.updates() {
        match event {
            Event::Update {
                batch_size,
                num_passes,
                ..
            } => {
                assert_eq!(batch_size, 32);
                assert_eq!(num_passes, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[test]
fn off_policy_warmup_collects_without_updates() {
    let log = EventLog::new();
    let config = TrainerConfig::builder(Regime::OffPolicy)
        .epoch_num_steps(2000)
        .collection_step_num_env_steps(10)
        .update_per_step(0.1)
        .batch_size(32)
        .warmup_buffer_size(1000)
        .build();
    let mut trainer = Trainer::builder(config, CountingAlgorithm::new(&log))
        .train_collector(ScriptedCollector::train(&log))
        .build()
        .unwrap();

    trainer.reset(true, true).unwrap();
    let result = trainer.execute_epoch().unwrap();

    let events = log.events();
    let first_update = events
        .iter()
        .position(|e| matches!(e, Event::Update { .. }))
        .expect("updates after warm-up");
    let collects_before_first_update = events[..first_update]
        .iter()
        .filter(|e| matches!(e, Event::Collect { role: Role::Train, .. }))
        .count();
    assert_eq!(collects_before_first_update, 101);

    // Warm-up steps still count toward env_step and the epoch budget
    assert_eq!(result.env_step, Some(2000));
    assert_eq!(log.train_collects().len(), 200);
    assert_eq!(result.update_step, 100);
}

#[test]
fn off_policy_budget_may_overshoot_by_less_than_one_collection() {
    let log = EventLog::new();
    let config = TrainerConfig::builder(Regime::OffPolicy)
        .epoch_num_steps(95)
        .collection_step_num_env_steps(10)
        .batch_size(8)
        .build();
    let mut trainer = Trainer::builder(config, CountingAlgorithm::new(&log))
        .train_collector(ScriptedCollector::train(&log))
        .build()
        .unwrap();
    trainer.reset(true, true).unwrap();

    let result = trainer.execute_epoch().unwrap();
    assert_eq!(result.env_step, Some(100));
    // Default ratio: one update per step
    assert_eq!(result.update_step, 100);
}

#[test]
fn zero_episode_collections_report_absent_returns() {
    let log = EventLog::new();
    let memory = MemoryLogger::new();
    let mut trainer = Trainer::builder(off_policy_config(), CountingAlgorithm::new(&log))
        .train_collector(ScriptedCollector::train(&log).episode_len(1000))
        .logger(memory.clone())
        .build()
        .unwrap();
    trainer.reset(true, true).unwrap();

    let result = trainer.execute_epoch().unwrap();
    let last = result.last_train_collect.unwrap();
    assert_eq!(last.n_collected_episodes, 0);
    assert_eq!(last.returns_mean(), None);
    assert_eq!(last.lens_mean(), None);
    assert_eq!(result.train_collect.unwrap().returns, None);

    let records = memory.records_for(LogScope::TrainCollect);
    assert_eq!(records.len(), 10);
    assert!(records.iter().all(|r| !r.scalars.contains_key("returns_mean")));
}

#[test]
fn last_collect_is_never_stale() {
    let log = EventLog::new();
    let collector = ScriptedCollector::train(&log).episode_len(5).returns(vec![7.0]);
    let mut trainer = Trainer::builder(off_policy_config(), CountingAlgorithm::new(&log))
        .train_collector(collector)
        .build()
        .unwrap();
    trainer.reset(true, true).unwrap();
    let result = trainer.execute_epoch().unwrap();
    assert_eq!(result.last_train_collect.unwrap().returns_mean(), Some(7.0));

    let log = EventLog::new();
    let mut trainer = Trainer::builder(off_policy_config(), CountingAlgorithm::new(&log))
        .train_collector(ScriptedCollector::train(&log).without_episodes())
        .build()
        .unwrap();
    trainer.reset(true, true).unwrap();
    let result = trainer.execute_epoch().unwrap();
    assert_eq!(result.last_train_collect.unwrap().returns_mean(), None);
}

// ============================================================================
// On-policy
// ============================================================================

#[test]
fn on_policy_repeats_updates_then_discards_batch() {
    let log = EventLog::new();
    let mut trainer = Trainer::builder(on_policy_config(), CountingAlgorithm::new(&log))
        .train_collector(ScriptedCollector::train(&log))
        .build()
        .unwrap();
    trainer.reset(true, true).unwrap();
    log.clear();

    let result = trainer.execute_epoch().unwrap();

    assert_eq!(log.train_collects().len(), 1);
    assert_eq!(result.update.num_updates, 4);
    assert_eq!(result.update_step, 4);

    let passes: Vec<(u64, usize, usize, usize)> = log
        .updates()
        .into_iter()
        .filter_map(|e| match e {
            Event::Update {
                update_step,
                pass,
                num_passes,
                batch_size,
            } => Some((update_step, pass, num_passes, batch_size)),
            _ => None,
        })
        .collect();
    assert_eq!(
        passes,
        vec![(0, 0, 4, 2000), (1, 1, 4, 2000), (2, 2, 4, 2000), (3, 3, 4, 2000)]
    );

    // The whole buffer was sampled once, then discarded without an env reset
    let events = log.events();
    assert!(events.contains(&Event::Sample { batch_size: None }));
    assert_eq!(log.resets(Role::Train), vec![(false, true)]);
    assert!(matches!(events.last(), Some(Event::Reset { role: Role::Train, .. })));

    let algorithm = trainer.algorithm();
    assert_eq!(algorithm.preprocessed, 1);
    assert_eq!(algorithm.postprocessed, 1);
}

#[test]
fn on_policy_batch_is_discarded_when_test_in_train_ends_the_epoch() {
    let log = EventLog::new();
    let mut config = on_policy_config();
    config.test_in_train = true;
    let mut trainer = Trainer::builder(config, CountingAlgorithm::new(&log))
        .train_collector(ScriptedCollector::train(&log).returns(vec![200.0, 0.0]))
        .test_collector(ScriptedCollector::test(&log, vec![200.0, 0.0]))
        .stop_fn(scoring::reward_threshold(195.0))
        .build()
        .unwrap();
    trainer.reset(true, true).unwrap();
    log.clear();

    let first = trainer.execute_epoch().unwrap();
    assert!(first.stopped_in_train);
    assert_eq!(first.update_step, 0);
    assert!(log.update_batch_sizes().is_empty());
    assert_eq!(log.resets(Role::Train), vec![(false, true)]);

    // The next epoch trains on its own collection only
    let second = trainer.execute_epoch().unwrap();
    assert!(!second.stopped_in_train);
    assert_eq!(second.env_step, Some(4000));
    assert_eq!(second.update_step, 4);
    assert_eq!(log.update_batch_sizes(), vec![2000; 4]);
    assert_eq!(log.train_buffer_lens(), vec![0, 0]);
}

#[test]
fn on_policy_batch_is_discarded_when_an_update_fails() {
    let log = EventLog::new();
    let mut trainer = Trainer::builder(on_policy_config(), CountingAlgorithm::new(&log).fail_at_update_step(2))
        .train_collector(ScriptedCollector::train(&log))
        .build()
        .unwrap();
    trainer.reset(true, true).unwrap();
    log.clear();

    let err = trainer.execute_epoch().unwrap_err();
    assert!(matches!(err, TrainerError::Update { .. }));
    assert_eq!(log.resets(Role::Train), vec![(false, true)]);

    // Retrying the epoch starts from an empty buffer
    assert!(trainer.execute_epoch().is_err());
    assert_eq!(log.train_buffer_lens(), vec![0, 0]);
    assert!(log.update_batch_sizes().iter().all(|&size| size == 2000));
}

#[test]
fn on_policy_updates_only_see_the_current_collection() {
    let log = EventLog::new();
    let mut trainer = Trainer::builder(on_policy_config(), CountingAlgorithm::new(&log))
        .train_collector(ScriptedCollector::train(&log))
        .build()
        .unwrap();

    trainer.run(RunOptions::epochs(3)).unwrap();

    assert_eq!(log.update_batch_sizes(), vec![2000; 12]);
    assert_eq!(log.train_buffer_lens(), vec![0, 0, 0]);
}

#[test]
fn on_policy_collects_full_episodes() {
    let log = EventLog::new();
    let config = TrainerConfig::builder(Regime::OnPolicy)
        .epoch_num_steps(200)
        .collection_step_num_episodes(5)
        .build();
    let mut trainer = Trainer::builder(config, CountingAlgorithm::new(&log))
        .train_collector(ScriptedCollector::train(&log).episode_len(10))
        .build()
        .unwrap();
    trainer.reset(true, true).unwrap();

    let result = trainer.execute_epoch().unwrap();
    let collects = log.train_collects();
    assert_eq!(collects.len(), 4);
    assert!(collects.iter().all(|e| matches!(
        e,
        Event::Collect {
            request: CollectRequest::Episodes(5),
            mode: CollectMode::Train,
            buffer_len_before: 0,
            ..
        }
    )));
    assert_eq!(result.update_step, 4);
    assert_eq!(result.env_step, Some(200));
    assert_eq!(trainer.state().unwrap().env_episode, Some(20));
}

// ============================================================================
// Offline
// ============================================================================

#[test]
fn offline_runs_budget_updates_without_env_steps() {
    let log = EventLog::new();
    let mut trainer = Trainer::builder(offline_config(), CountingAlgorithm::new(&log))
        .dataset(FixedDataset::new(&log, 10_000))
        .build()
        .unwrap();

    let stats = trainer.run(RunOptions::default()).unwrap();

    assert_eq!(stats.epochs_completed, 10);
    assert_eq!(stats.update_step, 500);
    assert_eq!(stats.env_step, None);
    assert_eq!(stats.env_episode, None);
    assert!(stats.best.is_none());
    assert!(!stats.stopped_early);
    assert_eq!(trainer.algorithm().updates, 500);
    assert!(log
        .events()
        .iter()
        .all(|e| !matches!(e, Event::Collect { .. })));
}

#[test]
fn offline_epochs_are_tested_when_a_test_collector_exists() {
    let log = EventLog::new();
    let mut trainer = Trainer::builder(offline_config(), CountingAlgorithm::new(&log))
        .dataset(FixedDataset::new(&log, 10_000))
        .test_collector(ScriptedCollector::test(&log, vec![1.0, 2.0, 3.0]))
        .build()
        .unwrap();
    trainer.reset(true, true).unwrap();

    let result = trainer.execute_epoch().unwrap();
    assert_eq!(result.env_step, None);
    assert_eq!(result.score, Some(1.0));
    assert!(result.train_collect.is_none());
    assert_eq!(log.test_collects(), 1);
}

// ============================================================================
// Test Schedule
// ============================================================================

#[test]
fn test_pass_follows_interval() {
    let log = EventLog::new();
    let mut config = off_policy_config();
    config.test_interval = 2;
    let mut trainer = Trainer::builder(config, CountingAlgorithm::new(&log))
        .train_collector(ScriptedCollector::train(&log))
        .test_collector(ScriptedCollector::test(&log, vec![5.0]))
        .build()
        .unwrap();
    trainer.reset(true, true).unwrap();

    let scores: Vec<Option<f64>> = (0..4)
        .map(|_| trainer.execute_epoch().unwrap().score)
        .collect();
    assert_eq!(scores, vec![None, Some(5.0), None, Some(5.0)]);
    assert_eq!(log.test_collects(), 2);
}

#[test]
fn test_collector_starts_every_pass_from_reset_environments() {
    let log = EventLog::new();
    let mut trainer = Trainer::builder(off_policy_config(), CountingAlgorithm::new(&log))
        .train_collector(ScriptedCollector::train(&log))
        .test_collector(ScriptedCollector::test(&log, vec![5.0]))
        .build()
        .unwrap();
    trainer.reset(false, false).unwrap();
    trainer.execute_epoch().unwrap();
    trainer.execute_epoch().unwrap();

    assert_eq!(log.resets(Role::Test), vec![(true, true), (true, true)]);
    let test_collect = log
        .events()
        .into_iter()
        .find(|e| matches!(e, Event::Collect { role: Role::Test, .. }))
        .unwrap();
    assert_eq!(
        test_collect,
        Event::Collect {
            role: Role::Test,
            request: CollectRequest::Episodes(2),
            mode: CollectMode::Test,
            buffer_len_before: 0,
        }
    );
}

#[test]
fn update_records_are_keyed_by_update_step() {
    let log = EventLog::new();
    let memory = MemoryLogger::new();
    let mut trainer = Trainer::builder(offline_config(), CountingAlgorithm::new(&log))
        .dataset(FixedDataset::new(&log, 100))
        .logger(memory.clone())
        .build()
        .unwrap();
    trainer.reset(true, true).unwrap();
    trainer.execute_epoch().unwrap();

    let steps: Vec<u64> = memory
        .records_for(LogScope::Update)
        .iter()
        .map(|r| r.update_step)
        .collect();
    assert_eq!(steps, (1..=50).collect::<Vec<_>>());

    let epochs = memory.records_for(LogScope::Epoch);
    assert_eq!(epochs.len(), 1);
    assert_eq!(epochs[0].scalars["num_updates"], 50.0);
    assert!(!epochs[0].scalars.contains_key("env_step"));
}
