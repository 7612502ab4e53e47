//! Score functions and stop criteria.
//!
//! Both are plain pure functions supplied as configuration: a score function
//! maps test statistics to a scalar, a stop criterion maps that scalar to a
//! verdict. The trainer always hands the stop criterion the score produced by
//! the configured score function, so swapping the score function changes stop
//! behavior with no other change.
//!
//! # Example
//!
//! ```rust
//! use rl_trainer_rs::metrics::CollectStats;
//! use rl_trainer_rs::scoring::{self, ScoreFn, StopFn};
//!
//! let score: ScoreFn = scoring::mean_minus_std(1.0);
//! let stop: StopFn = scoring::reward_threshold(195.0);
//!
//! let stats = CollectStats::from_episodes(400, &[200.0, 200.0], &[200, 200]);
//! assert!(stop(score(&stats)));
//! ```

use std::sync::Arc;

use crate::metrics::CollectStats;

/// Maps test statistics to a score. Must be pure.
pub type ScoreFn = Arc<dyn Fn(&CollectStats) -> f64 + Send + Sync>;

/// Decides whether a score is good enough to stop. Must be pure.
pub type StopFn = Arc<dyn Fn(f64) -> bool + Send + Sync>;

/// Default score: mean test return, `-inf` if no episode finished.
#[must_use]
pub fn mean_return() -> ScoreFn {
    Arc::new(|stats: &CollectStats| stats.returns_mean().unwrap_or(f64::NEG_INFINITY))
}

/// Mean return penalized by `k` standard deviations.
#[must_use]
pub fn mean_minus_std(k: f64) -> ScoreFn {
    Arc::new(move |stats: &CollectStats| {
        stats
            .returns
            .map_or(f64::NEG_INFINITY, |r| r.mean - k * r.std)
    })
}

/// Negated mean episode length; useful when shorter episodes are better.
#[must_use]
pub fn shortest_episodes() -> ScoreFn {
    Arc::new(|stats: &CollectStats| stats.lens_mean().map_or(f64::NEG_INFINITY, |l| -l))
}

/// Stops once the score reaches `threshold`.
#[must_use]
pub fn reward_threshold(threshold: f64) -> StopFn {
    Arc::new(move |score| score >= threshold)
}

/// Wraps a closure as a [`ScoreFn`].
pub fn score_fn(f: impl Fn(&CollectStats) -> f64 + Send + Sync + 'static) -> ScoreFn {
    Arc::new(f)
}

/// Wraps a closure as a [`StopFn`].
pub fn stop_fn(f: impl Fn(f64) -> bool + Send + Sync + 'static) -> StopFn {
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_return_defaults_to_negative_infinity() {
        let score = mean_return();
        assert_eq!(score(&CollectStats::without_episodes(10)), f64::NEG_INFINITY);
        let stats = CollectStats::from_episodes(20, &[1.0, 3.0], &[10, 10]);
        assert!((score(&stats) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_mean_minus_std() {
        let stats = CollectStats::from_episodes(20, &[1.0, 3.0], &[10, 10]);
        let score = mean_minus_std(2.0);
        assert!((score(&stats) - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_shortest_episodes() {
        let stats = CollectStats::from_episodes(30, &[0.0, 0.0], &[10, 20]);
        assert!((shortest_episodes()(&stats) + 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_reward_threshold_is_inclusive() {
        let stop = reward_threshold(195.0);
        assert!(stop(195.0));
        assert!(!stop(194.9));
    }
}
