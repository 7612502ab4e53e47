//! Error types for the training orchestrator.
//!
//! The trainer itself never retries or swallows a failure. Errors raised by
//! collectors and algorithms travel up unchanged, and the trainer only adds
//! its own variants for misconfiguration, missing scores and checkpoint I/O.
//!
//! # Error Categories
//!
//! - **Configuration Errors**: Regime/parameter mismatches, missing collaborators,
//!   or lifecycle misuse such as executing an epoch before `reset`
//! - **Collaborator Errors**: Failures reported by a collector or an algorithm
//! - **Scoring Errors**: A stop check was requested for an epoch without a score
//! - **I/O Errors**: Checkpoint save/load failures
//!
//! # Example
//!
//! ```rust
//! use rl_trainer_rs::error::TrainerError;
//!
//! fn describe(error: &TrainerError) -> &'static str {
//!     match error {
//!         TrainerError::Config { .. } => "fix the configuration and rebuild the trainer",
//!         TrainerError::Collection { .. } | TrainerError::Update { .. } => "collaborator failed",
//!         TrainerError::ScoringUnavailable { .. } => "no test pass ran this epoch",
//!         TrainerError::Checkpoint { .. } => "checkpoint I/O failed",
//!     }
//! }
//! ```

use thiserror::Error;

/// Boxed error reported by an external collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for the training orchestrator.
#[derive(Debug, Error)]
pub enum TrainerError {
    /// Invalid parameters, inconsistent collaborators, or lifecycle misuse.
    ///
    /// Raised at construction or `reset` time and never auto-corrected.
    #[error("Configuration error: {detail}")]
    Config {
        /// Description of the configuration issue.
        detail: String,
    },

    /// A collector failed while gathering experience.
    #[error("Collection failed: {source}")]
    Collection {
        /// The collector's own error.
        #[source]
        source: BoxError,
    },

    /// An algorithm failed while processing a batch.
    #[error("Update failed: {source}")]
    Update {
        /// The algorithm's own error.
        #[source]
        source: BoxError,
    },

    /// A stop criterion was evaluated for an epoch that produced no score.
    #[error("No score available for epoch {epoch}: no test pass ran")]
    ScoringUnavailable {
        /// The epoch that was checked.
        epoch: u64,
    },

    /// Checkpoint save or load failed.
    #[error("Checkpoint error: {reason}")]
    Checkpoint {
        /// Description of the checkpoint failure.
        reason: String,
    },
}

impl TrainerError {
    /// Creates a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::Config {
            detail: detail.into(),
        }
    }

    /// Wraps a collector failure.
    pub fn collection(source: impl Into<BoxError>) -> Self {
        Self::Collection {
            source: source.into(),
        }
    }

    /// Wraps an algorithm failure.
    pub fn update(source: impl Into<BoxError>) -> Self {
        Self::Update {
            source: source.into(),
        }
    }

    /// Creates a checkpoint error.
    pub fn checkpoint(reason: impl Into<String>) -> Self {
        Self::Checkpoint {
            reason: reason.into(),
        }
    }

    /// Returns whether the error originated in a collaborator.
    #[must_use]
    pub fn is_collaborator_error(&self) -> bool {
        matches!(self, Self::Collection { .. } | Self::Update { .. })
    }
}

/// Result alias used throughout the crate.
pub type TrainerResult<T> = Result<T, TrainerError>;
