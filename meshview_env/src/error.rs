//! Error types for the MeshView environment abstraction.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// Attempted to move a virtual clock backwards.
    #[error("Clock rewind: requested {requested:?}, clock is already at {now:?}")]
    ClockRewind {
        requested: Duration,
        now: Duration,
    },

    /// A probability outside `[0, 1]` was supplied.
    #[error("Invalid probability: {0}")]
    InvalidProbability(String),
}

impl EnvError {
    /// Creates a clock rewind error.
    pub fn rewind(requested: Duration, now: Duration) -> Self {
        Self::ClockRewind { requested, now }
    }

    /// Checks that `p` is a usable probability.
    pub fn check_probability(p: f64) -> Result<f64, Self> {
        if p.is_finite() && (0.0..=1.0).contains(&p) {
            Ok(p)
        } else {
            Err(Self::InvalidProbability(p.to_string()))
        }
    }
}
