//! Error types for the drill harness.

use meshview_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    /// An engine operation failed where the drill expected it to succeed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A drill observed state that contradicts what it just did.
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// The invariant oracle reported violations.
    #[error("invariant violated: {}", .0.join("; "))]
    Invariant(Vec<String>),

    #[error("unknown drill: {0}")]
    UnknownDrill(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SimResult<T> = Result<T, SimError>;

/// Returns early with [`SimError::Assertion`] when the condition is false.
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::SimError::Assertion(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure;
