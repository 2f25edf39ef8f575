//! Synchronous error type for every engine operation.
//!
//! Probabilistic outcomes recorded on scenarios ("system timeout",
//! "connection lost", ...) are not errors; they live in
//! [`FailureReason`](crate::model::FailureReason).

use meshview_env::{AccountId, BatchId, EnvError, ResultId};

use crate::model::Amount;

/// Errors returned by engine operations. None of them leave partial
/// mutation behind.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Faucet pool exhausted: requested {requested}, available {available}")]
    PoolExhausted { requested: Amount, available: Amount },

    #[error("Insufficient funds on {account}: required {required}, available {available}")]
    InsufficientFunds {
        account: AccountId,
        required: Amount,
        available: Amount,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("Scenario {sequence_id} not found in batch {batch}")]
    ScenarioNotFound { batch: BatchId, sequence_id: u32 },

    #[error("Result not found: {0}")]
    ResultNotFound(ResultId),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Amount overflow")]
    Overflow,

    #[error(transparent)]
    Env(#[from] EnvError),
}

impl CoreError {
    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::PoolExhausted {
            requested: Amount::from_tokens(5),
            available: Amount::from_tokens(2),
        };
        assert_eq!(
            err.to_string(),
            "Faucet pool exhausted: requested 5.000000, available 2.000000"
        );
        assert_eq!(
            CoreError::validation("no target chains").to_string(),
            "Validation failed: no target chains"
        );
    }

    #[test]
    fn test_json_error_maps_to_config() {
        let err: CoreError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, CoreError::Config(_)));
    }
}
