//! The closed error taxonomy surfaced by transaction runners and state
//! transactions.
//!
//! Store-level codes never cross this boundary directly: adapters match
//! their client's error type and wrap it into one of these kinds before it
//! reaches caller code (§7 of the spec this crate implements).

use thiserror::Error;

/// Errors surfaced by state transactions and transaction runners.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("entity not found: {entity_type} {key}")]
    EntityNotFound { entity_type: String, key: String },

    #[error("entity already exists: {entity_type} {key}")]
    EntityAlreadyExists { entity_type: String, key: String },

    #[error("entity is missing a primary key column: {entity_type}")]
    EntityMissingPrimaryKey { entity_type: String },

    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },

    /// Retryable infrastructure error. The SDK-level retry (if any) has
    /// already been exhausted by the time this surfaces; the runner may
    /// retry again at its own discretion.
    #[error("temporary backend error: {message}")]
    TemporaryBackendError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Domain-level "the snapshot this transaction read is stale, retry
    /// after `suggested_delay_ms`" signal. Raised by user transaction
    /// bodies, caught by the SQL transaction runner.
    #[error("transaction read an old timestamp, retry after {suggested_delay_ms}ms")]
    TransactionOldTimestampError {
        as_of_unix_ms: i64,
        suggested_delay_ms: u64,
    },

    #[error("invalid entity definition: {reason}")]
    InvalidEntityDefinition { reason: String },

    /// The user's transaction body committed or rolled back the
    /// underlying store transaction itself.
    #[error("transaction already finished")]
    TransactionFinished,
}

impl CoreError {
    /// True for errors the SQL transaction runner should retry rather than
    /// surface, per §4.6's error-translation table.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::TemporaryBackendError { .. })
    }

    pub fn temporary(message: impl Into<String>) -> Self {
        CoreError::TemporaryBackendError {
            message: message.into(),
            source: None,
        }
    }

    pub fn temporary_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        CoreError::TemporaryBackendError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_temporary_backend_errors_are_retryable() {
        assert!(CoreError::temporary("x").is_retryable());
        assert!(!CoreError::TransactionFinished.is_retryable());
        assert!(!CoreError::EntityNotFound {
            entity_type: "Foo".into(),
            key: "1".into()
        }
        .is_retryable());
    }
}
