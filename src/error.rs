use thiserror::Error;

/// Failures of the record store itself.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Idempotency record '{0}' is not pending")]
    RecordNotPending(String),

    #[error("Corrupt idempotency record '{key}': {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("Result for '{key}' is {size} bytes, limit is {limit}")]
    ResultTooLarge { key: String, size: usize, limit: usize },

    #[error("Failed to release idempotency record '{key}': {reason}")]
    Release { key: String, reason: String },
}

#[derive(Error, Debug)]
pub enum IdempotencyError {
    #[error("Key extraction failed: {0}")]
    KeyExtraction(String),

    #[error("Timed out waiting for in-flight invocation '{key}' after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation failed: {0}")]
    Operation(#[source] anyhow::Error),

    #[error("Failed to commit outcome of '{key}': {source}")]
    Commit {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for IdempotencyError {
    fn from(err: sqlx::Error) -> Self {
        IdempotencyError::Store(StoreError::Database(err))
    }
}

impl IdempotencyError {
    /// Returns the wrapped operation error, if this is one.
    pub fn operation_error(&self) -> Option<&anyhow::Error> {
        match self {
            IdempotencyError::Operation(err) => Some(err),
            _ => None,
        }
    }

    /// Whether re-invoking with the same key later can succeed.
    ///
    /// Undecodable results and corrupt records stay that way for the key.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            IdempotencyError::KeyExtraction(_)
                | IdempotencyError::Config(_)
                | IdempotencyError::Serialization(_)
                | IdempotencyError::Store(StoreError::CorruptRecord { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;
