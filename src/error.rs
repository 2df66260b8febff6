//! Error types for the Commandpool service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Commandpool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Content failed the length or content rules
    #[error("Validation error: {0}")]
    Validation(String),

    /// The same content is already stored
    #[error("Command already exists")]
    Duplicate,

    /// Invalidation target is absent
    #[error("Command not found or already removed")]
    NotFound,

    /// A row lock could not be acquired in time, or the row vanished mid-transaction
    #[error("Contention: {0}")]
    Contention(String),

    /// The store is unreachable or failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A crawl report could not be parsed
    #[error("Malformed crawl report: {0}")]
    Report(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Contention(_))
    }

    /// Whether the caller can fix the request themselves.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PoolError::Validation(_) | PoolError::Duplicate | PoolError::NotFound
        )
    }
}

impl From<StoreError> for PoolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => PoolError::Duplicate,
            StoreError::LockTimeout => PoolError::Contention("row lock timed out".to_string()),
            StoreError::Vanished(id) => {
                PoolError::Contention(format!("command {} vanished before commit", id))
            }
            StoreError::Backend(msg) => PoolError::Persistence(msg),
        }
    }
}

impl From<config::ConfigError> for PoolError {
    fn from(err: config::ConfigError) -> Self {
        PoolError::Config(err.to_string())
    }
}

/// Result type alias for Commandpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        assert!(matches!(PoolError::from(StoreError::Duplicate), PoolError::Duplicate));
        assert!(PoolError::from(StoreError::LockTimeout).is_retryable());
        assert!(PoolError::from(StoreError::Vanished(uuid::Uuid::nil().into())).is_retryable());
        assert!(matches!(
            PoolError::from(StoreError::Backend("down".into())),
            PoolError::Persistence(_)
        ));
    }

    #[test]
    fn test_user_errors() {
        assert!(PoolError::Duplicate.is_user_error());
        assert!(PoolError::NotFound.is_user_error());
        assert!(PoolError::Validation("short".into()).is_user_error());
        assert!(!PoolError::Persistence("down".into()).is_user_error());
        assert!(!PoolError::Contention("busy".into()).is_user_error());
    }
}
