//! Error types for the consistency and caching layer

use thiserror::Error;

/// Errors raised by the core primitives and the store collaborators they drive.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Cache error: {0}")]
    CacheError(String),

    /// The cache backend could not be reached. `ServiceCache` turns this into a miss.
    #[error("Cache backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Search index error: {0}")]
    SearchIndexError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timed out acquiring lock '{key}' after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Compensation for step '{step}' failed: {reason}")]
    CompensationFailed { step: String, reason: String },

    #[error("Sync of {entity_type} '{canonical_id}' failed: {reason}")]
    SyncItemFailed {
        entity_type: String,
        canonical_id: String,
        reason: String,
    },
}

impl ServiceError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::BackendUnavailable(_)
                | ServiceError::CacheError(_)
                | ServiceError::DatabaseError(_)
                | ServiceError::SearchIndexError(_)
                | ServiceError::LockTimeout { .. }
        )
    }
}

impl From<redis::RedisError> for ServiceError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_timeout() {
            ServiceError::BackendUnavailable(err.to_string())
        } else {
            ServiceError::CacheError(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for ServiceError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        ServiceError::BackendUnavailable(format!("Failed to get Redis connection: {}", err))
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ServiceError::NotFound(err.to_string()),
            other => ServiceError::DatabaseError(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::SearchIndexError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ServiceError::BackendUnavailable("down".into()).is_transient());
        assert!(ServiceError::DatabaseError("deadlock".into()).is_transient());
        assert!(ServiceError::LockTimeout { key: "k".into(), attempts: 3 }.is_transient());
        assert!(!ServiceError::NotFound("user 1".into()).is_transient());
        assert!(!ServiceError::SerializationError("bad json".into()).is_transient());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: ServiceError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
