use thiserror::Error;

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Request failed validation and will never succeed unchanged.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller-supplied idempotency key is blank or malformed.
    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    /// Referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database error from the durable store.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis error from the record cache.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Payload serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Business work raised an error during execution. The original error is
    /// preserved as the source and annotated with the execution identity.
    #[error("Work execution failed for key {key} (correlation {correlation_id}): {source}")]
    WorkExecution {
        key: String,
        correlation_id: String,
        retryable: bool,
        #[source]
        source: Box<AppError>,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Wraps a business error raised by caller-supplied work with the
    /// identity of the execution it belongs to.
    pub fn work_execution(
        key: impl Into<String>,
        correlation_id: impl Into<String>,
        retryable: bool,
        source: AppError,
    ) -> Self {
        AppError::WorkExecution {
            key: key.into(),
            correlation_id: correlation_id.into(),
            retryable,
            source: Box::new(source),
        }
    }

    /// Returns true when a later attempt with the same input may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Validation(_) | AppError::InvalidKey(_) | AppError::NotFound(_) => false,
            AppError::WorkExecution { retryable, .. } => *retryable,
            AppError::Database(_) | AppError::Redis(_) => true,
            AppError::Serialization(_) | AppError::Internal(_) => false,
        }
    }
}

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_execution_annotation() {
        let err = AppError::work_execution(
            "JOB:payroll:20260115:abc123",
            "4f2d6a",
            true,
            AppError::Validation("amount missing".to_string()),
        );

        let message = err.to_string();
        assert!(message.contains("JOB:payroll:20260115:abc123"));
        assert!(message.contains("4f2d6a"));
        assert!(message.contains("amount missing"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retryability() {
        assert!(!AppError::Validation("bad".to_string()).is_retryable());
        assert!(!AppError::InvalidKey("blank".to_string()).is_retryable());
        assert!(!AppError::NotFound("missing".to_string()).is_retryable());

        let terminal = AppError::work_execution(
            "k",
            "c",
            false,
            AppError::Validation("no".to_string()),
        );
        assert!(!terminal.is_retryable());
    }
}
