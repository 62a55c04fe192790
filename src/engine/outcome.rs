use serde::{Deserialize, Serialize};

/// How an execution request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// The work function ran to completion in this call.
    Success,
    /// A previously stored result was replayed; the work did not run.
    CachedResult,
    /// Another caller currently owns the key; retry later.
    InProgress,
    /// The failure budget is spent; the work will not run again this window.
    MaxRetriesExceeded,
}

impl ExecutionStatus {
    /// Lowercase label used for metrics and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::CachedResult => "cached_result",
            ExecutionStatus::InProgress => "in_progress",
            ExecutionStatus::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }
}

/// Result of an idempotent execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome<T> {
    pub status: ExecutionStatus,
    pub data: Option<T>,
    pub key: String,
    pub correlation_id: String,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub from_cache: bool,
    pub duration_ms: f64,
}

impl<T> ExecutionOutcome<T> {
    pub fn success(
        data: T,
        key: impl Into<String>,
        correlation_id: impl Into<String>,
        retry_count: i32,
        duration_ms: f64,
    ) -> Self {
        Self {
            status: ExecutionStatus::Success,
            data: Some(data),
            key: key.into(),
            correlation_id: correlation_id.into(),
            error_message: None,
            retry_count,
            from_cache: false,
            duration_ms,
        }
    }

    pub fn cached(
        data: Option<T>,
        key: impl Into<String>,
        correlation_id: impl Into<String>,
        retry_count: i32,
        duration_ms: f64,
    ) -> Self {
        Self {
            status: ExecutionStatus::CachedResult,
            data,
            key: key.into(),
            correlation_id: correlation_id.into(),
            error_message: None,
            retry_count,
            from_cache: true,
            duration_ms,
        }
    }

    pub fn in_progress(
        key: impl Into<String>,
        correlation_id: impl Into<String>,
        retry_count: i32,
        duration_ms: f64,
    ) -> Self {
        Self {
            status: ExecutionStatus::InProgress,
            data: None,
            key: key.into(),
            correlation_id: correlation_id.into(),
            error_message: None,
            retry_count,
            from_cache: false,
            duration_ms,
        }
    }

    pub fn max_retries_exceeded(
        key: impl Into<String>,
        correlation_id: impl Into<String>,
        error_message: Option<String>,
        retry_count: i32,
        duration_ms: f64,
    ) -> Self {
        Self {
            status: ExecutionStatus::MaxRetriesExceeded,
            data: None,
            key: key.into(),
            correlation_id: correlation_id.into(),
            error_message,
            retry_count,
            from_cache: false,
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn is_cached(&self) -> bool {
        self.status == ExecutionStatus::CachedResult
    }
}
