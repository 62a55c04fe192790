use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::TargetKind;

/// State of an idempotency record in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    /// Record has been created but the work has not been claimed yet.
    Started,
    /// A caller holds the record and is executing the work.
    InProgress,
    /// Work finished; the stored response is replayable.
    Completed,
    /// Work raised an error; retries may remain.
    Failed,
    /// Validity window elapsed before the record reached a replayable end.
    Expired,
}

impl ExecutionState {
    /// Returns true for states that admit no further transition within the
    /// validity window.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Expired)
    }

    /// Returns true while some caller owns (or owned) the execution.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ExecutionState::Started | ExecutionState::InProgress)
    }

    /// Returns true if the state machine admits `next` from this state.
    /// Every state can reach `InProgress` because an elapsed validity window
    /// recycles the record into a fresh attempt under the same key.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        match (self, next) {
            (ExecutionState::Started, ExecutionState::InProgress) => true,
            (ExecutionState::Started, ExecutionState::Expired) => true,
            (ExecutionState::InProgress, ExecutionState::InProgress) => true,
            (ExecutionState::InProgress, ExecutionState::Completed) => true,
            (ExecutionState::InProgress, ExecutionState::Failed) => true,
            (ExecutionState::InProgress, ExecutionState::Expired) => true,
            (ExecutionState::Failed, ExecutionState::InProgress) => true,
            (ExecutionState::Failed, ExecutionState::Expired) => true,
            (ExecutionState::Completed, ExecutionState::InProgress) => true,
            (ExecutionState::Expired, ExecutionState::InProgress) => true,
            _ => false,
        }
    }

    /// Lowercase label used for metrics and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionState::Started => "started",
            ExecutionState::InProgress => "in_progress",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Expired => "expired",
        }
    }
}

/// Durable record tracking one unit of work under an idempotency key.
///
/// The `version` column is the optimistic-lock token: every successful write
/// increments it, and conditional updates carry the version they read so the
/// store can reject writes that lost a race.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IdempotencyRecord {
    pub id: Uuid,
    pub key: String,
    pub target_kind: TargetKind,
    pub target_name: String,
    pub correlation_id: String,
    pub transaction_ref: Option<String>,
    pub content_hash: Option<String>,
    pub state: ExecutionState,
    pub request_payload: Option<serde_json::Value>,
    pub response_payload: Option<serde_json::Value>,
    pub error_detail: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Creates a fresh record in `Started` state with the validity window
    /// anchored at `now`.
    pub fn new(
        key: impl Into<String>,
        target_kind: TargetKind,
        target_name: impl Into<String>,
        correlation_id: impl Into<String>,
        ttl_seconds: i64,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            target_kind,
            target_name: target_name.into(),
            correlation_id: correlation_id.into(),
            transaction_ref: None,
            content_hash: None,
            state: ExecutionState::Started,
            request_payload: None,
            response_payload: None,
            error_detail: None,
            retry_count: 0,
            max_retries,
            version: 1,
            created_at: now,
            completed_at: None,
            last_accessed_at: now,
            expires_at: now + Duration::seconds(ttl_seconds),
        }
    }

    pub fn with_transaction_ref(mut self, transaction_ref: impl Into<String>) -> Self {
        self.transaction_ref = Some(transaction_ref.into());
        self
    }

    pub fn with_content_hash(mut self, content_hash: impl Into<String>) -> Self {
        self.content_hash = Some(content_hash.into());
        self
    }

    pub fn with_request_payload(mut self, payload: serde_json::Value) -> Self {
        self.request_payload = Some(payload);
        self
    }

    /// Returns true once the validity window has elapsed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Returns true when an in-flight record has gone untouched for at least
    /// `stale_timeout_secs` — the owning process is presumed to have crashed.
    pub fn is_stale_at(&self, now: DateTime<Utc>, stale_timeout_secs: i64) -> bool {
        self.state.is_in_flight()
            && now.signed_duration_since(self.last_accessed_at)
                >= Duration::seconds(stale_timeout_secs)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true while the failure budget still admits another attempt.
    pub fn has_retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Claims the record for execution.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        debug_assert!(self.state.can_transition_to(ExecutionState::InProgress));
        self.state = ExecutionState::InProgress;
        self.last_accessed_at = now;
    }

    /// Marks the work as finished with its replayable response.
    pub fn complete(&mut self, response_payload: Option<serde_json::Value>, now: DateTime<Utc>) {
        debug_assert!(self.state.can_transition_to(ExecutionState::Completed));
        self.state = ExecutionState::Completed;
        self.response_payload = response_payload;
        self.error_detail = None;
        self.completed_at = Some(now);
        self.last_accessed_at = now;
    }

    /// Records an attempt failure and consumes one retry.
    pub fn record_failure(&mut self, error_detail: impl Into<String>, now: DateTime<Utc>) {
        debug_assert!(self.state.can_transition_to(ExecutionState::Failed));
        self.state = ExecutionState::Failed;
        self.error_detail = Some(error_detail.into());
        self.retry_count += 1;
        self.completed_at = Some(now);
        self.last_accessed_at = now;
    }

    /// Marks a non-terminal record whose window elapsed.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        debug_assert!(self.state.can_transition_to(ExecutionState::Expired));
        self.state = ExecutionState::Expired;
        self.last_accessed_at = now;
    }

    /// Recycles the record into a brand-new claimed attempt under the same
    /// key: a fresh validity window, a zeroed failure budget, and no residue
    /// from the previous outcome. The version keeps increasing through the
    /// store, so concurrent writers against the old incarnation still lose.
    pub fn reset_for_new_attempt(
        &mut self,
        correlation_id: impl Into<String>,
        ttl_seconds: i64,
        max_retries: i32,
        now: DateTime<Utc>,
    ) {
        debug_assert!(self.state.can_transition_to(ExecutionState::InProgress));
        self.state = ExecutionState::InProgress;
        self.correlation_id = correlation_id.into();
        self.transaction_ref = None;
        self.content_hash = None;
        self.request_payload = None;
        self.response_payload = None;
        self.error_detail = None;
        self.retry_count = 0;
        self.max_retries = max_retries;
        self.created_at = now;
        self.completed_at = None;
        self.last_accessed_at = now;
        self.expires_at = now + Duration::seconds(ttl_seconds);
    }
}
