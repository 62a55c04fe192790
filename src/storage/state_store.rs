use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{ExecutionState, IdempotencyRecord};

/// Durable storage for idempotency records.
///
/// Implementations must provide two atomic primitives: an insert that
/// detects create races on the key, and a conditional update that only
/// applies when the caller still holds the version it read.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Attempts to insert a new record.
    /// Returns `Ok(None)` if the record was inserted (this caller owns it),
    /// or `Ok(Some(existing))` if another record already holds the key.
    async fn try_insert(&self, record: &IdempotencyRecord) -> Result<Option<IdempotencyRecord>>;

    /// Looks up a record by key without interpreting expiry.
    async fn find_by_key(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Writes the record's mutable fields if and only if the stored version
    /// still equals `expected_version`, bumping the version by one.
    /// Returns `Ok(None)` when the version moved underneath the caller.
    async fn update_with_version(
        &self,
        record: &IdempotencyRecord,
        expected_version: i64,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Refreshes a record's last-access timestamp. Best-effort from the
    /// caller's perspective; a missing key is not an error.
    async fn touch_last_accessed(&self, key: &str, now: DateTime<Utc>) -> Result<()>;

    /// Deletes records whose validity window elapsed before `now`.
    /// Returns the number of rows removed.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Counts records currently in the given state.
    async fn count_by_state(&self, state: ExecutionState) -> Result<i64>;
}
