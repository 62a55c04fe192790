use async_trait::async_trait;

use crate::error::Result;
use crate::models::AuditEntry;

/// Append-only storage for the state-transition audit trail.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Appends one entry. Entries are never updated or deleted.
    async fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Returns the full trail for a key in the order it was written.
    async fn history(&self, record_key: &str) -> Result<Vec<AuditEntry>>;
}
