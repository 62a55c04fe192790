use async_trait::async_trait;

use crate::error::Result;
use crate::models::{IdempotencyPolicy, TargetKind};

/// Storage for per-target idempotency policies.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Returns every policy registered for the given kind. Pattern matching
    /// and specificity ranking happen in the resolver, not the store.
    async fn list_for_kind(&self, target_kind: TargetKind) -> Result<Vec<IdempotencyPolicy>>;

    /// Inserts the policy, or replaces the existing one with the same
    /// `(target_kind, target_pattern)` pair.
    async fn upsert(&self, policy: &IdempotencyPolicy) -> Result<IdempotencyPolicy>;
}
