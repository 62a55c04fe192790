use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{AuditEntry, ExecutionState, IdempotencyPolicy, IdempotencyRecord, TargetKind};
use crate::storage::{AuditStore, PolicyStore, StateStore};

/// Process-local state store backed by a map. Used by tests and by
/// deployments that accept losing deduplication state on restart.
#[derive(Default)]
pub struct InMemoryStateStore {
    records: RwLock<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, IdempotencyRecord>> {
        match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn try_insert(&self, record: &IdempotencyRecord) -> Result<Option<IdempotencyRecord>> {
        let mut records = self.lock();
        match records.get(&record.key) {
            Some(existing) => Ok(Some(existing.clone())),
            None => {
                records.insert(record.key.clone(), record.clone());
                Ok(None)
            }
        }
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let records = match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(records.get(key).cloned())
    }

    async fn update_with_version(
        &self,
        record: &IdempotencyRecord,
        expected_version: i64,
    ) -> Result<Option<IdempotencyRecord>> {
        let mut records = self.lock();
        match records.get_mut(&record.key) {
            Some(stored) if stored.version == expected_version => {
                let mut updated = record.clone();
                updated.id = stored.id;
                updated.version = expected_version + 1;
                *stored = updated.clone();
                Ok(Some(updated))
            }
            _ => Ok(None),
        }
    }

    // Deliberately does not bump the version: a timestamp refresh must never
    // fail a concurrent conditional update.
    async fn touch_last_accessed(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let mut records = self.lock();
        if let Some(stored) = records.get_mut(key) {
            stored.last_accessed_at = now;
        }
        Ok(())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|_, record| record.expires_at >= now);
        Ok((before - records.len()) as u64)
    }

    async fn count_by_state(&self, state: ExecutionState) -> Result<i64> {
        let records = match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(records.values().filter(|r| r.state == state).count() as i64)
    }
}

/// Process-local policy store seeded at construction or through `upsert`.
#[derive(Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<Vec<IdempotencyPolicy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies(policies: Vec<IdempotencyPolicy>) -> Self {
        Self {
            policies: RwLock::new(policies),
        }
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn list_for_kind(&self, target_kind: TargetKind) -> Result<Vec<IdempotencyPolicy>> {
        let policies = match self.policies.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(policies
            .iter()
            .filter(|p| p.target_kind == target_kind)
            .cloned()
            .collect())
    }

    async fn upsert(&self, policy: &IdempotencyPolicy) -> Result<IdempotencyPolicy> {
        let mut policies = match self.policies.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut stored = policy.clone();
        stored.updated_at = Utc::now();
        match policies.iter_mut().find(|p| {
            p.target_kind == policy.target_kind && p.target_pattern == policy.target_pattern
        }) {
            Some(existing) => {
                stored.id = existing.id;
                stored.created_at = existing.created_at;
                *existing = stored.clone();
            }
            None => policies.push(stored.clone()),
        }
        Ok(stored)
    }
}

/// Process-local append-only audit trail.
#[derive(Default)]
pub struct InMemoryAuditStore {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push(entry.clone());
        Ok(())
    }

    async fn history(&self, record_key: &str) -> Result<Vec<AuditEntry>> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(entries
            .iter()
            .filter(|e| e.record_key == record_key)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::models::KeyStrategy;

    fn record(key: &str, ttl_seconds: i64) -> IdempotencyRecord {
        IdempotencyRecord::new(
            key,
            TargetKind::Job,
            "payroll",
            "corr-1",
            ttl_seconds,
            3,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_try_insert_detects_existing_key() {
        let store = InMemoryStateStore::new();
        let first = record("JOB:a", 3600);
        let second = record("JOB:a", 3600);

        assert!(store.try_insert(&first).await.unwrap().is_none());

        let existing = store.try_insert(&second).await.unwrap();
        assert_eq!(existing.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_update_with_version_bumps_and_rejects_stale() {
        let store = InMemoryStateStore::new();
        let mut rec = record("JOB:a", 3600);
        store.try_insert(&rec).await.unwrap();

        rec.begin_attempt(Utc::now());
        let updated = store.update_with_version(&rec, 1).await.unwrap().unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.state, ExecutionState::InProgress);

        // A writer still holding version 1 must lose.
        let stale = store.update_with_version(&rec, 1).await.unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn test_touch_refreshes_timestamp_without_version_bump() {
        let store = InMemoryStateStore::new();
        let rec = record("JOB:a", 3600);
        store.try_insert(&rec).await.unwrap();

        let later = Utc::now() + Duration::seconds(90);
        store.touch_last_accessed("JOB:a", later).await.unwrap();
        store.touch_last_accessed("JOB:missing", later).await.unwrap();

        let stored = store.find_by_key("JOB:a").await.unwrap().unwrap();
        assert_eq!(stored.last_accessed_at, later);
        assert_eq!(stored.version, rec.version);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_elapsed_windows() {
        let store = InMemoryStateStore::new();
        store.try_insert(&record("JOB:old", 10)).await.unwrap();
        store.try_insert(&record("JOB:live", 3600)).await.unwrap();

        let removed = store
            .cleanup_expired(Utc::now() + Duration::seconds(60))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(store.find_by_key("JOB:old").await.unwrap().is_none());
        assert!(store.find_by_key("JOB:live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_count_by_state() {
        let store = InMemoryStateStore::new();
        let mut done = record("JOB:done", 3600);
        done.begin_attempt(Utc::now());
        done.complete(None, Utc::now());
        store.try_insert(&done).await.unwrap();
        store.try_insert(&record("JOB:new", 3600)).await.unwrap();

        assert_eq!(
            store.count_by_state(ExecutionState::Completed).await.unwrap(),
            1
        );
        assert_eq!(
            store.count_by_state(ExecutionState::Started).await.unwrap(),
            1
        );
        assert_eq!(
            store.count_by_state(ExecutionState::Failed).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_policy_upsert_replaces_same_pattern() {
        let store = InMemoryPolicyStore::new();
        let policy = IdempotencyPolicy::new(TargetKind::Job, "payment-*").with_ttl_seconds(600);
        store.upsert(&policy).await.unwrap();

        let replacement = IdempotencyPolicy::new(TargetKind::Job, "payment-*")
            .with_ttl_seconds(1200)
            .with_key_strategy(KeyStrategy::ClientProvided);
        store.upsert(&replacement).await.unwrap();

        let policies = store.list_for_kind(TargetKind::Job).await.unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].ttl_seconds, 1200);
        assert_eq!(policies[0].key_strategy, KeyStrategy::ClientProvided);
    }

    #[tokio::test]
    async fn test_policy_listing_is_scoped_to_kind() {
        let store = InMemoryPolicyStore::with_policies(vec![
            IdempotencyPolicy::new(TargetKind::Job, "*"),
            IdempotencyPolicy::new(TargetKind::ApiEndpoint, "*"),
        ]);

        let jobs = store.list_for_kind(TargetKind::Job).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].target_kind, TargetKind::Job);
    }

    #[tokio::test]
    async fn test_audit_history_preserves_append_order() {
        let store = InMemoryAuditStore::new();
        let now = Utc::now();
        store
            .append(&AuditEntry::creation("JOB:a", ExecutionState::Started, "engine", now))
            .await
            .unwrap();
        store
            .append(&AuditEntry::transition(
                "JOB:a",
                ExecutionState::Started,
                ExecutionState::InProgress,
                "claimed",
                "engine",
                now,
            ))
            .await
            .unwrap();
        store
            .append(&AuditEntry::creation("JOB:b", ExecutionState::Started, "engine", now))
            .await
            .unwrap();

        let history = store.history("JOB:a").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].old_state.is_none());
        assert_eq!(history[1].new_state, ExecutionState::InProgress);
    }
}
