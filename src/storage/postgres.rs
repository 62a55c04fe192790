use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{AppError, Result};
use crate::models::{AuditEntry, ExecutionState, IdempotencyPolicy, IdempotencyRecord, TargetKind};
use crate::storage::{AuditStore, PolicyStore, StateStore};

const RECORD_COLUMNS: &str = "id, key, target_kind, target_name, correlation_id, transaction_ref, \
     content_hash, state, request_payload, response_payload, error_detail, retry_count, \
     max_retries, version, created_at, completed_at, last_accessed_at, expires_at";

const POLICY_COLUMNS: &str = "id, target_kind, target_pattern, enabled, ttl_seconds, max_retries, \
     key_strategy, store_request_payload, store_response_payload, encryption_required, \
     created_at, updated_at";

/// PostgreSQL-backed state store.
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn try_insert(&self, record: &IdempotencyRecord) -> Result<Option<IdempotencyRecord>> {
        // Insert, or return the existing row on key conflict. Comparing the
        // returned id against ours tells the two cases apart.
        let returned = sqlx::query_as::<_, IdempotencyRecord>(&format!(
            r#"
            INSERT INTO idempotency_records ({RECORD_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (key) DO UPDATE SET key = idempotency_records.key
            RETURNING {RECORD_COLUMNS}
            "#,
        ))
        .bind(record.id)
        .bind(&record.key)
        .bind(record.target_kind)
        .bind(&record.target_name)
        .bind(&record.correlation_id)
        .bind(&record.transaction_ref)
        .bind(&record.content_hash)
        .bind(record.state)
        .bind(&record.request_payload)
        .bind(&record.response_payload)
        .bind(&record.error_detail)
        .bind(record.retry_count)
        .bind(record.max_retries)
        .bind(record.version)
        .bind(record.created_at)
        .bind(record.completed_at)
        .bind(record.last_accessed_at)
        .bind(record.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        if returned.id == record.id {
            Ok(None)
        } else {
            Ok(Some(returned))
        }
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM idempotency_records
            WHERE key = $1
            "#,
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(record)
    }

    async fn update_with_version(
        &self,
        record: &IdempotencyRecord,
        expected_version: i64,
    ) -> Result<Option<IdempotencyRecord>> {
        let updated = sqlx::query_as::<_, IdempotencyRecord>(&format!(
            r#"
            UPDATE idempotency_records
            SET state = $3,
                correlation_id = $4,
                transaction_ref = $5,
                content_hash = $6,
                request_payload = $7,
                response_payload = $8,
                error_detail = $9,
                retry_count = $10,
                max_retries = $11,
                created_at = $12,
                completed_at = $13,
                last_accessed_at = $14,
                expires_at = $15,
                version = version + 1
            WHERE key = $1 AND version = $2
            RETURNING {RECORD_COLUMNS}
            "#,
        ))
        .bind(&record.key)
        .bind(expected_version)
        .bind(record.state)
        .bind(&record.correlation_id)
        .bind(&record.transaction_ref)
        .bind(&record.content_hash)
        .bind(&record.request_payload)
        .bind(&record.response_payload)
        .bind(&record.error_detail)
        .bind(record.retry_count)
        .bind(record.max_retries)
        .bind(record.created_at)
        .bind(record.completed_at)
        .bind(record.last_accessed_at)
        .bind(record.expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(updated)
    }

    async fn touch_last_accessed(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        // No version bump: a timestamp refresh must never fail a concurrent
        // conditional update.
        sqlx::query(
            r#"
            UPDATE idempotency_records
            SET last_accessed_at = $2
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    async fn count_by_state(&self, state: ExecutionState) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM idempotency_records WHERE state = $1
            "#,
        )
        .bind(state)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.0)
    }
}

/// PostgreSQL-backed policy store.
pub struct PostgresPolicyStore {
    pool: PgPool,
}

impl PostgresPolicyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyStore for PostgresPolicyStore {
    async fn list_for_kind(&self, target_kind: TargetKind) -> Result<Vec<IdempotencyPolicy>> {
        let policies = sqlx::query_as::<_, IdempotencyPolicy>(&format!(
            r#"
            SELECT {POLICY_COLUMNS}
            FROM idempotency_policies
            WHERE target_kind = $1
            "#,
        ))
        .bind(target_kind)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(policies)
    }

    async fn upsert(&self, policy: &IdempotencyPolicy) -> Result<IdempotencyPolicy> {
        let stored = sqlx::query_as::<_, IdempotencyPolicy>(&format!(
            r#"
            INSERT INTO idempotency_policies ({POLICY_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (target_kind, target_pattern) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                ttl_seconds = EXCLUDED.ttl_seconds,
                max_retries = EXCLUDED.max_retries,
                key_strategy = EXCLUDED.key_strategy,
                store_request_payload = EXCLUDED.store_request_payload,
                store_response_payload = EXCLUDED.store_response_payload,
                encryption_required = EXCLUDED.encryption_required,
                updated_at = NOW()
            RETURNING {POLICY_COLUMNS}
            "#,
        ))
        .bind(policy.id)
        .bind(policy.target_kind)
        .bind(&policy.target_pattern)
        .bind(policy.enabled)
        .bind(policy.ttl_seconds)
        .bind(policy.max_retries)
        .bind(policy.key_strategy)
        .bind(policy.store_request_payload)
        .bind(policy.store_response_payload)
        .bind(policy.encryption_required)
        .bind(policy.created_at)
        .bind(policy.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(stored)
    }
}

/// PostgreSQL-backed audit trail.
pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_audit
                (id, record_key, old_state, new_state, reason, actor, client_context, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.record_key)
        .bind(entry.old_state)
        .bind(entry.new_state)
        .bind(&entry.reason)
        .bind(&entry.actor)
        .bind(&entry.client_context)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    async fn history(&self, record_key: &str) -> Result<Vec<AuditEntry>> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT id, record_key, old_state, new_state, reason, actor, client_context, created_at
            FROM idempotency_audit
            WHERE record_key = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(record_key)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(entries)
    }
}
