use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{AuditEntry, ExecutionState, IdempotencyRecord};
use crate::observability::get_metrics;
use crate::storage::AuditStore;

/// Append-only trail of record lifecycle events.
///
/// Writes are fire-and-forget: an audit failure is logged and never fails
/// the execution it describes.
pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    actor: String,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            actor: "engine".to_string(),
        }
    }

    /// Overrides the actor recorded on entries, e.g. a worker identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Records a brand-new record entering the state machine.
    pub async fn record_creation(&self, record: &IdempotencyRecord, now: DateTime<Utc>) {
        get_metrics().record_state_transition(None, record.state.label());
        let entry = AuditEntry::creation(&record.key, record.state, &self.actor, now)
            .with_client_context(&record.correlation_id);
        self.append(entry).await;
    }

    /// Records a transition between two states of an existing record.
    pub async fn record_transition(
        &self,
        record_key: &str,
        old_state: ExecutionState,
        new_state: ExecutionState,
        reason: &str,
        correlation_id: Option<&str>,
        now: DateTime<Utc>,
    ) {
        get_metrics().record_state_transition(Some(old_state.label()), new_state.label());
        let mut entry =
            AuditEntry::transition(record_key, old_state, new_state, reason, &self.actor, now);
        if let Some(correlation_id) = correlation_id {
            entry = entry.with_client_context(correlation_id);
        }
        self.append(entry).await;
    }

    /// Records a duplicate request served from a stored result. The state
    /// does not change; the entry exists so the trail shows every caller
    /// that observed the record.
    pub async fn record_access(
        &self,
        record: &IdempotencyRecord,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) {
        let entry = AuditEntry::transition(
            &record.key,
            record.state,
            record.state,
            "duplicate request served from stored result",
            &self.actor,
            now,
        )
        .with_client_context(correlation_id);
        self.append(entry).await;
    }

    /// Full trail for a record, oldest entry first. Reads propagate errors;
    /// only writes are fire-and-forget.
    pub async fn history(&self, record_key: &str) -> Result<Vec<AuditEntry>> {
        self.store.history(record_key).await
    }

    async fn append(&self, entry: AuditEntry) {
        if let Err(e) = self.store.append(&entry).await {
            tracing::error!(
                error = %e,
                record_key = %entry.record_key,
                reason = %entry.reason,
                "Failed to append audit entry"
            );
        }
    }
}
