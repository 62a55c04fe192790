use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::ExecutionState;

/// One append-only entry in the state-transition audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub record_key: String,
    /// `None` for the entry that records the creation of the record.
    pub old_state: Option<ExecutionState>,
    pub new_state: ExecutionState,
    pub reason: String,
    pub actor: String,
    pub client_context: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Entry for a brand-new record entering the state machine.
    pub fn creation(
        record_key: impl Into<String>,
        new_state: ExecutionState,
        actor: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_key: record_key.into(),
            old_state: None,
            new_state,
            reason: "record created".to_string(),
            actor: actor.into(),
            client_context: None,
            created_at: now,
        }
    }

    /// Entry for a transition between two states of an existing record.
    pub fn transition(
        record_key: impl Into<String>,
        old_state: ExecutionState,
        new_state: ExecutionState,
        reason: impl Into<String>,
        actor: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_key: record_key.into(),
            old_state: Some(old_state),
            new_state,
            reason: reason.into(),
            actor: actor.into(),
            client_context: None,
            created_at: now,
        }
    }

    pub fn with_client_context(mut self, client_context: impl Into<String>) -> Self {
        self.client_context = Some(client_context.into());
        self
    }
}
