use serde::{Deserialize, Serialize};

use crate::models::TargetKind;

/// A unit of work submitted for idempotent execution.
///
/// The optional fields are deduplication aids; the key generator consumes the
/// highest-priority one available when no client key is supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub source_system: String,
    pub target_kind: TargetKind,
    pub target_name: String,
    pub transaction_ref: Option<String>,
    pub content_hash: Option<String>,
    pub request_hash: Option<String>,
    pub file_path: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub payload: Option<serde_json::Value>,
    pub client_provided_key: Option<String>,
}

impl ExecutionRequest {
    pub fn new(
        source_system: impl Into<String>,
        target_kind: TargetKind,
        target_name: impl Into<String>,
    ) -> Self {
        Self {
            source_system: source_system.into(),
            target_kind,
            target_name: target_name.into(),
            transaction_ref: None,
            content_hash: None,
            request_hash: None,
            file_path: None,
            parameters: None,
            payload: None,
            client_provided_key: None,
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

    pub fn with_request_hash(mut self, request_hash: impl Into<String>) -> Self {
        self.request_hash = Some(request_hash.into());
        self
    }

    pub fn with_file_path(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_client_key(mut self, client_key: impl Into<String>) -> Self {
        self.client_provided_key = Some(client_key.into());
        self
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.source_system.trim().is_empty() {
            errors.push(ValidationError {
                field: "source_system".to_string(),
                message: "source_system cannot be empty".to_string(),
            });
        }
        if self.target_name.trim().is_empty() {
            errors.push(ValidationError {
                field: "target_name".to_string(),
                message: "target_name cannot be empty".to_string(),
            });
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The deduplication hash carried by this request, preferring an explicit
    /// content hash over a request hash.
    pub fn dedup_hash(&self) -> Option<&str> {
        self.content_hash
            .as_deref()
            .or(self.request_hash.as_deref())
    }
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}
