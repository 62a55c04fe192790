use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::EngineSettings;
use crate::engine::ExecutionRequest;
use crate::error::{AppError, Result};
use crate::models::IdempotencyPolicy;

/// Encodes payloads for persistence alongside a record and decodes stored
/// responses for replay.
///
/// Retention is governed by the resolved policy and bounded in size. A
/// payload that cannot be retained is withheld with a warning; the execution
/// itself is never failed over payload bookkeeping.
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    max_payload_bytes: usize,
    max_error_detail_bytes: usize,
}

impl PayloadCodec {
    pub fn new(max_payload_bytes: usize, max_error_detail_bytes: usize) -> Self {
        Self {
            max_payload_bytes,
            max_error_detail_bytes,
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(settings.max_payload_bytes, settings.max_error_detail_bytes)
    }

    /// Request payload to persist with a new record, if the policy retains
    /// request payloads. Falls back to the structured parameters when the
    /// request carries no free-form payload.
    pub fn encode_request(
        &self,
        policy: &IdempotencyPolicy,
        request: &ExecutionRequest,
    ) -> Option<Value> {
        if !policy.store_request_payload {
            return None;
        }
        let value = request.payload.as_ref().or(request.parameters.as_ref())?;
        self.retain(policy, value, "request")
    }

    /// Response payload to persist on completion, if the policy retains
    /// response payloads.
    pub fn encode_response<T: Serialize>(
        &self,
        policy: &IdempotencyPolicy,
        value: &T,
    ) -> Option<Value> {
        if !policy.store_response_payload {
            return None;
        }
        match serde_json::to_value(value) {
            Ok(encoded) => self.retain(policy, &encoded, "response"),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize response for replay storage");
                None
            }
        }
    }

    /// Decodes a stored response payload into the caller's type.
    pub fn decode_response<T: DeserializeOwned>(&self, payload: Option<&Value>) -> Result<Option<T>> {
        match payload {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(AppError::Serialization),
            None => Ok(None),
        }
    }

    /// Bounds an error detail string to the configured byte budget, cutting
    /// on a character boundary.
    pub fn truncate_error_detail(&self, detail: &str) -> String {
        if detail.len() <= self.max_error_detail_bytes {
            return detail.to_string();
        }
        let mut end = self.max_error_detail_bytes;
        while !detail.is_char_boundary(end) {
            end -= 1;
        }
        detail[..end].to_string()
    }

    fn retain(&self, policy: &IdempotencyPolicy, value: &Value, payload: &str) -> Option<Value> {
        if policy.encryption_required {
            tracing::warn!(
                target_pattern = %policy.target_pattern,
                payload,
                "Policy requires payload encryption but no encrypting codec is configured; payload withheld"
            );
            return None;
        }
        let size = match serde_json::to_vec(value) {
            Ok(bytes) => bytes.len(),
            Err(e) => {
                tracing::warn!(error = %e, payload, "Failed to size payload; payload withheld");
                return None;
            }
        };
        if size > self.max_payload_bytes {
            tracing::warn!(
                size,
                limit = self.max_payload_bytes,
                payload,
                "Payload exceeds retention limit; payload withheld"
            );
            return None;
        }
        Some(value.clone())
    }
}
