use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::engine::request::ExecutionRequest;
use crate::error::{AppError, Result};
use crate::models::KeyStrategy;
use crate::observability::mask_sensitive;

/// Maximum key length accepted by the record store.
pub const MAX_KEY_LENGTH: usize = 128;

const TRUNCATION_HASH_LEN: usize = 16;

/// Derives stable, collision-resistant idempotency keys using SHA-256, and
/// mints correlation identifiers for tracing.
///
/// Derivation is a pure function of the request and the calendar day, except
/// for the last-resort fallback when a request carries no discriminator at
/// all: that key mixes in random bits, so duplicate protection is not
/// possible for such requests.
#[derive(Debug, Clone, Default)]
pub struct KeyGenerator;

impl KeyGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Generates the idempotency key for a request.
    pub fn generate(&self, request: &ExecutionRequest, strategy: KeyStrategy) -> Result<String> {
        self.generate_at(request, strategy, Utc::now())
    }

    /// Generates the idempotency key for a request at a specific timestamp.
    pub fn generate_at(
        &self,
        request: &ExecutionRequest,
        strategy: KeyStrategy,
        timestamp: DateTime<Utc>,
    ) -> Result<String> {
        if let Some(client_key) = request.client_provided_key.as_deref() {
            return self.from_client_key(client_key);
        }
        if strategy == KeyStrategy::ClientProvided {
            return Err(AppError::InvalidKey(
                "policy requires a client-provided idempotency key".to_string(),
            ));
        }
        Ok(self.derive(request, timestamp))
    }

    /// Normalizes a client-provided key: sanitizes the character set and
    /// bounds the length. Collision semantics are the caller's responsibility.
    pub fn from_client_key(&self, client_key: &str) -> Result<String> {
        if client_key.trim().is_empty() {
            return Err(AppError::InvalidKey(
                "client-provided idempotency key is empty".to_string(),
            ));
        }

        let sanitized = sanitize(client_key);
        if sanitized != client_key {
            tracing::warn!(
                key = %mask_sensitive(client_key, 4),
                "Client-provided key contained invalid characters and was sanitized"
            );
        }

        Ok(bound_length(&sanitized))
    }

    /// Generates a correlation identifier for tracing a single call.
    pub fn generate_correlation_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn derive(&self, request: &ExecutionRequest, timestamp: DateTime<Utc>) -> String {
        let date = timestamp.format("%Y%m%d");

        let suffix = match discriminator(request) {
            Some((tag, value, hex_len)) => {
                let mut hasher = Sha256::new();
                hasher.update(tag.as_bytes());
                hasher.update(b":");
                hasher.update(value.as_bytes());
                let digest = hex::encode(hasher.finalize());
                digest[..hex_len].to_string()
            }
            None => {
                // No discriminator at all: mix time and random bits. Two such
                // requests will get different keys even on the same day.
                let mut hasher = Sha256::new();
                hasher.update(timestamp.timestamp_micros().to_string().as_bytes());
                hasher.update(b"|");
                hasher.update(Uuid::new_v4().as_bytes());
                let digest = hex::encode(hasher.finalize());
                digest[..TRUNCATION_HASH_LEN].to_string()
            }
        };

        let key = format!(
            "{}:{}:{}:{}",
            request.target_kind.as_str(),
            sanitize(&request.target_name),
            date,
            suffix
        );
        bound_length(&key)
    }
}

/// The highest-priority discriminator available on the request, with the tag
/// mixed into the digest and the suffix length to keep. Payload-derived keys
/// keep only 8 hex characters to bound key growth.
fn discriminator(request: &ExecutionRequest) -> Option<(&'static str, String, usize)> {
    if let Some(ref v) = request.transaction_ref {
        return Some(("txn", v.clone(), 16));
    }
    if let Some(ref v) = request.content_hash {
        return Some(("content", v.clone(), 16));
    }
    if let Some(ref v) = request.request_hash {
        return Some(("request", v.clone(), 16));
    }
    if let Some(ref v) = request.file_path {
        return Some(("file", v.clone(), 16));
    }
    if let Some(ref v) = request.parameters {
        return Some(("params", v.to_string(), 16));
    }
    if let Some(ref v) = request.payload {
        return Some(("payload", v.to_string(), 8));
    }
    None
}

/// Replaces every character outside `[A-Za-z0-9_:-]` with an underscore.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Bounds a sanitized (all-ASCII) key to `MAX_KEY_LENGTH`, replacing the tail
/// of over-long keys with a digest of the full original so distinct keys stay
/// distinct after truncation.
fn bound_length(key: &str) -> String {
    if key.len() <= MAX_KEY_LENGTH {
        return key.to_string();
    }

    let digest = {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    };
    let keep = MAX_KEY_LENGTH - TRUNCATION_HASH_LEN - 1;
    format!("{}-{}", &key[..keep], &digest[..TRUNCATION_HASH_LEN])
}
