use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Kind of work an idempotency policy governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetKind {
    Job,
    ApiEndpoint,
}

impl TargetKind {
    /// Uppercase label used as the leading segment of derived keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Job => "JOB",
            TargetKind::ApiEndpoint => "API_ENDPOINT",
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the idempotency key for a request is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStrategy {
    /// Derive the key from the request; a caller-supplied key still wins.
    Auto,
    /// The caller must supply the key; requests without one are rejected.
    ClientProvided,
}

/// Per-target configuration controlling how executions are deduplicated.
///
/// `target_pattern` selects which names the policy applies to: an exact name,
/// a `prefix-*` wildcard, or the global `*`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IdempotencyPolicy {
    pub id: Uuid,
    pub target_kind: TargetKind,
    pub target_pattern: String,
    pub enabled: bool,
    pub ttl_seconds: i64,
    pub max_retries: i32,
    pub key_strategy: KeyStrategy,
    pub store_request_payload: bool,
    pub store_response_payload: bool,
    pub encryption_required: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyPolicy {
    pub fn new(target_kind: TargetKind, target_pattern: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target_kind,
            target_pattern: target_pattern.into(),
            enabled: true,
            ttl_seconds: 86_400,
            max_retries: 3,
            key_strategy: KeyStrategy::Auto,
            store_request_payload: true,
            store_response_payload: true,
            encryption_required: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Built-in configuration used when no stored policy matches a target.
    pub fn fallback(target_kind: TargetKind) -> Self {
        Self::new(target_kind, "*")
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_key_strategy(mut self, key_strategy: KeyStrategy) -> Self {
        self.key_strategy = key_strategy;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_payload_storage(mut self, request: bool, response: bool) -> Self {
        self.store_request_payload = request;
        self.store_response_payload = response;
        self
    }

    pub fn with_encryption_required(mut self, encryption_required: bool) -> Self {
        self.encryption_required = encryption_required;
        self
    }

    /// Returns true if this policy's pattern covers `target_name`.
    pub fn matches(&self, target_name: &str) -> bool {
        pattern_matches(&self.target_pattern, target_name)
    }

    /// Rank used to pick one policy among several matches: exact beats
    /// wildcard, and a longer wildcard prefix beats a shorter one.
    pub fn specificity(&self) -> (u8, usize) {
        if self.target_pattern == "*" {
            (0, 0)
        } else if let Some(prefix) = self.target_pattern.strip_suffix('*') {
            (1, prefix.len())
        } else {
            (2, self.target_pattern.len())
        }
    }
}

/// Matches `name` against a policy pattern: `*` covers everything, a
/// trailing `*` makes a prefix pattern, anything else is an exact match.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_kind_labels() {
        assert_eq!(TargetKind::Job.as_str(), "JOB");
        assert_eq!(TargetKind::ApiEndpoint.as_str(), "API_ENDPOINT");
        assert_eq!(TargetKind::Job.to_string(), "JOB");
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("payment-*", "payment-settle"));
        assert!(pattern_matches("payment-*", "payment-"));
        assert!(!pattern_matches("payment-*", "payroll"));
        assert!(pattern_matches("payroll", "payroll"));
        assert!(!pattern_matches("payroll", "payroll-eu"));
    }

    #[test]
    fn test_specificity_ordering() {
        let global = IdempotencyPolicy::new(TargetKind::Job, "*");
        let prefix = IdempotencyPolicy::new(TargetKind::Job, "payment-*");
        let longer_prefix = IdempotencyPolicy::new(TargetKind::Job, "payment-settle-*");
        let exact = IdempotencyPolicy::new(TargetKind::Job, "payment-settle");

        assert!(exact.specificity() > longer_prefix.specificity());
        assert!(longer_prefix.specificity() > prefix.specificity());
        assert!(prefix.specificity() > global.specificity());
    }

    #[test]
    fn test_fallback_defaults() {
        let policy = IdempotencyPolicy::fallback(TargetKind::Job);

        assert!(policy.enabled);
        assert_eq!(policy.target_pattern, "*");
        assert_eq!(policy.ttl_seconds, 86_400);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.key_strategy, KeyStrategy::Auto);
        assert!(policy.store_request_payload);
        assert!(policy.store_response_payload);
        assert!(!policy.encryption_required);
    }

    #[test]
    fn test_builder_chain() {
        let policy = IdempotencyPolicy::new(TargetKind::ApiEndpoint, "POST:/v1/transfers")
            .with_ttl_seconds(3600)
            .with_max_retries(1)
            .with_key_strategy(KeyStrategy::ClientProvided)
            .with_payload_storage(false, true)
            .with_encryption_required(true);

        assert_eq!(policy.ttl_seconds, 3600);
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.key_strategy, KeyStrategy::ClientProvided);
        assert!(!policy.store_request_payload);
        assert!(policy.store_response_payload);
        assert!(policy.encryption_required);
    }

    #[test]
    fn test_serialization_uses_screaming_case() {
        let policy = IdempotencyPolicy::new(TargetKind::ApiEndpoint, "*");
        let json = serde_json::to_string(&policy).unwrap();

        assert!(json.contains("\"API_ENDPOINT\""));
        assert!(json.contains("\"AUTO\""));
    }
}
