use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::models::{IdempotencyPolicy, TargetKind};
use crate::storage::PolicyStore;

/// Resolves the effective idempotency policy for a target.
///
/// The most specific matching pattern wins: exact beats prefix wildcard,
/// longer prefixes beat shorter ones, and the global `*` comes last. When no
/// stored policy matches, a built-in fallback is synthesized and cached so
/// every caller observes the same policy for the process lifetime.
pub struct PolicyResolver {
    store: Arc<dyn PolicyStore>,
    cache: RwLock<HashMap<(TargetKind, String), Arc<IdempotencyPolicy>>>,
}

impl PolicyResolver {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn resolve(
        &self,
        target_kind: TargetKind,
        target_name: &str,
    ) -> Result<Arc<IdempotencyPolicy>> {
        let cache_key = (target_kind, target_name.to_string());
        if let Some(policy) = self.cached(&cache_key) {
            return Ok(policy);
        }

        let candidates = self.store.list_for_kind(target_kind).await?;
        let resolved = candidates
            .into_iter()
            .filter(|p| p.matches(target_name))
            .max_by(|a, b| {
                a.specificity()
                    .cmp(&b.specificity())
                    .then_with(|| a.target_pattern.cmp(&b.target_pattern))
            })
            .unwrap_or_else(|| {
                tracing::debug!(
                    kind = %target_kind,
                    target = %target_name,
                    "No stored policy matched; using built-in fallback"
                );
                IdempotencyPolicy::fallback(target_kind)
            });

        let policy = Arc::new(resolved);
        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // First writer wins so racing callers end up with one shared instance.
        let stored = cache.entry(cache_key).or_insert_with(|| policy.clone());
        Ok(stored.clone())
    }

    fn cached(&self, cache_key: &(TargetKind, String)) -> Option<Arc<IdempotencyPolicy>> {
        let cache = match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.get(cache_key).cloned()
    }

    /// Invalidation hook for configuration writes. The next resolve for each
    /// target re-reads the store.
    pub fn invalidate(&self) {
        let mut cache = match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.clear();
        tracing::debug!("Policy cache invalidated");
    }
}
