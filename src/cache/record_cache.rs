use crate::config::CacheSettings;
use crate::error::Result;
use crate::models::IdempotencyRecord;
use crate::observability::get_metrics;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache activity counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        Self::bump(&self.hits);
    }

    pub fn record_miss(&self) {
        Self::bump(&self.misses);
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.get_hits();
        let total = hits + self.get_misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn get_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn get_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn get_invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    pub fn get_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Cached record plus the metadata needed to reason about a stale copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedRecord {
    record: IdempotencyRecord,
    cached_at: i64,
    version: i64,
}

/// Redis read-through cache for completed idempotency records.
///
/// Strictly an accelerator for duplicate replays: every miss or Redis
/// failure degrades to the durable store, never to an error.
pub struct RecordCache {
    client: redis::Client,
    settings: CacheSettings,
    stats: Arc<CacheStats>,
}

impl RecordCache {
    pub fn new(client: redis::Client, settings: CacheSettings) -> Self {
        Self {
            client,
            settings,
            stats: Arc::new(CacheStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }

    fn cache_key(&self, record_key: &str) -> String {
        format!("{}:record:{}", self.settings.key_prefix, record_key)
    }

    /// A failed connection is counted and swallowed; callers fall through to
    /// the durable store.
    async fn connection(&self, operation: &str) -> Option<MultiplexedConnection> {
        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                CacheStats::bump(&self.stats.errors);
                tracing::warn!(operation, "Redis connection error: {}", e);
                None
            }
        }
    }

    /// Reads a record from the cache. Expiry is not interpreted here; the
    /// engine decides whether a cached record is still usable.
    pub async fn get(&self, record_key: &str) -> Result<Option<IdempotencyRecord>> {
        if !self.settings.enabled {
            return Ok(None);
        }

        let Some(mut conn) = self.connection("get").await else {
            return Ok(None);
        };

        let payload: Option<String> = match conn.get(self.cache_key(record_key)).await {
            Ok(v) => v,
            Err(e) => {
                CacheStats::bump(&self.stats.errors);
                tracing::warn!("Redis get error: {}", e);
                return Ok(None);
            }
        };

        let Some(json) = payload else {
            self.stats.record_miss();
            get_metrics().record_cache_lookup(false);
            return Ok(None);
        };

        match serde_json::from_str::<CachedRecord>(&json) {
            Ok(cached) => {
                self.stats.record_hit();
                get_metrics().record_cache_lookup(true);
                tracing::debug!(key = %record_key, "Cache hit for record");
                Ok(Some(cached.record))
            }
            Err(e) => {
                // An undecodable entry is garbage; drop it so the durable
                // store repopulates the slot.
                CacheStats::bump(&self.stats.errors);
                tracing::warn!("Failed to deserialize cached record: {}", e);
                self.invalidate(record_key).await?;
                Ok(None)
            }
        }
    }

    /// Caches a record for the remainder of its validity window.
    pub async fn set(&self, record: &IdempotencyRecord) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }

        let remaining = record
            .expires_at
            .signed_duration_since(Utc::now())
            .num_seconds();
        if remaining <= 0 {
            return Ok(());
        }

        let cached = CachedRecord {
            record: record.clone(),
            cached_at: Utc::now().timestamp(),
            version: record.version,
        };
        let json = match serde_json::to_string(&cached) {
            Ok(json) => json,
            Err(e) => {
                CacheStats::bump(&self.stats.errors);
                tracing::warn!("Failed to serialize record for cache: {}", e);
                return Ok(());
            }
        };

        let Some(mut conn) = self.connection("set").await else {
            return Ok(());
        };

        match conn
            .set_ex::<_, _, ()>(self.cache_key(&record.key), json, remaining as u64)
            .await
        {
            Ok(_) => {
                tracing::debug!(key = %record.key, ttl_secs = remaining, "Cached record");
            }
            Err(e) => {
                CacheStats::bump(&self.stats.errors);
                tracing::warn!("Redis set error: {}", e);
            }
        }
        Ok(())
    }

    /// Drops a cached record, e.g. when an expired record is recycled.
    pub async fn invalidate(&self, record_key: &str) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }

        let Some(mut conn) = self.connection("invalidate").await else {
            return Ok(());
        };

        match conn.del::<_, ()>(self.cache_key(record_key)).await {
            Ok(_) => {
                CacheStats::bump(&self.stats.invalidations);
                tracing::debug!(key = %record_key, "Invalidated cached record");
            }
            Err(e) => {
                CacheStats::bump(&self.stats.errors);
                tracing::warn!("Redis del error: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats() {
        let stats = CacheStats::new();

        assert_eq!(stats.get_hits(), 0);
        assert_eq!(stats.get_misses(), 0);
        assert_eq!(stats.hit_rate(), 0.0);

        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        CacheStats::bump(&stats.invalidations);

        assert_eq!(stats.get_hits(), 2);
        assert_eq!(stats.get_misses(), 1);
        assert_eq!(stats.get_invalidations(), 1);
        assert!((stats.hit_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_cache_key_format() {
        let settings = CacheSettings {
            enabled: true,
            url: "redis://localhost:6379".to_string(),
            key_prefix: "test".to_string(),
        };
        let client = redis::Client::open("redis://localhost:6379").unwrap();
        let cache = RecordCache::new(client, settings);

        let key = cache.cache_key("JOB:payroll:20260115:abcd1234efgh5678");

        assert_eq!(key, "test:record:JOB:payroll:20260115:abcd1234efgh5678");
    }

    #[tokio::test]
    async fn test_disabled_cache_is_a_no_op() {
        let settings = CacheSettings {
            enabled: false,
            url: "redis://localhost:6379".to_string(),
            key_prefix: "test".to_string(),
        };
        let client = redis::Client::open("redis://localhost:6379").unwrap();
        let cache = RecordCache::new(client, settings);

        assert!(cache.get("JOB:a").await.unwrap().is_none());
        cache.invalidate("JOB:a").await.unwrap();
        assert_eq!(cache.stats().get_errors(), 0);
    }
}
