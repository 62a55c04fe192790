use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use idempotency_engine::cache::RecordCache;
use idempotency_engine::config::{CacheSettings, EngineSettings};
use idempotency_engine::engine::{ExecutionRequest, ExecutionStatus, IdempotencyEngine};
use idempotency_engine::models::{ExecutionState, IdempotencyRecord, TargetKind};
use idempotency_engine::storage::{InMemoryAuditStore, InMemoryPolicyStore, InMemoryStateStore};

fn redis_settings() -> CacheSettings {
    dotenvy::dotenv().ok();
    CacheSettings {
        enabled: true,
        url: std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
        // A fresh prefix per test keeps runs from seeing each other's entries.
        key_prefix: format!("idem-test-{}", Uuid::new_v4().simple()),
    }
}

fn open_cache() -> RecordCache {
    let settings = redis_settings();
    let client =
        redis::Client::open(settings.url.as_str()).expect("Failed to open Redis client");
    RecordCache::new(client, settings)
}

fn completed_record(key: &str) -> IdempotencyRecord {
    let mut record = IdempotencyRecord::new(
        key,
        TargetKind::Job,
        "payroll",
        "corr-cache",
        3600,
        3,
        Utc::now(),
    );
    record.begin_attempt(Utc::now());
    record.complete(Some(json!({"settled": 12})), Utc::now());
    record
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_cache_round_trip_serves_completed_records() {
    let cache = open_cache();
    let key = format!("JOB:payroll:20260821:{}", Uuid::new_v4().simple());
    let record = completed_record(&key);

    cache.set(&record).await.expect("Failed to cache record");

    let found = cache
        .get(&key)
        .await
        .expect("Failed to read cache")
        .expect("Cached record should be returned");
    assert_eq!(found.key, record.key);
    assert_eq!(found.state, ExecutionState::Completed);
    assert_eq!(found.response_payload, Some(json!({"settled": 12})));
    assert_eq!(found.version, record.version);

    assert_eq!(cache.stats().get_hits(), 1);
    assert_eq!(cache.stats().get_errors(), 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_invalidation_removes_the_cached_record() {
    let cache = open_cache();
    let key = format!("JOB:payroll:20260821:{}", Uuid::new_v4().simple());

    cache
        .set(&completed_record(&key))
        .await
        .expect("Failed to cache record");
    cache
        .invalidate(&key)
        .await
        .expect("Failed to invalidate record");

    let found = cache.get(&key).await.expect("Failed to read cache");
    assert!(found.is_none());
    assert_eq!(cache.stats().get_invalidations(), 1);
    assert_eq!(cache.stats().get_misses(), 1);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_records_past_their_window_are_not_cached() {
    let cache = open_cache();
    let key = format!("JOB:payroll:20260821:{}", Uuid::new_v4().simple());

    // Built an hour ago with a zero-second window: nothing left to cache.
    let mut record = IdempotencyRecord::new(
        key.as_str(),
        TargetKind::Job,
        "payroll",
        "corr-cache",
        0,
        3,
        Utc::now() - chrono::Duration::hours(1),
    );
    record.begin_attempt(Utc::now());
    record.complete(Some(json!({"settled": 0})), Utc::now());

    cache.set(&record).await.expect("Cache set should be a no-op");

    let found = cache.get(&key).await.expect("Failed to read cache");
    assert!(found.is_none());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_engine_replays_duplicates_from_the_cache_fast_path() {
    let engine = IdempotencyEngine::new(
        Arc::new(InMemoryStateStore::new()),
        Arc::new(InMemoryPolicyStore::new()),
        Arc::new(InMemoryAuditStore::new()),
        EngineSettings::default(),
    )
    .with_cache(Arc::new(open_cache()));

    let request = ExecutionRequest::new("batch-scheduler", TargetKind::Job, "payroll")
        .with_transaction_ref("TXN-CACHE-1");
    let first = engine
        .execute::<Value, _, _>(request, || async { Ok(json!({"settled": 5})) })
        .await
        .expect("Failed to execute first request");
    assert_eq!(first.status, ExecutionStatus::Success);

    let duplicate = ExecutionRequest::new("batch-scheduler", TargetKind::Job, "payroll")
        .with_transaction_ref("TXN-CACHE-1");
    let second = engine
        .execute::<Value, _, _>(duplicate, || async { Ok(json!("unreachable")) })
        .await
        .expect("Failed to execute duplicate request");
    assert_eq!(second.status, ExecutionStatus::CachedResult);
    assert_eq!(second.data, Some(json!({"settled": 5})));
    assert!(second.from_cache);

    let stats = engine.cache_stats().expect("Cache should be configured");
    assert_eq!(stats.get_hits(), 1);
    assert_eq!(engine.metrics_snapshot().cached_hits, 1);
}
