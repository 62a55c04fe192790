use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::AuditTrail;
use crate::cache::{CacheStats, RecordCache};
use crate::config::EngineSettings;
use crate::engine::{
    ExecutionOutcome, ExecutionRequest, KeyGenerator, PayloadCodec, PolicyResolver,
};
use crate::error::{AppError, Result};
use crate::models::{
    AuditEntry, ExecutionState, IdempotencyPolicy, IdempotencyRecord,
};
use crate::observability::{get_metrics, LatencyTimer};
use crate::storage::{AuditStore, PolicyStore, StateStore};

/// Key reported for executions that bypass idempotency entirely.
pub const DIRECT_EXECUTION_KEY: &str = "DIRECT_EXECUTION";

/// How many times the acquire pass may lose a race before treating the
/// request as a concurrent duplicate.
const MAX_ACQUIRE_ATTEMPTS: u32 = 3;

/// In-process counters for engine activity.
///
/// Counts are also mirrored into the Prometheus recorder; this struct exists
/// so embedding applications can read totals without scraping.
#[derive(Debug)]
pub struct ExecutionMetrics {
    pub total_requests: AtomicU64,
    pub duplicate_requests: AtomicU64,
    pub new_executions: AtomicU64,
    pub completed_executions: AtomicU64,
    pub failed_executions: AtomicU64,
    pub cached_hits: AtomicU64,
    pub in_progress_rejections: AtomicU64,
    pub stale_recovered: AtomicU64,
    pub expired_recycled: AtomicU64,
    pub retries_exhausted: AtomicU64,
    pub bypassed: AtomicU64,
    duration_count: AtomicU64,
    duration_total_micros: AtomicU64,
    duration_min_micros: AtomicU64,
    duration_max_micros: AtomicU64,
}

impl Default for ExecutionMetrics {
    fn default() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            duplicate_requests: AtomicU64::new(0),
            new_executions: AtomicU64::new(0),
            completed_executions: AtomicU64::new(0),
            failed_executions: AtomicU64::new(0),
            cached_hits: AtomicU64::new(0),
            in_progress_rejections: AtomicU64::new(0),
            stale_recovered: AtomicU64::new(0),
            expired_recycled: AtomicU64::new(0),
            retries_exhausted: AtomicU64::new(0),
            bypassed: AtomicU64::new(0),
            duration_count: AtomicU64::new(0),
            duration_total_micros: AtomicU64::new(0),
            duration_min_micros: AtomicU64::new(u64::MAX),
            duration_max_micros: AtomicU64::new(0),
        }
    }
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new(&self) {
        self.new_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cached_hit(&self) {
        self.cached_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in_progress_rejection(&self) {
        self.in_progress_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_recovered(&self) {
        self.stale_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired_recycled(&self) {
        self.expired_recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retries_exhausted(&self) {
        self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypassed(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duration(&self, duration_ms: f64) {
        let micros = (duration_ms * 1_000.0) as u64;
        self.duration_count.fetch_add(1, Ordering::Relaxed);
        self.duration_total_micros.fetch_add(micros, Ordering::Relaxed);
        self.duration_min_micros.fetch_min(micros, Ordering::Relaxed);
        self.duration_max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn duplicate_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        let duplicates = self.duplicate_requests.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            duplicates as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let duration_count = self.duration_count.load(Ordering::Relaxed);
        let duration_total = self.duration_total_micros.load(Ordering::Relaxed);
        let duration_min = self.duration_min_micros.load(Ordering::Relaxed);
        let duration_max = self.duration_max_micros.load(Ordering::Relaxed);

        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            duplicate_requests: self.duplicate_requests.load(Ordering::Relaxed),
            new_executions: self.new_executions.load(Ordering::Relaxed),
            completed_executions: self.completed_executions.load(Ordering::Relaxed),
            failed_executions: self.failed_executions.load(Ordering::Relaxed),
            cached_hits: self.cached_hits.load(Ordering::Relaxed),
            in_progress_rejections: self.in_progress_rejections.load(Ordering::Relaxed),
            stale_recovered: self.stale_recovered.load(Ordering::Relaxed),
            expired_recycled: self.expired_recycled.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            min_duration_ms: if duration_count == 0 {
                0.0
            } else {
                duration_min as f64 / 1_000.0
            },
            max_duration_ms: duration_max as f64 / 1_000.0,
            avg_duration_ms: if duration_count == 0 {
                0.0
            } else {
                duration_total as f64 / duration_count as f64 / 1_000.0
            },
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub duplicate_requests: u64,
    pub new_executions: u64,
    pub completed_executions: u64,
    pub failed_executions: u64,
    pub cached_hits: u64,
    pub in_progress_rejections: u64,
    pub stale_recovered: u64,
    pub expired_recycled: u64,
    pub retries_exhausted: u64,
    pub bypassed: u64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub avg_duration_ms: f64,
}

impl MetricsSnapshot {
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.duplicate_requests as f64 / self.total_requests as f64
        }
    }

    /// Share of all requests that were served from a stored result.
    pub fn cache_hit_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.cached_hits as f64 / self.total_requests as f64
        }
    }

    /// Share of finished executions that completed successfully.
    pub fn success_ratio(&self) -> f64 {
        let finished = self.completed_executions + self.failed_executions;
        if finished == 0 {
            0.0
        } else {
            self.completed_executions as f64 / finished as f64
        }
    }
}

/// Result of the acquire pass over the durable store.
enum Acquired {
    /// This caller owns the record and must run the work.
    Claimed(IdempotencyRecord),
    /// A completed record exists inside its validity window.
    Replay(IdempotencyRecord),
    /// Another caller is executing right now.
    InFlight(IdempotencyRecord),
    /// The record failed terminally with no retries left.
    Exhausted(IdempotencyRecord),
    /// The acquire pass kept losing races and gave up.
    Contended,
}

/// Executes caller-supplied work at most once per idempotency key.
///
/// Duplicate requests inside a record's validity window observe the stored
/// outcome instead of re-running the work. Concurrency control is optimistic:
/// every record carries a version, and all writes are conditional on the
/// version the writer read.
pub struct IdempotencyEngine {
    state_store: Arc<dyn StateStore>,
    policy_store: Arc<dyn PolicyStore>,
    resolver: PolicyResolver,
    key_generator: KeyGenerator,
    codec: PayloadCodec,
    audit: AuditTrail,
    cache: Option<Arc<RecordCache>>,
    metrics: Arc<ExecutionMetrics>,
    settings: EngineSettings,
}

impl IdempotencyEngine {
    pub fn new(
        state_store: Arc<dyn StateStore>,
        policy_store: Arc<dyn PolicyStore>,
        audit_store: Arc<dyn AuditStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            state_store,
            policy_store: policy_store.clone(),
            resolver: PolicyResolver::new(policy_store),
            key_generator: KeyGenerator::new(),
            codec: PayloadCodec::from_settings(&settings),
            audit: AuditTrail::new(audit_store),
            cache: None,
            metrics: Arc::new(ExecutionMetrics::new()),
            settings,
        }
    }

    /// Attaches the read-through record cache.
    pub fn with_cache(mut self, cache: Arc<RecordCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Gets the counters for this engine.
    pub fn metrics(&self) -> Arc<ExecutionMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn cache_stats(&self) -> Option<Arc<CacheStats>> {
        self.cache.as_ref().map(|cache| cache.stats())
    }

    /// Looks up the record stored under `key`.
    pub async fn record(&self, key: &str) -> Result<IdempotencyRecord> {
        self.state_store
            .find_by_key(key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No idempotency record for key '{}'", key)))
    }

    /// Audit history for the record stored under `key`, oldest entry first.
    pub async fn history(&self, key: &str) -> Result<Vec<AuditEntry>> {
        self.audit.history(key).await
    }

    /// Counts records currently in the given state.
    pub async fn count_records(&self, state: ExecutionState) -> Result<i64> {
        self.state_store.count_by_state(state).await
    }

    /// Writes a policy and drops the resolver cache so the change takes
    /// effect on the next request.
    pub async fn upsert_policy(&self, policy: &IdempotencyPolicy) -> Result<IdempotencyPolicy> {
        let stored = self.policy_store.upsert(policy).await?;
        self.resolver.invalidate();
        Ok(stored)
    }

    /// Drops the resolver cache. For callers that write policies out of band.
    pub fn invalidate_policies(&self) {
        self.resolver.invalidate();
    }

    /// Deletes records whose validity window has elapsed.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let removed = self.state_store.cleanup_expired(Utc::now()).await?;
        if removed > 0 {
            get_metrics().record_cleanup_removed(removed);
        }
        Ok(removed)
    }

    /// Publishes per-state record counts as gauges.
    pub async fn refresh_state_gauges(&self) {
        for state in [
            ExecutionState::Started,
            ExecutionState::InProgress,
            ExecutionState::Completed,
            ExecutionState::Failed,
            ExecutionState::Expired,
        ] {
            match self.state_store.count_by_state(state).await {
                Ok(count) => get_metrics().set_records_in_state(state.label(), count),
                Err(e) => {
                    tracing::warn!(error = %e, state = state.label(), "Failed to count records for gauge");
                    return;
                }
            }
        }
    }

    /// Executes `operation` at most once for the request's idempotency key.
    ///
    /// This is the main entry point. The outcome tells the caller whether the
    /// work ran (`Success`), was replayed from a stored result
    /// (`CachedResult`), is currently running elsewhere (`InProgress`), or
    /// has exhausted its failure budget (`MaxRetriesExceeded`). Errors raised
    /// by the operation itself come back as `AppError::WorkExecution` with
    /// the original error preserved as the source.
    pub async fn execute<T, F, Fut>(
        &self,
        request: ExecutionRequest,
        operation: F,
    ) -> Result<ExecutionOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        let timer = LatencyTimer::new();
        let target_kind = request.target_kind;
        self.metrics.record_request();

        let result = self.execute_inner(request, operation, &timer).await;

        let duration_ms = timer.elapsed_ms();
        self.metrics.record_duration(duration_ms);
        let status = match &result {
            Ok(outcome) => outcome.status.label(),
            Err(AppError::WorkExecution { .. }) => "failed",
            Err(_) => "error",
        };
        get_metrics().record_execution(target_kind.as_str(), status, duration_ms);

        result
    }

    async fn execute_inner<T, F, Fut>(
        &self,
        request: ExecutionRequest,
        operation: F,
        timer: &LatencyTimer,
    ) -> Result<ExecutionOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        if let Err(errors) = request.validate() {
            let detail = errors
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AppError::Validation(detail));
        }

        let policy = self
            .resolver
            .resolve(request.target_kind, &request.target_name)
            .await?;

        if !policy.enabled {
            return self.execute_bypassed(request, operation, timer).await;
        }

        let key = self.key_generator.generate(&request, policy.key_strategy)?;
        let correlation_id = self.key_generator.generate_correlation_id();

        // Fast path: a completed record in the cache is served without
        // touching the durable store.
        if let Some(record) = self.cache_fast_path(&key, &request).await {
            let now = Utc::now();
            self.metrics.record_duplicate();
            self.metrics.record_cached_hit();
            get_metrics().record_duplicate(request.target_kind.as_str());
            if let Err(e) = self.state_store.touch_last_accessed(&key, now).await {
                tracing::warn!(error = %e, key = %key, "Failed to refresh last-access timestamp");
            }
            self.audit.record_access(&record, &correlation_id, now).await;
            tracing::debug!(key = %key, "Duplicate request served from record cache");
            let data = self.codec.decode_response(record.response_payload.as_ref())?;
            return Ok(ExecutionOutcome::cached(
                data,
                key,
                correlation_id,
                record.retry_count,
                timer.elapsed_ms(),
            ));
        }

        let claimed = match self.acquire(&request, &policy, &key, &correlation_id).await? {
            Acquired::Claimed(record) => record,
            Acquired::Replay(record) => {
                let now = Utc::now();
                self.metrics.record_duplicate();
                self.metrics.record_cached_hit();
                get_metrics().record_duplicate(request.target_kind.as_str());
                if let Err(e) = self.state_store.touch_last_accessed(&key, now).await {
                    tracing::warn!(error = %e, key = %key, "Failed to refresh last-access timestamp");
                }
                self.audit.record_access(&record, &correlation_id, now).await;
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.set(&record).await {
                        tracing::warn!(error = %e, key = %key, "Failed to populate record cache");
                    }
                }
                tracing::debug!(key = %key, "Duplicate request served from stored result");
                let data = self.codec.decode_response(record.response_payload.as_ref())?;
                return Ok(ExecutionOutcome::cached(
                    data,
                    key,
                    correlation_id,
                    record.retry_count,
                    timer.elapsed_ms(),
                ));
            }
            Acquired::InFlight(record) => {
                self.metrics.record_duplicate();
                self.metrics.record_in_progress_rejection();
                get_metrics().record_duplicate(request.target_kind.as_str());
                tracing::debug!(
                    key = %key,
                    owner_correlation = %record.correlation_id,
                    "Duplicate request while execution is in progress"
                );
                return Ok(ExecutionOutcome::in_progress(
                    key,
                    correlation_id,
                    record.retry_count,
                    timer.elapsed_ms(),
                ));
            }
            Acquired::Exhausted(record) => {
                self.metrics.record_duplicate();
                self.metrics.record_retries_exhausted();
                get_metrics().record_retries_exhausted(request.target_kind.as_str());
                tracing::warn!(
                    key = %key,
                    retry_count = record.retry_count,
                    "Request rejected: failure budget exhausted"
                );
                return Ok(ExecutionOutcome::max_retries_exceeded(
                    key,
                    correlation_id,
                    record.error_detail.clone(),
                    record.retry_count,
                    timer.elapsed_ms(),
                ));
            }
            Acquired::Contended => {
                self.metrics.record_duplicate();
                self.metrics.record_in_progress_rejection();
                get_metrics().record_duplicate(request.target_kind.as_str());
                tracing::warn!(
                    key = %key,
                    attempts = MAX_ACQUIRE_ATTEMPTS,
                    "Gave up acquiring record after repeated version conflicts; treating request as a concurrent duplicate"
                );
                return Ok(ExecutionOutcome::in_progress(
                    key,
                    correlation_id,
                    0,
                    timer.elapsed_ms(),
                ));
            }
        };

        // This caller owns the record; run the work and persist the outcome.
        // Bookkeeping failures are logged and never mask the business result.
        match operation().await {
            Ok(data) => {
                let response_payload = self.codec.encode_response(&policy, &data);
                self.persist_completion(&claimed, response_payload).await;
                self.metrics.record_completed();
                Ok(ExecutionOutcome::success(
                    data,
                    key,
                    correlation_id,
                    claimed.retry_count,
                    timer.elapsed_ms(),
                ))
            }
            Err(e) => {
                let retryable = claimed.retry_count + 1 < claimed.max_retries;
                let detail = self.codec.truncate_error_detail(&e.to_string());
                self.persist_failure(&claimed, detail).await;
                self.metrics.record_failed();
                Err(AppError::work_execution(key, correlation_id, retryable, e))
            }
        }
    }

    /// Runs the work without any idempotency bookkeeping. Used for targets
    /// whose policy disables idempotency.
    async fn execute_bypassed<T, F, Fut>(
        &self,
        request: ExecutionRequest,
        operation: F,
        timer: &LatencyTimer,
    ) -> Result<ExecutionOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        self.metrics.record_bypassed();
        get_metrics().record_bypassed(request.target_kind.as_str());
        let correlation_id = self.key_generator.generate_correlation_id();
        tracing::debug!(
            target = %request.target_name,
            "Idempotency disabled for target; executing directly"
        );

        match operation().await {
            Ok(data) => Ok(ExecutionOutcome::success(
                data,
                DIRECT_EXECUTION_KEY,
                correlation_id,
                0,
                timer.elapsed_ms(),
            )),
            Err(e) => Err(AppError::work_execution(
                DIRECT_EXECUTION_KEY,
                correlation_id,
                true,
                e,
            )),
        }
    }

    /// Reads a completed, unexpired record from the cache. Any disagreement
    /// with the incoming request falls through to the durable store, which
    /// is authoritative.
    async fn cache_fast_path(
        &self,
        key: &str,
        request: &ExecutionRequest,
    ) -> Option<IdempotencyRecord> {
        let cache = self.cache.as_ref()?;
        let record = cache.get(key).await.ok().flatten()?;
        if record.state != ExecutionState::Completed || record.is_expired_at(Utc::now()) {
            return None;
        }
        if let (Some(stored), Some(incoming)) = (record.content_hash.as_deref(), request.dedup_hash())
        {
            if stored != incoming {
                return None;
            }
        }
        Some(record)
    }

    /// Decides who owns the execution for `key`. Loops on version conflicts:
    /// losing a race means someone else moved the record, so the state is
    /// re-read and re-interpreted from scratch.
    async fn acquire(
        &self,
        request: &ExecutionRequest,
        policy: &IdempotencyPolicy,
        key: &str,
        correlation_id: &str,
    ) -> Result<Acquired> {
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let now = Utc::now();

            let existing = match self.state_store.find_by_key(key).await? {
                Some(existing) => existing,
                None => {
                    let mut record = self.new_record(request, policy, key, correlation_id, now);
                    match self.state_store.try_insert(&record).await? {
                        // Lost the create race; re-read and interpret the winner.
                        Some(_) => continue,
                        None => {
                            self.audit.record_creation(&record, now).await;
                            let read_version = record.version;
                            record.begin_attempt(now);
                            match self
                                .state_store
                                .update_with_version(&record, read_version)
                                .await?
                            {
                                Some(claimed) => {
                                    self.metrics.record_new();
                                    self.audit
                                        .record_transition(
                                            key,
                                            ExecutionState::Started,
                                            ExecutionState::InProgress,
                                            "execution claimed",
                                            Some(correlation_id),
                                            now,
                                        )
                                        .await;
                                    return Ok(Acquired::Claimed(claimed));
                                }
                                None => {
                                    get_metrics().record_version_conflict("claim");
                                    continue;
                                }
                            }
                        }
                    }
                }
            };

            // An elapsed window recycles the record for the incoming request,
            // whatever state the previous attempt reached.
            if existing.state == ExecutionState::Expired || existing.is_expired_at(now) {
                match self
                    .recycle_expired(existing, request, policy, correlation_id, now)
                    .await?
                {
                    Some(claimed) => return Ok(Acquired::Claimed(claimed)),
                    None => {
                        get_metrics().record_version_conflict("recycle");
                        continue;
                    }
                }
            }

            // Same key with different content is a caller bug, not a duplicate.
            if let (Some(stored), Some(incoming)) =
                (existing.content_hash.as_deref(), request.dedup_hash())
            {
                if stored != incoming {
                    return Err(AppError::Validation(
                        "Idempotency key reused with different request content".to_string(),
                    ));
                }
            }

            match existing.state {
                ExecutionState::Completed => return Ok(Acquired::Replay(existing)),
                ExecutionState::Started | ExecutionState::InProgress => {
                    if existing.is_stale_at(now, self.settings.stale_timeout_secs) {
                        match self.reclaim_stale(existing, correlation_id, now).await? {
                            Some(claimed) => return Ok(Acquired::Claimed(claimed)),
                            None => {
                                get_metrics().record_version_conflict("reclaim");
                                continue;
                            }
                        }
                    }
                    return Ok(Acquired::InFlight(existing));
                }
                ExecutionState::Failed => {
                    if existing.has_retries_remaining() {
                        match self.claim_retry(existing, correlation_id, now).await? {
                            Some(claimed) => return Ok(Acquired::Claimed(claimed)),
                            None => {
                                get_metrics().record_version_conflict("retry");
                                continue;
                            }
                        }
                    }
                    return Ok(Acquired::Exhausted(existing));
                }
                // Handled by the expiry branch above.
                ExecutionState::Expired => continue,
            }
        }

        Ok(Acquired::Contended)
    }

    fn new_record(
        &self,
        request: &ExecutionRequest,
        policy: &IdempotencyPolicy,
        key: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> IdempotencyRecord {
        let mut record = IdempotencyRecord::new(
            key,
            request.target_kind,
            &request.target_name,
            correlation_id,
            policy.ttl_seconds,
            policy.max_retries,
            now,
        );
        if let Some(transaction_ref) = &request.transaction_ref {
            record = record.with_transaction_ref(transaction_ref);
        }
        if let Some(hash) = request.dedup_hash() {
            record = record.with_content_hash(hash);
        }
        if let Some(payload) = self.codec.encode_request(policy, request) {
            record = record.with_request_payload(payload);
        }
        record
    }

    /// Recycles a record whose validity window elapsed into a fresh claimed
    /// attempt for the incoming request. One conditional write covers the
    /// whole recycle; the intermediate `Expired` state is visible in the
    /// audit trail but never left behind in the store.
    async fn recycle_expired(
        &self,
        existing: IdempotencyRecord,
        request: &ExecutionRequest,
        policy: &IdempotencyPolicy,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>> {
        let previous_state = existing.state;
        let read_version = existing.version;

        let mut record = existing;
        record.reset_for_new_attempt(correlation_id, policy.ttl_seconds, policy.max_retries, now);
        record.transaction_ref = request.transaction_ref.clone();
        record.content_hash = request.dedup_hash().map(str::to_string);
        record.request_payload = self.codec.encode_request(policy, request);

        match self
            .state_store
            .update_with_version(&record, read_version)
            .await?
        {
            Some(claimed) => {
                self.metrics.record_new();
                self.metrics.record_expired_recycled();
                get_metrics().record_expired(request.target_kind.as_str());
                if previous_state != ExecutionState::Expired {
                    self.audit
                        .record_transition(
                            &claimed.key,
                            previous_state,
                            ExecutionState::Expired,
                            "validity window elapsed",
                            None,
                            now,
                        )
                        .await;
                }
                self.audit
                    .record_transition(
                        &claimed.key,
                        ExecutionState::Expired,
                        ExecutionState::InProgress,
                        "new attempt started after window elapsed",
                        Some(correlation_id),
                        now,
                    )
                    .await;
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.invalidate(&claimed.key).await {
                        tracing::warn!(error = %e, key = %claimed.key, "Failed to invalidate cached record");
                    }
                }
                tracing::info!(key = %claimed.key, "Expired record recycled for a new attempt");
                Ok(Some(claimed))
            }
            None => Ok(None),
        }
    }

    /// Takes over an in-flight record whose owner is presumed crashed. The
    /// abandoned attempt consumes one entry of the failure budget.
    async fn reclaim_stale(
        &self,
        existing: IdempotencyRecord,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>> {
        let previous_state = existing.state;
        let read_version = existing.version;

        let mut record = existing;
        record.correlation_id = correlation_id.to_string();
        record.retry_count += 1;
        record.begin_attempt(now);

        match self
            .state_store
            .update_with_version(&record, read_version)
            .await?
        {
            Some(claimed) => {
                self.metrics.record_new();
                self.metrics.record_stale_recovered();
                get_metrics().record_stale_recovered(claimed.target_kind.as_str());
                self.audit
                    .record_transition(
                        &claimed.key,
                        previous_state,
                        ExecutionState::InProgress,
                        "stale in-flight execution reclaimed",
                        Some(correlation_id),
                        now,
                    )
                    .await;
                tracing::warn!(
                    key = %claimed.key,
                    retry_count = claimed.retry_count,
                    "Reclaimed stale in-flight record"
                );
                Ok(Some(claimed))
            }
            None => Ok(None),
        }
    }

    /// Claims a failed record for another attempt.
    async fn claim_retry(
        &self,
        existing: IdempotencyRecord,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>> {
        let read_version = existing.version;

        let mut record = existing;
        record.correlation_id = correlation_id.to_string();
        record.begin_attempt(now);

        match self
            .state_store
            .update_with_version(&record, read_version)
            .await?
        {
            Some(claimed) => {
                self.metrics.record_new();
                self.audit
                    .record_transition(
                        &claimed.key,
                        ExecutionState::Failed,
                        ExecutionState::InProgress,
                        "failed attempt retried",
                        Some(correlation_id),
                        now,
                    )
                    .await;
                tracing::debug!(
                    key = %claimed.key,
                    retry_count = claimed.retry_count,
                    "Retrying previously failed execution"
                );
                Ok(Some(claimed))
            }
            None => Ok(None),
        }
    }

    /// Persists the completed state with a bounded re-read-and-reapply loop.
    /// Gives up when the record was reclaimed by another caller or the store
    /// keeps failing; the business result has already been produced and is
    /// returned to the caller regardless.
    async fn persist_completion(
        &self,
        claimed: &IdempotencyRecord,
        response_payload: Option<Value>,
    ) {
        let mut record = claimed.clone();
        for attempt in 0..self.settings.completion_write_attempts {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(
                    self.settings.completion_write_backoff_ms,
                ))
                .await;
            }
            let now = Utc::now();
            if !record.state.can_transition_to(ExecutionState::Completed) {
                tracing::warn!(
                    key = %record.key,
                    state = record.state.label(),
                    "Record can no longer complete; dropping completion write"
                );
                return;
            }

            let previous_state = record.state;
            let read_version = record.version;
            let mut candidate = record.clone();
            candidate.complete(response_payload.clone(), now);

            match self
                .state_store
                .update_with_version(&candidate, read_version)
                .await
            {
                Ok(Some(updated)) => {
                    self.audit
                        .record_transition(
                            &updated.key,
                            previous_state,
                            ExecutionState::Completed,
                            "work finished",
                            Some(&updated.correlation_id),
                            now,
                        )
                        .await;
                    if let Some(cache) = &self.cache {
                        if let Err(e) = cache.set(&updated).await {
                            tracing::warn!(error = %e, key = %updated.key, "Failed to populate record cache");
                        }
                    }
                    return;
                }
                Ok(None) => {
                    get_metrics().record_version_conflict("complete");
                    match self.state_store.find_by_key(&record.key).await {
                        Ok(Some(current)) => {
                            if current.correlation_id != record.correlation_id {
                                tracing::warn!(
                                    key = %record.key,
                                    "Another caller reclaimed the record; dropping completion write"
                                );
                                return;
                            }
                            record = current;
                        }
                        Ok(None) => {
                            tracing::warn!(
                                key = %record.key,
                                "Record disappeared before completion could be recorded"
                            );
                            return;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, key = %record.key, "Failed to re-read record after version conflict");
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, key = %record.key, "Failed to persist completion");
                    return;
                }
            }
        }
        tracing::warn!(
            key = %record.key,
            attempts = self.settings.completion_write_attempts,
            "Gave up persisting completion after repeated version conflicts"
        );
    }

    /// Persists a failed attempt. Same bounded pattern as completion; the
    /// work error has already been captured and is returned to the caller
    /// regardless.
    async fn persist_failure(&self, claimed: &IdempotencyRecord, error_detail: String) {
        let mut record = claimed.clone();
        for attempt in 0..self.settings.completion_write_attempts {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(
                    self.settings.completion_write_backoff_ms,
                ))
                .await;
            }
            let now = Utc::now();
            if !record.state.can_transition_to(ExecutionState::Failed) {
                tracing::warn!(
                    key = %record.key,
                    state = record.state.label(),
                    "Record can no longer fail; dropping failure write"
                );
                return;
            }

            let previous_state = record.state;
            let read_version = record.version;
            let mut candidate = record.clone();
            candidate.record_failure(error_detail.as_str(), now);

            match self
                .state_store
                .update_with_version(&candidate, read_version)
                .await
            {
                Ok(Some(updated)) => {
                    self.audit
                        .record_transition(
                            &updated.key,
                            previous_state,
                            ExecutionState::Failed,
                            "attempt failed",
                            Some(&updated.correlation_id),
                            now,
                        )
                        .await;
                    return;
                }
                Ok(None) => {
                    get_metrics().record_version_conflict("fail");
                    match self.state_store.find_by_key(&record.key).await {
                        Ok(Some(current)) => {
                            if current.correlation_id != record.correlation_id {
                                tracing::warn!(
                                    key = %record.key,
                                    "Another caller reclaimed the record; dropping failure write"
                                );
                                return;
                            }
                            record = current;
                        }
                        Ok(None) => {
                            tracing::warn!(
                                key = %record.key,
                                "Record disappeared before failure could be recorded"
                            );
                            return;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, key = %record.key, "Failed to re-read record after version conflict");
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, key = %record.key, "Failed to persist failure");
                    return;
                }
            }
        }
        tracing::warn!(
            key = %record.key,
            attempts = self.settings.completion_write_attempts,
            "Gave up persisting failure after repeated version conflicts"
        );
    }
}

/// Background sweep for records whose validity window elapsed.
pub struct CleanupJob {
    engine: Arc<IdempotencyEngine>,
    interval_seconds: u64,
}

impl CleanupJob {
    pub fn new(engine: Arc<IdempotencyEngine>, interval_seconds: u64) -> Self {
        Self {
            engine,
            interval_seconds,
        }
    }

    /// Runs one sweep.
    pub async fn run_once(&self) -> Result<u64> {
        self.engine.cleanup_expired().await
    }

    /// Starts the sweep loop in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
                self.interval_seconds,
            ));

            loop {
                interval.tick().await;

                match self.engine.cleanup_expired().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Removed {} expired idempotency records", count);
                        }
                        self.engine.refresh_state_gauges().await;
                    }
                    Err(e) => {
                        tracing::error!("Failed to clean up expired idempotency records: {}", e);
                    }
                }
            }
        })
    }
}
