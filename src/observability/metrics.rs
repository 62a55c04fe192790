use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Emitters for the process-global Prometheus recorder. Labels carry the
/// target kind so operators can split jobs from API endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_execution(&self, target_kind: &str, status: &str, duration_ms: f64) {
        counter!("idempotency_executions_total", "kind" => target_kind.to_string(), "status" => status.to_string()).increment(1);
        histogram!("idempotency_execution_duration_ms", "kind" => target_kind.to_string()).record(duration_ms);
    }

    pub fn record_duplicate(&self, target_kind: &str) {
        counter!("idempotency_duplicates_total", "kind" => target_kind.to_string()).increment(1);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        counter!("idempotency_cache_lookups_total", "hit" => hit.to_string()).increment(1);
    }

    pub fn record_state_transition(&self, old_state: Option<&str>, new_state: &str) {
        let from = old_state.unwrap_or("none").to_string();
        counter!("idempotency_state_transitions_total", "from" => from, "to" => new_state.to_string()).increment(1);
    }

    pub fn record_version_conflict(&self, operation: &str) {
        counter!("idempotency_version_conflicts_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn record_stale_recovered(&self, target_kind: &str) {
        counter!("idempotency_stale_recovered_total", "kind" => target_kind.to_string()).increment(1);
    }

    pub fn record_expired(&self, target_kind: &str) {
        counter!("idempotency_expired_total", "kind" => target_kind.to_string()).increment(1);
    }

    pub fn record_retries_exhausted(&self, target_kind: &str) {
        counter!("idempotency_retries_exhausted_total", "kind" => target_kind.to_string()).increment(1);
    }

    pub fn record_bypassed(&self, target_kind: &str) {
        counter!("idempotency_bypassed_total", "kind" => target_kind.to_string()).increment(1);
    }

    pub fn record_cleanup_removed(&self, count: u64) {
        counter!("idempotency_cleanup_removed_total").increment(count);
    }

    pub fn set_records_in_state(&self, state: &str, count: i64) {
        gauge!("idempotency_records_in_state", "state" => state.to_string()).set(count as f64);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes the metrics system and returns the Prometheus handle.
pub fn init_metrics() -> PrometheusHandle {
    let handle = METRICS_HANDLE.get_or_init(|| {
        let builder = PrometheusBuilder::new();
        let handle = builder
            .install_recorder()
            .expect("Failed to install Prometheus recorder");

        describe_metrics();
        handle
    });

    METRICS.get_or_init(Metrics::new);

    handle.clone()
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("idempotency_executions_total", Unit::Count, "Total executions by kind and outcome status");
    describe_histogram!("idempotency_execution_duration_ms", Unit::Milliseconds, "End-to-end execution latency in milliseconds");

    describe_counter!("idempotency_duplicates_total", Unit::Count, "Duplicate submissions resolved without re-running work");
    describe_counter!("idempotency_cache_lookups_total", Unit::Count, "Record cache lookups by hit/miss");
    describe_counter!("idempotency_state_transitions_total", Unit::Count, "State machine transitions by from/to state");
    describe_counter!("idempotency_version_conflicts_total", Unit::Count, "Optimistic-lock conflicts by operation");
    describe_counter!("idempotency_stale_recovered_total", Unit::Count, "In-flight records reclaimed after the stale timeout");
    describe_counter!("idempotency_expired_total", Unit::Count, "Records whose validity window elapsed on access");
    describe_counter!("idempotency_retries_exhausted_total", Unit::Count, "Calls rejected because the failure budget was spent");
    describe_counter!("idempotency_bypassed_total", Unit::Count, "Executions that bypassed idempotency per policy");
    describe_counter!("idempotency_cleanup_removed_total", Unit::Count, "Expired records removed by the cleanup job");

    describe_gauge!("idempotency_records_in_state", Unit::Count, "Current record count per state");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_timer() {
        let timer = LatencyTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let elapsed = timer.elapsed_ms();
        assert!(elapsed >= 10.0);
    }

    #[test]
    fn test_latency_timer_default() {
        let timer = LatencyTimer::default();
        assert!(timer.elapsed_ms() >= 0.0);
    }
}
