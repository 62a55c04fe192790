use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::{Duration, Instant};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DATABASE_SLOW_MS: f64 = 100.0;
const CACHE_SLOW_MS: f64 = 50.0;

/// Health of the process or one of its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Probe result for a single dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    fn probed(name: &str, latency_ms: f64, slow_threshold_ms: f64) -> Self {
        if latency_ms > slow_threshold_ms {
            Self {
                name: name.to_string(),
                status: HealthStatus::Degraded,
                latency_ms: Some(latency_ms),
                message: Some("High latency detected".to_string()),
            }
        } else {
            Self {
                name: name.to_string(),
                status: HealthStatus::Healthy,
                latency_ms: Some(latency_ms),
                message: None,
            }
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            latency_ms: None,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

/// Combined health report: the worst dependency wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = dependencies
            .iter()
            .map(|d| d.status)
            .max_by_key(|s| match s {
                HealthStatus::Healthy => 0,
                HealthStatus::Degraded => 1,
                HealthStatus::Unhealthy => 2,
            })
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            version,
            uptime_seconds,
            dependencies,
        }
    }
}

/// Probes the engine's dependencies: the durable record store and the
/// optional Redis record cache.
pub struct HealthChecker {
    pool: PgPool,
    redis_client: Option<redis::Client>,
    start_time: Instant,
}

impl HealthChecker {
    pub fn new(pool: PgPool, redis_client: Option<redis::Client>) -> Self {
        Self {
            pool,
            redis_client,
            start_time: Instant::now(),
        }
    }

    pub async fn check_all(&self) -> AggregatedHealth {
        let dependencies = vec![self.check_database().await, self.check_cache().await];

        AggregatedHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.uptime_seconds(),
            dependencies,
        )
    }

    /// Probes the durable store with a trivial query.
    pub async fn check_database(&self) -> DependencyHealth {
        let started = Instant::now();

        match tokio::time::timeout(PROBE_TIMEOUT, sqlx::query("SELECT 1").fetch_one(&self.pool))
            .await
        {
            Ok(Ok(_)) => {
                let latency = started.elapsed().as_secs_f64() * 1000.0;
                DependencyHealth::probed("database", latency, DATABASE_SLOW_MS)
            }
            Ok(Err(e)) => DependencyHealth::unhealthy("database", format!("Query failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy("database", "Connection timeout"),
        }
    }

    /// Probes the record cache. The cache is optional, so its absence only
    /// degrades the aggregate, it never fails it.
    pub async fn check_cache(&self) -> DependencyHealth {
        let client = match &self.redis_client {
            Some(client) => client,
            None => return DependencyHealth::degraded("cache", "Record cache disabled"),
        };

        let started = Instant::now();
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                return DependencyHealth::unhealthy("cache", format!("Connection failed: {}", e))
            }
        };

        match tokio::time::timeout(
            PROBE_TIMEOUT,
            redis::cmd("PING").query_async::<_, ()>(&mut conn),
        )
        .await
        {
            Ok(Ok(_)) => {
                let latency = started.elapsed().as_secs_f64() * 1000.0;
                DependencyHealth::probed("cache", latency, CACHE_SLOW_MS)
            }
            Ok(Err(e)) => DependencyHealth::unhealthy("cache", format!("PING failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy("cache", "PING timeout"),
        }
    }

    /// Readiness gate: the store must answer; the cache may be absent or
    /// degraded because the engine falls back to the store without it.
    pub async fn is_ready(&self) -> bool {
        let database = self.check_database().await;
        let cache = self.check_cache().await;

        database.status.is_healthy() && !cache.status.is_unhealthy()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
