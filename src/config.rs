use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub application: ApplicationSettings,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

/// Settings for the optional Redis record cache.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    pub enabled: bool,
    pub url: String,
    pub key_prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://localhost:6379".to_string(),
            key_prefix: "idem".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSettings {
    pub log_level: String,
    pub log_format: String,
}

/// Runtime policy for the execution engine itself. Per-target TTL and retry
/// limits live in persisted policy rows; these knobs govern the engine's own
/// behavior regardless of target.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Seconds after which an in-flight record is presumed abandoned.
    pub stale_timeout_secs: i64,
    /// Bound on re-read-and-reapply attempts for bookkeeping writes.
    pub completion_write_attempts: u32,
    /// Fixed backoff between bookkeeping write attempts.
    pub completion_write_backoff_ms: u64,
    /// Largest request/response payload persisted with a record.
    pub max_payload_bytes: usize,
    /// Largest error detail persisted with a record.
    pub max_error_detail_bytes: usize,
    /// Interval between expired-record sweeps in the cleanup job.
    pub cleanup_interval_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            stale_timeout_secs: 1800,
            completion_write_attempts: 3,
            completion_write_backoff_ms: 25,
            max_payload_bytes: 64 * 1024,
            max_error_detail_bytes: 4096,
            cleanup_interval_secs: 3600,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}
