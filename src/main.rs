use std::sync::Arc;
use std::time::Duration;

use idempotency_engine::cache::RecordCache;
use idempotency_engine::config::Settings;
use idempotency_engine::engine::{CleanupJob, IdempotencyEngine};
use idempotency_engine::observability::{init_logging, init_metrics, HealthChecker, LogConfig};
use idempotency_engine::storage::{PostgresAuditStore, PostgresPolicyStore, PostgresStateStore};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    // Initialize logging
    let log_config = LogConfig {
        level: settings.application.log_level.clone(),
        format: settings.application.log_format.as_str().into(),
        ..LogConfig::default()
    };
    init_logging(&log_config);
    info!("Configuration loaded");

    // Initialize metrics recorder
    let _metrics_handle = init_metrics();

    // Connect to PostgreSQL
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(settings.database.pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&settings.database.url)
        .await?;
    info!("Database connection established");

    // Run migrations
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations applied successfully");

    // Connect to Redis when the record cache is enabled
    let redis_client = if settings.cache.enabled {
        info!("Connecting to Redis...");
        let client = redis::Client::open(settings.cache.url.clone())?;
        let mut con = client.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("PING").query_async(&mut con).await?;
        info!("Redis connection established");
        Some(client)
    } else {
        info!("Record cache disabled; running against the database only");
        None
    };

    // Assemble the engine
    let mut engine = IdempotencyEngine::new(
        Arc::new(PostgresStateStore::new(pool.clone())),
        Arc::new(PostgresPolicyStore::new(pool.clone())),
        Arc::new(PostgresAuditStore::new(pool.clone())),
        settings.engine.clone(),
    );
    if let Some(client) = &redis_client {
        engine = engine.with_cache(Arc::new(RecordCache::new(
            client.clone(),
            settings.cache.clone(),
        )));
    }
    let engine = Arc::new(engine);

    // Startup verification
    let health = HealthChecker::new(pool.clone(), redis_client);
    let aggregated = health.check_all().await;
    info!(status = ?aggregated.status, "Startup verification complete");

    // Background cleanup of expired records
    let cleanup = CleanupJob::new(engine.clone(), settings.engine.cleanup_interval_secs);
    let cleanup_handle = cleanup.start();
    info!(
        interval_seconds = settings.engine.cleanup_interval_secs,
        "Cleanup job started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received; stopping");
    cleanup_handle.abort();

    Ok(())
}
