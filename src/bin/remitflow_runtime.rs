//! Remitflow Runtime
//!
//! Long-running process that:
//! - Opens (and migrates) the SQLite database
//! - Builds the PipelineEngine
//! - Spawns the feed consumer (poll loop + time-threshold sweep)
//! - Logs release notices handed to the file generator
//!
//! Usage:
//!   cargo run --release --bin remitflow_runtime
//!
//! Environment variables:
//!   REMITFLOW_DB_PATH - SQLite database path (default: remitflow.db)
//!   ENABLE_PIPELINE - Master switch (default: false)
//!   FEED_POLL_INTERVAL_MS - Poll interval (default: 5000)
//!   RELEASE_CHANNEL_BUFFER - Release notice channel size (default: 1000)

use dotenv::dotenv;
use log::{error, info};
use remitflow::pipeline::{
    config::PipelineConfig,
    db::SqliteStore,
    engine::PipelineEngine,
    ingestion::{start_feed_consumer, FeedConsumer},
    release::ChannelReleaseSink,
};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Remitflow Runtime");
    info!("   ├─ Version: {}", env!("CARGO_PKG_VERSION"));
    info!("   └─ Mode: feed consumer + time sweep");

    let config = PipelineConfig::from_env();

    if !config.enabled {
        info!("⚠️  Pipeline is DISABLED (set ENABLE_PIPELINE=true to activate)");
        info!("   └─ Exiting gracefully...");
        return Ok(());
    }

    info!("✅ Pipeline ENABLED");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Consumer: {}", config.consumer_id);
    info!("   ├─ Poll interval: {}ms (batch {})", config.poll_interval_ms, config.batch_size);
    info!("   ├─ Store timeout: {}ms", config.store_timeout_ms);
    info!("   ├─ Config cache TTL: {}ms", config.config_cache_ttl_ms);
    info!("   ├─ Time sweep interval: {}ms", config.time_sweep_interval_ms);
    info!("   └─ Settled statuses: {}", config.settled_statuses.join(","));

    info!("🔧 Initializing database...");
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    info!("✅ Database initialized");

    let (sink, mut notices) = ChannelReleaseSink::channel(config.release_channel_buffer);
    info!("✅ Release channel created (buffer: {})", config.release_channel_buffer);

    let engine = Arc::new(PipelineEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(sink),
        &config,
    ));
    info!("✅ PipelineEngine created");

    let consumer = Arc::new(FeedConsumer::new(
        store.clone(),
        store.clone(),
        engine.clone(),
        &config,
    ));

    info!("🚀 Spawning background tasks...");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let poll_interval = config.poll_interval();
    let sweep_interval = config.time_sweep_interval();
    let consumer_task = tokio::spawn(async move {
        start_feed_consumer(consumer, poll_interval, sweep_interval, shutdown_rx).await;
    });
    info!("   ├─ ✅ Feed consumer task spawned");

    // File generation lives outside this process; notices are logged for it
    let notice_task = tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            info!(
                "📦 Release notice: bucket {} (rule {}) | payer {} → payee {} | {} claims | total {}",
                notice.bucket_id,
                notice.rule_id,
                notice.payer_key,
                notice.payee_key,
                notice.claim_count,
                notice.total_amount
            );
        }
    });
    info!("   └─ ✅ Release notice logger spawned");

    info!("");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    shutdown_tx.send(true)?;
    if let Err(e) = consumer_task.await {
        error!("❌ Feed consumer task ended abnormally: {}", e);
    }

    // Dropping the engine closes the release channel once the consumer is gone
    drop(engine);
    if tokio::time::timeout(std::time::Duration::from_secs(2), notice_task)
        .await
        .is_err()
    {
        info!("⚠️  Release notice logger still draining, leaving it behind");
    }

    info!("✅ Remitflow runtime stopped");
    Ok(())
}
