//! Chronicle Pattern Mining daemon
//!
//! Loads the configuration, opens the database and runs the nightly
//! scheduler until Ctrl-C. In-flight jobs finish before the process exits.

use anyhow::Context;
use chronicle_patterns::config::Config;
use chronicle_patterns::logging::init_logging;
use chronicle_patterns::mining::{NightlyScheduler, PatternMiner};
use chronicle_patterns::storage::SqliteStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_default();
    init_logging(&config.logging).context("failed to initialize logging")?;

    tracing::info!("Chronicle Pattern Mining v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Database: {}", config.storage.database_path);

    let store = Arc::new(
        SqliteStore::open(&config.storage.database_path)
            .context("failed to open database")?
            .with_confidence(config.mining.confidence.clone()),
    );

    if !config.scheduler.enabled {
        tracing::warn!("Scheduler disabled in config, nothing to do");
        return Ok(());
    }

    let miner = Arc::new(
        PatternMiner::with_store(config.mining.clone(), store.clone())
            .with_retry_policy(config.scheduler.retry.clone())
            .with_job_retries(config.scheduler.job_retries),
    );
    let scheduler = Arc::new(NightlyScheduler::new(miner, store, config.scheduler.clone()));
    let handle = scheduler.clone().start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down...");
    let finished = scheduler.stop().await;
    handle.abort();

    tracing::info!(jobs = finished.len(), "Chronicle Pattern Mining shutdown complete");
    Ok(())
}
