// src/bin/worker.rs
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use profile_relay::logging::init_tracing;
use profile_relay::shutdown::shutdown_signal;
use profile_relay::worker::{
    bootstrap_schema, profile_handler, PgProfileStore, SCHEMA_BOOTSTRAP_TIMEOUT,
};
use profile_relay::{ConnectionManager, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = RelayConfig::load().context("Failed to load configuration")?;
    config.database.validate()?;

    let store = Arc::new(
        PgProfileStore::connect_lazy(&config.database)
            .context("Invalid database configuration")?,
    );
    if config.database.create_table {
        // Runs alongside the broker connect so a database that is down does
        // not hold up consuming.
        tokio::spawn(bootstrap_schema(store.clone(), SCHEMA_BOOTSTRAP_TIMEOUT));
    }

    let handler = profile_handler(store.clone());
    let manager = tokio::select! {
        manager = ConnectionManager::new(config.broker.queue_settings(), Some(handler)) => manager,
        _ = shutdown_signal() => {
            info!("Shutdown requested before the queue became ready");
            store.close().await;
            return Ok(());
        }
    };
    info!(queue = manager.queue_name(), "Worker consuming");

    shutdown_signal().await;

    manager.shutdown().await;
    store.close().await;
    info!("Worker stopped");
    Ok(())
}
