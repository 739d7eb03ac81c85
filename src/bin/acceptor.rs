// src/bin/acceptor.rs
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use profile_relay::acceptor;
use profile_relay::logging::init_tracing;
use profile_relay::shutdown::shutdown_signal;
use profile_relay::{ConnectionManager, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = RelayConfig::load().context("Failed to load configuration")?;

    // Serving starts only once the queue is usable.
    let manager = tokio::select! {
        manager = ConnectionManager::new(config.broker.queue_settings(), None) => manager,
        _ = shutdown_signal() => {
            info!("Shutdown requested before the queue became ready");
            return Ok(());
        }
    };

    let bind = config.http.bind_address();
    let listener = TcpListener::bind(&bind)
        .await
        .context(format!("Could not listen on {}", bind))?;
    info!("Starting acceptor on {}. Use Ctrl-C or SIGTERM to gracefully exit...", bind);

    let app = acceptor::router(Arc::new(manager.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    manager.shutdown().await;
    info!("Acceptor stopped");
    Ok(())
}
