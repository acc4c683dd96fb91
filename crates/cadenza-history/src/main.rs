// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cadenza History - sharded workflow history service
//!
//! The binary acquires every configured shard, serves their engines until
//! Ctrl-C and then drains them. Transports embed the library instead; see
//! [`cadenza_history::runtime`].

use anyhow::Result;
use tracing::{error, info};

use cadenza_history::config::Config;
use cadenza_history::runtime::{HistoryRuntimeBuilder, open_store};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cadenza_history=info".parse()?),
        )
        .init();

    info!("Starting Cadenza History");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        shard_count = config.shard_count,
        host = %config.host_identity,
        cluster = %config.cluster.current_cluster(),
        persistent = config.database_url.is_some(),
        "Configuration loaded"
    );

    let store = open_store(&config).await?;

    let runtime = HistoryRuntimeBuilder::from_config(&config)
        .store(store)
        .build()?
        .start()
        .await?;

    info!("Cadenza History initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
