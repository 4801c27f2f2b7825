// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fanin-core daemon
//!
//! Prepares the result schema and removes expired results on a schedule.
//! Recording results and completing chords happens in the processes that
//! embed the library.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use fanin_core::ResultBackend;
use fanin_core::cleanup_worker::{CleanupWorker, CleanupWorkerConfig};
use fanin_core::config::{Config, DatabaseKind};
use fanin_core::migrations;
use fanin_core::persistence::{
    MemoryPersistence, Persistence, PostgresPersistence, SqlitePersistence,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fanin_core=info".parse()?),
        )
        .init();

    info!("Starting fanin-core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        database = ?config.database_kind,
        max_connections = config.max_connections,
        read_replica = config.read_database_url.is_some(),
        "Configuration loaded"
    );

    let persistence: Arc<dyn Persistence> = match config.database_kind {
        DatabaseKind::Postgres => {
            info!("Connecting to PostgreSQL...");
            let persistence = PostgresPersistence::connect(
                &config.database_url,
                config.read_database_url.as_deref(),
                config.max_connections,
            )
            .await?;

            info!("Running database migrations...");
            migrations::run_postgres(persistence.writer()).await?;
            info!("Migrations completed");

            Arc::new(persistence)
        }
        DatabaseKind::Sqlite => {
            // Migrations run on connect
            info!("Opening SQLite database...");
            Arc::new(SqlitePersistence::connect(&config.database_url, config.max_connections).await?)
        }
        DatabaseKind::Memory => Arc::new(match config.backend.expires {
            Some(ttl) => MemoryPersistence::with_ttl(ttl),
            None => MemoryPersistence::new(),
        }),
    };

    let backend = ResultBackend::new(persistence, config.backend.clone());
    backend.startup_checks().await?;

    let worker = Arc::new(CleanupWorker::new(
        backend,
        CleanupWorkerConfig {
            poll_interval: config.cleanup_interval,
            expires: config.backend.expires,
        },
    ));
    let shutdown = worker.shutdown_handle();
    let worker_handle = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.run().await }
    });

    info!("fanin-core initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    shutdown.notify_one();
    if let Err(e) = worker_handle.await {
        error!("Cleanup worker task failed: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}
