// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that removes expired results.
//!
//! Task and group results whose last write is older than the configured
//! expiry are deleted in batches. Chord counters are never expired: a
//! counter lives until its last header task returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::backend::{CleanupReport, ResultBackend};
use crate::error::Result;

/// Configuration for the cleanup worker.
#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// Age after which results are deleted; `None` disables the worker.
    pub expires: Option<Duration>,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600), // 1 hour
            expires: Some(Duration::from_secs(86_400)), // 1 day
        }
    }
}

/// Periodically calls [`ResultBackend::cleanup`].
pub struct CleanupWorker {
    backend: ResultBackend,
    config: CleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl CleanupWorker {
    /// Create a new cleanup worker.
    pub fn new(backend: ResultBackend, config: CleanupWorkerConfig) -> Self {
        Self {
            backend,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until the shutdown signal is received.
    pub async fn run(&self) {
        let Some(expires) = self.config.expires else {
            info!("Cleanup worker disabled, results never expire");
            return;
        };

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            expires_secs = expires.as_secs(),
            "Cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Failed to delete expired results");
                    }
                }
            }
        }

        info!("Cleanup worker stopped");
    }

    /// Run a single cleanup cycle.
    pub async fn run_once(&self) -> Result<CleanupReport> {
        let report = self.backend.cleanup(self.config.expires).await?;
        if report.total() == 0 {
            debug!("Cleanup cycle completed, no expired results found");
        }
        Ok(report)
    }
}
