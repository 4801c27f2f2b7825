// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for fanin-core integration tests.
//!
//! Provides backends over file-backed SQLite and (when `TEST_DATABASE_URL`
//! is set) PostgreSQL, plus a callback double that records invocations.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use fanin_core::persistence::{PostgresPersistence, SqlitePersistence};
use fanin_core::{BackendConfig, ResultBackend, Signature};

/// Backend settings with short join timings.
pub fn test_config() -> BackendConfig {
    BackendConfig {
        join_timeout: Duration::from_secs(5),
        join_poll_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Random identifier with a readable prefix.
pub fn unique_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Backend over a SQLite file in `dir`, with several pooled connections.
pub async fn sqlite_file_backend(dir: &Path, max_connections: u32) -> ResultBackend {
    let persistence = SqlitePersistence::from_path(dir.join("results.db"), max_connections)
        .await
        .expect("Failed to open SQLite database");
    ResultBackend::new(Arc::new(persistence), test_config())
}

/// Backend over `TEST_DATABASE_URL`, migrated. `None` when unavailable.
pub async fn postgres_backend() -> Option<(ResultBackend, PgPool)> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    fanin_core::migrations::run_postgres(&pool).await.ok()?;

    let persistence = PostgresPersistence::new(pool.clone());
    Some((ResultBackend::new(Arc::new(persistence), test_config()), pool))
}

/// Chord callback that records every invocation.
pub struct RecordingSignature {
    id: String,
    calls: Mutex<Vec<Value>>,
    fail_with: Option<String>,
}

impl RecordingSignature {
    /// Callback that accepts every invocation.
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            calls: Mutex::new(Vec::new()),
            fail_with: None,
        })
    }

    /// Callback whose invocation fails with `message`.
    pub fn failing(id: impl Into<String>, message: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            calls: Mutex::new(Vec::new()),
            fail_with: Some(message.to_string()),
        })
    }

    /// Values passed to each invocation so far.
    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Signature for RecordingSignature {
    fn task_id(&self) -> &str {
        &self.id
    }

    async fn invoke_async(&self, value: Value) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(value);
        match &self.fail_with {
            Some(message) => Err(anyhow::anyhow!("{message}")),
            None => Ok(()),
        }
    }
}
