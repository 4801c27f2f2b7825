// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fanin-core - Task Result Store and Chord Coordinator
//!
//! This crate records the outcome of tasks executed elsewhere and detects,
//! exactly once, when every task of a chord header has finished so the
//! chord's callback can run with their combined results.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                  Task execution framework                      │
//! │       (workers report outcomes, dispatch chord callbacks)      │
//! └───────────────────────────────────────────────────────────────┘
//!                │ store_result / on_task_settled   ▲ invoke_async
//!                ▼                                  │
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        ResultBackend                           │
//! │   task results · group results · chord counters · cleanup     │
//! │                                                               │
//! │   ContentCodec ── RetryPolicy ── Joiner (StoreJoiner)         │
//! └───────────────────────────────────────────────────────────────┘
//!                │ Persistence
//!     ┌──────────┼─────────────────────┐
//!     ▼          ▼                     ▼
//! ┌──────────┐ ┌──────────┐     ┌─────────────┐
//! │PostgreSQL│ │  SQLite  │     │  In-memory  │
//! │ row lock │ │ db lock  │     │process lock │
//! └──────────┘ └──────────┘     └─────────────┘
//! ```
//!
//! # Chord Counter State Machine
//!
//! ```text
//!   ABSENT ──apply_chord──▶ ACTIVE(N) ──part──▶ … ──▶ ACTIVE(1) ──part──▶ ABSENT
//!                                                                  │
//!                                                     join + invoke callback
//! ```
//!
//! Decrements of one counter are serialized by the storage strategy (see
//! [`persistence::CounterLocking`]); the decrement that reaches zero deletes
//! the counter in the same transaction, so only one caller ever sees it.
//!
//! # Task Status
//!
//! | Status | Ready | Exception |
//! |--------|-------|-----------|
//! | `PENDING` | | |
//! | `RECEIVED` | | |
//! | `STARTED` | | |
//! | `RETRY` | | yes |
//! | `SUCCESS` | yes | |
//! | `FAILURE` | yes | yes |
//! | `REVOKED` | yes | yes |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FANIN_DATABASE_URL` | Yes | - | `postgres://`, `sqlite:` or `memory:` URL |
//! | `FANIN_READ_DATABASE_URL` | No | - | PostgreSQL read replica for lookups |
//! | `FANIN_MAX_CONNECTIONS` | No | `10` | Pool size |
//! | `FANIN_TASK_ID_MAX_LENGTH` | No | `255` | Identifier length bound |
//! | `FANIN_RESULT_EXTENDED` | No | `false` | Store name, args, kwargs and worker |
//! | `FANIN_RESULT_EXPIRES_SECS` | No | `86400` | Result lifetime, `0` keeps forever |
//! | `FANIN_CHORD_JOIN_TIMEOUT_MS` | No | `3000` | Wait for header results |
//! | `FANIN_CHORD_JOIN_POLL_MS` | No | `500` | Join poll interval |
//! | `FANIN_STORE_RETRIES` | No | `2` | Retries of transient write failures |
//! | `FANIN_CLEANUP_INTERVAL_SECS` | No | `3600` | Daemon cleanup period |
//! | `FANIN_CLEANUP_BATCH_SIZE` | No | `1000` | Rows per delete statement |
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fanin_core::{BackendConfig, ResultBackend, ResultRef};
//! use fanin_core::persistence::SqlitePersistence;
//!
//! let persistence = SqlitePersistence::from_path("results.db", 4).await?;
//! let backend = ResultBackend::new(Arc::new(persistence), BackendConfig::default());
//! backend.startup_checks().await?;
//!
//! backend
//!     .apply_chord(("g1", vec![ResultRef::task("t1"), ResultRef::task("t2")]), None)
//!     .await?;
//! ```

#![deny(missing_docs)]

/// Result backend: task results, group results and cleanup.
pub mod backend;

/// Chord counters and callback triggering.
pub mod chord;

/// Background expiry of old results.
pub mod cleanup_worker;

/// Payload serialization and error payloads.
pub mod codec;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Resolving references to values.
pub mod join;

/// Embedded database migrations.
pub mod migrations;

/// Storage strategies (PostgreSQL, SQLite, in-memory).
pub mod persistence;

/// Task and group references.
pub mod refs;

/// Bounded retry of transient failures.
pub mod retry;

/// Task status values.
pub mod status;

pub use backend::{CleanupReport, GroupMeta, ResultBackend, TaskMeta, TaskRequest};
pub use chord::{ChordHeader, Signature};
pub use codec::{Outcome, TaskError};
pub use config::{BackendConfig, Config};
pub use error::{CoreError, Result};
pub use refs::{GroupRef, ResultRef, TaskRef};
pub use status::TaskStatus;
