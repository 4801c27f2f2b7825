//! Persistence interfaces and backends for fanin-core.
//!
//! [`Persistence`] is the storage capability used by the result backend. It
//! is implemented by the PostgreSQL, SQLite and in-memory backends, one of
//! which is chosen when the backend is constructed.

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use self::memory::MemoryPersistence;
pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::status::TaskStatus;

/// Task result row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskResultRecord {
    /// Task identifier.
    pub task_id: String,
    /// Current status (PENDING, STARTED, SUCCESS, ...).
    pub status: String,
    /// MIME type of `result`, `meta`, `task_args` and `task_kwargs`.
    pub content_type: String,
    /// Encoding of the payload columns.
    pub content_encoding: String,
    /// Encoded return value or error.
    pub result: Option<String>,
    /// Traceback text for failures.
    pub traceback: Option<String>,
    /// Encoded metadata mapping (children and caller extensions).
    pub meta: Option<String>,
    /// Name of the task.
    pub task_name: Option<String>,
    /// Encoded positional arguments.
    pub task_args: Option<String>,
    /// Encoded keyword arguments.
    pub task_kwargs: Option<String>,
    /// Worker that executed the task.
    pub worker: Option<String>,
    /// Name of the periodic schedule that spawned the task.
    pub periodic_task_name: Option<String>,
    /// When the row was first written; `None` for placeholders.
    pub date_created: Option<DateTime<Utc>>,
    /// When the task first reported STARTED.
    pub date_started: Option<DateTime<Utc>>,
    /// When the row was last written; `None` for placeholders.
    pub date_done: Option<DateTime<Utc>>,
}

impl TaskResultRecord {
    /// Transient PENDING row for a task that has not been stored.
    pub fn pending(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Pending.as_str().to_string(),
            content_type: String::new(),
            content_encoding: String::new(),
            result: None,
            traceback: None,
            meta: None,
            task_name: None,
            task_args: None,
            task_kwargs: None,
            worker: None,
            periodic_task_name: None,
            date_created: None,
            date_started: None,
            date_done: None,
        }
    }
}

/// Group result row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupResultRecord {
    /// Group identifier.
    pub group_id: String,
    /// MIME type of `result`.
    pub content_type: String,
    /// Encoding of `result`.
    pub content_encoding: String,
    /// Encoded reference tree.
    pub result: Option<String>,
    /// When the row was first written.
    pub date_created: DateTime<Utc>,
    /// When the row was last written.
    pub date_done: DateTime<Utc>,
}

/// Chord counter row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ChordCounterRecord {
    /// Chord header group identifier.
    pub group_id: String,
    /// JSON list of member reference tuples.
    pub sub_tasks: String,
    /// Header tasks still outstanding.
    pub count: i64,
}

/// Values written by a task result upsert.
#[derive(Debug, Clone, Default)]
pub struct NewTaskResult {
    /// Task identifier.
    pub task_id: String,
    /// New status.
    pub status: TaskStatus,
    /// MIME type of the payload columns.
    pub content_type: String,
    /// Encoding of the payload columns.
    pub content_encoding: String,
    /// Encoded return value or error.
    pub result: Option<String>,
    /// Traceback text.
    pub traceback: Option<String>,
    /// Encoded metadata.
    pub meta: Option<String>,
    /// Task name (extended results only).
    pub task_name: Option<String>,
    /// Encoded args (extended results only).
    pub task_args: Option<String>,
    /// Encoded kwargs (extended results only).
    pub task_kwargs: Option<String>,
    /// Worker hostname (extended results only).
    pub worker: Option<String>,
    /// Periodic schedule name (extended results only).
    pub periodic_task_name: Option<String>,
}

/// Values written by a group result upsert.
#[derive(Debug, Clone)]
pub struct NewGroupResult {
    /// Group identifier.
    pub group_id: String,
    /// MIME type of `result`.
    pub content_type: String,
    /// Encoding of `result`.
    pub content_encoding: String,
    /// Encoded reference tree.
    pub result: String,
}

/// Outcome of decrementing a chord counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChordDecrement {
    /// No counter exists: already consumed, or never created.
    Missing,
    /// Counter decremented, this many header tasks remain.
    Remaining(i64),
    /// The last header task returned. The row was deleted in the same
    /// transaction; this is its final state.
    Completed(ChordCounterRecord),
}

/// How a backend serializes concurrent decrements of one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterLocking {
    /// `SELECT ... FOR UPDATE` on the counter row.
    RowLock,
    /// Whole-database write lock held for the transaction.
    DatabaseLock,
    /// In-process mutex; only correct when every writer shares the process.
    ProcessLocal,
}

impl CounterLocking {
    /// Whether decrements from separate processes are serialized.
    pub fn is_multi_process_safe(&self) -> bool {
        !matches!(self, CounterLocking::ProcessLocal)
    }
}

/// Convert a failed query's error, closing the connection it ran on when
/// the failure was connection-level so the pool opens a replacement.
pub(crate) async fn discard_if_broken<DB: sqlx::Database>(
    conn: sqlx::pool::PoolConnection<DB>,
    err: sqlx::Error,
) -> CoreError {
    let err = CoreError::from(err);
    if err.is_transient() {
        let _ = conn.close().await;
    }
    err
}

/// Storage used by the result backend.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Task results
    // ------------------------------------------------------------------

    /// Insert or update the row for `result.task_id`.
    ///
    /// `date_created` is set on insert only, `date_done` on every write, and
    /// `date_started` the first time the status is STARTED.
    async fn store_task_result(
        &self,
        result: &NewTaskResult,
    ) -> Result<TaskResultRecord, CoreError>;

    /// Read a task result.
    async fn get_task_result(&self, task_id: &str)
    -> Result<Option<TaskResultRecord>, CoreError>;

    /// Delete a task result. Returns whether a row existed.
    async fn delete_task_result(&self, task_id: &str) -> Result<bool, CoreError>;

    /// Delete task results whose `date_done` is before `cutoff`, at most
    /// `batch_size` rows per statement. Returns the number deleted.
    async fn delete_expired_task_results(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<u64, CoreError>;

    /// Read a task result, or a PENDING placeholder if none is stored.
    async fn fetch_task_result(&self, task_id: &str) -> Result<TaskResultRecord, CoreError> {
        Ok(self
            .get_task_result(task_id)
            .await?
            .unwrap_or_else(|| TaskResultRecord::pending(task_id)))
    }

    // ------------------------------------------------------------------
    // Group results
    // ------------------------------------------------------------------

    /// Insert or update the row for `group.group_id`.
    async fn store_group_result(
        &self,
        group: &NewGroupResult,
    ) -> Result<GroupResultRecord, CoreError>;

    /// Read a group result.
    async fn get_group_result(
        &self,
        group_id: &str,
    ) -> Result<Option<GroupResultRecord>, CoreError>;

    /// Delete a group result. Returns whether a row existed.
    async fn delete_group_result(&self, group_id: &str) -> Result<bool, CoreError>;

    /// Delete group results whose `date_done` is before `cutoff`.
    async fn delete_expired_group_results(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<u64, CoreError>;

    // ------------------------------------------------------------------
    // Chord counters
    // ------------------------------------------------------------------

    /// Create the counter for a chord header.
    async fn create_chord_counter(
        &self,
        group_id: &str,
        sub_tasks: &str,
        count: i64,
    ) -> Result<(), CoreError>;

    /// Read a counter without locking it.
    async fn get_chord_counter(
        &self,
        group_id: &str,
    ) -> Result<Option<ChordCounterRecord>, CoreError>;

    /// Atomically decrement the counter, deleting it when it reaches zero.
    ///
    /// Concurrent calls for one group are serialized as described by
    /// [`Persistence::counter_locking`]; exactly one of them observes
    /// [`ChordDecrement::Completed`].
    async fn decrement_chord_counter(&self, group_id: &str) -> Result<ChordDecrement, CoreError>;

    /// Locking used by [`Persistence::decrement_chord_counter`].
    fn counter_locking(&self) -> CounterLocking;

    /// Warn about database settings that make result polling unreliable.
    async fn check_isolation(&self) -> Result<(), CoreError> {
        Ok(())
    }
}
