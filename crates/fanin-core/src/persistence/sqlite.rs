//! SQLite-backed persistence implementation.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::CoreError;

use super::{
    ChordCounterRecord, ChordDecrement, CounterLocking, GroupResultRecord, NewGroupResult,
    NewTaskResult, Persistence, TaskResultRecord, discard_if_broken,
};

/// How long a connection waits for the database write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Enables WAL journaling with a generous busy timeout
    /// - Runs all migrations
    pub async fn from_path(path: impl AsRef<Path>, max_connections: u32) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let options = SqliteConnectOptions::new().filename(path);
        Self::open(options, max_connections).await
    }

    /// Connect using a `sqlite:` URL and run migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let options =
            SqliteConnectOptions::from_str(database_url).map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Invalid SQLite URL '{}': {}", database_url, e),
            })?;
        Self::open(options, max_connections).await
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;
        migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn open(options: SqliteConnectOptions, max_connections: u32) -> Result<Self, CoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite: {}", e),
            })?;

        migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn delete_expired(
        &self,
        table: &'static str,
        cutoff: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<u64, CoreError> {
        let sql = format!(
            "DELETE FROM {table} WHERE id IN \
             (SELECT id FROM {table} WHERE date_done < ? ORDER BY id LIMIT ?)"
        );
        let batch_size = batch_size.max(1);
        let mut total = 0u64;

        loop {
            let deleted = sqlx::query(&sql)
                .bind(cutoff)
                .bind(batch_size)
                .execute(&self.pool)
                .await?
                .rows_affected();
            total += deleted;

            if deleted < batch_size as u64 {
                break;
            }
        }

        Ok(total)
    }
}

async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
    crate::migrations::run_sqlite(pool)
        .await
        .map_err(|e| CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn store_task_result(
        &self,
        result: &NewTaskResult,
    ) -> Result<TaskResultRecord, CoreError> {
        let now = Utc::now();
        let mut conn = self.pool.acquire().await?;

        let stored = sqlx::query_as::<_, TaskResultRecord>(
            r#"
            INSERT INTO task_results (
                task_id, status, content_type, content_encoding, result, traceback, meta,
                task_name, task_args, task_kwargs, worker, periodic_task_name,
                date_created, date_started, date_done
            )
            VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                ?13, CASE WHEN ?2 = 'STARTED' THEN ?13 END, ?13
            )
            ON CONFLICT (task_id) DO UPDATE
            SET status = excluded.status,
                content_type = excluded.content_type,
                content_encoding = excluded.content_encoding,
                result = excluded.result,
                traceback = excluded.traceback,
                meta = excluded.meta,
                task_name = excluded.task_name,
                task_args = excluded.task_args,
                task_kwargs = excluded.task_kwargs,
                worker = excluded.worker,
                periodic_task_name = excluded.periodic_task_name,
                date_started = COALESCE(task_results.date_started, excluded.date_started),
                date_done = excluded.date_done
            RETURNING task_id, status, content_type, content_encoding, result, traceback, meta,
                      task_name, task_args, task_kwargs, worker, periodic_task_name,
                      date_created, date_started, date_done
            "#,
        )
        .bind(&result.task_id)
        .bind(result.status.as_str())
        .bind(&result.content_type)
        .bind(&result.content_encoding)
        .bind(&result.result)
        .bind(&result.traceback)
        .bind(&result.meta)
        .bind(&result.task_name)
        .bind(&result.task_args)
        .bind(&result.task_kwargs)
        .bind(&result.worker)
        .bind(&result.periodic_task_name)
        .bind(now)
        .fetch_one(&mut *conn)
        .await;

        match stored {
            Ok(record) => Ok(record),
            Err(err) => Err(discard_if_broken(conn, err).await),
        }
    }

    async fn get_task_result(
        &self,
        task_id: &str,
    ) -> Result<Option<TaskResultRecord>, CoreError> {
        let record = sqlx::query_as::<_, TaskResultRecord>(
            r#"
            SELECT task_id, status, content_type, content_encoding, result, traceback, meta,
                   task_name, task_args, task_kwargs, worker, periodic_task_name,
                   date_created, date_started, date_done
            FROM task_results
            WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn delete_task_result(&self, task_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM task_results WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired_task_results(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<u64, CoreError> {
        self.delete_expired("task_results", cutoff, batch_size).await
    }

    async fn store_group_result(
        &self,
        group: &NewGroupResult,
    ) -> Result<GroupResultRecord, CoreError> {
        let now = Utc::now();
        let mut conn = self.pool.acquire().await?;

        let stored = sqlx::query_as::<_, GroupResultRecord>(
            r#"
            INSERT INTO group_results (group_id, content_type, content_encoding, result, date_created, date_done)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT (group_id) DO UPDATE
            SET content_type = excluded.content_type,
                content_encoding = excluded.content_encoding,
                result = excluded.result,
                date_done = excluded.date_done
            RETURNING group_id, content_type, content_encoding, result, date_created, date_done
            "#,
        )
        .bind(&group.group_id)
        .bind(&group.content_type)
        .bind(&group.content_encoding)
        .bind(&group.result)
        .bind(now)
        .fetch_one(&mut *conn)
        .await;

        match stored {
            Ok(record) => Ok(record),
            Err(err) => Err(discard_if_broken(conn, err).await),
        }
    }

    async fn get_group_result(
        &self,
        group_id: &str,
    ) -> Result<Option<GroupResultRecord>, CoreError> {
        let record = sqlx::query_as::<_, GroupResultRecord>(
            r#"
            SELECT group_id, content_type, content_encoding, result, date_created, date_done
            FROM group_results
            WHERE group_id = ?
            "#,
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn delete_group_result(&self, group_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM group_results WHERE group_id = ?")
            .bind(group_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired_group_results(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<u64, CoreError> {
        self.delete_expired("group_results", cutoff, batch_size).await
    }

    async fn create_chord_counter(
        &self,
        group_id: &str,
        sub_tasks: &str,
        count: i64,
    ) -> Result<(), CoreError> {
        sqlx::query("INSERT INTO chord_counters (group_id, sub_tasks, count) VALUES (?, ?, ?)")
            .bind(group_id)
            .bind(sub_tasks)
            .bind(count)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_chord_counter(
        &self,
        group_id: &str,
    ) -> Result<Option<ChordCounterRecord>, CoreError> {
        let record = sqlx::query_as::<_, ChordCounterRecord>(
            "SELECT group_id, sub_tasks, count FROM chord_counters WHERE group_id = ?",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// The transaction opens with the `UPDATE`, which takes the database
    /// write lock before anything is read; concurrent decrements wait on
    /// `busy_timeout` and then see the committed count.
    async fn decrement_chord_counter(&self, group_id: &str) -> Result<ChordDecrement, CoreError> {
        let mut tx = self.pool.begin().await?;

        let counter = sqlx::query_as::<_, ChordCounterRecord>(
            r#"
            UPDATE chord_counters
            SET count = MAX(count - 1, 0)
            WHERE group_id = ?
            RETURNING group_id, sub_tasks, count
            "#,
        )
        .bind(group_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(counter) = counter else {
            tx.rollback().await?;
            return Ok(ChordDecrement::Missing);
        };

        if counter.count > 0 {
            tx.commit().await?;
            return Ok(ChordDecrement::Remaining(counter.count));
        }

        sqlx::query("DELETE FROM chord_counters WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(ChordDecrement::Completed(counter))
    }

    fn counter_locking(&self) -> CounterLocking {
        CounterLocking::DatabaseLock
    }
}
