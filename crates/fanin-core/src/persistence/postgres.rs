// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! All writes and every chord counter transaction run on the writer pool.
//! Plain reads go to the optional reader pool (e.g. a replica).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::warn;

use crate::error::CoreError;

use super::{
    ChordCounterRecord, ChordDecrement, CounterLocking, GroupResultRecord, NewGroupResult,
    NewTaskResult, Persistence, TaskResultRecord, discard_if_broken,
};

const TASK_RESULT_COLUMNS: &str = "task_id, status, content_type, content_encoding, result, \
     traceback, meta, task_name, task_args, task_kwargs, worker, periodic_task_name, \
     date_created, date_started, date_done";

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    writer: PgPool,
    reader: PgPool,
}

impl PostgresPersistence {
    /// Use one pool for reads and writes.
    pub fn new(pool: PgPool) -> Self {
        Self {
            writer: pool.clone(),
            reader: pool,
        }
    }

    /// Send plain reads to `reader`; writes and counters stay on `writer`.
    pub fn with_reader(writer: PgPool, reader: PgPool) -> Self {
        Self { writer, reader }
    }

    /// Connect a writer pool (and optionally a reader pool).
    pub async fn connect(
        database_url: &str,
        read_database_url: Option<&str>,
        max_connections: u32,
    ) -> Result<Self, CoreError> {
        let writer = connect_pool(database_url, max_connections).await?;
        match read_database_url {
            Some(url) => {
                let reader = connect_pool(url, max_connections).await?;
                Ok(Self::with_reader(writer, reader))
            }
            None => Ok(Self::new(writer)),
        }
    }

    /// The pool used for writes and counter transactions.
    pub fn writer(&self) -> &PgPool {
        &self.writer
    }
}

async fn connect_pool(url: &str, max_connections: u32) -> Result<PgPool, CoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|e| CoreError::DatabaseError {
            operation: "connect".to_string(),
            details: e.to_string(),
        })
}

// ============================================================================
// Task Result Operations
// ============================================================================

/// Upsert a task result, keeping `date_created` and the first `date_started`.
pub async fn store_task_result(
    pool: &PgPool,
    result: &NewTaskResult,
) -> Result<TaskResultRecord, CoreError> {
    let sql = format!(
        r#"
        INSERT INTO task_results (
            task_id, status, content_type, content_encoding, result, traceback, meta,
            task_name, task_args, task_kwargs, worker, periodic_task_name,
            date_created, date_started, date_done
        )
        VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
            NOW(), CASE WHEN $2 = 'STARTED' THEN NOW() END, NOW()
        )
        ON CONFLICT (task_id) DO UPDATE
        SET status = EXCLUDED.status,
            content_type = EXCLUDED.content_type,
            content_encoding = EXCLUDED.content_encoding,
            result = EXCLUDED.result,
            traceback = EXCLUDED.traceback,
            meta = EXCLUDED.meta,
            task_name = EXCLUDED.task_name,
            task_args = EXCLUDED.task_args,
            task_kwargs = EXCLUDED.task_kwargs,
            worker = EXCLUDED.worker,
            periodic_task_name = EXCLUDED.periodic_task_name,
            date_started = COALESCE(task_results.date_started, EXCLUDED.date_started),
            date_done = EXCLUDED.date_done
        RETURNING {TASK_RESULT_COLUMNS}
        "#
    );

    let mut conn = pool.acquire().await?;
    let stored = sqlx::query_as::<_, TaskResultRecord>(&sql)
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
        .fetch_one(&mut *conn)
        .await;

    match stored {
        Ok(record) => Ok(record),
        Err(err) => Err(discard_if_broken(conn, err).await),
    }
}

/// Get a task result by ID.
pub async fn get_task_result(
    pool: &PgPool,
    task_id: &str,
) -> Result<Option<TaskResultRecord>, CoreError> {
    let sql = format!("SELECT {TASK_RESULT_COLUMNS} FROM task_results WHERE task_id = $1");
    let record = sqlx::query_as::<_, TaskResultRecord>(&sql)
        .bind(task_id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

/// Delete a task result.
pub async fn delete_task_result(pool: &PgPool, task_id: &str) -> Result<bool, CoreError> {
    let result = sqlx::query("DELETE FROM task_results WHERE task_id = $1")
        .bind(task_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete rows of `table` finished before `cutoff`, `batch_size` at a time.
///
/// Each batch is its own statement so no lock is held across batches.
async fn delete_expired(
    pool: &PgPool,
    table: &'static str,
    cutoff: DateTime<Utc>,
    batch_size: i64,
) -> Result<u64, CoreError> {
    let sql = format!(
        "DELETE FROM {table} WHERE id IN \
         (SELECT id FROM {table} WHERE date_done < $1 ORDER BY id LIMIT $2)"
    );
    let batch_size = batch_size.max(1);
    let mut total = 0u64;

    loop {
        let deleted = sqlx::query(&sql)
            .bind(cutoff)
            .bind(batch_size)
            .execute(pool)
            .await?
            .rows_affected();
        total += deleted;

        if deleted < batch_size as u64 {
            break;
        }
    }

    Ok(total)
}

// ============================================================================
// Group Result Operations
// ============================================================================

/// Upsert a group result.
pub async fn store_group_result(
    pool: &PgPool,
    group: &NewGroupResult,
) -> Result<GroupResultRecord, CoreError> {
    let mut conn = pool.acquire().await?;
    let stored = sqlx::query_as::<_, GroupResultRecord>(
        r#"
        INSERT INTO group_results (group_id, content_type, content_encoding, result, date_created, date_done)
        VALUES ($1, $2, $3, $4, NOW(), NOW())
        ON CONFLICT (group_id) DO UPDATE
        SET content_type = EXCLUDED.content_type,
            content_encoding = EXCLUDED.content_encoding,
            result = EXCLUDED.result,
            date_done = EXCLUDED.date_done
        RETURNING group_id, content_type, content_encoding, result, date_created, date_done
        "#,
    )
    .bind(&group.group_id)
    .bind(&group.content_type)
    .bind(&group.content_encoding)
    .bind(&group.result)
    .fetch_one(&mut *conn)
    .await;

    match stored {
        Ok(record) => Ok(record),
        Err(err) => Err(discard_if_broken(conn, err).await),
    }
}

/// Get a group result by ID.
pub async fn get_group_result(
    pool: &PgPool,
    group_id: &str,
) -> Result<Option<GroupResultRecord>, CoreError> {
    let record = sqlx::query_as::<_, GroupResultRecord>(
        r#"
        SELECT group_id, content_type, content_encoding, result, date_created, date_done
        FROM group_results
        WHERE group_id = $1
        "#,
    )
    .bind(group_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Delete a group result.
pub async fn delete_group_result(pool: &PgPool, group_id: &str) -> Result<bool, CoreError> {
    let result = sqlx::query("DELETE FROM group_results WHERE group_id = $1")
        .bind(group_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Chord Counter Operations
// ============================================================================

/// Insert a chord counter.
pub async fn create_chord_counter(
    pool: &PgPool,
    group_id: &str,
    sub_tasks: &str,
    count: i64,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO chord_counters (group_id, sub_tasks, count)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(group_id)
    .bind(sub_tasks)
    .bind(count)
    .execute(pool)
    .await?;

    Ok(())
}

/// Read a chord counter.
pub async fn get_chord_counter(
    pool: &PgPool,
    group_id: &str,
) -> Result<Option<ChordCounterRecord>, CoreError> {
    let record = sqlx::query_as::<_, ChordCounterRecord>(
        "SELECT group_id, sub_tasks, count FROM chord_counters WHERE group_id = $1",
    )
    .bind(group_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Decrement a chord counter under a row lock.
///
/// The `FOR UPDATE` lock is held until commit, so concurrent decrements of
/// the same group run one after another and only one sees zero.
pub async fn decrement_chord_counter(
    pool: &PgPool,
    group_id: &str,
) -> Result<ChordDecrement, CoreError> {
    let mut tx = pool.begin().await?;

    let counter = sqlx::query_as::<_, ChordCounterRecord>(
        r#"
        SELECT group_id, sub_tasks, count
        FROM chord_counters
        WHERE group_id = $1
        FOR UPDATE
        "#,
    )
    .bind(group_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(mut counter) = counter else {
        tx.rollback().await?;
        return Ok(ChordDecrement::Missing);
    };

    counter.count = (counter.count - 1).max(0);

    if counter.count > 0 {
        sqlx::query("UPDATE chord_counters SET count = $2 WHERE group_id = $1")
            .bind(group_id)
            .bind(counter.count)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        return Ok(ChordDecrement::Remaining(counter.count));
    }

    sqlx::query("DELETE FROM chord_counters WHERE group_id = $1")
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(ChordDecrement::Completed(counter))
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn store_task_result(
        &self,
        result: &NewTaskResult,
    ) -> Result<TaskResultRecord, CoreError> {
        store_task_result(&self.writer, result).await
    }

    async fn get_task_result(
        &self,
        task_id: &str,
    ) -> Result<Option<TaskResultRecord>, CoreError> {
        get_task_result(&self.reader, task_id).await
    }

    async fn delete_task_result(&self, task_id: &str) -> Result<bool, CoreError> {
        delete_task_result(&self.writer, task_id).await
    }

    async fn delete_expired_task_results(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<u64, CoreError> {
        delete_expired(&self.writer, "task_results", cutoff, batch_size).await
    }

    async fn store_group_result(
        &self,
        group: &NewGroupResult,
    ) -> Result<GroupResultRecord, CoreError> {
        store_group_result(&self.writer, group).await
    }

    async fn get_group_result(
        &self,
        group_id: &str,
    ) -> Result<Option<GroupResultRecord>, CoreError> {
        get_group_result(&self.reader, group_id).await
    }

    async fn delete_group_result(&self, group_id: &str) -> Result<bool, CoreError> {
        delete_group_result(&self.writer, group_id).await
    }

    async fn delete_expired_group_results(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: i64,
    ) -> Result<u64, CoreError> {
        delete_expired(&self.writer, "group_results", cutoff, batch_size).await
    }

    async fn create_chord_counter(
        &self,
        group_id: &str,
        sub_tasks: &str,
        count: i64,
    ) -> Result<(), CoreError> {
        create_chord_counter(&self.writer, group_id, sub_tasks, count).await
    }

    async fn get_chord_counter(
        &self,
        group_id: &str,
    ) -> Result<Option<ChordCounterRecord>, CoreError> {
        // Never from a replica.
        get_chord_counter(&self.writer, group_id).await
    }

    async fn decrement_chord_counter(&self, group_id: &str) -> Result<ChordDecrement, CoreError> {
        decrement_chord_counter(&self.writer, group_id).await
    }

    fn counter_locking(&self) -> CounterLocking {
        CounterLocking::RowLock
    }

    async fn check_isolation(&self) -> Result<(), CoreError> {
        let (level,): (String,) = sqlx::query_as("SHOW transaction_isolation")
            .fetch_one(&self.reader)
            .await?;

        if level.eq_ignore_ascii_case("repeatable read")
            || level.eq_ignore_ascii_case("serializable")
        {
            warn!(
                isolation = %level,
                "Polling results inside one '{}' transaction may return outdated rows; \
                 commit between polls",
                level
            );
        }

        Ok(())
    }
}
