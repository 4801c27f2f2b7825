// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The result backend: task results, group results and cleanup.
//!
//! Chord coordination is implemented on the same type in [`crate::chord`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::chord::Signature;
use crate::codec::{ContentCodec, Outcome, Serializer, TaskError};
use crate::config::{BackendConfig, MAX_ID_LENGTH};
use crate::error::{CoreError, Result};
use crate::join::{Joiner, StoreJoiner};
use crate::persistence::{
    GroupResultRecord, NewGroupResult, NewTaskResult, Persistence, TaskResultRecord,
};
use crate::refs::ResultRef;
use crate::retry::{RetryPolicy, with_retry};
use crate::status::TaskStatus;

/// Context of the task execution reporting a result.
#[derive(Clone, Default)]
pub struct TaskRequest {
    /// Task identifier.
    pub id: String,
    /// Group the task belongs to.
    pub group: Option<String>,
    /// Callback to run once every task of the group has returned.
    pub chord: Option<Arc<dyn Signature>>,
    /// Task name.
    pub task: Option<String>,
    /// Positional arguments.
    pub args: Option<Value>,
    /// Keyword arguments.
    pub kwargs: Option<Value>,
    /// Caller-rendered positional arguments, stored instead of `args`.
    pub argsrepr: Option<String>,
    /// Caller-rendered keyword arguments, stored instead of `kwargs`.
    pub kwargsrepr: Option<String>,
    /// Worker hostname.
    pub hostname: Option<String>,
    /// Periodic schedule that spawned the task.
    pub periodic_task_name: Option<String>,
    /// Tasks spawned by this one.
    pub children: Vec<ResultRef>,
    /// Extra metadata merged into the stored `meta` mapping.
    pub extra_meta: Map<String, Value>,
}

impl TaskRequest {
    /// Request for `id` with nothing else set.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Mark the task as a member of chord header `group_id`.
    pub fn with_chord(mut self, group_id: impl Into<String>, callback: Arc<dyn Signature>) -> Self {
        self.group = Some(group_id.into());
        self.chord = Some(callback);
        self
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("chord", &self.chord.as_ref().map(|c| c.task_id().to_string()))
            .field("task", &self.task)
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

/// Decoded task result.
#[derive(Debug, Clone)]
pub struct TaskMeta {
    /// Task identifier.
    pub task_id: String,
    /// Current status.
    pub status: TaskStatus,
    /// Return value or error, `None` while nothing was stored.
    pub result: Option<Outcome>,
    /// Traceback text.
    pub traceback: Option<String>,
    /// Tasks spawned by this one.
    pub children: Vec<ResultRef>,
    /// Caller metadata stored alongside the result.
    pub extra: Map<String, Value>,
    /// Task name (extended results).
    pub name: Option<String>,
    /// Stored positional arguments (extended results). A string when the
    /// caller supplied a rendered repr.
    pub args: Option<Value>,
    /// Stored keyword arguments (extended results).
    pub kwargs: Option<Value>,
    /// Worker hostname (extended results).
    pub worker: Option<String>,
    /// Periodic schedule name (extended results).
    pub periodic_task_name: Option<String>,
    /// First write.
    pub date_created: Option<DateTime<Utc>>,
    /// First STARTED write.
    pub date_started: Option<DateTime<Utc>>,
    /// Last write.
    pub date_done: Option<DateTime<Utc>>,
}

/// Decoded group result.
#[derive(Debug, Clone)]
pub struct GroupMeta {
    /// Group identifier.
    pub group_id: String,
    /// Member references as saved.
    pub members: Vec<ResultRef>,
    /// Current state of every leaf task, in member order, when requested.
    pub resolved: Option<Vec<TaskMeta>>,
    /// Last write.
    pub date_done: DateTime<Utc>,
}

/// Rows removed by [`ResultBackend::cleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Task results deleted.
    pub task_results: u64,
    /// Group results deleted.
    pub group_results: u64,
}

impl CleanupReport {
    /// Total rows deleted.
    pub fn total(&self) -> u64 {
        self.task_results + self.group_results
    }
}

/// Stores task and group results and coordinates chords.
#[derive(Clone)]
pub struct ResultBackend {
    pub(crate) persistence: Arc<dyn Persistence>,
    pub(crate) codec: ContentCodec,
    pub(crate) config: BackendConfig,
    pub(crate) joiner: Arc<dyn Joiner>,
    retry: RetryPolicy,
}

impl fmt::Debug for ResultBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultBackend")
            .field("codec", &self.codec)
            .field("config", &self.config)
            .field("counter_locking", &self.persistence.counter_locking())
            .finish_non_exhaustive()
    }
}

impl ResultBackend {
    /// Backend over `persistence` using JSON payloads.
    pub fn new(persistence: Arc<dyn Persistence>, config: BackendConfig) -> Self {
        Self {
            persistence,
            codec: ContentCodec::default(),
            joiner: Arc::new(StoreJoiner::new(config.join_poll_interval)),
            retry: RetryPolicy::new(config.store_retries),
            config,
        }
    }

    /// Encode new payloads with `serializer`.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.codec = ContentCodec::new(serializer);
        self
    }

    /// Resolve chord headers with `joiner` instead of polling the store.
    pub fn with_joiner(mut self, joiner: Arc<dyn Joiner>) -> Self {
        self.joiner = joiner;
        self
    }

    /// The storage strategy.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Backend settings.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Warn about storage setups that weaken chord or polling guarantees.
    ///
    /// Intended to run once after construction.
    pub async fn startup_checks(&self) -> Result<()> {
        let locking = self.persistence.counter_locking();
        if locking.is_multi_process_safe() {
            info!(locking = ?locking, "Chord counter locking");
        } else {
            warn!(
                locking = ?locking,
                "Chord counters are only consistent within this process; \
                 chords completed from several processes may fire twice or never"
            );
        }
        self.persistence.check_isolation().await
    }

    // ------------------------------------------------------------------
    // Task results
    // ------------------------------------------------------------------

    /// Store the outcome of a task, replacing any previous one.
    pub async fn store_result(
        &self,
        task_id: &str,
        outcome: &Outcome,
        status: TaskStatus,
        traceback: Option<&str>,
        request: Option<&TaskRequest>,
    ) -> Result<TaskResultRecord> {
        self.validate_id("task_id", task_id)?;

        let encoded = self.codec.encode(&outcome.to_value()?)?;

        let mut meta = request.map(|r| r.extra_meta.clone()).unwrap_or_default();
        let children: Vec<Value> = request
            .map(|r| r.children.iter().map(ResultRef::to_tuple).collect())
            .unwrap_or_default();
        meta.insert("children".to_string(), Value::Array(children));
        let meta = self.codec.encode(&Value::Object(meta))?;

        let mut row = NewTaskResult {
            task_id: task_id.to_string(),
            status,
            content_type: encoded.content_type,
            content_encoding: encoded.content_encoding,
            result: Some(encoded.body),
            traceback: traceback.map(str::to_string),
            meta: Some(meta.body),
            ..Default::default()
        };

        if self.config.extended_result
            && let Some(request) = request
        {
            row.task_name = request.task.clone();
            row.task_args = self.encode_args(request.argsrepr.as_deref(), request.args.as_ref())?;
            row.task_kwargs =
                self.encode_args(request.kwargsrepr.as_deref(), request.kwargs.as_ref())?;
            row.worker = request.hostname.clone();
            row.periodic_task_name = request.periodic_task_name.clone();
        }

        let persistence = &*self.persistence;
        let row = &row;
        let record = with_retry(self.retry, CoreError::is_transient, move || async move {
            persistence.store_task_result(row).await
        })
        .await?;

        debug!(task_id = %task_id, status = %status, "Stored task result");
        Ok(record)
    }

    /// Record that a task began executing; `meta` is stored as its result.
    pub async fn mark_as_started(
        &self,
        task_id: &str,
        meta: Value,
        request: Option<&TaskRequest>,
    ) -> Result<TaskResultRecord> {
        self.store_result(task_id, &Outcome::Value(meta), TaskStatus::Started, None, request)
            .await
    }

    /// Record a successful return value.
    pub async fn mark_as_done(
        &self,
        task_id: &str,
        value: Value,
        request: Option<&TaskRequest>,
    ) -> Result<TaskResultRecord> {
        self.store_result(task_id, &Outcome::Value(value), TaskStatus::Success, None, request)
            .await
    }

    /// Record a task error.
    pub async fn mark_as_failure(
        &self,
        task_id: &str,
        error: &TaskError,
        traceback: Option<&str>,
        request: Option<&TaskRequest>,
    ) -> Result<TaskResultRecord> {
        self.store_result(
            task_id,
            &Outcome::Error(error.clone()),
            TaskStatus::Failure,
            traceback,
            request,
        )
        .await
    }

    /// Record that the task will be retried after `error`.
    pub async fn mark_as_retry(
        &self,
        task_id: &str,
        error: &TaskError,
        traceback: Option<&str>,
        request: Option<&TaskRequest>,
    ) -> Result<TaskResultRecord> {
        self.store_result(
            task_id,
            &Outcome::Error(error.clone()),
            TaskStatus::Retry,
            traceback,
            request,
        )
        .await
    }

    /// Record that the task was revoked.
    pub async fn mark_as_revoked(
        &self,
        task_id: &str,
        reason: &str,
        request: Option<&TaskRequest>,
    ) -> Result<TaskResultRecord> {
        let error = TaskError::new("TaskRevokedError", reason);
        self.store_result(
            task_id,
            &Outcome::Error(error),
            TaskStatus::Revoked,
            None,
            request,
        )
        .await
    }

    /// Store the outcome reported by a worker and, once the task is ready
    /// and belongs to a chord header, count it towards the chord.
    pub async fn on_task_settled(
        &self,
        request: &TaskRequest,
        status: TaskStatus,
        outcome: &Outcome,
        traceback: Option<&str>,
    ) -> Result<TaskResultRecord> {
        let record = self
            .store_result(&request.id, outcome, status, traceback, Some(request))
            .await?;
        if status.is_ready() && request.chord.is_some() {
            self.on_chord_part_return(request, status, outcome).await?;
        }
        Ok(record)
    }

    /// Stored row for `task_id`, or a PENDING placeholder.
    pub async fn get_result(&self, task_id: &str) -> Result<TaskResultRecord> {
        self.persistence.fetch_task_result(task_id).await
    }

    /// Current status of `task_id` (PENDING when unknown).
    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatus> {
        self.get_result(task_id).await?.status.parse()
    }

    /// Decoded result for `task_id`.
    pub async fn get_task_meta(&self, task_id: &str) -> Result<TaskMeta> {
        let record = self.get_result(task_id).await?;
        let status: TaskStatus = record.status.parse()?;
        let encoding = record.content_encoding.as_str();

        let result = self
            .codec
            .decode_opt(encoding, record.result.as_deref())?
            .map(|value| Outcome::from_value(value, status.is_exception()));

        let (children, extra) = match self.codec.decode_opt(encoding, record.meta.as_deref())? {
            Some(Value::Object(mut meta)) => {
                let children = match meta.remove("children") {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(ResultRef::from_tuple)
                        .collect::<Result<Vec<_>>>()?,
                    _ => Vec::new(),
                };
                (children, meta)
            }
            _ => (Vec::new(), Map::new()),
        };

        Ok(TaskMeta {
            task_id: record.task_id,
            status,
            result,
            traceback: record.traceback,
            children,
            extra,
            name: record.task_name,
            args: self.codec.decode_opt(encoding, record.task_args.as_deref())?,
            kwargs: self.codec.decode_opt(encoding, record.task_kwargs.as_deref())?,
            worker: record.worker,
            periodic_task_name: record.periodic_task_name,
            date_created: record.date_created,
            date_started: record.date_started,
            date_done: record.date_done,
        })
    }

    /// Delete the result of `task_id`. Unknown ids are ignored.
    pub async fn forget(&self, task_id: &str) -> Result<()> {
        let persistence = &*self.persistence;
        let existed = with_retry(self.retry, CoreError::is_transient, move || async move {
            persistence.delete_task_result(task_id).await
        })
        .await?;
        debug!(task_id = %task_id, existed, "Forgot task result");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Group results
    // ------------------------------------------------------------------

    /// Store the member references of a group.
    pub async fn save_group(
        &self,
        group_id: &str,
        members: &[ResultRef],
    ) -> Result<GroupResultRecord> {
        self.validate_id("group_id", group_id)?;

        let tuples = Value::Array(members.iter().map(ResultRef::to_tuple).collect());
        let encoded = self.codec.encode(&tuples)?;
        let row = NewGroupResult {
            group_id: group_id.to_string(),
            content_type: encoded.content_type,
            content_encoding: encoded.content_encoding,
            result: encoded.body,
        };

        let persistence = &*self.persistence;
        let row = &row;
        let record = with_retry(self.retry, CoreError::is_transient, move || async move {
            persistence.store_group_result(row).await
        })
        .await?;

        debug!(group_id = %group_id, members = members.len(), "Saved group result");
        Ok(record)
    }

    /// Load a saved group, optionally reading the state of every leaf task.
    pub async fn restore_group(&self, group_id: &str, resolve: bool) -> Result<Option<GroupMeta>> {
        let Some(record) = self.persistence.get_group_result(group_id).await? else {
            return Ok(None);
        };

        let members = match self
            .codec
            .decode_opt(&record.content_encoding, record.result.as_deref())?
        {
            Some(Value::Array(items)) => items
                .iter()
                .map(ResultRef::from_tuple)
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(CoreError::InvalidReference {
                    details: format!("group '{group_id}' holds {other}, expected a member list"),
                });
            }
            None => Vec::new(),
        };

        let resolved = if resolve {
            let mut metas = Vec::new();
            for member in &members {
                for task_id in member.leaf_task_ids() {
                    metas.push(self.get_task_meta(task_id).await?);
                }
            }
            Some(metas)
        } else {
            None
        };

        Ok(Some(GroupMeta {
            group_id: record.group_id,
            members,
            resolved,
            date_done: record.date_done,
        }))
    }

    /// Delete a saved group. Unknown ids are ignored.
    pub async fn delete_group(&self, group_id: &str) -> Result<()> {
        let persistence = &*self.persistence;
        with_retry(self.retry, CoreError::is_transient, move || async move {
            persistence.delete_group_result(group_id).await
        })
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expiry
    // ------------------------------------------------------------------

    /// Delete task and group results last written more than `expires` ago.
    ///
    /// Falls back to the configured expiry; does nothing when neither is set.
    pub async fn cleanup(&self, expires: Option<Duration>) -> Result<CleanupReport> {
        let Some(expires) = expires.or(self.config.expires) else {
            return Ok(CleanupReport::default());
        };
        let expires = chrono::Duration::from_std(expires)
            .map_err(|e| CoreError::validation("expires", e.to_string()))?;
        let cutoff = Utc::now() - expires;
        let batch_size = self.config.cleanup_batch_size;

        let report = CleanupReport {
            task_results: self
                .persistence
                .delete_expired_task_results(cutoff, batch_size)
                .await?,
            group_results: self
                .persistence
                .delete_expired_group_results(cutoff, batch_size)
                .await?,
        };

        if report.total() > 0 {
            info!(
                task_results = report.task_results,
                group_results = report.group_results,
                cutoff = %cutoff,
                "Deleted expired results"
            );
        }
        Ok(report)
    }

    pub(crate) fn validate_id(&self, field: &str, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(CoreError::validation(field, "must not be empty"));
        }
        let max = self.config.task_id_max_length.clamp(1, MAX_ID_LENGTH);
        if id.chars().count() > max {
            return Err(CoreError::validation(
                field,
                format!("must be at most {max} characters"),
            ));
        }
        Ok(())
    }

    fn encode_args(&self, repr: Option<&str>, raw: Option<&Value>) -> Result<Option<String>> {
        match (repr, raw) {
            (Some(repr), _) => Ok(Some(self.codec.encode(&Value::String(repr.to_string()))?.body)),
            (None, Some(raw)) => Ok(Some(self.codec.encode(raw)?.body)),
            (None, None) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::persistence::{MemoryPersistence, SqlitePersistence};

    fn memory_backend(config: BackendConfig) -> ResultBackend {
        ResultBackend::new(Arc::new(MemoryPersistence::new()), config)
    }

    #[tokio::test]
    async fn test_store_and_read_back() {
        let backend = memory_backend(BackendConfig::default());

        let mut request = TaskRequest::new("t1");
        request.children = vec![ResultRef::task("child-1")];
        request
            .extra_meta
            .insert("tenant".to_string(), json!("acme"));

        backend
            .store_result(
                "t1",
                &Outcome::Value(json!({"total": 3})),
                TaskStatus::Success,
                None,
                Some(&request),
            )
            .await
            .unwrap();

        let meta = backend.get_task_meta("t1").await.unwrap();
        assert_eq!(meta.status, TaskStatus::Success);
        assert_eq!(meta.result, Some(Outcome::Value(json!({"total": 3}))));
        assert_eq!(meta.children, vec![ResultRef::task("child-1")]);
        assert_eq!(meta.extra.get("tenant"), Some(&json!("acme")));
        assert!(meta.date_done.is_some());
    }

    #[tokio::test]
    async fn test_unknown_task_is_pending() {
        let backend = memory_backend(BackendConfig::default());

        let meta = backend.get_task_meta("nope").await.unwrap();
        assert_eq!(meta.status, TaskStatus::Pending);
        assert!(meta.result.is_none());
        assert!(meta.date_done.is_none());
        assert_eq!(backend.get_status("nope").await.unwrap(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_failure_round_trips_as_error() {
        let backend = memory_backend(BackendConfig::default());
        let error = TaskError::new("KeyError", "'sku'").with_module("builtins");

        backend
            .mark_as_failure("t1", &error, Some("Traceback ..."), None)
            .await
            .unwrap();

        let meta = backend.get_task_meta("t1").await.unwrap();
        assert_eq!(meta.status, TaskStatus::Failure);
        assert_eq!(meta.result, Some(Outcome::Error(error)));
        assert_eq!(meta.traceback.as_deref(), Some("Traceback ..."));
    }

    #[tokio::test]
    async fn test_extended_result_prefers_repr() {
        let config = BackendConfig {
            extended_result: true,
            ..Default::default()
        };
        let backend = memory_backend(config);

        let mut request = TaskRequest::new("t1");
        request.task = Some("orders.sync".to_string());
        request.args = Some(json!(["secret-token", 5]));
        request.argsrepr = Some("('***', 5)".to_string());
        request.kwargs = Some(json!({"page": 2}));
        request.hostname = Some("worker-1".to_string());

        backend
            .mark_as_done("t1", json!(null), Some(&request))
            .await
            .unwrap();

        let meta = backend.get_task_meta("t1").await.unwrap();
        assert_eq!(meta.name.as_deref(), Some("orders.sync"));
        assert_eq!(meta.args, Some(json!("('***', 5)")));
        assert_eq!(meta.kwargs, Some(json!({"page": 2})));
        assert_eq!(meta.worker.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn test_extended_fields_skipped_by_default() {
        let backend = memory_backend(BackendConfig::default());

        let mut request = TaskRequest::new("t1");
        request.task = Some("orders.sync".to_string());
        request.args = Some(json!([1]));

        backend
            .mark_as_done("t1", json!(1), Some(&request))
            .await
            .unwrap();

        let meta = backend.get_task_meta("t1").await.unwrap();
        assert!(meta.name.is_none());
        assert!(meta.args.is_none());
    }

    #[tokio::test]
    async fn test_rejects_overlong_ids() {
        let config = BackendConfig {
            task_id_max_length: 8,
            ..Default::default()
        };
        let backend = memory_backend(config);

        let err = backend
            .mark_as_done("123456789", json!(1), None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let err = backend.save_group("", &[]).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        backend.mark_as_done("12345678", json!(1), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_id_limit_capped_at_column_width() {
        let config = BackendConfig {
            task_id_max_length: 10_000,
            ..Default::default()
        };
        let backend = memory_backend(config);

        let err = backend
            .mark_as_done(&"x".repeat(MAX_ID_LENGTH + 1), json!(1), None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        backend
            .mark_as_done(&"x".repeat(MAX_ID_LENGTH), json!(1), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_forget_is_idempotent() {
        let backend = memory_backend(BackendConfig::default());
        backend.mark_as_done("t1", json!(1), None).await.unwrap();

        backend.forget("t1").await.unwrap();
        backend.forget("t1").await.unwrap();

        assert_eq!(backend.get_status("t1").await.unwrap(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_group_round_trip_nested() {
        let backend = memory_backend(BackendConfig::default());
        let members = vec![
            ResultRef::task("t1"),
            ResultRef::group(
                "g-inner",
                vec![
                    ResultRef::task("t2"),
                    ResultRef::group("g-deep", vec![ResultRef::task("t3")]),
                ],
            ),
        ];

        backend.save_group("g1", &members).await.unwrap();
        let restored = backend.restore_group("g1", false).await.unwrap().unwrap();

        assert_eq!(restored.members, members);
        assert!(restored.resolved.is_none());
    }

    #[tokio::test]
    async fn test_restore_group_resolves_leaves() {
        let backend = memory_backend(BackendConfig::default());
        backend.mark_as_done("t1", json!("a"), None).await.unwrap();

        let members = vec![
            ResultRef::task("t1"),
            ResultRef::group("inner", vec![ResultRef::task("t2")]),
        ];
        backend.save_group("g1", &members).await.unwrap();

        let restored = backend.restore_group("g1", true).await.unwrap().unwrap();
        let resolved = restored.resolved.unwrap();
        let states: Vec<_> = resolved.iter().map(|m| (m.task_id.as_str(), m.status)).collect();
        assert_eq!(
            states,
            vec![("t1", TaskStatus::Success), ("t2", TaskStatus::Pending)]
        );
    }

    #[tokio::test]
    async fn test_delete_group_is_idempotent() {
        let backend = memory_backend(BackendConfig::default());
        backend.save_group("g1", &[ResultRef::task("t1")]).await.unwrap();

        backend.delete_group("g1").await.unwrap();
        backend.delete_group("g1").await.unwrap();

        assert!(backend.restore_group("g1", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let persistence = SqlitePersistence::in_memory().await.unwrap();
        let pool = persistence.pool().clone();
        let backend = ResultBackend::new(Arc::new(persistence), BackendConfig::default());

        backend.mark_as_done("old", json!(1), None).await.unwrap();
        backend.mark_as_done("recent", json!(2), None).await.unwrap();
        backend.save_group("g-old", &[ResultRef::task("old")]).await.unwrap();

        let ten_days_ago = Utc::now() - chrono::Duration::days(10);
        let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
        sqlx::query("UPDATE task_results SET date_done = ? WHERE task_id = 'old'")
            .bind(ten_days_ago)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE task_results SET date_done = ? WHERE task_id = 'recent'")
            .bind(an_hour_ago)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE group_results SET date_done = ? WHERE group_id = 'g-old'")
            .bind(ten_days_ago)
            .execute(&pool)
            .await
            .unwrap();

        let report = backend
            .cleanup(Some(Duration::from_secs(7 * 86_400)))
            .await
            .unwrap();

        assert_eq!(
            report,
            CleanupReport {
                task_results: 1,
                group_results: 1
            }
        );
        assert_eq!(backend.get_status("old").await.unwrap(), TaskStatus::Pending);
        assert_eq!(backend.get_status("recent").await.unwrap(), TaskStatus::Success);
    }

    struct Base64Json;

    impl Serializer for Base64Json {
        fn content_type(&self) -> &str {
            "application/x-json-bytes"
        }

        fn content_encoding(&self) -> &str {
            crate::codec::BINARY_ENCODING
        }

        fn dumps(&self, value: &Value) -> Result<Vec<u8>> {
            Ok(serde_json::to_vec(value)?)
        }

        fn loads(&self, data: &[u8]) -> Result<Value> {
            Ok(serde_json::from_slice(data)?)
        }
    }

    #[tokio::test]
    async fn test_binary_serializer_round_trip() {
        let backend = memory_backend(BackendConfig::default()).with_serializer(Arc::new(Base64Json));

        let record = backend.mark_as_done("t1", json!({"ok": true}), None).await.unwrap();
        assert_eq!(record.content_encoding, "binary");
        assert_ne!(record.result.as_deref(), Some(r#"{"ok":true}"#));

        let meta = backend.get_task_meta("t1").await.unwrap();
        assert_eq!(meta.result, Some(Outcome::Value(json!({"ok": true}))));
    }

    #[tokio::test]
    async fn test_extended_args_share_one_encoding() {
        let config = BackendConfig {
            extended_result: true,
            ..Default::default()
        };
        let backend = memory_backend(config).with_serializer(Arc::new(Base64Json));

        let mut redacted = TaskRequest::new("t1");
        redacted.args = Some(json!(["secret-token", 5]));
        redacted.argsrepr = Some("('***', 5)".to_string());
        let mut plain = TaskRequest::new("t2");
        plain.args = Some(json!(["secret-token", 5]));
        plain.kwargs = Some(json!({"page": 2}));

        let stored_repr = backend
            .mark_as_done("t1", json!(null), Some(&redacted))
            .await
            .unwrap();
        let stored_raw = backend
            .mark_as_done("t2", json!(null), Some(&plain))
            .await
            .unwrap();

        let codec = ContentCodec::new(Arc::new(Base64Json));
        assert_eq!(
            codec
                .decode_opt(&stored_repr.content_encoding, stored_repr.task_args.as_deref())
                .unwrap(),
            Some(json!("('***', 5)"))
        );
        assert_eq!(
            codec
                .decode_opt(&stored_raw.content_encoding, stored_raw.task_args.as_deref())
                .unwrap(),
            Some(json!(["secret-token", 5]))
        );

        let meta = backend.get_task_meta("t1").await.unwrap();
        assert_eq!(meta.args, Some(json!("('***', 5)")));
        assert!(meta.kwargs.is_none());
        let meta = backend.get_task_meta("t2").await.unwrap();
        assert_eq!(meta.args, Some(json!(["secret-token", 5])));
        assert_eq!(meta.kwargs, Some(json!({"page": 2})));
    }

    #[tokio::test]
    async fn test_cleanup_disabled_without_expiry() {
        let config = BackendConfig {
            expires: None,
            ..Default::default()
        };
        let backend = memory_backend(config);
        backend.mark_as_done("t1", json!(1), None).await.unwrap();

        let report = backend.cleanup(None).await.unwrap();
        assert_eq!(report.total(), 0);
    }
}
