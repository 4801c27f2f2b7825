// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory, cache-style persistence.
//!
//! Entries optionally expire after a fixed TTL measured from their last
//! write, like a cache would evict them: reads skip them and every write
//! removes them. Chord counters never expire.
//! Everything lives in this process: counters are only consistent when
//! all task completions are reported through the same instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::CoreError;
use crate::status::TaskStatus;

use super::{
    ChordCounterRecord, ChordDecrement, CounterLocking, GroupResultRecord, NewGroupResult,
    NewTaskResult, Persistence, TaskResultRecord,
};

/// In-memory storage state.
#[derive(Default)]
struct MemoryState {
    tasks: HashMap<String, TaskResultRecord>,
    groups: HashMap<String, GroupResultRecord>,
    counters: HashMap<String, ChordCounterRecord>,
}

/// Process-local persistence with optional expiry.
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    state: Arc<Mutex<MemoryState>>,
    ttl: Option<Duration>,
}

impl MemoryPersistence {
    /// Entries are kept until deleted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries disappear `ttl` after their last write.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            state: Arc::default(),
            ttl: Some(ttl),
        }
    }

    fn is_live(&self, date_done: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match (self.ttl, date_done) {
            (Some(ttl), Some(done)) => chrono::Duration::from_std(ttl)
                .map(|ttl| done + ttl > now)
                .unwrap_or(true),
            _ => true,
        }
    }

    /// Drop every expired entry.
    fn evict_expired(&self, state: &mut MemoryState, now: DateTime<Utc>) {
        if self.ttl.is_none() {
            return;
        }
        state
            .tasks
            .retain(|_, record| self.is_live(record.date_done, now));
        state
            .groups
            .retain(|_, record| self.is_live(Some(record.date_done), now));
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn store_task_result(
        &self,
        result: &NewTaskResult,
    ) -> Result<TaskResultRecord, CoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        self.evict_expired(&mut state, now);

        let (date_created, previous_started) = match state.tasks.get(&result.task_id) {
            Some(existing) => (existing.date_created, existing.date_started),
            None => (Some(now), None),
        };
        let date_started = previous_started
            .or_else(|| (result.status == TaskStatus::Started).then_some(now));

        let record = TaskResultRecord {
            task_id: result.task_id.clone(),
            status: result.status.as_str().to_string(),
            content_type: result.content_type.clone(),
            content_encoding: result.content_encoding.clone(),
            result: result.result.clone(),
            traceback: result.traceback.clone(),
            meta: result.meta.clone(),
            task_name: result.task_name.clone(),
            task_args: result.task_args.clone(),
            task_kwargs: result.task_kwargs.clone(),
            worker: result.worker.clone(),
            periodic_task_name: result.periodic_task_name.clone(),
            date_created,
            date_started,
            date_done: Some(now),
        };
        state.tasks.insert(record.task_id.clone(), record.clone());

        Ok(record)
    }

    async fn get_task_result(
        &self,
        task_id: &str,
    ) -> Result<Option<TaskResultRecord>, CoreError> {
        let now = Utc::now();
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .get(task_id)
            .filter(|record| self.is_live(record.date_done, now))
            .cloned())
    }

    async fn delete_task_result(&self, task_id: &str) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        Ok(state.tasks.remove(task_id).is_some())
    }

    async fn delete_expired_task_results(
        &self,
        cutoff: DateTime<Utc>,
        _batch_size: i64,
    ) -> Result<u64, CoreError> {
        let mut state = self.state.lock().await;
        let before = state.tasks.len();
        state
            .tasks
            .retain(|_, record| record.date_done.is_none_or(|done| done >= cutoff));
        Ok((before - state.tasks.len()) as u64)
    }

    async fn store_group_result(
        &self,
        group: &NewGroupResult,
    ) -> Result<GroupResultRecord, CoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        self.evict_expired(&mut state, now);

        let date_created = state
            .groups
            .get(&group.group_id)
            .map_or(now, |existing| existing.date_created);

        let record = GroupResultRecord {
            group_id: group.group_id.clone(),
            content_type: group.content_type.clone(),
            content_encoding: group.content_encoding.clone(),
            result: Some(group.result.clone()),
            date_created,
            date_done: now,
        };
        state.groups.insert(record.group_id.clone(), record.clone());

        Ok(record)
    }

    async fn get_group_result(
        &self,
        group_id: &str,
    ) -> Result<Option<GroupResultRecord>, CoreError> {
        let now = Utc::now();
        let state = self.state.lock().await;
        Ok(state
            .groups
            .get(group_id)
            .filter(|record| self.is_live(Some(record.date_done), now))
            .cloned())
    }

    async fn delete_group_result(&self, group_id: &str) -> Result<bool, CoreError> {
        let mut state = self.state.lock().await;
        Ok(state.groups.remove(group_id).is_some())
    }

    async fn delete_expired_group_results(
        &self,
        cutoff: DateTime<Utc>,
        _batch_size: i64,
    ) -> Result<u64, CoreError> {
        let mut state = self.state.lock().await;
        let before = state.groups.len();
        state.groups.retain(|_, record| record.date_done >= cutoff);
        Ok((before - state.groups.len()) as u64)
    }

    async fn create_chord_counter(
        &self,
        group_id: &str,
        sub_tasks: &str,
        count: i64,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if state.counters.contains_key(group_id) {
            return Err(CoreError::DatabaseError {
                operation: "create_chord_counter".to_string(),
                details: format!("chord counter for group '{}' already exists", group_id),
            });
        }
        state.counters.insert(
            group_id.to_string(),
            ChordCounterRecord {
                group_id: group_id.to_string(),
                sub_tasks: sub_tasks.to_string(),
                count,
            },
        );
        Ok(())
    }

    async fn get_chord_counter(
        &self,
        group_id: &str,
    ) -> Result<Option<ChordCounterRecord>, CoreError> {
        let state = self.state.lock().await;
        Ok(state.counters.get(group_id).cloned())
    }

    async fn decrement_chord_counter(&self, group_id: &str) -> Result<ChordDecrement, CoreError> {
        let mut state = self.state.lock().await;

        let Some(counter) = state.counters.get_mut(group_id) else {
            return Ok(ChordDecrement::Missing);
        };
        counter.count = (counter.count - 1).max(0);

        if counter.count > 0 {
            return Ok(ChordDecrement::Remaining(counter.count));
        }

        Ok(state
            .counters
            .remove(group_id)
            .map_or(ChordDecrement::Missing, ChordDecrement::Completed))
    }

    fn counter_locking(&self) -> CounterLocking {
        CounterLocking::ProcessLocal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_result(task_id: &str, status: TaskStatus) -> NewTaskResult {
        NewTaskResult {
            task_id: task_id.to_string(),
            status,
            content_type: "application/json".to_string(),
            content_encoding: "utf-8".to_string(),
            result: Some("null".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_preserves_creation_time() {
        let persistence = MemoryPersistence::new();

        let first = persistence
            .store_task_result(&new_result("t1", TaskStatus::Started))
            .await
            .unwrap();
        let second = persistence
            .store_task_result(&new_result("t1", TaskStatus::Success))
            .await
            .unwrap();

        assert_eq!(second.date_created, first.date_created);
        assert_eq!(second.date_started, first.date_started);
        assert!(second.date_done >= first.date_done);
        assert_eq!(second.status, "SUCCESS");
    }

    #[tokio::test]
    async fn test_ttl_hides_stale_entries() {
        let persistence = MemoryPersistence::with_ttl(Duration::from_millis(1));
        persistence
            .store_task_result(&new_result("t1", TaskStatus::Success))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(persistence.get_task_result("t1").await.unwrap().is_none());
        assert_eq!(
            persistence.fetch_task_result("t1").await.unwrap().status,
            "PENDING"
        );
    }

    #[tokio::test]
    async fn test_writes_evict_expired_entries() {
        let persistence = MemoryPersistence::with_ttl(Duration::from_millis(5));
        persistence
            .store_task_result(&new_result("t1", TaskStatus::Success))
            .await
            .unwrap();
        persistence
            .store_group_result(&NewGroupResult {
                group_id: "g1".to_string(),
                content_type: "application/json".to_string(),
                content_encoding: "utf-8".to_string(),
                result: "[]".to_string(),
            })
            .await
            .unwrap();
        persistence.create_chord_counter("g2", "[]", 2).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        persistence
            .store_task_result(&new_result("t2", TaskStatus::Success))
            .await
            .unwrap();

        let state = persistence.state.lock().await;
        assert!(!state.tasks.contains_key("t1"));
        assert!(state.tasks.contains_key("t2"));
        assert!(state.groups.is_empty());
        assert!(state.counters.contains_key("g2"));
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let persistence = MemoryPersistence::new();
        persistence
            .store_task_result(&new_result("t1", TaskStatus::Success))
            .await
            .unwrap();

        let deleted = persistence
            .delete_expired_task_results(Utc::now() - chrono::Duration::days(1), 100)
            .await
            .unwrap();
        assert_eq!(deleted, 0);

        let deleted = persistence
            .delete_expired_task_results(Utc::now() + chrono::Duration::seconds(1), 100)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn test_concurrent_decrements_complete_once() {
        let persistence = MemoryPersistence::new();
        persistence.create_chord_counter("g1", "[]", 16).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let persistence = persistence.clone();
                tokio::spawn(async move { persistence.decrement_chord_counter("g1").await })
            })
            .collect();

        let mut completed = 0;
        for handle in handles {
            if let ChordDecrement::Completed(_) = handle.await.unwrap().unwrap() {
                completed += 1;
            }
        }

        assert_eq!(completed, 1);
        assert!(persistence.get_chord_counter("g1").await.unwrap().is_none());
        assert_eq!(persistence.counter_locking(), CounterLocking::ProcessLocal);
    }
}
