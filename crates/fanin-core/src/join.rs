// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waiting for a set of results to become ready.
//!
//! A chord's callback receives the values of its header tasks shaped like
//! the header itself: a task becomes its return value, a group becomes an
//! array of its members' values.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::backend::ResultBackend;
use crate::codec::{Outcome, TaskError};
use crate::error::CoreError;
use crate::refs::ResultRef;
use crate::status::TaskStatus;

/// Why a join did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// A member ended in FAILURE or REVOKED.
    #[error("Dependency {task_id} raised {error}")]
    TaskFailed {
        /// The first failed member, in header order.
        task_id: String,
        /// The error it recorded.
        error: TaskError,
    },

    /// Members were still outstanding when the timeout expired.
    #[error("timed out after {timeout:?} waiting for {pending} of {total} results")]
    Timeout {
        /// The timeout that expired.
        timeout: Duration,
        /// Members not yet ready.
        pending: usize,
        /// Members joined.
        total: usize,
    },

    /// Results could not be read.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

impl JoinError {
    /// The member responsible for the failure, when one can be named.
    pub fn culprit(&self) -> Option<&str> {
        match self {
            JoinError::TaskFailed { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// Resolves references to their values.
#[async_trait]
pub trait Joiner: Send + Sync {
    /// Wait up to `timeout` for every member of `members` to succeed and
    /// return their values as an array shaped like `members`.
    async fn join(
        &self,
        backend: &ResultBackend,
        members: &[ResultRef],
        timeout: Duration,
    ) -> Result<Value, JoinError>;
}

/// Joins by polling the result store.
#[derive(Debug, Clone)]
pub struct StoreJoiner {
    poll_interval: Duration,
}

impl StoreJoiner {
    /// Poll every `poll_interval` until ready or timed out.
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

#[async_trait]
impl Joiner for StoreJoiner {
    async fn join(
        &self,
        backend: &ResultBackend,
        members: &[ResultRef],
        timeout: Duration,
    ) -> Result<Value, JoinError> {
        let deadline = Instant::now() + timeout;
        let leaves: Vec<&str> = members.iter().flat_map(ResultRef::leaf_task_ids).collect();

        loop {
            let mut values: HashMap<&str, Value> = HashMap::with_capacity(leaves.len());
            let mut pending = 0;

            for &task_id in &leaves {
                let meta = backend.get_task_meta(task_id).await?;
                if meta.status.is_propagating() {
                    let error = match meta.result {
                        Some(Outcome::Error(error)) => error,
                        _ => TaskError::new(meta.status.as_str(), "no error recorded"),
                    };
                    return Err(JoinError::TaskFailed {
                        task_id: task_id.to_string(),
                        error,
                    });
                }
                if meta.status == TaskStatus::Success {
                    let value = match meta.result {
                        Some(Outcome::Value(value)) => value,
                        _ => Value::Null,
                    };
                    values.insert(task_id, value);
                } else {
                    pending += 1;
                }
            }

            if pending == 0 {
                return Ok(Value::Array(
                    members.iter().map(|member| shape(member, &values)).collect(),
                ));
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(JoinError::Timeout {
                    timeout,
                    pending,
                    total: leaves.len(),
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

fn shape(member: &ResultRef, values: &HashMap<&str, Value>) -> Value {
    match member {
        ResultRef::Task(task) => values.get(task.id.as_str()).cloned().unwrap_or(Value::Null),
        ResultRef::Group(group) => Value::Array(
            group
                .members
                .iter()
                .map(|member| shape(member, values))
                .collect(),
        ),
    }
}
