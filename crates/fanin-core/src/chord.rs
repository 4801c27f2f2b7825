// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chord (fan-in) completion tracking.
//!
//! [`ResultBackend::apply_chord`] creates a counter holding the number of
//! header tasks. Every header task that reaches a ready state decrements
//! it; the decrement that reaches zero deletes the counter in the same
//! transaction and then, outside of it, joins the header results and runs
//! the callback.
//!
//! ```text
//! ABSENT --apply_chord--> ACTIVE(N) --part--> ... --part--> ACTIVE(1) --part--> ABSENT
//!                                                                      |
//!                                                                      +--> join + callback
//! ```
//!
//! A decrement arriving for an absent counter (already consumed, or never
//! created) is logged and ignored. Failures of the join or the callback are
//! recorded as a FAILURE result on the callback's task id and never
//! returned to the caller.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::backend::{ResultBackend, TaskRequest};
use crate::codec::{Outcome, TaskError};
use crate::error::{CoreError, Result};
use crate::persistence::ChordDecrement;
use crate::refs::{GroupRef, ResultRef, members_from_json, members_to_json};
use crate::status::TaskStatus;

/// Error type recorded on the callback when a chord cannot complete.
pub const CHORD_ERROR: &str = "ChordError";

/// A task invocation that can be sent for execution.
#[async_trait]
pub trait Signature: Send + Sync {
    /// Task id the invocation will run under.
    fn task_id(&self) -> &str;

    /// Send the invocation with `value` as its argument.
    async fn invoke_async(&self, value: Value) -> anyhow::Result<()>;
}

/// Header of a chord: the group whose completion triggers the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChordHeader {
    /// Group identifier the counter is keyed by.
    pub group_id: String,
    /// Header members in dispatch order.
    pub members: Vec<ResultRef>,
}

impl From<GroupRef> for ChordHeader {
    fn from(group: GroupRef) -> Self {
        Self {
            group_id: group.id,
            members: group.members,
        }
    }
}

impl From<(String, Vec<ResultRef>)> for ChordHeader {
    fn from((group_id, members): (String, Vec<ResultRef>)) -> Self {
        Self { group_id, members }
    }
}

impl From<(&str, Vec<ResultRef>)> for ChordHeader {
    fn from((group_id, members): (&str, Vec<ResultRef>)) -> Self {
        Self {
            group_id: group_id.to_string(),
            members,
        }
    }
}

impl ResultBackend {
    /// Start tracking a chord header.
    ///
    /// The counter starts at `chord_size` when given (header tasks may have
    /// been merged before dispatch), otherwise at the number of members.
    pub async fn apply_chord(
        &self,
        header: impl Into<ChordHeader>,
        chord_size: Option<usize>,
    ) -> Result<()> {
        let header = header.into();
        self.validate_id("group_id", &header.group_id)?;

        let count = chord_size.unwrap_or(header.members.len());
        if count == 0 {
            return Err(CoreError::validation(
                "chord_size",
                "a chord needs at least one header task",
            ));
        }
        let count = i64::try_from(count)
            .map_err(|_| CoreError::validation("chord_size", "too large"))?;

        let sub_tasks = members_to_json(&header.members)?;
        self.persistence
            .create_chord_counter(&header.group_id, &sub_tasks, count)
            .await?;

        debug!(group_id = %header.group_id, count, "Created chord counter");
        Ok(())
    }

    /// Count a ready header task towards its chord.
    ///
    /// Does nothing unless the request names both a group and a chord
    /// callback and `status` is a ready state.
    pub async fn on_chord_part_return(
        &self,
        request: &TaskRequest,
        status: TaskStatus,
        outcome: &Outcome,
    ) -> Result<()> {
        if !status.is_ready() {
            return Ok(());
        }
        let (Some(group_id), Some(callback)) = (request.group.as_deref(), request.chord.as_deref())
        else {
            return Ok(());
        };
        if let Some(err) = outcome.error() {
            debug!(task_id = %request.id, group_id = %group_id, error = %err, "Chord header task failed");
        }
        self.on_part_return(&request.id, group_id, callback).await
    }

    /// Decrement the counter of `group_id` for `task_id`, running the
    /// callback if this was the last outstanding header task.
    ///
    /// A callback id that could not hold a result is rejected before the
    /// counter is touched.
    pub async fn on_part_return(
        &self,
        task_id: &str,
        group_id: &str,
        callback: &dyn Signature,
    ) -> Result<()> {
        if task_id.is_empty() || group_id.is_empty() {
            return Ok(());
        }
        self.validate_id("callback", callback.task_id())?;

        match self.persistence.decrement_chord_counter(group_id).await? {
            ChordDecrement::Missing => {
                warn!(
                    task_id = %task_id,
                    group_id = %group_id,
                    "Chord counter not found, already completed or never created"
                );
                Ok(())
            }
            ChordDecrement::Remaining(remaining) => {
                debug!(task_id = %task_id, group_id = %group_id, remaining, "Chord part returned");
                Ok(())
            }
            ChordDecrement::Completed(counter) => {
                debug!(task_id = %task_id, group_id = %group_id, "Chord header complete");
                match members_from_json(&counter.sub_tasks) {
                    Ok(members) => self.trigger_callback(group_id, callback, &members).await,
                    Err(err) => self.chord_error(group_id, callback, err.to_string()).await,
                }
            }
        }
    }

    /// Join the header results and run the callback with them.
    ///
    /// When the join fails the callback is not run; when the callback fails
    /// its error is recorded. Either way the callback's task id ends in
    /// FAILURE and `Ok` is returned.
    pub async fn trigger_callback(
        &self,
        group_id: &str,
        callback: &dyn Signature,
        members: &[ResultRef],
    ) -> Result<()> {
        let joined = self
            .joiner
            .join(self, members, self.config.join_timeout)
            .await;

        match joined {
            Ok(value) => {
                if let Err(err) = callback.invoke_async(value).await {
                    let reason = format!("Callback error: {err:#}");
                    return self.chord_error(group_id, callback, reason).await;
                }
                debug!(group_id = %group_id, callback = %callback.task_id(), "Chord callback sent");
                Ok(())
            }
            Err(err) => {
                if let Some(culprit) = err.culprit() {
                    debug!(group_id = %group_id, culprit = %culprit, "Chord dependency failed");
                }
                self.chord_error(group_id, callback, err.to_string()).await
            }
        }
    }

    async fn chord_error(
        &self,
        group_id: &str,
        callback: &dyn Signature,
        reason: String,
    ) -> Result<()> {
        error!(
            group_id = %group_id,
            callback = %callback.task_id(),
            reason = %reason,
            "Chord failed"
        );
        let error = TaskError::new(CHORD_ERROR, reason);
        self.store_result(
            callback.task_id(),
            &Outcome::Error(error),
            TaskStatus::Failure,
            None,
            None,
        )
        .await?;
        Ok(())
    }
}
