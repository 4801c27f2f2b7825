// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task states as persisted in the `status` column.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// State of a single task execution.
///
/// Transitions are not enforced: the last write wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Unknown or not yet reported.
    #[default]
    Pending,
    /// Received by a worker.
    Received,
    /// Execution started.
    Started,
    /// Failed and scheduled for retry.
    Retry,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failure,
    /// Revoked before or during execution.
    Revoked,
}

impl TaskStatus {
    /// All states, in declaration order.
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Received,
        TaskStatus::Started,
        TaskStatus::Retry,
        TaskStatus::Success,
        TaskStatus::Failure,
        TaskStatus::Revoked,
    ];

    /// Column representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Received => "RECEIVED",
            TaskStatus::Started => "STARTED",
            TaskStatus::Retry => "RETRY",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Revoked => "REVOKED",
        }
    }

    /// The task will not change state again.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked
        )
    }

    /// The stored result is an error rather than a return value.
    pub fn is_exception(&self) -> bool {
        matches!(
            self,
            TaskStatus::Retry | TaskStatus::Failure | TaskStatus::Revoked
        )
    }

    /// Ready and unsuccessful.
    pub fn is_propagating(&self) -> bool {
        matches!(self, TaskStatus::Failure | TaskStatus::Revoked)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::validation("status", format!("unknown task status '{s}'")))
    }
}
