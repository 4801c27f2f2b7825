// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded retry for storage writes.

use std::future::Future;

use tracing::debug;

/// How many times a failed write is attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 disables retrying).
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Policy that never retries.
    pub const NONE: RetryPolicy = RetryPolicy { max_retries: 0 };

    /// Create a policy allowing `max_retries` additional attempts.
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

/// Run `op` until it succeeds, fails with an error `is_retryable` rejects,
/// or the policy's retries are used up.
///
/// The error from the last attempt is returned unchanged.
pub async fn with_retry<T, E, F, Fut, C>(
    policy: RetryPolicy,
    is_retryable: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut retries = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if retries < policy.max_retries && is_retryable(&err) => {
                retries += 1;
                debug!(
                    attempt = retries,
                    max_retries = policy.max_retries,
                    error = %err,
                    "Retrying storage operation"
                );
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> CoreError {
        CoreError::TransientDatabaseError {
            operation: "store".to_string(),
            details: "connection reset".to_string(),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let result = with_retry(RetryPolicy::new(2), CoreError::is_transient, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient())
            } else {
                Ok("stored")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "stored");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), CoreError> =
            with_retry(RetryPolicy::new(1), CoreError::is_transient, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), CoreError> =
            with_retry(RetryPolicy::default(), CoreError::is_transient, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::validation("task_id", "empty"))
            })
            .await;

        assert_eq!(result.unwrap_err().error_code(), "VALIDATION_ERROR");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_policy() {
        let calls = &AtomicU32::new(0);
        let _: Result<(), CoreError> =
            with_retry(RetryPolicy::NONE, CoreError::is_transient, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
