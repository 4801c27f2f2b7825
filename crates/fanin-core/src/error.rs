// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fanin-core.
//!
//! Every storage and backend operation returns [`CoreError`]. Transient
//! database failures are distinguished from permanent ones so the write
//! paths can retry them (see [`crate::retry`]).

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while storing or reading results.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed in a way that may succeed on a fresh connection.
    TransientDatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A payload could not be encoded or decoded.
    SerializationError {
        /// Error details.
        details: String,
    },

    /// A stored task/group reference tree is malformed.
    InvalidReference {
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::TransientDatabaseError { .. } => "TRANSIENT_DATABASE_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::SerializationError { .. } => "SERIALIZATION_ERROR",
            Self::InvalidReference { .. } => "INVALID_REFERENCE",
        }
    }

    /// Whether retrying the operation on a new connection may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientDatabaseError { .. })
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::TransientDatabaseError { operation, details } => {
                write!(
                    f,
                    "Transient database error during '{}': {}",
                    operation, details
                )
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::SerializationError { details } => {
                write!(f, "Serialization error: {}", details)
            }
            Self::InvalidReference { details } => {
                write!(f, "Invalid result reference: {}", details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

/// SQLSTATE / SQLite result codes that indicate a retryable condition.
///
/// Postgres: `40001` serialization failure, `40P01` deadlock, `57P01` admin
/// shutdown. SQLite (extended codes): the SQLITE_BUSY and SQLITE_LOCKED family.
const TRANSIENT_DB_CODES: &[&str] = &[
    "40001", "40P01", "57P01", "5", "261", "517", "773", "6", "262",
];

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => db
                .code()
                .is_some_and(|code| TRANSIENT_DB_CODES.contains(&code.as_ref())),
            _ => false,
        };

        if transient {
            CoreError::TransientDatabaseError {
                operation: "query".to_string(),
                details: err.to_string(),
            }
        } else {
            CoreError::DatabaseError {
                operation: "query".to_string(),
                details: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError {
            details: err.to_string(),
        }
    }
}
