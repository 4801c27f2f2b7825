// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payload encoding for stored results.
//!
//! The wire format itself is pluggable through [`Serializer`]. Serializers
//! that produce binary output declare the `binary` content encoding, and
//! their output is base64 wrapped so it fits the text columns.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Content encoding whose payloads are base64 wrapped before storage.
pub const BINARY_ENCODING: &str = "binary";

/// Converts result values to bytes and back.
pub trait Serializer: Send + Sync {
    /// MIME type written to the `content_type` column.
    fn content_type(&self) -> &str;

    /// Written to the `content_encoding` column.
    fn content_encoding(&self) -> &str;

    /// Encode a value.
    fn dumps(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode bytes produced by [`Serializer::dumps`].
    fn loads(&self, data: &[u8]) -> Result<Value>;
}

/// JSON text serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn content_encoding(&self) -> &str {
        "utf-8"
    }

    fn dumps(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads(&self, data: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Encoded payload ready for a text column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Serializer MIME type.
    pub content_type: String,
    /// Serializer encoding.
    pub content_encoding: String,
    /// Serialized value, base64 wrapped for binary encodings.
    pub body: String,
}

/// Applies a [`Serializer`] plus the binary wrapping policy.
#[derive(Clone)]
pub struct ContentCodec {
    serializer: Arc<dyn Serializer>,
}

impl fmt::Debug for ContentCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCodec")
            .field("content_type", &self.serializer.content_type())
            .field("content_encoding", &self.serializer.content_encoding())
            .finish()
    }
}

impl Default for ContentCodec {
    fn default() -> Self {
        Self::new(Arc::new(JsonSerializer))
    }
}

impl ContentCodec {
    /// Wrap a serializer.
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self { serializer }
    }

    /// MIME type of newly encoded payloads.
    pub fn content_type(&self) -> &str {
        self.serializer.content_type()
    }

    /// Encoding of newly encoded payloads.
    pub fn content_encoding(&self) -> &str {
        self.serializer.content_encoding()
    }

    /// Serialize `value` into a storable body.
    pub fn encode(&self, value: &Value) -> Result<Encoded> {
        let bytes = self.serializer.dumps(value)?;
        let content_encoding = self.serializer.content_encoding().to_string();
        let body = if content_encoding == BINARY_ENCODING {
            STANDARD.encode(bytes)
        } else {
            String::from_utf8(bytes).map_err(|e| CoreError::SerializationError {
                details: format!("serializer produced non-text output for '{content_encoding}': {e}"),
            })?
        };

        Ok(Encoded {
            content_type: self.serializer.content_type().to_string(),
            content_encoding,
            body,
        })
    }

    /// Decode a stored body, honouring the encoding recorded with it.
    pub fn decode(&self, content_encoding: &str, body: &str) -> Result<Value> {
        if content_encoding == BINARY_ENCODING {
            let bytes = STANDARD
                .decode(body)
                .map_err(|e| CoreError::SerializationError {
                    details: format!("invalid base64 payload: {e}"),
                })?;
            self.serializer.loads(&bytes)
        } else {
            self.serializer.loads(body.as_bytes())
        }
    }

    /// Decode an optional column, treating empty bodies as absent.
    pub fn decode_opt(&self, content_encoding: &str, body: Option<&str>) -> Result<Option<Value>> {
        match body {
            Some(body) if !body.is_empty() => self.decode(content_encoding, body).map(Some),
            _ => Ok(None),
        }
    }
}

/// Error raised by a task, as stored in its result payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Error type name.
    pub exc_type: String,
    /// Human-readable message.
    pub exc_message: String,
    /// Module or crate the error type belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_module: Option<String>,
}

impl TaskError {
    /// Error of type `exc_type` with `message`.
    pub fn new(exc_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exc_type: exc_type.into(),
            exc_message: message.into(),
            exc_module: None,
        }
    }

    /// Set the originating module.
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.exc_module = Some(module.into());
        self
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exc_type, self.exc_message)
    }
}

impl std::error::Error for TaskError {}

/// What a task produced: a return value or an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Successful return value.
    Value(Value),
    /// Error raised by the task.
    Error(TaskError),
}

impl Outcome {
    /// Value form written to the payload column.
    pub fn to_value(&self) -> Result<Value> {
        match self {
            Outcome::Value(value) => Ok(value.clone()),
            Outcome::Error(error) => Ok(serde_json::to_value(error)?),
        }
    }

    /// Interpret a decoded payload for a row in `is_exception` state.
    pub fn from_value(value: Value, is_exception: bool) -> Self {
        if !is_exception {
            return Outcome::Value(value);
        }
        match serde_json::from_value::<TaskError>(value.clone()) {
            Ok(error) => Outcome::Error(error),
            Err(_) => Outcome::Error(TaskError::new("Exception", value.to_string())),
        }
    }

    /// The return value, if successful.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Outcome::Value(value) => Some(value),
            Outcome::Error(_) => None,
        }
    }

    /// The error, if failed.
    pub fn error(&self) -> Option<&TaskError> {
        match self {
            Outcome::Value(_) => None,
            Outcome::Error(error) => Some(error),
        }
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Value(value)
    }
}

impl From<TaskError> for Outcome {
    fn from(error: TaskError) -> Self {
        Outcome::Error(error)
    }
}
