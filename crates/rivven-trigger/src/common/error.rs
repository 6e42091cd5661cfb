//! Error types for trigger operations
//!
//! Includes error classification so the scheduler can decide between
//! absorbing a failure (retry with backoff) and surfacing it to the host.
//!
//! Lease contention is deliberately absent from this taxonomy: a denied
//! claim is an expected outcome reported through
//! [`ClaimResult::Denied`](crate::common::ClaimResult), never an error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Change log or lease store could not be reached
    Source,
    /// Table shape or change tracking problems
    Schema,
    /// Configuration errors (invalid settings)
    Configuration,
    /// Errors raised by the registered handler
    Handler,
    /// Serialization errors (JSON, YAML)
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Trigger-specific errors
#[derive(Error, Debug)]
pub enum TriggerError {
    /// The change log or lease store is unreachable. Always retried.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// The table has no change log. Fatal at startup.
    #[error("Change tracking not enabled: {0}")]
    TrackingNotEnabled(String),

    /// The table lacks a primary key or collides with reserved columns.
    #[error("Schema incompatible: {0}")]
    SchemaIncompatible(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Handler failure
    #[error("Handler failed (retryable: {retryable}): {message}")]
    Handler { retryable: bool, message: String },

    /// The partition stopped advancing on a poison batch
    #[error("Partition {partition} stalled: {message}")]
    PartitionStalled { partition: String, message: String },

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl TriggerError {
    /// Create a source unavailable error
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    /// Create a tracking not enabled error
    pub fn tracking_not_enabled(msg: impl Into<String>) -> Self {
        Self::TrackingNotEnabled(msg.into())
    }

    /// Create a schema incompatible error
    pub fn schema_incompatible(msg: impl Into<String>) -> Self {
        Self::SchemaIncompatible(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a handler error
    pub fn handler(retryable: bool, msg: impl Into<String>) -> Self {
        Self::Handler {
            retryable,
            message: msg.into(),
        }
    }

    /// Create a stalled partition error
    pub fn partition_stalled(partition: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PartitionStalled {
            partition: partition.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a new serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors that may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::SourceUnavailable(_) => true,
            Self::Timeout(_) => true,
            Self::Handler { retryable, .. } => *retryable,

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::TrackingNotEnabled(_)
            | Self::SchemaIncompatible(_)
            | Self::Config(_)
            | Self::PartitionStalled { .. }
            | Self::InvalidState(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::Other(_) => false,
        }
    }

    /// Check if this error must halt the partition's scheduler.
    ///
    /// Fatal errors are surfaced to the host; everything else is absorbed
    /// inside the polling loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::TrackingNotEnabled(_)
                | Self::SchemaIncompatible(_)
                | Self::Config(_)
                | Self::PartitionStalled { .. }
                | Self::InvalidState(_)
        )
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SourceUnavailable(_) => ErrorCategory::Source,
            Self::Timeout(_) => ErrorCategory::Source,
            Self::Io(_) => ErrorCategory::Source,
            Self::TrackingNotEnabled(_) => ErrorCategory::Schema,
            Self::SchemaIncompatible(_) => ErrorCategory::Schema,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Handler { .. } => ErrorCategory::Handler,
            Self::PartitionStalled { .. } => ErrorCategory::Handler,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::InvalidState(_) => ErrorCategory::Other,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::TrackingNotEnabled(_) => "tracking_not_enabled",
            Self::SchemaIncompatible(_) => "schema_incompatible",
            Self::Config(_) => "config_error",
            Self::Handler { .. } => "handler_failure",
            Self::PartitionStalled { .. } => "partition_stalled",
            Self::InvalidState(_) => "invalid_state",
            Self::Serialization(_) => "serialization_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Timeout(_) => "timeout",
            Self::Other(_) => "unknown",
        }
    }
}

impl From<serde_yaml::Error> for TriggerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for trigger operations
pub type Result<T> = std::result::Result<T, TriggerError>;
