//! SQL Server backend error types

use crate::common::TriggerError;
use thiserror::Error;

/// Server error numbers the backend reacts to
pub mod codes {
    /// Invalid object name
    pub const INVALID_OBJECT: u32 = 208;
    /// Deadlock victim
    pub const DEADLOCK_VICTIM: u32 = 1205;
    /// Unique index violation
    pub const DUPLICATE_KEY_INDEX: u32 = 2601;
    /// Primary key violation
    pub const DUPLICATE_KEY_CONSTRAINT: u32 = 2627;
    /// Change tracking is not enabled on the table
    pub const TRACKING_NOT_ENABLED: u32 = 4998;
    /// Change tracking is not enabled on the table (CHANGETABLE)
    pub const TRACKING_NOT_ENABLED_CHANGETABLE: u32 = 22105;
    /// Login failed
    pub const LOGIN_FAILED: u32 = 18456;
}

/// SQL Server-specific errors
#[derive(Error, Debug)]
pub enum SqlServerError {
    /// TDS protocol or value conversion error
    #[error("TDS protocol error: {0}")]
    Tds(String),

    /// Authentication failure
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Network failure or dropped connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Change tracking disabled on the database or table
    #[error("Change tracking not enabled: {0}. Run: ALTER TABLE <table> ENABLE CHANGE_TRACKING")]
    TrackingNotEnabled(String),

    /// Referenced table does not exist
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Primary key or unique index violation
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Chosen as deadlock victim
    #[error("Deadlock: {0}")]
    Deadlock(String),

    /// Any other server error
    #[error("Query failed ({code}): {message}")]
    QueryFailed { code: u32, message: String },
}

impl SqlServerError {
    /// The connection is unusable and must be reopened.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Tds(_))
    }
}

impl From<tiberius::error::Error> for SqlServerError {
    fn from(err: tiberius::error::Error) -> Self {
        use tiberius::error::Error;

        match err {
            Error::Io { message, .. } => Self::Connection(message),
            Error::Tls(message) => Self::Connection(message),
            Error::Routing { host, port } => {
                Self::Connection(format!("server requested routing to {}:{}", host, port))
            }
            Error::Server(token) => {
                let message = token.message().to_string();
                match token.code() {
                    codes::TRACKING_NOT_ENABLED | codes::TRACKING_NOT_ENABLED_CHANGETABLE => {
                        Self::TrackingNotEnabled(message)
                    }
                    codes::INVALID_OBJECT => Self::ObjectNotFound(message),
                    codes::DUPLICATE_KEY_INDEX | codes::DUPLICATE_KEY_CONSTRAINT => {
                        Self::DuplicateKey(message)
                    }
                    codes::DEADLOCK_VICTIM => Self::Deadlock(message),
                    codes::LOGIN_FAILED => Self::Authentication(message),
                    code => Self::QueryFailed { code, message },
                }
            }
            other => Self::Tds(other.to_string()),
        }
    }
}

impl From<SqlServerError> for TriggerError {
    fn from(err: SqlServerError) -> Self {
        match err {
            SqlServerError::Authentication(msg) => TriggerError::config(format!(
                "SQL Server authentication failed: {}",
                msg
            )),
            SqlServerError::TrackingNotEnabled(msg) => TriggerError::tracking_not_enabled(msg),
            SqlServerError::ObjectNotFound(msg) => TriggerError::schema_incompatible(msg),
            SqlServerError::DuplicateKey(msg) => TriggerError::invalid_state(msg),
            SqlServerError::Connection(_)
            | SqlServerError::Tds(_)
            | SqlServerError::Deadlock(_)
            | SqlServerError::QueryFailed { .. } => TriggerError::source_unavailable(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SqlServerError::TrackingNotEnabled("dbo.Products".to_string());
        assert!(err.to_string().contains("ENABLE CHANGE_TRACKING"));
        assert!(err.to_string().contains("dbo.Products"));

        let err = SqlServerError::QueryFailed {
            code: 102,
            message: "Incorrect syntax".to_string(),
        };
        assert_eq!(err.to_string(), "Query failed (102): Incorrect syntax");
    }

    #[test]
    fn test_conversion_to_trigger_error() {
        let err: TriggerError = SqlServerError::Connection("reset by peer".into()).into();
        assert!(err.is_retriable());

        let err: TriggerError = SqlServerError::TrackingNotEnabled("t".into()).into();
        assert!(matches!(err, TriggerError::TrackingNotEnabled(_)));
        assert!(err.is_fatal());

        let err: TriggerError = SqlServerError::ObjectNotFound("t".into()).into();
        assert!(matches!(err, TriggerError::SchemaIncompatible(_)));

        let err: TriggerError = SqlServerError::Authentication("login failed".into()).into();
        assert!(matches!(err, TriggerError::Config(_)));
    }

    #[test]
    fn test_connection_lost() {
        assert!(SqlServerError::Connection("eof".into()).is_connection_lost());
        assert!(!SqlServerError::Deadlock("victim".into()).is_connection_lost());
    }
}
