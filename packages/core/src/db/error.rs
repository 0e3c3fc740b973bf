//! Database Error Types
//!
//! This module defines error types for database operations, providing
//! clear error handling for connection, initialization, and statement
//! failures. Statement failures carry a typed kind so callers can
//! distinguish constraint violations from transient contention.

use std::path::PathBuf;
use thiserror::Error;

/// Database operation errors
///
/// Schema initialization failure is fatal to the caller; individual
/// statement failures are reported with a variant that distinguishes
/// not-found, constraint violations, version conflicts, transient
/// busy states, and corruption. The storage layer never retries
/// silently - retry policy belongs to the service layer.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to establish database connection
    #[error("Failed to connect to database at {path}: {source}")]
    ConnectionFailed {
        path: PathBuf,
        source: libsql::Error,
    },

    /// Failed to initialize database schema (fatal)
    #[error("Failed to initialize database schema: {0}")]
    InitializationFailed(String),

    /// Permission denied when accessing database
    #[error("Permission denied for database path: {path}")]
    PermissionDenied { path: PathBuf },

    /// Failed to create parent directory
    #[error("Failed to create parent directory for database: {0}")]
    DirectoryCreationFailed(#[from] std::io::Error),

    /// Row or referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Attempted to create a row with an id that already exists
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// Reference points at a non-existent node
    #[error("Foreign key constraint violated: {0}")]
    ForeignKeyViolation(String),

    /// Optimistic concurrency check failed
    #[error("Version conflict on node '{node_id}': expected v{expected}, found v{actual}")]
    VersionConflict {
        node_id: String,
        expected: i64,
        actual: i64,
    },

    /// Transient contention; the caller decides whether to retry
    #[error("Database busy: {0}")]
    Busy(String),

    /// Fatal corruption; escalated to the host for shutdown
    #[error("Database corrupt: {0}")]
    Corrupt(String),

    /// libsql operation error (not classified further)
    #[error("Database operation failed: {0}")]
    LibsqlError(libsql::Error),

    /// SQL execution error with context
    #[error("SQL execution failed: {context}")]
    SqlExecutionError { context: String },
}

impl DatabaseError {
    /// Create a connection failed error
    pub fn connection_failed(path: PathBuf, source: libsql::Error) -> Self {
        Self::ConnectionFailed { path, source }
    }

    /// Create an initialization failed error
    pub fn initialization_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    /// Create a permission denied error
    pub fn permission_denied(path: PathBuf) -> Self {
        Self::PermissionDenied { path }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a version conflict error
    pub fn version_conflict(node_id: impl Into<String>, expected: i64, actual: i64) -> Self {
        Self::VersionConflict {
            node_id: node_id.into(),
            expected,
            actual,
        }
    }

    /// Create a SQL execution error with context
    pub fn sql_execution(context: impl Into<String>) -> Self {
        Self::SqlExecutionError {
            context: context.into(),
        }
    }

    /// Classify a libsql error by its SQLite message text.
    ///
    /// libsql surfaces SQLite extended errors as strings, so constraint
    /// failures and lock contention are recognized by message content.
    /// The `context` names the statement for diagnostics; raw SQL text is
    /// never included.
    pub fn from_libsql(context: &str, source: libsql::Error) -> Self {
        let message = source.to_string();
        let lowered = message.to_lowercase();

        if lowered.contains("unique constraint failed") {
            Self::UniqueViolation(context.to_string())
        } else if lowered.contains("foreign key constraint failed") {
            Self::ForeignKeyViolation(context.to_string())
        } else if lowered.contains("database is locked") || lowered.contains("busy") {
            Self::Busy(context.to_string())
        } else if lowered.contains("malformed") || lowered.contains("not a database") {
            Self::Corrupt(context.to_string())
        } else {
            Self::SqlExecutionError {
                context: format!("{}: {}", context, message),
            }
        }
    }

    /// Whether this error is transient contention worth retrying
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_conflict_message() {
        let err = DatabaseError::version_conflict("n1", 2, 5);
        assert_eq!(
            err.to_string(),
            "Version conflict on node 'n1': expected v2, found v5"
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = DatabaseError::not_found("node 'missing'");
        assert_eq!(err.to_string(), "Not found: node 'missing'");
    }

    #[test]
    fn test_busy_is_busy() {
        assert!(DatabaseError::Busy("insert node".to_string()).is_busy());
        assert!(!DatabaseError::not_found("x").is_busy());
    }
}
