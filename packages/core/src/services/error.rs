//! Service Layer Error Types
//!
//! High-level error types for node operations. Storage errors are wrapped
//! and, where they carry retry-relevant meaning (version conflicts, unique
//! violations), re-raised as dedicated variants so callers can match on
//! them without digging into the database layer.

use crate::db::DatabaseError;
use crate::models::{Node, SchemaViolation, ValidationError};
use thiserror::Error;

/// Service operation errors
#[derive(Error, Debug)]
pub enum NodeServiceError {
    /// Node not found by ID
    #[error("Node not found: {id}")]
    NodeNotFound { id: String },

    /// Structural validation failed for node
    #[error("Node validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),

    /// Properties failed schema validation
    #[error("Schema violation: {0}")]
    SchemaViolation(#[from] SchemaViolation),

    /// Attempted to create a node with an id that already exists.
    /// Never silently coerced into an update.
    #[error("Node '{id}' already exists")]
    UniqueViolation { id: String },

    /// Optimistic concurrency check failed
    ///
    /// `current` carries the latest stored node when it could be re-read,
    /// so callers can re-derive their intent against fresh state.
    #[error("Version conflict on node '{node_id}': expected v{expected}, found v{actual}")]
    VersionConflict {
        node_id: String,
        expected: i64,
        actual: i64,
        current: Option<Box<Node>>,
    },

    /// A move would make a node its own ancestor
    #[error("Move rejected: node '{node_id}' would become its own ancestor")]
    CycleWouldOccur { node_id: String },

    /// Invalid parent reference
    #[error("Invalid parent node: {parent_id}")]
    InvalidParent { parent_id: String },

    /// Node hierarchy constraint violation
    #[error("Hierarchy constraint violated: {0}")]
    HierarchyViolation(String),

    /// Invalid update operation
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Query execution error
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Database operation failed
    #[error("Database operation failed: {0}")]
    DatabaseError(#[from] DatabaseError),
}

impl NodeServiceError {
    /// Create a node not found error
    pub fn node_not_found(id: impl Into<String>) -> Self {
        Self::NodeNotFound { id: id.into() }
    }

    /// Create a unique violation error
    pub fn unique_violation(id: impl Into<String>) -> Self {
        Self::UniqueViolation { id: id.into() }
    }

    /// Create a version conflict error
    pub fn version_conflict(
        node_id: impl Into<String>,
        expected: i64,
        actual: i64,
        current: Option<Node>,
    ) -> Self {
        Self::VersionConflict {
            node_id: node_id.into(),
            expected,
            actual,
            current: current.map(Box::new),
        }
    }

    /// Create a cycle error
    pub fn cycle_would_occur(node_id: impl Into<String>) -> Self {
        Self::CycleWouldOccur {
            node_id: node_id.into(),
        }
    }

    /// Create an invalid parent error
    pub fn invalid_parent(parent_id: impl Into<String>) -> Self {
        Self::InvalidParent {
            parent_id: parent_id.into(),
        }
    }

    /// Create a hierarchy violation error
    pub fn hierarchy_violation(msg: impl Into<String>) -> Self {
        Self::HierarchyViolation(msg.into())
    }

    /// Create an invalid update error
    pub fn invalid_update(msg: impl Into<String>) -> Self {
        Self::InvalidUpdate(msg.into())
    }

    /// Create a serialization error
    pub fn serialization_error(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }

    /// Create a query failed error
    pub fn query_failed(msg: impl Into<String>) -> Self {
        Self::QueryFailed(msg.into())
    }

    /// Whether this error is a version conflict (retriable for
    /// commutative structural edits)
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
