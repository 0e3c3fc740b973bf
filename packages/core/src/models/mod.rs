//! Data Models
//!
//! Core data structures shared across the engine:
//!
//! - [`Node`] - the universal node struct (all content types)
//! - [`NodeUpdate`] - field-wise patch applied by updates
//! - [`NodeQuery`] - structured query record
//! - [`Schema`] / [`SchemaField`] - node-type property schemas
//! - [`PersistenceState`] - per-node lifecycle state

pub mod node;
pub mod query;
pub mod schema;

pub use node::{Node, NodeUpdate, PersistenceState, ValidationError};
pub use query::NodeQuery;
pub use schema::{FieldType, Schema, SchemaField, SchemaViolation};
