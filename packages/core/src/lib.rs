//! NodeSpace Core Engine
//!
//! This crate is the core engine of the NodeSpace knowledge store: it
//! mediates between the in-memory reactive document model and durable
//! storage.
//!
//! # Architecture
//!
//! - **Universal node model**: one struct for all content types, entity
//!   data in a Pure JSON `properties` field
//! - **libsql/Turso**: embedded SQLite-compatible database, WAL mode,
//!   bounded writer concurrency
//! - **Optimistic concurrency**: versioned nodes, compare-and-swap
//!   updates, jittered retry for commutative reorders
//! - **Fractional sibling ranks**: dense ordering keys on child edges
//! - **Persistence coordinator**: debounces typing bursts, batches bulk
//!   conversions, defers references to ephemeral nodes
//! - **Event bus**: typed pub/sub decoupling mutation from observers
//!
//! # Modules
//!
//! - [`models`] - data structures (Node, NodeUpdate, NodeQuery, Schema)
//! - [`db`] - database layer with libsql integration
//! - [`events`] - typed event bus with debounce/batch delivery
//! - [`services`] - business services (NodeService, SchemaService)
//! - [`operations`] - OCC retry layer for sibling reorders
//! - [`coordinator`] - persistence coordinator state machine
//! - [`mcp`] - MCP stdio endpoint for AI agent integration
//! - [`backend`] - adapter seam for IPC vs. HTTP callers

pub mod backend;
pub mod coordinator;
pub mod db;
pub mod events;
pub mod mcp;
pub mod models;
pub mod operations;
pub mod services;
pub mod utils;

// Re-exports
pub use coordinator::{CoordinatorConfig, CoordinatorError, Mutation, PersistenceCoordinator};
pub use db::{DatabaseError, DatabaseService};
pub use events::{Event, EventBus, EventNamespace};
pub use models::{Node, NodeQuery, NodeUpdate, PersistenceState, ValidationError};
pub use services::{NodeService, NodeServiceError, SchemaService};
