//! Business Services
//!
//! This module contains the core business logic services:
//!
//! - `NodeService` - CRUD operations, hierarchy management, mention graph
//! - `SchemaService` - node-type schemas with migration-safe admin mutations
//!
//! Services coordinate between the database layer and application logic,
//! implementing business rules and orchestrating complex operations.

pub mod error;
pub mod node_service;
pub mod schema_service;

pub use error::NodeServiceError;
pub use node_service::NodeService;
pub use schema_service::SchemaService;
