//! Database Layer
//!
//! This module handles all database interactions using libsql/Turso:
//!
//! - Database initialization and connection management
//! - WAL-mode concurrency with a bounded writer-slot semaphore
//! - Typed statement errors (constraint violations, version conflicts,
//!   transient contention, corruption)
//! - Fractional sibling ranks for ordered child enumeration

pub mod database;
mod error;
pub mod fractional_rank;

pub use database::{core_schemas, DatabaseService, WriteTransaction, WRITE_CONCURRENCY_ENV};
pub use error::DatabaseError;
pub use fractional_rank::{minimal_rank_updates, RankCalculator};
