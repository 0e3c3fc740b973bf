//! Database Connection Management
//!
//! This module provides the core database connection and initialization
//! functionality using libsql/Turso.
//!
//! # Architecture
//!
//! - **Path-agnostic**: Accepts any valid PathBuf (user-selectable by the host)
//! - **WAL mode**: Write-Ahead Logging so readers proceed alongside the writer
//! - **Foreign keys**: Enabled for referential integrity
//! - **Bounded writers**: A semaphore caps concurrent write transactions so
//!   OCC retry budgets aren't starved under contention
//!
//! # Connection Patterns
//!
//! **Always use `connect_with_timeout()` in async functions.** The 5-second
//! busy timeout lets concurrent operations wait and retry instead of failing
//! immediately with `SQLITE_BUSY`. PRAGMA directives return rows, so they are
//! issued through a prepared statement whose rows are consumed - executing
//! them through `execute()` silently misconfigures the connection.
//!
//! Write transactions go through [`DatabaseService::begin_write`], which
//! acquires a writer slot and opens `BEGIN IMMEDIATE` on a dedicated
//! connection. The connection never escapes the returned guard.

use crate::db::error::DatabaseError;
use crate::models::schema::{Schema, SchemaField};
use libsql::{Builder, Database};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Environment variable overriding the writer-slot semaphore size.
/// The only environment variable the core itself recognizes.
pub const WRITE_CONCURRENCY_ENV: &str = "NODESPACE_WRITE_CONCURRENCY";

/// Resolve the writer-slot count: the override if set, otherwise the
/// smaller of 4 and the machine's physical parallelism.
fn write_slot_count() -> usize {
    if let Ok(raw) = std::env::var(WRITE_CONCURRENCY_ENV) {
        match raw.trim().parse::<usize>() {
            Ok(n) if n >= 1 => return n.min(64),
            _ => {
                tracing::warn!(
                    "Ignoring invalid {} value '{}', using default",
                    WRITE_CONCURRENCY_ENV,
                    raw
                );
            }
        }
    }
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    parallelism.min(4)
}

/// Database service for managing the libsql connection and schema
///
/// # Examples
///
/// ```no_run
/// use nodespace_core::db::DatabaseService;
/// use std::path::PathBuf;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let db_path = PathBuf::from("/path/to/nodespace.db");
///     let db_service = DatabaseService::new(db_path).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DatabaseService {
    /// libsql database handle (wrapped in Arc for sharing)
    db: Arc<Database>,

    /// Path to the database file
    db_path: PathBuf,

    /// Bounded writer slots; every write transaction holds one permit
    write_slots: Arc<Semaphore>,
}

/// RAII guard for a write transaction.
///
/// Holds a writer-slot permit and a dedicated connection with an open
/// `BEGIN IMMEDIATE` transaction. Call [`WriteTransaction::commit`] to
/// publish the writes; dropping the guard without committing closes the
/// connection and the open transaction rolls back.
pub struct WriteTransaction {
    conn: libsql::Connection,
    _permit: OwnedSemaphorePermit,
    finished: bool,
}

impl WriteTransaction {
    /// The transaction's connection. Statements executed on it are part of
    /// the open transaction.
    pub fn connection(&self) -> &libsql::Connection {
        &self.conn
    }

    /// Commit the transaction, releasing the writer slot
    pub async fn commit(mut self) -> Result<(), DatabaseError> {
        self.conn
            .execute("COMMIT", ())
            .await
            .map_err(|e| DatabaseError::from_libsql("commit transaction", e))?;
        self.finished = true;
        Ok(())
    }

    /// Roll back the transaction explicitly
    pub async fn rollback(mut self) -> Result<(), DatabaseError> {
        self.conn
            .execute("ROLLBACK", ())
            .await
            .map_err(|e| DatabaseError::from_libsql("rollback transaction", e))?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            // Closing the connection rolls the open transaction back.
            tracing::debug!("Write transaction dropped without commit; rolling back");
        }
    }
}

impl DatabaseService {
    /// Create a new DatabaseService with the specified database path
    ///
    /// This will:
    /// 1. Ensure the parent directory exists (create if needed)
    /// 2. Open/create the database file
    /// 3. Initialize the schema (CREATE TABLE IF NOT EXISTS) and seed core
    ///    node-type schemas
    /// 4. Enable SQLite features (WAL mode, foreign keys, busy timeout)
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the parent directory cannot be created,
    /// the connection fails, or schema initialization fails. Schema
    /// initialization failure is fatal - there is no degraded mode.
    pub async fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        // Only newly created database files need the post-init WAL
        // checkpoint, so record existence before opening.
        let is_new_database = !db_path.exists();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        DatabaseError::permission_denied(db_path.clone())
                    } else {
                        DatabaseError::DirectoryCreationFailed(e)
                    }
                })?;
            }
        }

        let db = Builder::new_local(&db_path)
            .build()
            .await
            .map_err(|e| DatabaseError::connection_failed(db_path.clone(), e))?;

        let service = Self {
            db: Arc::new(db),
            db_path,
            write_slots: Arc::new(Semaphore::new(write_slot_count())),
        };

        service.initialize_schema(is_new_database).await?;

        Ok(service)
    }

    /// Path of the underlying database file
    pub fn path(&self) -> &PathBuf {
        &self.db_path
    }

    /// Execute a PRAGMA statement
    ///
    /// PRAGMA statements return rows, so we must use query() instead of
    /// execute() and consume the result. Ignoring the returned rows leaves
    /// the directive unapplied on some drivers.
    async fn execute_pragma(
        &self,
        conn: &libsql::Connection,
        pragma: &str,
    ) -> Result<(), DatabaseError> {
        let mut stmt = conn.prepare(pragma).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to prepare '{}': {}", pragma, e))
        })?;
        let _ = stmt.query(()).await.map_err(|e| {
            DatabaseError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        Ok(())
    }

    /// Initialize database schema and configuration
    ///
    /// Creates tables and indexes using CREATE TABLE IF NOT EXISTS,
    /// ensuring idempotent initialization (safe to call multiple times).
    ///
    /// # Schema
    ///
    /// - `nodes`: universal node storage with Pure JSON properties and an
    ///   OCC version column
    /// - `node_children`: sibling ordering edges with fractional rank
    /// - `node_mentions`: many-to-many mention relationships
    /// - `schemas`: node-type schema definitions
    async fn initialize_schema(&self, is_new_database: bool) -> Result<(), DatabaseError> {
        let conn = self.connect_with_timeout().await?;

        // WAL mode for better concurrency
        self.execute_pragma(&conn, "PRAGMA journal_mode = WAL")
            .await?;

        // Wait up to 5s on lock contention instead of failing immediately
        self.execute_pragma(&conn, "PRAGMA busy_timeout = 5000")
            .await?;

        // Referential integrity
        self.execute_pragma(&conn, "PRAGMA foreign_keys = ON")
            .await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                node_type TEXT NOT NULL,
                content TEXT NOT NULL,
                parent_id TEXT,
                container_node_id TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                modified_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                properties JSON NOT NULL DEFAULT '{}',
                -- Parent deletion cascades to children (tree structure)
                FOREIGN KEY (parent_id) REFERENCES nodes(id) ON DELETE CASCADE,
                -- Container deletion cascades to all contained nodes
                FOREIGN KEY (container_node_id) REFERENCES nodes(id) ON DELETE CASCADE
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::initialization_failed(format!("Failed to create nodes table: {}", e))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS node_children (
                parent_id TEXT NOT NULL,
                child_id TEXT NOT NULL,
                rank REAL NOT NULL,
                PRIMARY KEY (parent_id, child_id),
                FOREIGN KEY (parent_id) REFERENCES nodes(id) ON DELETE CASCADE,
                FOREIGN KEY (child_id) REFERENCES nodes(id) ON DELETE CASCADE
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::initialization_failed(format!(
                "Failed to create node_children table: {}",
                e
            ))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS node_mentions (
                node_id TEXT NOT NULL,
                mentions_node_id TEXT NOT NULL,
                PRIMARY KEY (node_id, mentions_node_id),
                FOREIGN KEY (node_id) REFERENCES nodes(id) ON DELETE CASCADE,
                FOREIGN KEY (mentions_node_id) REFERENCES nodes(id) ON DELETE CASCADE
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::initialization_failed(format!(
                "Failed to create node_mentions table: {}",
                e
            ))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schemas (
                node_type TEXT PRIMARY KEY,
                definition JSON NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                modified_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            (),
        )
        .await
        .map_err(|e| {
            DatabaseError::initialization_failed(format!("Failed to create schemas table: {}", e))
        })?;

        self.create_core_indexes(&conn).await?;
        self.seed_core_schemas(&conn).await?;

        // Force WAL checkpoint for newly created databases so rapid
        // open/close cycles in tests don't observe "no such table".
        if is_new_database {
            self.execute_pragma(&conn, "PRAGMA wal_checkpoint(TRUNCATE)")
                .await?;
        }

        Ok(())
    }

    /// Create core indexes for the nodes and edge tables
    async fn create_core_indexes(&self, conn: &libsql::Connection) -> Result<(), DatabaseError> {
        let indexes = [
            ("idx_nodes_type", "nodes(node_type)"),
            ("idx_nodes_parent", "nodes(parent_id)"),
            ("idx_nodes_container", "nodes(container_node_id)"),
            ("idx_nodes_modified", "nodes(modified_at)"),
            ("idx_nodes_created", "nodes(created_at)"),
            ("idx_nodes_content", "nodes(content)"),
            // Ordered child enumeration
            ("idx_children_parent_rank", "node_children(parent_id, rank)"),
            // Bidirectional mention queries
            ("idx_mentions_source", "node_mentions(node_id)"),
            ("idx_mentions_target", "node_mentions(mentions_node_id)"),
        ];

        for (name, spec) in indexes {
            conn.execute(
                &format!("CREATE INDEX IF NOT EXISTS {} ON {}", name, spec),
                (),
            )
            .await
            .map_err(|e| {
                DatabaseError::initialization_failed(format!(
                    "Failed to create index '{}': {}",
                    name, e
                ))
            })?;
        }

        Ok(())
    }

    /// Seed core node-type schemas
    ///
    /// Inserts the definitions for the built-in node types (task, text,
    /// header, date, code-block, quote-block, ordered-list). Idempotent -
    /// uses INSERT OR IGNORE so repeated initialization is safe and user
    /// modifications survive restarts.
    async fn seed_core_schemas(&self, conn: &libsql::Connection) -> Result<(), DatabaseError> {
        for schema in core_schemas() {
            let definition = serde_json::to_string(&schema).map_err(|e| {
                DatabaseError::initialization_failed(format!(
                    "Failed to encode core schema '{}': {}",
                    schema.node_type, e
                ))
            })?;

            conn.execute(
                "INSERT OR IGNORE INTO schemas (node_type, definition, version)
                 VALUES (?, ?, ?)",
                (schema.node_type.as_str(), definition, schema.version),
            )
            .await
            .map_err(|e| {
                DatabaseError::initialization_failed(format!(
                    "Failed to seed schema '{}': {}",
                    schema.node_type, e
                ))
            })?;
        }

        Ok(())
    }

    /// Get a synchronous connection to the database
    ///
    /// Only use this in synchronous, single-threaded contexts where the
    /// connection will not be used across await points. Most code should
    /// use [`connect_with_timeout`](Self::connect_with_timeout) instead.
    pub fn connect(&self) -> Result<libsql::Connection, DatabaseError> {
        self.db.connect().map_err(DatabaseError::LibsqlError)
    }

    /// Get an async connection with busy timeout configured
    ///
    /// The safe default for all async code: sets a 5-second busy timeout so
    /// concurrent operations wait and retry instead of failing immediately
    /// when the database is locked.
    pub async fn connect_with_timeout(&self) -> Result<libsql::Connection, DatabaseError> {
        let conn = self.connect()?;
        self.execute_pragma(&conn, "PRAGMA busy_timeout = 5000")
            .await?;
        Ok(conn)
    }

    /// Begin a write transaction, acquiring a writer slot
    ///
    /// Suspends until a writer slot is free, then opens `BEGIN IMMEDIATE`
    /// on a fresh connection. The slot is held until the returned guard is
    /// committed, rolled back, or dropped.
    pub async fn begin_write(&self) -> Result<WriteTransaction, DatabaseError> {
        let permit = self
            .write_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DatabaseError::sql_execution("writer semaphore closed"))?;

        let conn = self.connect_with_timeout().await?;
        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::from_libsql("begin write transaction", e))?;

        Ok(WriteTransaction {
            conn,
            _permit: permit,
            finished: false,
        })
    }

    /// Force a WAL checkpoint, flushing pending writes to the main file
    ///
    /// Used before database swaps and on graceful shutdown so no committed
    /// write lingers only in the WAL sidecar.
    pub async fn checkpoint(&self) -> Result<(), DatabaseError> {
        let conn = self.connect_with_timeout().await?;
        self.execute_pragma(&conn, "PRAGMA wal_checkpoint(TRUNCATE)")
            .await?;
        Ok(())
    }
}

/// Definitions for the built-in node types.
///
/// Markdown-shaped types (text, header, code-block, quote-block,
/// ordered-list) carry their full syntax in `content` and declare no
/// property fields. Task is the one core type with a structured schema.
pub fn core_schemas() -> Vec<Schema> {
    vec![
        Schema::new(
            "task",
            vec![
                SchemaField::enumeration(
                    "status",
                    vec![
                        "OPEN".to_string(),
                        "IN_PROGRESS".to_string(),
                        "DONE".to_string(),
                    ],
                    true,
                )
                .with_default(json!("OPEN"))
                .with_description("Status"),
                SchemaField::enumeration(
                    "priority",
                    vec!["LOW".to_string(), "MEDIUM".to_string(), "HIGH".to_string()],
                    false,
                )
                .with_description("Priority"),
                SchemaField::date("due_date", false).with_description("Due Date"),
                SchemaField::text("assignee", false).with_description("Assignee"),
            ],
        )
        .with_description("Task tracking schema"),
        Schema::new("text", vec![]).with_description("Plain text content"),
        Schema::new("header", vec![]).with_description("Markdown header (h1-h6)"),
        Schema::new("date", vec![]).with_description("Date container node"),
        Schema::new("code-block", vec![]).with_description("Fenced code block"),
        Schema::new("quote-block", vec![]).with_description("Markdown block quote"),
        Schema::new("ordered-list", vec![]).with_description("Numbered list item"),
    ]
}
