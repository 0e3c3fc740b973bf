//! Node Data Structures
//!
//! This module defines the core `Node` struct and related types for NodeSpace's
//! universal node system.
//!
//! # Architecture
//!
//! - **Universal Node**: Single struct represents all content types
//! - **Pure JSON properties**: All entity-specific data in the `properties` field
//! - **Optimistic concurrency**: Every node carries a monotonically increasing
//!   `version`; updates must present the version they read
//! - **Rank-ordered siblings**: Ordering lives on the `node_children` edge table,
//!   not on the node itself
//!
//! # Examples
//!
//! ```rust
//! use nodespace_core::models::Node;
//! use serde_json::json;
//!
//! // Create a text node
//! let text_node = Node::new(
//!     "text".to_string(),
//!     "My first note".to_string(),
//!     None,
//!     json!({}),
//! );
//!
//! // Create a task node with properties
//! let task_node = Node::new(
//!     "task".to_string(),
//!     "Review quarterly reports".to_string(),
//!     Some("2026-01-03".to_string()),
//!     json!({
//!         "status": "IN_PROGRESS",
//!         "priority": "HIGH",
//!         "due_date": "2026-01-10"
//!     }),
//! );
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default version value for serde deserialization (version 1)
fn default_version() -> i64 {
    1
}

/// Validation errors for Node operations
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid node type: {0}")]
    InvalidNodeType(String),

    #[error("Invalid node ID format: {0}")]
    InvalidId(String),

    #[error("Invalid parent reference: {0}")]
    InvalidParent(String),

    #[error("Invalid container reference: {0}")]
    InvalidContainer(String),

    #[error("Properties validation failed: {0}")]
    InvalidProperties(String),
}

/// Per-node lifecycle state tracked by the persistence coordinator.
///
/// Storage never sees this value: a node loaded from the database is by
/// definition `Persisted`, and the coordinator owns the in-memory
/// transitions `Ephemeral -> Pending -> Persisted` (and `Persisted ->
/// Pending` on mutation). A node never returns to `Ephemeral`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceState {
    /// Created in memory only (editor placeholder); not in storage
    Ephemeral,
    /// Mutated but not yet flushed (debounce or batch window open)
    Pending,
    /// Last observed write succeeded; in-memory version matches storage
    #[default]
    Persisted,
}

/// Universal Node structure for all content types in NodeSpace.
///
/// # Fields
///
/// - `id`: Unique identifier (UUID for most nodes, `YYYY-MM-DD` for date nodes)
/// - `node_type`: Type identifier (e.g., "text", "task", "header", "date")
/// - `content`: Primary content/text of the node (may carry markdown)
/// - `parent_id`: Optional reference to parent node
/// - `container_node_id`: Optional reference to the container document
///   (NULL means this node IS a container)
/// - `version`: Optimistic concurrency token, incremented on every update
/// - `created_at` / `modified_at`: Timestamps
/// - `properties`: JSON object containing all entity-specific fields
/// - `mentions` / `mentioned_by`: Bidirectional link graph, derived from
///   `nodespace://` references in content
/// - `persistence_state`: In-memory lifecycle state (never stored)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier (UUID or deterministic like YYYY-MM-DD for dates)
    pub id: String,

    /// Node type (e.g., "text", "task", "header", "date", "code-block")
    pub node_type: String,

    /// Primary content/text of the node
    pub content: String,

    /// Parent node ID (hierarchy position)
    pub parent_id: Option<String>,

    /// Container node ID (NULL means this node IS a container/root)
    pub container_node_id: Option<String>,

    /// Optimistic concurrency control version (incremented on each update).
    /// Used to detect conflicting concurrent writes from MCP clients and the UI.
    #[serde(default = "default_version")]
    pub version: i64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub modified_at: DateTime<Utc>,

    /// All entity-specific fields (Pure JSON properties)
    pub properties: serde_json::Value,

    /// Outgoing mentions - IDs of nodes that THIS node references.
    /// Example: if this node's content includes "nodespace://node-123",
    /// then mentions = ["node-123"].
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<String>,

    /// Incoming mentions - IDs of nodes that reference THIS node (backlinks).
    /// Computed from the node_mentions table; read-only, populated on query.
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mentioned_by: Vec<String>,

    /// Lifecycle state tracked by the coordinator (in-memory only)
    #[serde(default)]
    pub persistence_state: PersistenceState,
}

impl Node {
    /// Create a new Node with auto-generated UUID
    ///
    /// # Note on `container_node_id`
    ///
    /// This constructor sets `container_node_id = parent_id`, which is correct
    /// for root nodes and direct children of a root. For nested hierarchies
    /// use [`Node::new_in_container`] to specify the container explicitly.
    pub fn new(
        node_type: String,
        content: String,
        parent_id: Option<String>,
        properties: serde_json::Value,
    ) -> Self {
        let container_node_id = parent_id.clone();
        Self::build(
            Uuid::new_v4().to_string(),
            node_type,
            content,
            parent_id,
            container_node_id,
            properties,
        )
    }

    /// Create a new Node with auto-generated UUID and explicit container
    ///
    /// Use this constructor for nested hierarchies where the container
    /// document is different from the immediate parent.
    pub fn new_in_container(
        node_type: String,
        content: String,
        parent_id: Option<String>,
        container_node_id: Option<String>,
        properties: serde_json::Value,
    ) -> Self {
        Self::build(
            Uuid::new_v4().to_string(),
            node_type,
            content,
            parent_id,
            container_node_id,
            properties,
        )
    }

    /// Create a new Node with a caller-specified ID
    ///
    /// Used for deterministic IDs such as `YYYY-MM-DD` date nodes, and by
    /// external callers (MCP agents) that supply their own identifiers.
    pub fn new_with_id(
        id: String,
        node_type: String,
        content: String,
        parent_id: Option<String>,
        properties: serde_json::Value,
    ) -> Self {
        let container_node_id = parent_id.clone();
        Self::build(id, node_type, content, parent_id, container_node_id, properties)
    }

    fn build(
        id: String,
        node_type: String,
        content: String,
        parent_id: Option<String>,
        container_node_id: Option<String>,
        properties: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            node_type,
            content,
            parent_id,
            container_node_id,
            version: 1,
            created_at: now,
            modified_at: now,
            properties,
            mentions: Vec::new(),
            mentioned_by: Vec::new(),
            persistence_state: PersistenceState::Ephemeral,
        }
    }

    /// Whether this node is a container (roots a document)
    ///
    /// A node IS a container iff it has no parent and no container reference.
    pub fn is_container(&self) -> bool {
        self.parent_id.is_none() && self.container_node_id.is_none()
    }

    /// Validate node structure and required fields
    ///
    /// Content is allowed to be empty: blank nodes are valid during editing
    /// and are created when users press Enter.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if:
    /// - `id` or `node_type` is empty
    /// - `properties` is not a JSON object
    /// - the node references itself as parent or container
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("id".to_string()));
        }

        if self.node_type.is_empty() {
            return Err(ValidationError::MissingField("node_type".to_string()));
        }

        if !self.properties.is_object() {
            return Err(ValidationError::InvalidProperties(
                "properties must be a JSON object".to_string(),
            ));
        }

        if self.parent_id.as_deref() == Some(self.id.as_str()) {
            return Err(ValidationError::InvalidParent(format!(
                "node '{}' cannot be its own parent",
                self.id
            )));
        }

        if self.container_node_id.as_deref() == Some(self.id.as_str()) {
            return Err(ValidationError::InvalidContainer(format!(
                "node '{}' cannot be its own container",
                self.id
            )));
        }

        Ok(())
    }
}

/// Field-wise patch applied by `update_node`.
///
/// `None` leaves a field untouched. The outer `Option` on hierarchy fields
/// distinguishes "don't change" from "set to NULL":
/// `parent_id: Some(None)` detaches the node from its parent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdate {
    pub content: Option<String>,
    pub node_type: Option<String>,
    pub properties: Option<serde_json::Value>,
    pub parent_id: Option<Option<String>>,
    pub container_node_id: Option<Option<String>>,
}

impl NodeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(mut self, content: String) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_node_type(mut self, node_type: String) -> Self {
        self.node_type = Some(node_type);
        self
    }

    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Whether this patch changes nothing
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.node_type.is_none()
            && self.properties.is_none()
            && self.parent_id.is_none()
            && self.container_node_id.is_none()
    }

    /// Merge a later patch into this one (later fields win)
    pub fn merge(&mut self, later: NodeUpdate) {
        if later.content.is_some() {
            self.content = later.content;
        }
        if later.node_type.is_some() {
            self.node_type = later.node_type;
        }
        if later.properties.is_some() {
            self.properties = later.properties;
        }
        if later.parent_id.is_some() {
            self.parent_id = later.parent_id;
        }
        if later.container_node_id.is_some() {
            self.container_node_id = later.container_node_id;
        }
    }
}
