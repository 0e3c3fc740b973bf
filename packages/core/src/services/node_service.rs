//! Node Service - Core CRUD Operations
//!
//! The primary mutation surface of the engine:
//!
//! - CRUD operations with optimistic concurrency control
//! - Hierarchy management (get_children, move_node, reorder_siblings)
//! - Mention graph maintenance as a side effect of content writes
//! - Structured queries (NodeQuery)
//!
//! Every mutation runs inside a single write transaction holding one
//! writer slot; mention-edge updates commit atomically with the content
//! write that caused them. Successful mutations emit lifecycle events on
//! the attached [`EventBus`].

use crate::db::{minimal_rank_updates, DatabaseService, RankCalculator, WriteTransaction};
use crate::events::{Event, EventBus};
use crate::models::{Node, NodeQuery, NodeUpdate, PersistenceState};
use crate::services::error::NodeServiceError;
use crate::services::schema_service::SchemaService;
use crate::utils::mentions::{diff_mentions, extract_mentions};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::json;
use std::sync::Arc;

/// Node types allowed to root a document
const CONTAINER_TYPES: &[&str] = &["date", "text", "header"];

/// Parse timestamp from database - handles both SQLite and RFC3339 formats
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    Err(format!(
        "Unable to parse timestamp '{}' as SQLite or RFC3339 format",
        s
    ))
}

const NODE_COLUMNS: &str =
    "id, node_type, content, parent_id, container_node_id, version, created_at, modified_at, properties";

/// Core service for node CRUD and hierarchy operations
///
/// # Examples
///
/// ```no_run
/// use nodespace_core::services::NodeService;
/// use nodespace_core::db::DatabaseService;
/// use nodespace_core::models::Node;
/// use std::path::PathBuf;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let db = DatabaseService::new(PathBuf::from("./data/test.db")).await?;
///     let service = NodeService::new(db);
///
///     let node = Node::new(
///         "text".to_string(),
///         "Hello World".to_string(),
///         None,
///         json!({}),
///     );
///
///     let id = service.create_node(node).await?;
///     println!("Created node: {}", id);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct NodeService {
    /// Database service for persistence
    db: Arc<DatabaseService>,

    /// Schema lookups and property validation
    schemas: SchemaService,

    /// Lifecycle event sink
    bus: EventBus,
}

impl NodeService {
    /// Create a new NodeService with its own event bus
    pub fn new(db: DatabaseService) -> Self {
        Self::with_event_bus(db, EventBus::new())
    }

    /// Create a new NodeService attached to an existing event bus
    pub fn with_event_bus(db: DatabaseService, bus: EventBus) -> Self {
        let db = Arc::new(db);
        Self {
            schemas: SchemaService::new(Arc::clone(&db)),
            db,
            bus,
        }
    }

    /// The event bus this service emits lifecycle events on
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// The schema service sharing this service's database
    pub fn schema_service(&self) -> &SchemaService {
        &self.schemas
    }

    /// The underlying database service
    pub fn database(&self) -> &Arc<DatabaseService> {
        &self.db
    }

    // =========================================================================
    // CREATE
    // =========================================================================

    /// Create a new node
    ///
    /// Enforces the hierarchy rules before touching storage:
    ///
    /// 1. A node with neither parent nor container IS a container; its type
    ///    must be container-capable (date, text, header).
    /// 2. Every other node must have a container; if absent it is inferred
    ///    from the parent.
    /// 3. Parent and child must agree on the container.
    ///
    /// Properties are validated against the node type's schema (defaults
    /// applied first). The node row, its sibling-order edge, and its mention
    /// edges commit in one transaction; the new node is appended as the last
    /// sibling of its parent.
    ///
    /// # Errors
    ///
    /// - `UniqueViolation` if the id already exists (the existing row is
    ///   left untouched and no event is emitted)
    /// - `InvalidParent` if the parent does not exist
    /// - `SchemaViolation` if properties fail the schema check
    pub async fn create_node(&self, mut node: Node) -> Result<String, NodeServiceError> {
        node.validate()?;

        if node.is_container() {
            if !CONTAINER_TYPES.contains(&node.node_type.as_str()) {
                return Err(NodeServiceError::hierarchy_violation(format!(
                    "Node type '{}' cannot root a document",
                    node.node_type
                )));
            }
        } else {
            // Infer container from parent when absent.
            if node.container_node_id.is_none() {
                let parent_id = node.parent_id.clone().ok_or_else(|| {
                    NodeServiceError::hierarchy_violation(format!(
                        "Non-container node '{}' must have a container",
                        node.id
                    ))
                })?;
                let parent = self
                    .get_node(&parent_id)
                    .await?
                    .ok_or_else(|| NodeServiceError::invalid_parent(parent_id.clone()))?;
                node.container_node_id = Some(
                    parent
                        .container_node_id
                        .clone()
                        .unwrap_or_else(|| parent.id.clone()),
                );
            }

            if let Some(ref parent_id) = node.parent_id {
                let parent = self
                    .get_node(parent_id)
                    .await?
                    .ok_or_else(|| NodeServiceError::invalid_parent(parent_id.clone()))?;
                let parent_container = parent
                    .container_node_id
                    .clone()
                    .unwrap_or_else(|| parent.id.clone());
                if node.container_node_id.as_deref() != Some(parent_container.as_str()) {
                    return Err(NodeServiceError::hierarchy_violation(format!(
                        "Parent '{}' is in container '{}' but child declares '{}'",
                        parent_id,
                        parent_container,
                        node.container_node_id.as_deref().unwrap_or("None")
                    )));
                }
            }
        }

        if let Some(schema) = self.schemas.get_schema(&node.node_type).await? {
            schema.apply_defaults(&mut node.properties);
            schema.validate_properties(&node.properties)?;
        }

        let properties = serde_json::to_string(&node.properties)
            .map_err(|e| NodeServiceError::serialization_error(e.to_string()))?;

        let tx = self.db.begin_write().await?;

        let insert = tx
            .connection()
            .execute(
                "INSERT INTO nodes (id, node_type, content, parent_id, container_node_id, properties)
                 VALUES (?, ?, ?, ?, ?, ?)",
                (
                    node.id.as_str(),
                    node.node_type.as_str(),
                    node.content.as_str(),
                    node.parent_id.as_deref(),
                    node.container_node_id.as_deref(),
                    properties.as_str(),
                ),
            )
            .await;

        if let Err(e) = insert {
            let classified = crate::db::DatabaseError::from_libsql("insert node", e);
            tx.rollback().await.ok();
            return Err(match classified {
                crate::db::DatabaseError::UniqueViolation(_) => {
                    NodeServiceError::unique_violation(node.id.clone())
                }
                crate::db::DatabaseError::ForeignKeyViolation(_) => {
                    NodeServiceError::invalid_parent(
                        node.parent_id.clone().unwrap_or_default(),
                    )
                }
                other => NodeServiceError::DatabaseError(other),
            });
        }

        if let Some(ordering_parent) = ordering_parent(&node) {
            let rank = self.next_rank(&tx, &ordering_parent).await?;
            tx.connection()
                .execute(
                    "INSERT INTO node_children (parent_id, child_id, rank) VALUES (?, ?, ?)",
                    (ordering_parent.as_str(), node.id.as_str(), rank),
                )
                .await
                .map_err(|e| crate::db::DatabaseError::from_libsql("insert child edge", e))?;
        }

        let mentions = extract_mentions(&node.content);
        self.apply_mention_diff(&tx, &node.id, &mentions, &[]).await?;

        tx.commit().await?;

        self.bus.emit(Event::lifecycle(
            "node:created",
            "node-service",
            json!({ "id": node.id, "nodeType": node.node_type }),
        ));

        tracing::debug!(node_id = %node.id, node_type = %node.node_type, "Created node");
        Ok(node.id)
    }

    /// Create a batch of nodes in one transaction, all-or-nothing
    ///
    /// Nodes are inserted in the given order, so parents may appear in the
    /// same batch as their children as long as they come first; referential
    /// integrity inside the batch is enforced by the foreign keys rather
    /// than by per-node lookups. Hierarchy fields are taken as provided -
    /// callers assembling a batch (markdown import, workspace restore) have
    /// already resolved containers.
    ///
    /// Any failure rolls the whole batch back; events are emitted only
    /// after the batch commits.
    pub async fn bulk_create(&self, nodes: Vec<Node>) -> Result<Vec<String>, NodeServiceError> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut encoded = Vec::with_capacity(nodes.len());
        for node in &nodes {
            node.validate()?;
            let mut properties = node.properties.clone();
            if let Some(schema) = self.schemas.get_schema(&node.node_type).await? {
                schema.apply_defaults(&mut properties);
                schema.validate_properties(&properties)?;
            }
            let properties = serde_json::to_string(&properties)
                .map_err(|e| NodeServiceError::serialization_error(e.to_string()))?;
            encoded.push(properties);
        }

        let tx = self.db.begin_write().await?;

        for (node, properties) in nodes.iter().zip(&encoded) {
            let insert = tx
                .connection()
                .execute(
                    "INSERT INTO nodes (id, node_type, content, parent_id, container_node_id, properties)
                     VALUES (?, ?, ?, ?, ?, ?)",
                    (
                        node.id.as_str(),
                        node.node_type.as_str(),
                        node.content.as_str(),
                        node.parent_id.as_deref(),
                        node.container_node_id.as_deref(),
                        properties.as_str(),
                    ),
                )
                .await;

            if let Err(e) = insert {
                let classified = crate::db::DatabaseError::from_libsql("bulk insert node", e);
                tx.rollback().await.ok();
                return Err(match classified {
                    crate::db::DatabaseError::UniqueViolation(_) => {
                        NodeServiceError::unique_violation(node.id.clone())
                    }
                    crate::db::DatabaseError::ForeignKeyViolation(_) => {
                        NodeServiceError::invalid_parent(
                            node.parent_id.clone().unwrap_or_default(),
                        )
                    }
                    other => NodeServiceError::DatabaseError(other),
                });
            }

            if let Some(ordering_parent) = ordering_parent(node) {
                let rank = self.next_rank(&tx, &ordering_parent).await?;
                tx.connection()
                    .execute(
                        "INSERT INTO node_children (parent_id, child_id, rank) VALUES (?, ?, ?)",
                        (ordering_parent.as_str(), node.id.as_str(), rank),
                    )
                    .await
                    .map_err(|e| {
                        crate::db::DatabaseError::from_libsql("bulk insert child edge", e)
                    })?;
            }

            let mentions = extract_mentions(&node.content);
            self.apply_mention_diff(&tx, &node.id, &mentions, &[]).await?;
        }

        tx.commit().await?;

        let mut ids = Vec::with_capacity(nodes.len());
        for node in &nodes {
            self.bus.emit(Event::lifecycle(
                "node:created",
                "node-service",
                json!({ "id": node.id, "nodeType": node.node_type }),
            ));
            ids.push(node.id.clone());
        }

        tracing::debug!(count = ids.len(), "Bulk-created nodes");
        Ok(ids)
    }

    /// Get or create the date node for a `YYYY-MM-DD` day
    ///
    /// Date nodes use their date as a deterministic id, giving daily notes
    /// get-or-create semantics. Idempotent.
    pub async fn get_or_create_date_node(&self, date: &str) -> Result<Node, NodeServiceError> {
        if chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
            return Err(NodeServiceError::invalid_update(format!(
                "'{}' is not a YYYY-MM-DD date",
                date
            )));
        }

        if let Some(existing) = self.get_node(date).await? {
            return Ok(existing);
        }

        let node = Node::new_with_id(
            date.to_string(),
            "date".to_string(),
            date.to_string(),
            None,
            json!({}),
        );

        match self.create_node(node).await {
            Ok(_) => {}
            // Lost a create race; the other writer's row is what we want.
            Err(NodeServiceError::UniqueViolation { .. }) => {}
            Err(e) => return Err(e),
        }

        self.get_node(date)
            .await?
            .ok_or_else(|| NodeServiceError::node_not_found(date))
    }

    // =========================================================================
    // READ
    // =========================================================================

    /// Get a node by ID, with mention arrays populated
    pub async fn get_node(&self, id: &str) -> Result<Option<Node>, NodeServiceError> {
        let conn = self.db.connect_with_timeout().await?;

        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM nodes WHERE id = ?", NODE_COLUMNS))
            .await
            .map_err(|e| {
                NodeServiceError::query_failed(format!("Failed to prepare get_node query: {}", e))
            })?;

        let mut rows = stmt.query([id]).await.map_err(|e| {
            NodeServiceError::query_failed(format!("Failed to execute get_node query: {}", e))
        })?;

        let row = rows
            .next()
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut node = row_to_node(&row)?;
        node.mentions = self.mention_targets(&conn, id).await?;
        node.mentioned_by = self.mention_sources(&conn, id).await?;
        Ok(Some(node))
    }

    /// Children of a parent in ascending rank order
    ///
    /// For container top-level nodes, pass the container id: ordering edges
    /// key top-level nodes under their container.
    pub async fn get_children(&self, parent_id: &str) -> Result<Vec<Node>, NodeServiceError> {
        let conn = self.db.connect_with_timeout().await?;

        let sql = "SELECT n.id, n.node_type, n.content, n.parent_id, n.container_node_id,
                    n.version, n.created_at, n.modified_at, n.properties
             FROM node_children c JOIN nodes n ON n.id = c.child_id
             WHERE c.parent_id = ? ORDER BY c.rank ASC";

        let mut stmt = conn.prepare(sql).await.map_err(|e| {
            NodeServiceError::query_failed(format!("Failed to prepare children query: {}", e))
        })?;

        let mut rows = stmt.query([parent_id]).await.map_err(|e| {
            NodeServiceError::query_failed(format!("Failed to execute children query: {}", e))
        })?;

        let mut nodes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?
        {
            nodes.push(row_to_node(&row)?);
        }
        Ok(nodes)
    }

    /// Execute a structured query
    ///
    /// At most one lookup path is taken (id, mentioned_by, content,
    /// node_type, containers-and-tasks filter, in that priority); see
    /// [`NodeQuery`]. An empty query returns an empty result.
    pub async fn query_nodes(&self, query: NodeQuery) -> Result<Vec<Node>, NodeServiceError> {
        if query.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(ref id) = query.id {
            return Ok(self.get_node(id).await?.into_iter().collect());
        }

        let conn = self.db.connect_with_timeout().await?;
        let limit_clause = query
            .limit
            .map(|l| format!(" LIMIT {}", l))
            .unwrap_or_default();

        // The flag predicate restricts to containers, while always letting
        // task nodes through - even past a node_type filter.
        let flag = " AND (node_type = 'task' OR container_node_id IS NULL)";

        if let Some(ref target) = query.mentioned_by {
            let mention_flag = if query.include_containers_and_tasks {
                " AND (n.node_type = 'task' OR n.container_node_id IS NULL)"
            } else {
                ""
            };
            // Backlink join: return the nodes whose mention edges point at
            // the target.
            let sql = format!(
                "SELECT n.id, n.node_type, n.content, n.parent_id, n.container_node_id,
                        n.version, n.created_at, n.modified_at, n.properties
                 FROM node_mentions m JOIN nodes n ON n.id = m.node_id
                 WHERE m.mentions_node_id = ?{}{}",
                mention_flag, limit_clause
            );
            return self.collect_rows(&conn, &sql, [target.as_str()]).await;
        }

        if let Some(ref needle) = query.content_contains {
            let pattern = format!("%{}%", needle);
            let mut predicate = String::from("content LIKE ?");
            if query.node_type.is_some() {
                predicate.push_str(" AND (node_type = ? OR node_type = 'task')");
            }
            if query.include_containers_and_tasks {
                predicate.push_str(flag);
            }
            let sql = format!(
                "SELECT {} FROM nodes WHERE {}{}",
                NODE_COLUMNS, predicate, limit_clause
            );
            return match query.node_type {
                Some(ref node_type) => {
                    self.collect_rows(&conn, &sql, [pattern.as_str(), node_type.as_str()])
                        .await
                }
                None => self.collect_rows(&conn, &sql, [pattern.as_str()]).await,
            };
        }

        if let Some(ref node_type) = query.node_type {
            let mut predicate = String::from("node_type = ?");
            if query.include_containers_and_tasks {
                predicate = String::from("(node_type = ? OR node_type = 'task')");
                predicate.push_str(flag);
            }
            let sql = format!(
                "SELECT {} FROM nodes WHERE {}{}",
                NODE_COLUMNS, predicate, limit_clause
            );
            return self.collect_rows(&conn, &sql, [node_type.as_str()]).await;
        }

        // Filter-only: containers and tasks.
        let sql = format!(
            "SELECT {} FROM nodes WHERE (node_type = 'task' OR container_node_id IS NULL){}",
            NODE_COLUMNS, limit_clause
        );
        self.collect_rows(&conn, &sql, ()).await
    }

    // =========================================================================
    // UPDATE
    // =========================================================================

    /// Update node content, type, and/or properties with OCC
    ///
    /// The caller presents the version it read; the write succeeds only if
    /// storage still holds that version, and the new version is returned.
    /// Mention-edge changes derived from the content diff commit in the
    /// same transaction. Hierarchy fields cannot be changed here - use
    /// [`move_node`](Self::move_node) or
    /// [`reorder_siblings`](Self::reorder_siblings).
    ///
    /// # Errors
    ///
    /// - `NotFound` if the id does not resolve
    /// - `VersionConflict` if the stored version differs; the latest stored
    ///   node is attached and no partial write is visible
    pub async fn update_node(
        &self,
        id: &str,
        expected_version: i64,
        update: NodeUpdate,
    ) -> Result<i64, NodeServiceError> {
        if update.parent_id.is_some() || update.container_node_id.is_some() {
            return Err(NodeServiceError::invalid_update(
                "Hierarchy fields cannot change through update_node; use move_node",
            ));
        }

        let current = self
            .get_node(id)
            .await?
            .ok_or_else(|| NodeServiceError::node_not_found(id))?;

        let new_content = update.content.clone().unwrap_or_else(|| current.content.clone());
        let new_type = update
            .node_type
            .clone()
            .unwrap_or_else(|| current.node_type.clone());
        let new_properties = update
            .properties
            .clone()
            .unwrap_or_else(|| current.properties.clone());

        if let Some(schema) = self.schemas.get_schema(&new_type).await? {
            schema.validate_properties(&new_properties)?;
        }

        let properties = serde_json::to_string(&new_properties)
            .map_err(|e| NodeServiceError::serialization_error(e.to_string()))?;

        let tx = self.db.begin_write().await?;

        let affected = tx
            .connection()
            .execute(
                "UPDATE nodes
                 SET node_type = ?, content = ?, properties = ?,
                     modified_at = CURRENT_TIMESTAMP, version = version + 1
                 WHERE id = ? AND version = ?",
                (
                    new_type.as_str(),
                    new_content.as_str(),
                    properties.as_str(),
                    id,
                    expected_version,
                ),
            )
            .await
            .map_err(|e| crate::db::DatabaseError::from_libsql("update node", e))?;

        if affected == 0 {
            tx.rollback().await.ok();
            return Err(self.conflict_or_missing(id, expected_version).await?);
        }

        if update.content.is_some() {
            let new_mentions = extract_mentions(&new_content);
            let (added, removed) = diff_mentions(&current.mentions, &new_mentions);
            self.apply_mention_diff(&tx, id, &added, &removed).await?;
        }

        tx.commit().await?;

        let new_version = expected_version + 1;
        self.bus.emit(Event::lifecycle(
            "node:updated",
            "node-service",
            json!({ "id": id, "version": new_version }),
        ));

        tracing::debug!(node_id = %id, version = new_version, "Updated node");
        Ok(new_version)
    }

    /// Move a node to a new parent at an optional position
    ///
    /// `position` is the index among the new parent's children (`None`
    /// appends). Rejected with `CycleWouldOccur` when the target parent is
    /// the node itself or one of its descendants. The node's version is
    /// bumped under OCC like any other write.
    pub async fn move_node(
        &self,
        id: &str,
        new_parent_id: Option<&str>,
        position: Option<usize>,
    ) -> Result<i64, NodeServiceError> {
        let node = self
            .get_node(id)
            .await?
            .ok_or_else(|| NodeServiceError::node_not_found(id))?;

        if node.is_container() {
            return Err(NodeServiceError::hierarchy_violation(format!(
                "Container node '{}' cannot be moved",
                id
            )));
        }

        // Resolve the target container and check for cycles by walking the
        // ancestor chain of the new parent.
        let new_container = match new_parent_id {
            Some(parent_id) => {
                if parent_id == id {
                    return Err(NodeServiceError::cycle_would_occur(id));
                }
                let parent = self
                    .get_node(parent_id)
                    .await?
                    .ok_or_else(|| NodeServiceError::node_not_found(parent_id))?;

                let mut ancestor = parent.parent_id.clone();
                while let Some(ancestor_id) = ancestor {
                    if ancestor_id == id {
                        return Err(NodeServiceError::cycle_would_occur(id));
                    }
                    ancestor = self
                        .get_node(&ancestor_id)
                        .await?
                        .and_then(|n| n.parent_id);
                }

                parent
                    .container_node_id
                    .clone()
                    .unwrap_or_else(|| parent.id.clone())
            }
            None => node.container_node_id.clone().ok_or_else(|| {
                NodeServiceError::hierarchy_violation(format!(
                    "Node '{}' has no container to re-root under",
                    id
                ))
            })?,
        };

        let old_ordering_parent = ordering_parent(&node);
        let new_ordering_parent = new_parent_id
            .map(String::from)
            .unwrap_or_else(|| new_container.clone());

        // Target rank among the new siblings.
        let siblings = self.child_ranks(&new_ordering_parent).await?;
        let siblings: Vec<(String, f64)> = siblings
            .into_iter()
            .filter(|(child_id, _)| child_id != id)
            .collect();
        let rank = rank_at_position(&siblings, position);

        let tx = self.db.begin_write().await?;

        let affected = tx
            .connection()
            .execute(
                "UPDATE nodes
                 SET parent_id = ?, container_node_id = ?,
                     modified_at = CURRENT_TIMESTAMP, version = version + 1
                 WHERE id = ? AND version = ?",
                (new_parent_id, new_container.as_str(), id, node.version),
            )
            .await
            .map_err(|e| crate::db::DatabaseError::from_libsql("move node", e))?;

        if affected == 0 {
            tx.rollback().await.ok();
            return Err(self.conflict_or_missing(id, node.version).await?);
        }

        if let Some(old_parent) = old_ordering_parent {
            tx.connection()
                .execute(
                    "DELETE FROM node_children WHERE parent_id = ? AND child_id = ?",
                    (old_parent.as_str(), id),
                )
                .await
                .map_err(|e| crate::db::DatabaseError::from_libsql("delete child edge", e))?;
        }

        tx.connection()
            .execute(
                "INSERT INTO node_children (parent_id, child_id, rank) VALUES (?, ?, ?)",
                (new_ordering_parent.as_str(), id, rank),
            )
            .await
            .map_err(|e| crate::db::DatabaseError::from_libsql("insert child edge", e))?;

        tx.commit().await?;

        let new_version = node.version + 1;
        self.bus.emit(Event::lifecycle(
            "node:moved",
            "node-service",
            json!({ "id": id, "parentId": new_parent_id, "version": new_version }),
        ));

        Ok(new_version)
    }

    /// Reorder the children of a parent to a target permutation
    ///
    /// Computes the minimum rank-update set; a target matching the current
    /// order is a no-op (no writes, no events). Each rank change bumps the
    /// child's version with an OCC check; any conflict rolls the whole
    /// transaction back.
    pub async fn reorder_siblings(
        &self,
        parent_id: &str,
        target_order: &[String],
    ) -> Result<(), NodeServiceError> {
        // Ranks and versions must come from one snapshot: a version read
        // after a concurrent commit would let stale ranks pass the CAS.
        let snapshot = self.child_ranks_with_versions(parent_id).await?;
        let children: Vec<(String, f64)> = snapshot
            .iter()
            .map(|(id, rank, _)| (id.clone(), *rank))
            .collect();

        let mut current_ids: Vec<&String> = children.iter().map(|(id, _)| id).collect();
        current_ids.sort();
        let mut target_ids: Vec<&String> = target_order.iter().collect();
        target_ids.sort();
        if current_ids != target_ids {
            return Err(NodeServiceError::hierarchy_violation(format!(
                "Target order is not a permutation of the children of '{}'",
                parent_id
            )));
        }

        let updates = minimal_rank_updates(&children, target_order);
        if updates.is_empty() {
            return Ok(());
        }

        let version_of = |child_id: &str| -> i64 {
            snapshot
                .iter()
                .find(|(id, _, _)| id == child_id)
                .map(|(_, _, version)| *version)
                .unwrap_or(1)
        };

        let tx = self.db.begin_write().await?;

        for (child_id, rank) in updates.iter() {
            let expected_version = version_of(child_id);
            tx.connection()
                .execute(
                    "UPDATE node_children SET rank = ? WHERE parent_id = ? AND child_id = ?",
                    (*rank, parent_id, child_id.as_str()),
                )
                .await
                .map_err(|e| crate::db::DatabaseError::from_libsql("update rank", e))?;

            let affected = tx
                .connection()
                .execute(
                    "UPDATE nodes
                     SET modified_at = CURRENT_TIMESTAMP, version = version + 1
                     WHERE id = ? AND version = ?",
                    (child_id.as_str(), expected_version),
                )
                .await
                .map_err(|e| crate::db::DatabaseError::from_libsql("bump version", e))?;

            if affected == 0 {
                tx.rollback().await.ok();
                return Err(self.conflict_or_missing(child_id, expected_version).await?);
            }
        }

        tx.commit().await?;

        self.bus.emit(Event::lifecycle(
            "children:reordered",
            "node-service",
            json!({ "parentId": parent_id, "order": target_order }),
        ));

        Ok(())
    }

    // =========================================================================
    // DELETE
    // =========================================================================

    /// Delete a node
    ///
    /// Children, sibling-order edges, and mention edges are removed by
    /// cascade in the same transaction.
    ///
    /// # Errors
    ///
    /// `NotFound` if the id does not resolve.
    pub async fn delete_node(&self, id: &str) -> Result<(), NodeServiceError> {
        let tx = self.db.begin_write().await?;

        let affected = tx
            .connection()
            .execute("DELETE FROM nodes WHERE id = ?", [id])
            .await
            .map_err(|e| crate::db::DatabaseError::from_libsql("delete node", e))?;

        if affected == 0 {
            tx.rollback().await.ok();
            return Err(NodeServiceError::node_not_found(id));
        }

        tx.commit().await?;

        self.bus.emit(Event::lifecycle(
            "node:deleted",
            "node-service",
            json!({ "id": id }),
        ));

        tracing::debug!(node_id = %id, "Deleted node");
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Resolve an OCC write that affected zero rows into the right error
    async fn conflict_or_missing(
        &self,
        id: &str,
        expected: i64,
    ) -> Result<NodeServiceError, NodeServiceError> {
        match self.get_node(id).await? {
            Some(current) => Ok(NodeServiceError::version_conflict(
                id,
                expected,
                current.version,
                Some(current),
            )),
            None => Ok(NodeServiceError::node_not_found(id)),
        }
    }

    /// Next append rank under a parent, within the given transaction
    async fn next_rank(
        &self,
        tx: &WriteTransaction,
        parent_id: &str,
    ) -> Result<f64, NodeServiceError> {
        let mut stmt = tx
            .connection()
            .prepare("SELECT MAX(rank) FROM node_children WHERE parent_id = ?")
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
        let mut rows = stmt
            .query([parent_id])
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;

        let max_rank: Option<f64> = match rows
            .next()
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?
        {
            Some(row) => row.get(0).ok(),
            None => None,
        };

        Ok(RankCalculator::between(max_rank, None))
    }

    /// Children of a parent as `(id, rank, version)` triples from a single
    /// statement, so ranks and OCC versions come from one snapshot
    async fn child_ranks_with_versions(
        &self,
        parent_id: &str,
    ) -> Result<Vec<(String, f64, i64)>, NodeServiceError> {
        let conn = self.db.connect_with_timeout().await?;
        let mut stmt = conn
            .prepare(
                "SELECT c.child_id, c.rank, n.version
                 FROM node_children c JOIN nodes n ON n.id = c.child_id
                 WHERE c.parent_id = ? ORDER BY c.rank ASC",
            )
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
        let mut rows = stmt
            .query([parent_id])
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;

        let mut children = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?
        {
            let child_id: String = row
                .get(0)
                .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
            let rank: f64 = row
                .get(1)
                .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
            let version: i64 = row
                .get(2)
                .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
            children.push((child_id, rank, version));
        }
        Ok(children)
    }

    /// Children of a parent as `(id, rank)` pairs in rank order
    async fn child_ranks(&self, parent_id: &str) -> Result<Vec<(String, f64)>, NodeServiceError> {
        let conn = self.db.connect_with_timeout().await?;
        let mut stmt = conn
            .prepare(
                "SELECT child_id, rank FROM node_children WHERE parent_id = ? ORDER BY rank ASC",
            )
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
        let mut rows = stmt
            .query([parent_id])
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;

        let mut children = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?
        {
            let child_id: String = row
                .get(0)
                .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
            let rank: f64 = row
                .get(1)
                .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
            children.push((child_id, rank));
        }
        Ok(children)
    }

    /// Apply a mention diff inside the given transaction
    ///
    /// Added edges are inserted only when the target row exists; a
    /// reference to a not-yet-persisted node is the coordinator's deferral
    /// case, not a storage error.
    async fn apply_mention_diff(
        &self,
        tx: &WriteTransaction,
        source_id: &str,
        added: &[String],
        removed: &[String],
    ) -> Result<(), NodeServiceError> {
        for target in added {
            if target == source_id {
                continue;
            }
            tx.connection()
                .execute(
                    "INSERT OR IGNORE INTO node_mentions (node_id, mentions_node_id)
                     SELECT ?, id FROM nodes WHERE id = ?",
                    (source_id, target.as_str()),
                )
                .await
                .map_err(|e| crate::db::DatabaseError::from_libsql("insert mention", e))?;
        }

        for target in removed {
            tx.connection()
                .execute(
                    "DELETE FROM node_mentions WHERE node_id = ? AND mentions_node_id = ?",
                    (source_id, target.as_str()),
                )
                .await
                .map_err(|e| crate::db::DatabaseError::from_libsql("delete mention", e))?;
        }

        Ok(())
    }

    /// Outgoing mention targets of a node
    async fn mention_targets(
        &self,
        conn: &libsql::Connection,
        node_id: &str,
    ) -> Result<Vec<String>, NodeServiceError> {
        self.collect_ids(
            conn,
            "SELECT mentions_node_id FROM node_mentions WHERE node_id = ?",
            node_id,
        )
        .await
    }

    /// Incoming mention sources (backlinks) of a node
    async fn mention_sources(
        &self,
        conn: &libsql::Connection,
        node_id: &str,
    ) -> Result<Vec<String>, NodeServiceError> {
        self.collect_ids(
            conn,
            "SELECT node_id FROM node_mentions WHERE mentions_node_id = ?",
            node_id,
        )
        .await
    }

    async fn collect_ids(
        &self,
        conn: &libsql::Connection,
        sql: &str,
        param: &str,
    ) -> Result<Vec<String>, NodeServiceError> {
        let mut stmt = conn
            .prepare(sql)
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
        let mut rows = stmt
            .query([param])
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn collect_rows(
        &self,
        conn: &libsql::Connection,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Node>, NodeServiceError> {
        let mut stmt = conn
            .prepare(sql)
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
        let mut rows = stmt
            .query(params)
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;

        let mut nodes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?
        {
            nodes.push(row_to_node(&row)?);
        }
        Ok(nodes)
    }
}

/// The parent a node's ordering edge is keyed under: its parent when it
/// has one, otherwise its container (top-level nodes order under the
/// container). Containers themselves have no ordering edge.
fn ordering_parent(node: &Node) -> Option<String> {
    node.parent_id
        .clone()
        .or_else(|| node.container_node_id.clone())
}

/// Rank for inserting at `position` among `siblings` (None = append)
fn rank_at_position(siblings: &[(String, f64)], position: Option<usize>) -> f64 {
    let index = position.unwrap_or(siblings.len()).min(siblings.len());
    let prev = index.checked_sub(1).map(|i| siblings[i].1);
    let next = siblings.get(index).map(|(_, rank)| *rank);
    RankCalculator::between(prev, next)
}

/// Convert a database row (NODE_COLUMNS order) into a Node
fn row_to_node(row: &libsql::Row) -> Result<Node, NodeServiceError> {
    let id: String = row
        .get(0)
        .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
    let node_type: String = row
        .get(1)
        .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
    let content: String = row
        .get(2)
        .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
    let parent_id: Option<String> = row
        .get(3)
        .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
    let container_node_id: Option<String> = row
        .get(4)
        .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
    let version: i64 = row
        .get(5)
        .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
    let created_at: String = row
        .get(6)
        .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
    let modified_at: String = row
        .get(7)
        .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
    let properties: String = row
        .get(8)
        .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;

    Ok(Node {
        id,
        node_type,
        content,
        parent_id,
        container_node_id,
        version,
        created_at: parse_timestamp(&created_at).map_err(NodeServiceError::serialization_error)?,
        modified_at: parse_timestamp(&modified_at)
            .map_err(NodeServiceError::serialization_error)?,
        properties: serde_json::from_str(&properties)
            .map_err(|e| NodeServiceError::serialization_error(e.to_string()))?,
        mentions: Vec::new(),
        mentioned_by: Vec::new(),
        persistence_state: PersistenceState::Persisted,
    })
}
