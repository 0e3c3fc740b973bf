//! Structured node queries
//!
//! A [`NodeQuery`] is a record of optional criteria. At most one lookup path
//! is taken, earlier paths overriding later ones:
//!
//! 1. `id` - direct lookup
//! 2. `mentioned_by` - join on mention edges
//! 3. `content_contains` (optionally combined with `node_type`) - substring filter
//! 4. `node_type` - type filter
//! 5. `include_containers_and_tasks` alone - filter-only query
//! 6. empty query - empty result
//!
//! The `include_containers_and_tasks` flag combines with whichever path was
//! taken: it adds the predicate `(node_type = 'task' OR container_node_id
//! IS NULL)`, so tasks are always included even when a `node_type` filter
//! names a different type.

use serde::Deserialize;

/// Structured query accepted by `NodeService::query_nodes`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeQuery {
    /// Direct lookup by node ID (highest priority)
    pub id: Option<String>,

    /// Filter by node type
    pub node_type: Option<String>,

    /// Case-insensitive content substring match
    pub content_contains: Option<String>,

    /// Nodes that mention the given node ID (backlink join)
    pub mentioned_by: Option<String>,

    /// Restrict results to containers and task nodes
    #[serde(default)]
    pub include_containers_and_tasks: bool,

    /// Maximum number of results
    pub limit: Option<usize>,
}

impl NodeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_node_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }

    pub fn with_content_contains(mut self, needle: impl Into<String>) -> Self {
        self.content_contains = Some(needle.into());
        self
    }

    pub fn with_mentioned_by(mut self, node_id: impl Into<String>) -> Self {
        self.mentioned_by = Some(node_id.into());
        self
    }

    pub fn containers_and_tasks(mut self) -> Self {
        self.include_containers_and_tasks = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether no criteria are set at all (yields an empty result)
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.node_type.is_none()
            && self.content_contains.is_none()
            && self.mentioned_by.is_none()
            && !self.include_containers_and_tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_query_is_empty() {
        assert!(NodeQuery::new().is_empty());
    }

    #[test]
    fn test_flag_alone_is_not_empty() {
        assert!(!NodeQuery::new().containers_and_tasks().is_empty());
    }

    #[test]
    fn test_builder_chains() {
        let q = NodeQuery::new()
            .with_node_type("task")
            .with_content_contains("report")
            .with_limit(10);
        assert_eq!(q.node_type.as_deref(), Some("task"));
        assert_eq!(q.content_contains.as_deref(), Some("report"));
        assert_eq!(q.limit, Some(10));
    }

    #[test]
    fn test_deserializes_from_json() {
        let q: NodeQuery = serde_json::from_str(
            r#"{"node_type": "task", "include_containers_and_tasks": true}"#,
        )
        .unwrap();
        assert_eq!(q.node_type.as_deref(), Some("task"));
        assert!(q.include_containers_and_tasks);
    }
}
