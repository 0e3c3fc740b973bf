//! MCP node CRUD handlers
//!
//! JSON-RPC methods mapping directly onto the node service:
//! `create_node`, `get_node`, `update_node`, `delete_node`, `query_nodes`.
//! Lifecycle events are emitted by the service itself when the mutations
//! commit, so agents and UI observers see one stream regardless of entry
//! point.

use crate::mcp::handlers::translate_error;
use crate::mcp::types::McpError;
use crate::models::{Node, NodeQuery, NodeUpdate};
use crate::services::NodeService;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Parameters for the `create_node` method
#[derive(Debug, Deserialize)]
pub struct CreateNodeParams {
    /// Explicit id; auto-generated when absent (dates derive from content)
    pub id: Option<String>,
    pub node_type: String,
    pub content: String,
    pub parent_id: Option<String>,
    pub container_node_id: Option<String>,
    #[serde(default = "default_properties")]
    pub properties: Value,
}

fn default_properties() -> Value {
    json!({})
}

/// Parameters for the `get_node` method
#[derive(Debug, Deserialize)]
pub struct GetNodeParams {
    pub id: String,
}

/// Parameters for the `update_node` method
#[derive(Debug, Deserialize)]
pub struct UpdateNodeParams {
    pub id: String,
    /// Expected OCC version (the version the caller read)
    pub version: i64,
    pub content: Option<String>,
    pub node_type: Option<String>,
    pub properties: Option<Value>,
}

/// Parameters for the `delete_node` method
#[derive(Debug, Deserialize)]
pub struct DeleteNodeParams {
    pub id: String,
}

/// Handle `create_node`
pub async fn handle_create_node(
    service: &Arc<NodeService>,
    params: Value,
) -> Result<Value, McpError> {
    let params: CreateNodeParams = serde_json::from_value(params)
        .map_err(|e| McpError::invalid_params(format!("Invalid parameters: {}", e)))?;

    // Date nodes use their YYYY-MM-DD content as a deterministic id.
    let mut node = match params.id {
        Some(id) => Node::new_with_id(
            id,
            params.node_type,
            params.content,
            params.parent_id,
            params.properties,
        ),
        None if params.node_type == "date" => Node::new_with_id(
            params.content.clone(),
            params.node_type,
            params.content,
            params.parent_id,
            params.properties,
        ),
        None => Node::new_in_container(
            params.node_type,
            params.content,
            params.parent_id.clone(),
            params.container_node_id.clone().or(params.parent_id),
            params.properties,
        ),
    };
    if let Some(container) = params.container_node_id {
        node.container_node_id = Some(container);
    }

    let id = service.create_node(node).await.map_err(translate_error)?;
    Ok(json!({ "id": id }))
}

/// Handle `get_node` (read-only)
pub async fn handle_get_node(
    service: &Arc<NodeService>,
    params: Value,
) -> Result<Value, McpError> {
    let params: GetNodeParams = serde_json::from_value(params)
        .map_err(|e| McpError::invalid_params(format!("Invalid parameters: {}", e)))?;

    let node = service
        .get_node(&params.id)
        .await
        .map_err(translate_error)?;

    match node {
        Some(node) => serde_json::to_value(node)
            .map_err(|e| McpError::internal_error(format!("Failed to encode node: {}", e))),
        None => Ok(Value::Null),
    }
}

/// Handle `update_node`
pub async fn handle_update_node(
    service: &Arc<NodeService>,
    params: Value,
) -> Result<Value, McpError> {
    let params: UpdateNodeParams = serde_json::from_value(params)
        .map_err(|e| McpError::invalid_params(format!("Invalid parameters: {}", e)))?;

    let mut update = NodeUpdate::new();
    update.content = params.content;
    update.node_type = params.node_type;
    update.properties = params.properties;

    if update.is_empty() {
        return Err(McpError::invalid_params(
            "update_node requires at least one of content, node_type, properties",
        ));
    }

    let new_version = service
        .update_node(&params.id, params.version, update)
        .await
        .map_err(translate_error)?;

    Ok(json!({ "id": params.id, "version": new_version }))
}

/// Handle `delete_node`
pub async fn handle_delete_node(
    service: &Arc<NodeService>,
    params: Value,
) -> Result<Value, McpError> {
    let params: DeleteNodeParams = serde_json::from_value(params)
        .map_err(|e| McpError::invalid_params(format!("Invalid parameters: {}", e)))?;

    service
        .delete_node(&params.id)
        .await
        .map_err(translate_error)?;

    Ok(json!({ "id": params.id, "deleted": true }))
}

/// Handle `query_nodes`
pub async fn handle_query_nodes(
    service: &Arc<NodeService>,
    params: Value,
) -> Result<Value, McpError> {
    let query: NodeQuery = serde_json::from_value(params)
        .map_err(|e| McpError::invalid_params(format!("Invalid parameters: {}", e)))?;

    let nodes = service.query_nodes(query).await.map_err(translate_error)?;

    serde_json::to_value(json!({ "count": nodes.len(), "nodes": nodes }))
        .map_err(|e| McpError::internal_error(format!("Failed to encode nodes: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseService;
    use crate::mcp::types;
    use tempfile::TempDir;

    async fn setup() -> (Arc<NodeService>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = DatabaseService::new(db_path).await.unwrap();
        (Arc::new(NodeService::new(db)), temp_dir)
    }

    #[tokio::test]
    async fn test_create_and_get_roundtrip() {
        let (service, _tmp) = setup().await;

        let created = handle_create_node(
            &service,
            json!({ "node_type": "text", "content": "hello" }),
        )
        .await
        .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let fetched = handle_get_node(&service, json!({ "id": id })).await.unwrap();
        assert_eq!(fetched["content"], json!("hello"));
        assert_eq!(fetched["version"], json!(1));
        assert_eq!(fetched["persistenceState"], json!("persisted"));
    }

    #[tokio::test]
    async fn test_get_missing_node_returns_null() {
        let (service, _tmp) = setup().await;
        let fetched = handle_get_node(&service, json!({ "id": "ghost" }))
            .await
            .unwrap();
        assert!(fetched.is_null());
    }

    #[tokio::test]
    async fn test_update_increments_version() {
        let (service, _tmp) = setup().await;

        let created = handle_create_node(
            &service,
            json!({ "node_type": "text", "content": "hello" }),
        )
        .await
        .unwrap();
        let id = created["id"].as_str().unwrap();

        let updated = handle_update_node(
            &service,
            json!({ "id": id, "version": 1, "content": "hello world" }),
        )
        .await
        .unwrap();
        assert_eq!(updated["version"], json!(2));

        let fetched = handle_get_node(&service, json!({ "id": id })).await.unwrap();
        assert_eq!(fetched["content"], json!("hello world"));
        assert_eq!(fetched["version"], json!(2));
    }

    #[tokio::test]
    async fn test_stale_version_is_a_conflict() {
        let (service, _tmp) = setup().await;

        let created = handle_create_node(
            &service,
            json!({ "node_type": "text", "content": "hello" }),
        )
        .await
        .unwrap();
        let id = created["id"].as_str().unwrap();

        handle_update_node(&service, json!({ "id": id, "version": 1, "content": "v2" }))
            .await
            .unwrap();

        let error = handle_update_node(&service, json!({ "id": id, "version": 1, "content": "v2b" }))
            .await
            .unwrap_err();
        assert_eq!(error.code, types::VERSION_CONFLICT);

        // No partial write: content is still the committed v2.
        let fetched = handle_get_node(&service, json!({ "id": id })).await.unwrap();
        assert_eq!(fetched["content"], json!("v2"));
    }

    #[tokio::test]
    async fn test_duplicate_create_is_surfaced_not_swallowed() {
        let (service, _tmp) = setup().await;

        handle_create_node(
            &service,
            json!({ "id": "n1", "node_type": "text", "content": "first" }),
        )
        .await
        .unwrap();

        let error = handle_create_node(
            &service,
            json!({ "id": "n1", "node_type": "text", "content": "second" }),
        )
        .await
        .unwrap_err();
        assert_eq!(error.code, types::NODE_EXISTS);

        // The first row is unchanged.
        let fetched = handle_get_node(&service, json!({ "id": "n1" })).await.unwrap();
        assert_eq!(fetched["content"], json!("first"));
    }

    #[tokio::test]
    async fn test_delete_then_get_returns_null() {
        let (service, _tmp) = setup().await;

        handle_create_node(
            &service,
            json!({ "id": "n1", "node_type": "text", "content": "x" }),
        )
        .await
        .unwrap();

        let deleted = handle_delete_node(&service, json!({ "id": "n1" })).await.unwrap();
        assert_eq!(deleted["deleted"], json!(true));

        let fetched = handle_get_node(&service, json!({ "id": "n1" })).await.unwrap();
        assert!(fetched.is_null());
    }

    #[tokio::test]
    async fn test_delete_missing_node_errors() {
        let (service, _tmp) = setup().await;
        let error = handle_delete_node(&service, json!({ "id": "ghost" }))
            .await
            .unwrap_err();
        assert_eq!(error.code, types::NODE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_query_nodes_by_type() {
        let (service, _tmp) = setup().await;

        handle_create_node(&service, json!({ "node_type": "text", "content": "a" }))
            .await
            .unwrap();
        handle_create_node(&service, json!({ "node_type": "header", "content": "# b" }))
            .await
            .unwrap();

        let result = handle_query_nodes(&service, json!({ "node_type": "header" }))
            .await
            .unwrap();
        assert_eq!(result["count"], json!(1));
        assert_eq!(result["nodes"][0]["content"], json!("# b"));
    }

    #[tokio::test]
    async fn test_empty_query_returns_empty() {
        let (service, _tmp) = setup().await;
        handle_create_node(&service, json!({ "node_type": "text", "content": "a" }))
            .await
            .unwrap();

        let result = handle_query_nodes(&service, json!({})).await.unwrap();
        assert_eq!(result["count"], json!(0));
    }

    #[tokio::test]
    async fn test_malformed_params_are_invalid_params() {
        let (service, _tmp) = setup().await;
        let error = handle_create_node(&service, json!({ "content": "missing type" }))
            .await
            .unwrap_err();
        assert_eq!(error.code, types::INVALID_PARAMS);
    }
}
