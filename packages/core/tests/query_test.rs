//! Structured query integration tests
//!
//! The query record takes at most one lookup path, in priority order:
//! id, mentioned_by, content (with optional type), type, filter-only.
//! The containers-and-tasks flag combines with every path and always
//! lets task nodes through.

use nodespace_core::db::DatabaseService;
use nodespace_core::models::{Node, NodeQuery};
use nodespace_core::services::NodeService;
use serde_json::json;
use tempfile::TempDir;

async fn setup() -> (NodeService, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = DatabaseService::new(db_path).await.unwrap();
    let service = NodeService::new(db);

    // A small workspace: one date container with a task and a note, plus
    // a standalone document container.
    let date = service.get_or_create_date_node("2026-04-01").await.unwrap();
    service
        .create_node(Node::new_with_id(
            "task-1".to_string(),
            "task".to_string(),
            "ship the quarterly report".to_string(),
            Some(date.id.clone()),
            json!({ "status": "OPEN" }),
        ))
        .await
        .unwrap();
    service
        .create_node(Node::new_with_id(
            "note-1".to_string(),
            "text".to_string(),
            "meeting notes about the report".to_string(),
            Some(date.id.clone()),
            json!({}),
        ))
        .await
        .unwrap();
    service
        .create_node(Node::new_with_id(
            "doc-1".to_string(),
            "text".to_string(),
            "Project Plan".to_string(),
            None,
            json!({}),
        ))
        .await
        .unwrap();

    (service, temp_dir)
}

fn ids(nodes: Vec<Node>) -> Vec<String> {
    let mut ids: Vec<String> = nodes.into_iter().map(|n| n.id).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_empty_query_returns_nothing() {
    let (service, _tmp) = setup().await;
    let nodes = service.query_nodes(NodeQuery::new()).await.unwrap();
    assert!(nodes.is_empty());
}

#[tokio::test]
async fn test_id_lookup_overrides_other_criteria() {
    let (service, _tmp) = setup().await;
    let nodes = service
        .query_nodes(
            NodeQuery::new()
                .with_id("task-1")
                .with_node_type("text")
                .with_content_contains("nothing like this"),
        )
        .await
        .unwrap();
    assert_eq!(ids(nodes), vec!["task-1"]);
}

#[tokio::test]
async fn test_content_filter_matches_substring() {
    let (service, _tmp) = setup().await;
    let nodes = service
        .query_nodes(NodeQuery::new().with_content_contains("report"))
        .await
        .unwrap();
    assert_eq!(ids(nodes), vec!["note-1", "task-1"]);
}

#[tokio::test]
async fn test_content_filter_combines_with_type() {
    let (service, _tmp) = setup().await;
    let nodes = service
        .query_nodes(
            NodeQuery::new()
                .with_content_contains("report")
                .with_node_type("text"),
        )
        .await
        .unwrap();
    // Tasks are never excluded by the type clause in combined queries.
    assert_eq!(ids(nodes), vec!["note-1", "task-1"]);
}

#[tokio::test]
async fn test_type_filter() {
    let (service, _tmp) = setup().await;
    let nodes = service
        .query_nodes(NodeQuery::new().with_node_type("task"))
        .await
        .unwrap();
    assert_eq!(ids(nodes), vec!["task-1"]);
}

#[tokio::test]
async fn test_filter_only_containers_and_tasks() {
    let (service, _tmp) = setup().await;
    let nodes = service
        .query_nodes(NodeQuery::new().containers_and_tasks())
        .await
        .unwrap();
    // The date container, the standalone document, and the task - but not
    // the plain note living inside the container.
    assert_eq!(ids(nodes), vec!["2026-04-01", "doc-1", "task-1"]);
}

#[tokio::test]
async fn test_type_filter_with_flag_keeps_tasks() {
    let (service, _tmp) = setup().await;
    let nodes = service
        .query_nodes(NodeQuery::new().with_node_type("text").containers_and_tasks())
        .await
        .unwrap();
    // Text containers plus every task, even though the filter names text.
    assert_eq!(ids(nodes), vec!["doc-1", "task-1"]);
}

#[tokio::test]
async fn test_limit_caps_results() {
    let (service, _tmp) = setup().await;
    let nodes = service
        .query_nodes(NodeQuery::new().with_content_contains("report").with_limit(1))
        .await
        .unwrap();
    assert_eq!(nodes.len(), 1);
}
