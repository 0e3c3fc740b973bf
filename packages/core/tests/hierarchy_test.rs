//! Hierarchy integration tests
//!
//! Sibling ordering, moves with position directives, cycle prevention,
//! and the no-op reorder guarantee.

use nodespace_core::db::DatabaseService;
use nodespace_core::models::Node;
use nodespace_core::services::{NodeService, NodeServiceError};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

async fn setup() -> (NodeService, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = DatabaseService::new(db_path).await.unwrap();
    (NodeService::new(db), temp_dir)
}

async fn create_child(service: &NodeService, parent: &str, content: &str) -> String {
    service
        .create_node(Node::new(
            "text".to_string(),
            content.to_string(),
            Some(parent.to_string()),
            json!({}),
        ))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_children_enumerate_in_insertion_order() {
    let (service, _tmp) = setup().await;
    let date = service.get_or_create_date_node("2026-01-01").await.unwrap();

    let a = create_child(&service, &date.id, "a").await;
    let b = create_child(&service, &date.id, "b").await;
    let c = create_child(&service, &date.id, "c").await;

    let children = service.get_children(&date.id).await.unwrap();
    let ids: Vec<String> = children.into_iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![a, b, c]);
}

#[tokio::test]
async fn test_nested_children_inherit_container() {
    let (service, _tmp) = setup().await;
    let date = service.get_or_create_date_node("2026-01-01").await.unwrap();

    let parent = create_child(&service, &date.id, "parent").await;
    let child = create_child(&service, &parent, "child").await;

    let node = service.get_node(&child).await.unwrap().unwrap();
    assert_eq!(node.parent_id.as_deref(), Some(parent.as_str()));
    assert_eq!(node.container_node_id.as_deref(), Some(date.id.as_str()));
}

#[tokio::test]
async fn test_move_node_to_position() {
    let (service, _tmp) = setup().await;
    let date = service.get_or_create_date_node("2026-01-01").await.unwrap();

    let a = create_child(&service, &date.id, "a").await;
    let b = create_child(&service, &date.id, "b").await;
    let parent2 = create_child(&service, &date.id, "section").await;
    let x = create_child(&service, &parent2, "x").await;

    // Move b under section, in front of x.
    let version = service
        .move_node(&b, Some(&parent2), Some(0))
        .await
        .unwrap();
    assert_eq!(version, 2);

    let top: Vec<String> = service
        .get_children(&date.id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(top, vec![a, parent2.clone()]);

    let section: Vec<String> = service
        .get_children(&parent2)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(section, vec![b, x]);
}

#[tokio::test]
async fn test_move_rejects_cycles() {
    let (service, _tmp) = setup().await;
    let date = service.get_or_create_date_node("2026-01-01").await.unwrap();

    let a = create_child(&service, &date.id, "a").await;
    let b = create_child(&service, &a, "b").await;
    let c = create_child(&service, &b, "c").await;

    // a under its own grandchild would close a cycle.
    let error = service.move_node(&a, Some(&c), None).await.unwrap_err();
    assert!(matches!(error, NodeServiceError::CycleWouldOccur { .. }));

    // a under itself is the degenerate case.
    let error = service.move_node(&a, Some(&a), None).await.unwrap_err();
    assert!(matches!(error, NodeServiceError::CycleWouldOccur { .. }));

    // The tree is unchanged.
    let children = service.get_children(&b).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, c);
}

#[tokio::test]
async fn test_reorder_applies_permutation() {
    let (service, _tmp) = setup().await;
    let date = service.get_or_create_date_node("2026-01-01").await.unwrap();

    let a = create_child(&service, &date.id, "a").await;
    let b = create_child(&service, &date.id, "b").await;
    let c = create_child(&service, &date.id, "c").await;

    let target = vec![c.clone(), a.clone(), b.clone()];
    service.reorder_siblings(&date.id, &target).await.unwrap();

    let observed: Vec<String> = service
        .get_children(&date.id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(observed, target);
}

#[tokio::test]
async fn test_reorder_to_current_order_emits_nothing() {
    let (service, _tmp) = setup().await;
    let date = service.get_or_create_date_node("2026-01-01").await.unwrap();

    let a = create_child(&service, &date.id, "a").await;
    let b = create_child(&service, &date.id, "b").await;

    let reorder_events = Arc::new(AtomicU64::new(0));
    let counter = reorder_events.clone();
    service.event_bus().subscribe(
        "children:reordered",
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    service
        .reorder_siblings(&date.id, &[a.clone(), b.clone()])
        .await
        .unwrap();

    tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
    assert_eq!(reorder_events.load(Ordering::SeqCst), 0, "no-op must not emit");

    // Versions untouched: no writes happened.
    assert_eq!(service.get_node(&a).await.unwrap().unwrap().version, 1);
    assert_eq!(service.get_node(&b).await.unwrap().unwrap().version, 1);
}

#[tokio::test]
async fn test_many_front_insertions_keep_strictly_ascending_ranks() {
    let (service, _tmp) = setup().await;
    let date = service.get_or_create_date_node("2026-01-01").await.unwrap();

    // Repeatedly move the newest node to the front; ranks must stay
    // strictly ascending (and renumber when midpoints crowd).
    let mut expected = Vec::new();
    for i in 0..12 {
        let id = create_child(&service, &date.id, &format!("n{}", i)).await;
        service.move_node(&id, None, Some(0)).await.unwrap();
        expected.insert(0, id);
    }

    let observed: Vec<String> = service
        .get_children(&date.id)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(observed, expected);
}

#[tokio::test]
async fn test_delete_cascades_to_descendants() {
    let (service, _tmp) = setup().await;
    let date = service.get_or_create_date_node("2026-01-01").await.unwrap();

    let a = create_child(&service, &date.id, "a").await;
    let b = create_child(&service, &a, "b").await;
    let c = create_child(&service, &b, "c").await;

    service.delete_node(&a).await.unwrap();

    assert!(service.get_node(&a).await.unwrap().is_none());
    assert!(service.get_node(&b).await.unwrap().is_none());
    assert!(service.get_node(&c).await.unwrap().is_none());
    assert!(service.get_children(&date.id).await.unwrap().is_empty());
}
