//! Persistence Coordinator
//!
//! Absorbs UI-side mutation bursts, serializes them into storage-safe
//! operations, and tracks each node's lifecycle state
//! (`ephemeral -> pending -> persisted`).
//!
//! # Mutation classification
//!
//! | Mutation | Policy |
//! |---|---|
//! | Content/property edits (typing) | Debounced, trailing (default 500 ms) |
//! | Structural edits (move, reorder, delete) | Immediate |
//! | Bulk pattern conversions | Batched (default 2000 ms window) |
//! | Anything referencing an ephemeral target | Deferred until the target persists |
//!
//! # Rules
//!
//! - The write verb (INSERT vs OCC UPDATE) is chosen from the tracked
//!   lifecycle state, never from the presence of an id. Conflating the two
//!   turns updates into creates and surfaces as `UniqueViolation`.
//! - One pending operation per node: when debounce and batch timers cover
//!   the same node, the later-firing deadline wins and the patches merge,
//!   so a debounced write never races a batch commit.
//! - Deferred mutations drain FIFO immediately after their target's own
//!   write commits.
//! - Shutdown drains everything it can within a grace period and reports
//!   what it could not, rather than silently dropping it.

use crate::events::{Event, EventBus};
use crate::models::{Node, NodeUpdate, PersistenceState};
use crate::operations::SiblingReorderQueue;
use crate::services::{NodeService, NodeServiceError};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};

/// Coordinator tuning knobs
///
/// The debounce and batch windows are deliberately configurable; the
/// defaults match interactive typing behavior.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Trailing debounce applied to content/property edits
    pub debounce: Duration,

    /// Window for batched bulk conversions
    pub batch_window: Duration,

    /// How long shutdown may spend draining outstanding work
    pub shutdown_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            batch_window: Duration::from_millis(2000),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Coordinator errors
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Work remained unflushed when the shutdown grace period elapsed
    #[error("Unflushed work after shutdown grace period: {node_ids:?}")]
    UnflushedWork { node_ids: Vec<String> },

    /// A mutation referenced a node the coordinator does not track and
    /// storage does not hold
    #[error("Unknown node: {id}")]
    UnknownNode { id: String },

    /// Service-level failure
    #[error(transparent)]
    Service(#[from] NodeServiceError),
}

/// A mutation submitted to the coordinator
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Content edit (typing); debounced
    ContentEdit { node_id: String, content: String },

    /// Property edit; debounced alongside content
    PropertyEdit {
        node_id: String,
        properties: serde_json::Value,
    },

    /// Bulk pattern conversion (e.g. turning `"> "` into a quote block);
    /// batched
    BulkConversion {
        node_id: String,
        node_type: String,
        content: String,
    },

    /// Move to a new parent; immediate
    Move {
        node_id: String,
        new_parent_id: Option<String>,
        position: Option<usize>,
    },

    /// Reorder a parent's children; immediate, OCC-retried
    Reorder {
        parent_id: String,
        order: Vec<String>,
    },

    /// Delete; immediate tombstone write
    Delete { node_id: String },
}

impl Mutation {
    /// The ephemeral-sensitive references of this mutation: if any of these
    /// ids is currently ephemeral, the mutation must be deferred on it.
    fn referenced_ids(&self) -> Vec<&str> {
        match self {
            Mutation::ContentEdit { .. } | Mutation::PropertyEdit { .. } => Vec::new(),
            Mutation::BulkConversion { .. } => Vec::new(),
            Mutation::Move {
                node_id,
                new_parent_id,
                ..
            } => {
                let mut ids = vec![node_id.as_str()];
                if let Some(parent) = new_parent_id {
                    ids.push(parent.as_str());
                }
                ids
            }
            Mutation::Reorder { parent_id, order } => {
                let mut ids = vec![parent_id.as_str()];
                ids.extend(order.iter().map(String::as_str));
                ids
            }
            Mutation::Delete { .. } => Vec::new(),
        }
    }
}

/// Flush latency histogram bucket upper bounds, in milliseconds
const LATENCY_BUCKETS_MS: [u64; 8] = [5, 10, 25, 50, 100, 250, 500, 1000];

/// Read-only snapshot of coordinator counters
#[derive(Debug, Clone, serde::Serialize)]
pub struct CoordinatorMetrics {
    /// Nodes currently in the pending state
    pub pending_count: usize,
    /// Nodes with an open batch window
    pub batches_open: usize,
    /// Mutations parked on ephemeral targets
    pub deferred_count: usize,
    /// OCC retries performed by the reorder queue
    pub occ_retries_total: u64,
    /// Flushes completed
    pub flushes_total: u64,
    /// Flush latency histogram: counts per bucket in
    /// [`LATENCY_BUCKETS_MS`], with a final overflow bucket
    pub flush_latency_buckets: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingClass {
    Debounce,
    Batch,
}

struct PendingWrite {
    update: NodeUpdate,
    class: PendingClass,
    deadline: Instant,
}

struct TrackedNode {
    /// In-memory truth, patches applied as they arrive
    node: Node,
    state: PersistenceState,
    /// Whether storage holds a row for this node. The write verb is chosen
    /// from this, never from id presence.
    stored: bool,
    pending: Option<PendingWrite>,
    /// Bumped on every (re)schedule; stale timers compare and no-op
    generation: u64,
}

#[derive(Default)]
struct CoordState {
    nodes: HashMap<String, TrackedNode>,
    deferred: HashMap<String, VecDeque<Mutation>>,
}

struct CoordinatorInner {
    service: Arc<NodeService>,
    reorder_queue: SiblingReorderQueue,
    bus: EventBus,
    config: CoordinatorConfig,
    state: Mutex<CoordState>,
    flushes_total: AtomicU64,
    latency_buckets: [AtomicU64; 9],
}

/// Persistence coordinator - see the module docs
#[derive(Clone)]
pub struct PersistenceCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl PersistenceCoordinator {
    pub fn new(service: Arc<NodeService>) -> Self {
        Self::with_config(service, CoordinatorConfig::default())
    }

    pub fn with_config(service: Arc<NodeService>, config: CoordinatorConfig) -> Self {
        let bus = service.event_bus().clone();
        Self {
            inner: Arc::new(CoordinatorInner {
                reorder_queue: SiblingReorderQueue::new(Arc::clone(&service)),
                service,
                bus,
                config,
                state: Mutex::new(CoordState::default()),
                flushes_total: AtomicU64::new(0),
                latency_buckets: Default::default(),
            }),
        }
    }

    /// Track a node that exists only in memory (editor placeholder)
    ///
    /// The node is not written to storage until a content edit arrives and
    /// its debounce window closes.
    pub async fn stage_ephemeral(&self, node: Node) {
        let mut state = self.inner.state.lock().await;
        let id = node.id.clone();
        state.nodes.insert(
            id.clone(),
            TrackedNode {
                node,
                state: PersistenceState::Ephemeral,
                stored: false,
                pending: None,
                generation: 0,
            },
        );
        tracing::debug!(node_id = %id, "Staged ephemeral node");
    }

    /// Lifecycle state of a tracked node (None if untracked)
    pub async fn persistence_state(&self, node_id: &str) -> Option<PersistenceState> {
        let state = self.inner.state.lock().await;
        state.nodes.get(node_id).map(|entry| entry.state)
    }

    /// Submit a mutation; it is classified, scheduled, executed, or
    /// deferred according to the policy table
    ///
    /// Returns an explicitly boxed future (rather than `async fn`) because
    /// this method and `drain_deferred` recursively call one another;
    /// boxing breaks the opaque-type cycle the compiler otherwise can't
    /// resolve.
    pub fn submit(
        &self,
        mutation: Mutation,
    ) -> Pin<Box<dyn Future<Output = Result<(), CoordinatorError>> + Send + '_>> {
        Box::pin(self.submit_inner(mutation))
    }

    async fn submit_inner(&self, mutation: Mutation) -> Result<(), CoordinatorError> {
        // Defer anything that references a still-ephemeral node.
        if let Some(target) = self.ephemeral_reference(&mutation).await {
            let mut state = self.inner.state.lock().await;
            state
                .deferred
                .entry(target.clone())
                .or_default()
                .push_back(mutation);
            drop(state);
            self.inner.bus.emit(Event::coordination(
                "coordination:deferred",
                "persistence-coordinator",
                json!({ "targetId": target }),
            ));
            return Ok(());
        }

        match mutation {
            Mutation::ContentEdit { node_id, content } => {
                let fut: Pin<Box<dyn Future<Output = Result<(), CoordinatorError>> + Send + '_>> =
                    Box::pin(self.schedule_patch(
                        &node_id,
                        NodeUpdate::new().with_content(content),
                        PendingClass::Debounce,
                    ));
                fut.await
            }
            Mutation::PropertyEdit {
                node_id,
                properties,
            } => {
                let fut: Pin<Box<dyn Future<Output = Result<(), CoordinatorError>> + Send + '_>> =
                    Box::pin(self.schedule_patch(
                        &node_id,
                        NodeUpdate::new().with_properties(properties),
                        PendingClass::Debounce,
                    ));
                fut.await
            }
            Mutation::BulkConversion {
                node_id,
                node_type,
                content,
            } => {
                let fut: Pin<Box<dyn Future<Output = Result<(), CoordinatorError>> + Send + '_>> =
                    Box::pin(self.schedule_patch(
                        &node_id,
                        NodeUpdate::new()
                            .with_node_type(node_type)
                            .with_content(content),
                        PendingClass::Batch,
                    ));
                fut.await
            }
            Mutation::Move {
                node_id,
                new_parent_id,
                position,
            } => {
                let version = self
                    .inner
                    .service
                    .move_node(&node_id, new_parent_id.as_deref(), position)
                    .await?;
                let mut state = self.inner.state.lock().await;
                if let Some(entry) = state.nodes.get_mut(&node_id) {
                    entry.node.version = version;
                    entry.node.parent_id = new_parent_id;
                }
                Ok(())
            }
            Mutation::Reorder { parent_id, order } => {
                self.inner
                    .reorder_queue
                    .reorder_with_retry(&parent_id, &order)
                    .await?;
                // Reorders bump child versions in storage; refresh tracked
                // versions so later debounced updates carry fresh OCC tokens.
                let mut state = self.inner.state.lock().await;
                for child_id in &order {
                    if let Some(entry) = state.nodes.get_mut(child_id) {
                        if entry.stored {
                            if let Ok(Some(node)) = self.inner.service.get_node(child_id).await {
                                entry.node.version = node.version;
                            }
                        }
                    }
                }
                Ok(())
            }
            Mutation::Delete { node_id } => {
                let mut state = self.inner.state.lock().await;
                let stored = state
                    .nodes
                    .get(&node_id)
                    .map(|entry| entry.stored)
                    .unwrap_or(true);
                state.nodes.remove(&node_id);
                drop(state);

                if stored {
                    self.inner.service.delete_node(&node_id).await?;
                }
                Ok(())
            }
        }
    }

    /// Force-flush one node's pending write now
    pub async fn flush_node(&self, node_id: &str) -> Result<(), CoordinatorError> {
        self.execute_flush(node_id).await
    }

    /// Flush every pending write immediately
    pub async fn flush_all(&self) -> Result<(), CoordinatorError> {
        let ids: Vec<String> = {
            let state = self.inner.state.lock().await;
            state
                .nodes
                .iter()
                .filter(|(_, entry)| entry.pending.is_some())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.execute_flush(&id).await?;
        }
        Ok(())
    }

    /// Graceful shutdown: drain pending, batched, and deferred work
    ///
    /// Work that cannot complete within the configured grace period - or
    /// deferred mutations whose targets never left the ephemeral state -
    /// is reported in `UnflushedWork`, never silently dropped.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        let grace = self.inner.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, self.flush_all()).await;

        match drained {
            Ok(result) => result?,
            Err(_) => {
                let state = self.inner.state.lock().await;
                let node_ids: Vec<String> = state
                    .nodes
                    .iter()
                    .filter(|(_, entry)| entry.pending.is_some())
                    .map(|(id, _)| id.clone())
                    .collect();
                return Err(CoordinatorError::UnflushedWork { node_ids });
            }
        }

        {
            let state = self.inner.state.lock().await;
            if !state.deferred.is_empty() {
                let node_ids: Vec<String> = state.deferred.keys().cloned().collect();
                return Err(CoordinatorError::UnflushedWork { node_ids });
            }
        }

        // Flush the WAL so nothing committed lingers only in the sidecar.
        self.inner.service.database().checkpoint().await.map_err(|e| {
            CoordinatorError::Service(NodeServiceError::DatabaseError(e))
        })?;

        Ok(())
    }

    /// Counter snapshot; also emitted as `coordination:*` events on flush
    pub async fn metrics(&self) -> CoordinatorMetrics {
        let state = self.inner.state.lock().await;
        let pending_count = state
            .nodes
            .values()
            .filter(|entry| entry.state == PersistenceState::Pending)
            .count();
        let batches_open = state
            .nodes
            .values()
            .filter(|entry| {
                entry
                    .pending
                    .as_ref()
                    .map(|p| p.class == PendingClass::Batch)
                    .unwrap_or(false)
            })
            .count();
        let deferred_count = state.deferred.values().map(VecDeque::len).sum();

        CoordinatorMetrics {
            pending_count,
            batches_open,
            deferred_count,
            occ_retries_total: self.inner.reorder_queue.retries_total(),
            flushes_total: self.inner.flushes_total.load(Ordering::Relaxed),
            flush_latency_buckets: self
                .inner
                .latency_buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// First referenced id that is currently ephemeral, if any
    async fn ephemeral_reference(&self, mutation: &Mutation) -> Option<String> {
        let state = self.inner.state.lock().await;
        for id in mutation.referenced_ids() {
            if let Some(entry) = state.nodes.get(id) {
                if entry.state == PersistenceState::Ephemeral {
                    return Some(id.to_string());
                }
            }
        }
        None
    }

    /// Merge a patch into the node's single pending write and (re)arm its
    /// timer
    async fn schedule_patch(
        &self,
        node_id: &str,
        patch: NodeUpdate,
        class: PendingClass,
    ) -> Result<(), CoordinatorError> {
        let mut state = self.inner.state.lock().await;

        if !state.nodes.contains_key(node_id) {
            // Lazily track a node that already lives in storage.
            let node = self
                .inner
                .service
                .get_node(node_id)
                .await?
                .ok_or_else(|| CoordinatorError::UnknownNode {
                    id: node_id.to_string(),
                })?;
            state.nodes.insert(
                node_id.to_string(),
                TrackedNode {
                    node,
                    state: PersistenceState::Persisted,
                    stored: true,
                    pending: None,
                    generation: 0,
                },
            );
        }

        let Some(entry) = state.nodes.get_mut(node_id) else {
            return Err(CoordinatorError::UnknownNode {
                id: node_id.to_string(),
            });
        };

        // Apply to in-memory truth immediately.
        apply_patch(&mut entry.node, &patch);

        let window = match class {
            PendingClass::Debounce => self.inner.config.debounce,
            PendingClass::Batch => self.inner.config.batch_window,
        };
        let new_deadline = Instant::now() + window;

        match entry.pending.as_mut() {
            Some(pending) => {
                // One pending op per node: merge, later-firing deadline wins.
                pending.update.merge(patch);
                match (pending.class, class) {
                    // An open batch window is not extended by later members.
                    (PendingClass::Batch, PendingClass::Batch) => {}
                    (PendingClass::Batch, PendingClass::Debounce) => {
                        pending.deadline = pending.deadline.max(new_deadline);
                    }
                    (PendingClass::Debounce, PendingClass::Batch) => {
                        pending.class = PendingClass::Batch;
                        pending.deadline = pending.deadline.max(new_deadline);
                    }
                    // Debounce: trailing, every edit re-arms.
                    (PendingClass::Debounce, PendingClass::Debounce) => {
                        pending.deadline = new_deadline;
                    }
                }
            }
            None => {
                entry.pending = Some(PendingWrite {
                    update: patch,
                    class,
                    deadline: new_deadline,
                });
            }
        }

        entry.state = PersistenceState::Pending;
        entry.generation += 1;
        let generation = entry.generation;
        let deadline = entry
            .pending
            .as_ref()
            .map(|pending| pending.deadline)
            .unwrap_or(new_deadline);
        let id = node_id.to_string();
        drop(state);

        let coordinator = self.clone();
        tokio::spawn(async move {
            sleep_until(deadline).await;
            coordinator.flush_if_current(&id, generation).await;
        });

        Ok(())
    }

    /// Timer callback: flush only if no later schedule superseded this one
    async fn flush_if_current(&self, node_id: &str, generation: u64) {
        {
            let state = self.inner.state.lock().await;
            match state.nodes.get(node_id) {
                Some(entry) if entry.generation == generation && entry.pending.is_some() => {}
                _ => return,
            }
        }
        if let Err(e) = self.execute_flush(node_id).await {
            tracing::error!(node_id = %node_id, error = %e, "Deferred flush failed");
        }
    }

    /// Take a node's pending write and commit it with the right verb
    async fn execute_flush(&self, node_id: &str) -> Result<(), CoordinatorError> {
        let (node, update, stored, version) = {
            let mut state = self.inner.state.lock().await;
            let Some(entry) = state.nodes.get_mut(node_id) else {
                return Ok(());
            };
            let Some(pending) = entry.pending.take() else {
                return Ok(());
            };
            // Invalidate any armed timer for the taken op.
            entry.generation += 1;
            (
                entry.node.clone(),
                pending.update,
                entry.stored,
                entry.node.version,
            )
        };

        let started = Instant::now();

        // The verb comes from the tracked lifecycle, never from the
        // presence of an id.
        let result: Result<i64, NodeServiceError> = if stored {
            self.inner
                .service
                .update_node(node_id, version, update.clone())
                .await
        } else {
            self.inner
                .service
                .create_node(node.clone())
                .await
                .map(|_| node.version)
        };

        let verb = if stored { "update" } else { "create" };

        match result {
            Ok(new_version) => {
                self.record_latency(started.elapsed());
                {
                    let mut state = self.inner.state.lock().await;
                    if let Some(entry) = state.nodes.get_mut(node_id) {
                        entry.stored = true;
                        entry.node.version = new_version;
                        // A newer edit may already have re-entered pending.
                        if entry.pending.is_none() {
                            entry.state = PersistenceState::Persisted;
                        }
                    }
                }

                self.inner.bus.emit(Event::coordination(
                    "coordination:flush",
                    "persistence-coordinator",
                    json!({
                        "id": node_id,
                        "verb": verb,
                        "latencyMs": started.elapsed().as_millis() as u64,
                    }),
                ));

                // The target has a row now; drain its deferred queue FIFO.
                self.drain_deferred(node_id).await;
                Ok(())
            }
            Err(NodeServiceError::VersionConflict {
                actual, current, ..
            }) => {
                self.inner.bus.emit(Event::coordination(
                    "coordination:conflict",
                    "persistence-coordinator",
                    json!({ "id": node_id, "verb": verb, "actual": actual }),
                ));

                // Refresh the OCC token and re-apply the patch once; typing
                // state is last-writer-wins.
                let retry_version = current.as_ref().map(|n| n.version).unwrap_or(actual);
                let retried = self
                    .inner
                    .service
                    .update_node(node_id, retry_version, update)
                    .await;
                match retried {
                    Ok(new_version) => {
                        self.record_latency(started.elapsed());
                        let mut state = self.inner.state.lock().await;
                        if let Some(entry) = state.nodes.get_mut(node_id) {
                            entry.node.version = new_version;
                            if entry.pending.is_none() {
                                entry.state = PersistenceState::Persisted;
                            }
                        }
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!(node_id = %node_id, error = %e, "Flush retry failed");
                        Err(e.into())
                    }
                }
            }
            Err(e) => {
                tracing::error!(node_id = %node_id, verb, error = %e, "Flush failed");
                Err(e.into())
            }
        }
    }

    /// Drain mutations parked on a freshly persisted target, in FIFO order
    async fn drain_deferred(&self, target_id: &str) {
        let queued: Vec<Mutation> = {
            let mut state = self.inner.state.lock().await;
            state
                .deferred
                .remove(target_id)
                .map(|queue| queue.into_iter().collect())
                .unwrap_or_default()
        };

        for mutation in queued {
            if let Err(e) = self.submit(mutation).await {
                tracing::error!(
                    target_id = %target_id,
                    error = %e,
                    "Deferred mutation failed after target persisted"
                );
            }
        }
    }

    fn record_latency(&self, elapsed: Duration) {
        self.inner.flushes_total.fetch_add(1, Ordering::Relaxed);
        let ms = elapsed.as_millis() as u64;
        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.inner.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }
}

/// Apply a patch to the in-memory node
fn apply_patch(node: &mut Node, patch: &NodeUpdate) {
    if let Some(content) = &patch.content {
        node.content = content.clone();
    }
    if let Some(node_type) = &patch.node_type {
        node.node_type = node_type.clone();
    }
    if let Some(properties) = &patch.properties {
        node.properties = properties.clone();
    }
    if let Some(parent_id) = &patch.parent_id {
        node.parent_id = parent_id.clone();
    }
    if let Some(container) = &patch.container_node_id {
        node.container_node_id = container.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseService;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            debounce: Duration::from_millis(50),
            batch_window: Duration::from_millis(150),
            shutdown_grace: Duration::from_secs(2),
        }
    }

    async fn setup() -> (Arc<NodeService>, PersistenceCoordinator, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = DatabaseService::new(db_path).await.unwrap();
        let service = Arc::new(NodeService::new(db));
        let coordinator = PersistenceCoordinator::with_config(Arc::clone(&service), fast_config());
        (service, coordinator, temp_dir)
    }

    async fn persisted_container(service: &NodeService) -> String {
        service
            .get_or_create_date_node("2026-01-10")
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_debounced_edits_coalesce_to_one_write() {
        let (service, coordinator, _tmp) = setup().await;
        let container = persisted_container(&service).await;

        let id = service
            .create_node(Node::new(
                "text".to_string(),
                "start".to_string(),
                Some(container),
                json!({}),
            ))
            .await
            .unwrap();

        for content in ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"] {
            coordinator
                .submit(Mutation::ContentEdit {
                    node_id: id.clone(),
                    content: content.to_string(),
                })
                .await
                .unwrap();
            sleep(Duration::from_millis(2)).await;
        }

        sleep(Duration::from_millis(150)).await;

        // Exactly one storage write: version went 1 -> 2, content is the
        // final edit.
        let node = service.get_node(&id).await.unwrap().unwrap();
        assert_eq!(node.content, "j");
        assert_eq!(node.version, 2);
        assert_eq!(
            coordinator.persistence_state(&id).await,
            Some(PersistenceState::Persisted)
        );
    }

    #[tokio::test]
    async fn test_ephemeral_node_creates_on_flush() {
        let (service, coordinator, _tmp) = setup().await;
        let container = persisted_container(&service).await;

        let node = Node::new(
            "text".to_string(),
            String::new(),
            Some(container),
            json!({}),
        );
        let id = node.id.clone();
        coordinator.stage_ephemeral(node).await;

        assert!(service.get_node(&id).await.unwrap().is_none());
        assert_eq!(
            coordinator.persistence_state(&id).await,
            Some(PersistenceState::Ephemeral)
        );

        coordinator
            .submit(Mutation::ContentEdit {
                node_id: id.clone(),
                content: "now real".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            coordinator.persistence_state(&id).await,
            Some(PersistenceState::Pending)
        );

        sleep(Duration::from_millis(150)).await;

        let stored = service.get_node(&id).await.unwrap().unwrap();
        assert_eq!(stored.content, "now real");
        assert_eq!(stored.version, 1);
        assert_eq!(
            coordinator.persistence_state(&id).await,
            Some(PersistenceState::Persisted)
        );
    }

    #[tokio::test]
    async fn test_persisted_node_updates_not_creates() {
        let (service, coordinator, _tmp) = setup().await;
        let container = persisted_container(&service).await;

        let id = service
            .create_node(Node::new(
                "text".to_string(),
                "original".to_string(),
                Some(container),
                json!({}),
            ))
            .await
            .unwrap();

        // Two rounds of edit + flush; a create verb on the second round
        // would raise UniqueViolation.
        for (round, content) in ["first", "second"].iter().enumerate() {
            coordinator
                .submit(Mutation::ContentEdit {
                    node_id: id.clone(),
                    content: content.to_string(),
                })
                .await
                .unwrap();
            sleep(Duration::from_millis(150)).await;

            let node = service.get_node(&id).await.unwrap().unwrap();
            assert_eq!(node.content, *content);
            assert_eq!(node.version, round as i64 + 2);
        }
    }

    #[tokio::test]
    async fn test_batch_and_debounce_merge_to_single_write() {
        let (service, coordinator, _tmp) = setup().await;
        let container = persisted_container(&service).await;

        let id = service
            .create_node(Node::new(
                "text".to_string(),
                "plain".to_string(),
                Some(container),
                json!({}),
            ))
            .await
            .unwrap();

        coordinator
            .submit(Mutation::ContentEdit {
                node_id: id.clone(),
                content: "> quoted".to_string(),
            })
            .await
            .unwrap();
        coordinator
            .submit(Mutation::BulkConversion {
                node_id: id.clone(),
                node_type: "quote-block".to_string(),
                content: "> quoted".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(coordinator.metrics().await.batches_open, 1);

        sleep(Duration::from_millis(250)).await;

        // The later-firing batch observed and merged the debounced edit:
        // one write carrying both fields.
        let node = service.get_node(&id).await.unwrap().unwrap();
        assert_eq!(node.node_type, "quote-block");
        assert_eq!(node.content, "> quoted");
        assert_eq!(node.version, 2);
    }

    #[tokio::test]
    async fn test_reference_to_ephemeral_is_deferred_then_drained() {
        let (service, coordinator, _tmp) = setup().await;
        let container = persisted_container(&service).await;

        let a = service
            .create_node(Node::new(
                "text".to_string(),
                "A".to_string(),
                Some(container.clone()),
                json!({}),
            ))
            .await
            .unwrap();

        let placeholder = Node::new(
            "text".to_string(),
            String::new(),
            Some(container.clone()),
            json!({}),
        );
        let p = placeholder.id.clone();
        coordinator.stage_ephemeral(placeholder).await;

        // A reorder that names the ephemeral node must park, not error.
        coordinator
            .submit(Mutation::Reorder {
                parent_id: container.clone(),
                order: vec![p.clone(), a.clone()],
            })
            .await
            .unwrap();
        assert_eq!(coordinator.metrics().await.deferred_count, 1);

        // Content arrives; the placeholder persists and the queue drains.
        coordinator
            .submit(Mutation::ContentEdit {
                node_id: p.clone(),
                content: "P".to_string(),
            })
            .await
            .unwrap();
        sleep(Duration::from_millis(200)).await;

        assert_eq!(coordinator.metrics().await.deferred_count, 0);
        let children = service.get_children(&container).await.unwrap();
        let order: Vec<String> = children.into_iter().map(|n| n.id).collect();
        assert_eq!(order, vec![p, a]);
    }

    #[tokio::test]
    async fn test_structural_edits_are_immediate() {
        let (service, coordinator, _tmp) = setup().await;
        let container = persisted_container(&service).await;

        let a = service
            .create_node(Node::new(
                "text".to_string(),
                "A".to_string(),
                Some(container.clone()),
                json!({}),
            ))
            .await
            .unwrap();
        let b = service
            .create_node(Node::new(
                "text".to_string(),
                "B".to_string(),
                Some(container.clone()),
                json!({}),
            ))
            .await
            .unwrap();

        coordinator
            .submit(Mutation::Reorder {
                parent_id: container.clone(),
                order: vec![b.clone(), a.clone()],
            })
            .await
            .unwrap();

        // No timer wait: the order is already visible.
        let children = service.get_children(&container).await.unwrap();
        let order: Vec<String> = children.into_iter().map(|n| n.id).collect();
        assert_eq!(order, vec![b, a]);
    }

    #[tokio::test]
    async fn test_delete_of_ephemeral_never_touches_storage() {
        let (service, coordinator, _tmp) = setup().await;
        let container = persisted_container(&service).await;

        let placeholder = Node::new(
            "text".to_string(),
            String::new(),
            Some(container),
            json!({}),
        );
        let id = placeholder.id.clone();
        coordinator.stage_ephemeral(placeholder).await;

        coordinator
            .submit(Mutation::Delete {
                node_id: id.clone(),
            })
            .await
            .unwrap();

        assert_eq!(coordinator.persistence_state(&id).await, None);
        assert!(service.get_node(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_work() {
        let (service, coordinator, _tmp) = setup().await;
        let container = persisted_container(&service).await;

        let id = service
            .create_node(Node::new(
                "text".to_string(),
                "before".to_string(),
                Some(container),
                json!({}),
            ))
            .await
            .unwrap();

        coordinator
            .submit(Mutation::ContentEdit {
                node_id: id.clone(),
                content: "after".to_string(),
            })
            .await
            .unwrap();

        // Shut down well inside the debounce window; the write must land
        // anyway.
        coordinator.shutdown().await.unwrap();

        let node = service.get_node(&id).await.unwrap().unwrap();
        assert_eq!(node.content, "after");
    }

    #[tokio::test]
    async fn test_shutdown_reports_undrainable_deferred_work() {
        let (service, coordinator, _tmp) = setup().await;
        let container = persisted_container(&service).await;

        let placeholder = Node::new(
            "text".to_string(),
            String::new(),
            Some(container.clone()),
            json!({}),
        );
        let p = placeholder.id.clone();
        coordinator.stage_ephemeral(placeholder).await;

        coordinator
            .submit(Mutation::Move {
                node_id: p.clone(),
                new_parent_id: Some(container),
                position: None,
            })
            .await
            .unwrap();

        let result = coordinator.shutdown().await;
        match result {
            Err(CoordinatorError::UnflushedWork { node_ids }) => {
                assert_eq!(node_ids, vec![p]);
            }
            other => panic!("expected UnflushedWork, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_metrics_track_pending_and_flushes() {
        let (service, coordinator, _tmp) = setup().await;
        let container = persisted_container(&service).await;

        let id = service
            .create_node(Node::new(
                "text".to_string(),
                "x".to_string(),
                Some(container),
                json!({}),
            ))
            .await
            .unwrap();

        coordinator
            .submit(Mutation::ContentEdit {
                node_id: id,
                content: "y".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(coordinator.metrics().await.pending_count, 1);

        sleep(Duration::from_millis(150)).await;

        let metrics = coordinator.metrics().await;
        assert_eq!(metrics.pending_count, 0);
        assert_eq!(metrics.flushes_total, 1);
        let histogram_total: u64 = metrics.flush_latency_buckets.iter().sum();
        assert_eq!(histogram_total, 1);
    }
}
