//! Typed Event Bus
//!
//! Decouples mutation from reactive observers. The coordinator and services
//! emit immutable [`Event`] records; observers subscribe by event type (or
//! the `"*"` wildcard), optionally filtered by predicate, with immediate,
//! debounced, or batched delivery.
//!
//! # Delivery contract
//!
//! - Handler invocation is single-threaded per subscriber; delivery order
//!   within an event type is FIFO.
//! - A handler that panics never affects sibling handlers or pending
//!   emissions; the error is counted in bus metrics and swallowed.
//! - Unsubscription removes the handler and cancels any pending
//!   debounce/batch timers without delivering the buffered events.
//!
//! # Event Flow
//!
//! 1. A mutation commits (service or coordinator)
//! 2. An event is emitted on the bus
//! 3. Each matching subscriber receives it on its own channel
//! 4. The subscriber's delivery task applies its debounce/batch policy and
//!    invokes the handler

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};

/// Coarse event grouping used to route and filter events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventNamespace {
    /// Node lifecycle: created, updated, deleted
    Lifecycle,
    /// Coordinator internals: flushes, deferrals, conflicts
    Coordination,
    /// User/agent interaction signals
    Interaction,
    /// Cache invalidation signals
    Cache,
}

impl EventNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventNamespace::Lifecycle => "lifecycle",
            EventNamespace::Coordination => "coordination",
            EventNamespace::Interaction => "interaction",
            EventNamespace::Cache => "cache",
        }
    }
}

/// Immutable event record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event type, e.g. "node:created"
    pub event_type: String,

    /// Namespace grouping
    pub namespace: EventNamespace,

    /// Component that emitted the event, e.g. "node-service"
    pub source: String,

    /// Emission timestamp
    pub timestamp: DateTime<Utc>,

    /// Type-specific payload
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        namespace: EventNamespace,
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            namespace,
            source: source.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Shorthand for a lifecycle event
    pub fn lifecycle(
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(EventNamespace::Lifecycle, event_type, source, payload)
    }

    /// Shorthand for a coordination event
    pub fn coordination(
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(EventNamespace::Coordination, event_type, source, payload)
    }
}

/// Predicate applied to events before delivery to a subscriber
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Handler receiving a single event
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Handler receiving a coalesced batch of events
pub type BatchHandler = Arc<dyn Fn(Vec<Event>) + Send + Sync>;

/// Identifier returned by subscribe calls; pass to `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Read-only snapshot of bus counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BusMetrics {
    /// Events emitted on the bus
    pub emitted_total: u64,
    /// Handler invocations that completed (batches count once)
    pub delivered_total: u64,
    /// Handler panics recorded and swallowed
    pub handler_errors: u64,
    /// Events that could not be enqueued to a subscriber
    pub dropped_total: u64,
}

#[derive(Default)]
struct MetricCells {
    emitted_total: AtomicU64,
    delivered_total: AtomicU64,
    handler_errors: AtomicU64,
    dropped_total: AtomicU64,
}

/// Capacity of the diagnostic history ring buffer
const HISTORY_CAPACITY: usize = 1000;

struct Registration {
    event_type: String,
    filter: Option<EventFilter>,
    tx: mpsc::UnboundedSender<Event>,
}

struct BusInner {
    subscriptions: RwLock<HashMap<u64, Registration>>,
    next_id: AtomicU64,
    history: Mutex<VecDeque<Event>>,
    metrics: MetricCells,
}

/// Typed pub/sub bus with per-subscriber delivery policies
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
                metrics: MetricCells::default(),
            }),
        }
    }

    /// Subscribe to an event type (or `"*"`) with immediate delivery
    pub fn subscribe(&self, event_type: &str, handler: EventHandler) -> SubscriptionId {
        self.subscribe_filtered(event_type, None, handler)
    }

    /// Subscribe with an optional predicate filter and immediate delivery
    pub fn subscribe_filtered(
        &self,
        event_type: &str,
        filter: Option<EventFilter>,
        handler: EventHandler,
    ) -> SubscriptionId {
        let (id, mut rx) = self.register(event_type, filter);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                invoke_single(&inner, &handler, event);
            }
        });
        id
    }

    /// Subscribe with trailing debounce: bursts coalesce to the latest
    /// event, delivered after `delay` of quiet
    pub fn subscribe_debounced(
        &self,
        event_type: &str,
        delay: Duration,
        handler: EventHandler,
    ) -> SubscriptionId {
        let (id, mut rx) = self.register(event_type, None);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut pending: Option<Event> = None;
            let mut deadline = Instant::now();
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(event) => {
                            pending = Some(event);
                            deadline = Instant::now() + delay;
                        }
                        // Unsubscribed: cancel without delivering.
                        None => break,
                    },
                    _ = sleep_until(deadline), if pending.is_some() => {
                        if let Some(event) = pending.take() {
                            invoke_single(&inner, &handler, event);
                        }
                    }
                }
            }
        });
        id
    }

    /// Subscribe with windowed batching: emissions within `window` are
    /// delivered as one list, flushed early when `max_batch` is reached
    pub fn subscribe_batched(
        &self,
        event_type: &str,
        window: Duration,
        max_batch: usize,
        handler: BatchHandler,
    ) -> SubscriptionId {
        let (id, mut rx) = self.register(event_type, None);
        let inner = Arc::clone(&self.inner);
        let max_batch = max_batch.max(1);
        tokio::spawn(async move {
            let mut buffer: Vec<Event> = Vec::new();
            let mut deadline = Instant::now();
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(event) => {
                            if buffer.is_empty() {
                                deadline = Instant::now() + window;
                            }
                            buffer.push(event);
                            if buffer.len() >= max_batch {
                                invoke_batch(&inner, &handler, std::mem::take(&mut buffer));
                            }
                        }
                        // Unsubscribed: cancel without delivering.
                        None => break,
                    },
                    _ = sleep_until(deadline), if !buffer.is_empty() => {
                        invoke_batch(&inner, &handler, std::mem::take(&mut buffer));
                    }
                }
            }
        });
        id
    }

    /// Remove a subscription and cancel its pending timers
    ///
    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Dropping the sender closes the channel; the delivery task exits
        // and discards any buffered debounce/batch state.
        subs.remove(&id.0).is_some()
    }

    /// Emit an event to all matching subscribers
    pub fn emit(&self, event: Event) {
        self.inner.metrics.emitted_total.fetch_add(1, Ordering::Relaxed);

        {
            let mut history = self
                .inner
                .history
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let subs = self
            .inner
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for registration in subs.values() {
            if registration.event_type != "*" && registration.event_type != event.event_type {
                continue;
            }
            if let Some(filter) = &registration.filter {
                if !filter(&event) {
                    continue;
                }
            }
            if registration.tx.send(event.clone()).is_err() {
                self.inner.metrics.dropped_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// The last `k` emitted events, oldest first
    pub fn recent(&self, k: usize) -> Vec<Event> {
        let history = self
            .inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let start = history.len().saturating_sub(k);
        history.iter().skip(start).cloned().collect()
    }

    /// Snapshot of bus counters
    pub fn metrics(&self) -> BusMetrics {
        BusMetrics {
            emitted_total: self.inner.metrics.emitted_total.load(Ordering::Relaxed),
            delivered_total: self.inner.metrics.delivered_total.load(Ordering::Relaxed),
            handler_errors: self.inner.metrics.handler_errors.load(Ordering::Relaxed),
            dropped_total: self.inner.metrics.dropped_total.load(Ordering::Relaxed),
        }
    }

    fn register(
        &self,
        event_type: &str,
        filter: Option<EventFilter>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            event_type: event_type.to_string(),
            filter,
            tx,
        };
        self.inner
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, registration);
        (SubscriptionId(id), rx)
    }
}

fn invoke_single(inner: &Arc<BusInner>, handler: &EventHandler, event: Event) {
    let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
    match result {
        Ok(()) => {
            inner.metrics.delivered_total.fetch_add(1, Ordering::Relaxed);
        }
        Err(_) => {
            inner.metrics.handler_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Event handler panicked; error recorded and swallowed");
        }
    }
}

fn invoke_batch(inner: &Arc<BusInner>, handler: &BatchHandler, events: Vec<Event>) {
    let result = catch_unwind(AssertUnwindSafe(|| handler(events)));
    match result {
        Ok(()) => {
            inner.metrics.delivered_total.fetch_add(1, Ordering::Relaxed);
        }
        Err(_) => {
            inner.metrics.handler_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Batch event handler panicked; error recorded and swallowed");
        }
    }
}
