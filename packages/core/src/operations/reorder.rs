//! Sibling reorder with retry logic for optimistic concurrency control
//!
//! Wraps `NodeService::reorder_siblings` in a bounded retry loop. Each
//! attempt re-reads the current children and re-derives the rank updates,
//! so a retry after a lost OCC race applies the caller's *intent* (the
//! target permutation) against fresh state rather than replaying stale
//! rank keys.
//!
//! Backoff is exponential with mandatory uniform jitter. Without jitter,
//! concurrent retriers wake in lock-step and collide again; under ~4-way
//! contention the success rate collapses.

use crate::services::{NodeService, NodeServiceError};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Duration;

/// Tuning for the reorder retry loop
#[derive(Debug, Clone, Copy)]
pub struct ReorderRetryConfig {
    /// Maximum attempts before the conflict is surfaced (first try included)
    pub max_attempts: usize,

    /// Base backoff; attempt `n` waits `base * 2^n` plus jitter
    pub base_backoff: Duration,
}

impl Default for ReorderRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
        }
    }
}

/// Queue for sibling reorder operations with automatic retry on version
/// conflicts
pub struct SiblingReorderQueue {
    service: Arc<NodeService>,
    config: ReorderRetryConfig,
    retries_total: AtomicU64,
}

impl SiblingReorderQueue {
    pub fn new(service: Arc<NodeService>) -> Self {
        Self::with_config(service, ReorderRetryConfig::default())
    }

    pub fn with_config(service: Arc<NodeService>, config: ReorderRetryConfig) -> Self {
        Self {
            service,
            config,
            retries_total: AtomicU64::new(0),
        }
    }

    /// Total OCC retries performed across all reorder calls
    pub fn retries_total(&self) -> u64 {
        self.retries_total.load(Ordering::Relaxed)
    }

    /// Reorder a parent's children to `target_order`, retrying on version
    /// conflicts
    ///
    /// # Retry Behavior
    ///
    /// - retries on `VersionConflict` only; other errors fail immediately
    /// - each attempt re-reads children and re-derives the minimal rank
    ///   update set
    /// - backoff: `base * 2^attempt` plus uniform jitter in `[0, half)`
    /// - after `max_attempts`, the conflict is surfaced with the latest
    ///   observed state attached
    pub async fn reorder_with_retry(
        &self,
        parent_id: &str,
        target_order: &[String],
    ) -> Result<(), NodeServiceError> {
        let mut attempt = 0;

        loop {
            match self.service.reorder_siblings(parent_id, target_order).await {
                Ok(()) => {
                    if attempt > 0 {
                        tracing::debug!(
                            parent_id = %parent_id,
                            retries = attempt,
                            "Sibling reorder succeeded after retry"
                        );
                    }
                    return Ok(());
                }

                Err(e) if e.is_version_conflict() && attempt + 1 < self.config.max_attempts => {
                    tracing::debug!(
                        parent_id = %parent_id,
                        attempt = attempt + 1,
                        max_attempts = self.config.max_attempts,
                        "Version conflict during reorder, retrying"
                    );
                    self.retries_total.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }

                Err(e) => {
                    if e.is_version_conflict() {
                        tracing::warn!(
                            parent_id = %parent_id,
                            attempts = self.config.max_attempts,
                            "Reorder retry budget exhausted"
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Exponential backoff with uniform jitter in `[0, backoff / 2)`
    fn backoff(&self, attempt: usize) -> Duration {
        let base = self.config.base_backoff.as_millis() as u64;
        let backoff_ms = base.saturating_mul(1u64 << attempt.min(16));
        let half = backoff_ms / 2;
        let jitter = if half > 0 {
            rand::thread_rng().gen_range(0..half)
        } else {
            0
        };
        Duration::from_millis(backoff_ms + jitter)
    }
}
