//! Open batch registry.

use super::{Batch, BatchKey, BatchState, PendingRequest};
use crate::balancer::Endpoint;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Result of adding a request to the open batches
#[derive(Debug)]
pub enum JoinOutcome {
    /// The request waits in an open batch
    Queued {
        batch_id: u64,
        /// Whether the request opened a new batch
        created: bool,
        flush_deadline: Instant,
    },
    /// The request filled the batch; it left the registry and must flush
    Full(Batch),
    /// The manager is closed; the entry is handed back untouched
    Rejected(PendingRequest),
}

/// Owns every open batch, keyed by endpoint, model and compatibility tag.
///
/// Each key holds at most one open batch. A batch leaves the registry
/// exactly once: when it fills up, when its timer fires, or on drain.
#[derive(Debug)]
pub struct BatchManager {
    open: DashMap<BatchKey, Batch>,
    next_id: AtomicU64,
    max_wait: Duration,
    closed: AtomicBool,
}

impl BatchManager {
    /// Create a manager whose batches wait at most `max_wait`
    pub fn new(max_wait: Duration) -> Self {
        Self {
            open: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_wait,
            closed: AtomicBool::new(false),
        }
    }

    /// Append a request to the open batch for `key`, creating it if needed
    pub(crate) fn join(
        &self,
        key: BatchKey,
        endpoint: &Arc<Endpoint>,
        max_size: usize,
        entry: PendingRequest,
    ) -> JoinOutcome {
        match self.open.entry(key) {
            Entry::Occupied(mut slot) => {
                if self.is_closed() {
                    return JoinOutcome::Rejected(entry);
                }
                slot.get_mut().push(entry);
                if slot.get().is_full() {
                    let mut batch = slot.remove();
                    batch.set_state(BatchState::Flushing);
                    return JoinOutcome::Full(batch);
                }
                JoinOutcome::Queued {
                    batch_id: slot.get().id(),
                    created: false,
                    flush_deadline: slot.get().flush_deadline(),
                }
            }
            Entry::Vacant(slot) => {
                if self.is_closed() {
                    return JoinOutcome::Rejected(entry);
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let mut batch = Batch::new(
                    id,
                    slot.key().clone(),
                    Arc::clone(endpoint),
                    max_size,
                    self.max_wait,
                );
                batch.push(entry);
                if batch.is_full() {
                    batch.set_state(BatchState::Flushing);
                    return JoinOutcome::Full(batch);
                }
                let flush_deadline = batch.flush_deadline();
                slot.insert(batch);
                JoinOutcome::Queued {
                    batch_id: id,
                    created: true,
                    flush_deadline,
                }
            }
        }
    }

    /// Remove a request from its still-open batch.
    ///
    /// Returns `None` when the batch has already flushed. An emptied batch
    /// leaves the registry; its timer then finds nothing to flush.
    pub(crate) fn cancel(
        &self,
        key: &BatchKey,
        batch_id: u64,
        request_id: uuid::Uuid,
    ) -> Option<PendingRequest> {
        match self.open.entry(key.clone()) {
            Entry::Occupied(mut slot) if slot.get().id() == batch_id => {
                let entry = slot.get_mut().remove(request_id);
                if slot.get().is_empty() {
                    slot.remove();
                }
                entry
            }
            _ => None,
        }
    }

    /// Take the open batch for `key` if it is still batch `batch_id`
    pub fn take_if_id(&self, key: &BatchKey, batch_id: u64) -> Option<Batch> {
        self.open
            .remove_if(key, |_, batch| batch.id() == batch_id)
            .map(|(_, mut batch)| {
                batch.set_state(BatchState::Flushing);
                batch
            })
    }

    /// Take every open batch
    pub fn drain(&self) -> Vec<Batch> {
        let keys: Vec<BatchKey> = self.open.iter().map(|e| e.key().clone()).collect();
        keys.iter()
            .filter_map(|key| self.open.remove(key))
            .map(|(_, mut batch)| {
                batch.set_state(BatchState::Flushing);
                batch
            })
            .collect()
    }

    /// Reject every later join
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether the manager rejects joins
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of open batches
    pub fn open_batches(&self) -> usize {
        self.open.len()
    }

    /// Number of requests waiting in open batches
    pub fn pending_requests(&self) -> usize {
        self.open.iter().map(|e| e.len()).sum()
    }
}
