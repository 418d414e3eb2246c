//! Request batching.
//!
//! Requests routed to the same endpoint for the same model and compatibility
//! tag accumulate in one open [`Batch`]. The [`BatchManager`] owns open
//! batches, the [`BatchScheduler`] decides when they flush and the
//! [`BatchProcessor`] executes flushed batches.

pub mod manager;
pub mod processor;
pub mod scheduler;

pub use manager::{BatchManager, JoinOutcome};
pub use processor::{BatchProcessor, ProcessorConfig};
pub use scheduler::BatchScheduler;

use crate::balancer::{Endpoint, InFlightGuard};
use crate::budget::Reservation;
use crate::error::RelayError;
use crate::router::ProbeTicket;
use crate::types::{Completion, EndpointId, Request};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Requests sharing a key may share a provider call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub endpoint: EndpointId,
    pub model: String,
    pub compat: Option<String>,
}

impl BatchKey {
    /// Key of a request routed to an endpoint
    pub fn new(endpoint: EndpointId, request: &Request) -> Self {
        Self {
            endpoint,
            model: request.model.clone(),
            compat: request.compat.clone(),
        }
    }
}

/// Batch lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Open,
    Flushing,
    Closed,
}

/// Why a batch flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// Reached its maximum size
    Size,
    /// Waited `max_wait` since its first request
    Timer,
    /// Explicit flush or shutdown
    Explicit,
}

impl FlushReason {
    /// Metric tag value
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Timer => "timer",
            FlushReason::Explicit => "explicit",
        }
    }
}

/// Summary of a flushed batch handed to hooks
#[derive(Debug, Clone, Serialize)]
pub struct FlushInfo {
    pub batch_id: u64,
    pub endpoint: EndpointId,
    pub model: String,
    pub size: usize,
    pub reason: FlushReason,
    /// Time between the first request joining and the flush
    pub waited: Duration,
    pub probe: bool,
}

/// Caller-side result channel
pub(crate) type Responder = oneshot::Sender<Result<Completion, RelayError>>;

/// A request waiting in a batch with everything it holds
pub struct PendingRequest {
    pub(crate) request: Request,
    pub(crate) reservations: Vec<Reservation>,
    pub(crate) probe: Option<ProbeTicket>,
    /// Counts the request against its endpoint until settled
    pub(crate) load: InFlightGuard,
    pub(crate) responder: Responder,
}

impl PendingRequest {
    /// The waiting request
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Whether the caller stopped waiting for the result
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }

    /// Release every reservation that was not reconciled
    pub fn release(&self) {
        for reservation in &self.reservations {
            reservation.release();
        }
    }

    /// Reconcile every reservation against actual usage
    pub fn reconcile(&self, actual: u64) {
        for reservation in &self.reservations {
            reservation.reconcile(actual);
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request_id", &self.request.id)
            .field("reservations", &self.reservations.len())
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

/// An accumulating group of same-key requests.
///
/// Entries keep insertion order; provider input order equals that order.
#[derive(Debug)]
pub struct Batch {
    id: u64,
    key: BatchKey,
    endpoint: Arc<Endpoint>,
    entries: Vec<PendingRequest>,
    created_at: Instant,
    max_size: usize,
    max_wait: Duration,
    state: BatchState,
}

impl Batch {
    pub(crate) fn new(
        id: u64,
        key: BatchKey,
        endpoint: Arc<Endpoint>,
        max_size: usize,
        max_wait: Duration,
    ) -> Self {
        Self {
            id,
            key,
            endpoint,
            entries: Vec::with_capacity(max_size.min(64)),
            created_at: Instant::now(),
            max_size: max_size.max(1),
            max_wait,
            state: BatchState::Open,
        }
    }

    /// Batch id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Batch key
    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    /// Target endpoint
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Number of requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch holds no request
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the batch reached its maximum size
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_size
    }

    /// Maximum size snapshot taken at creation
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// When the first request joined
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the batch must flush at the latest
    pub fn flush_deadline(&self) -> Instant {
        self.created_at + self.max_wait
    }

    /// Lifecycle state
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Request ids in insertion order
    pub fn request_ids(&self) -> Vec<uuid::Uuid> {
        self.entries.iter().map(|e| e.request.id).collect()
    }

    pub(crate) fn push(&mut self, entry: PendingRequest) {
        debug_assert!(self.state == BatchState::Open && !self.is_full());
        self.entries.push(entry);
    }

    pub(crate) fn remove(&mut self, request_id: uuid::Uuid) -> Option<PendingRequest> {
        let index = self.entries.iter().position(|e| e.request.id == request_id)?;
        Some(self.entries.remove(index))
    }

    pub(crate) fn set_state(&mut self, state: BatchState) {
        self.state = state;
    }

    pub(crate) fn take_entries(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.entries)
    }
}
