//! Flush scheduling.
//!
//! Size-triggered flushes happen inline when a join fills a batch. Time
//! triggered flushes use one timer task per batch; a timer whose batch
//! already left the registry does nothing. Every path takes an in-flight
//! slot on the processor before a batch leaves the manager, so shutdown
//! never observes a batch that is in neither place.

use super::manager::BatchManager;
use super::processor::{BatchProcessor, InFlight};
use super::{Batch, BatchKey, FlushReason};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Decides when open batches flush and hands them to the processor
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    manager: Arc<BatchManager>,
    processor: Arc<BatchProcessor>,
}

impl BatchScheduler {
    /// Create a scheduler
    pub fn new(manager: Arc<BatchManager>, processor: Arc<BatchProcessor>) -> Self {
        Self { manager, processor }
    }

    /// Arm the wait timer of a newly opened batch
    pub fn arm(&self, key: BatchKey, batch_id: u64, flush_deadline: Instant) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let processor = Arc::clone(&self.processor);
        tokio::spawn(async move {
            tokio::time::sleep_until(flush_deadline).await;
            let in_flight = processor.track();
            if let Some(batch) = manager.take_if_id(&key, batch_id) {
                tracing::debug!(
                    "batch wait elapsed: batch_id={}, endpoint={}, size={}",
                    batch_id,
                    key.endpoint,
                    batch.len()
                );
                processor.dispatch(in_flight, batch, FlushReason::Timer);
            }
        })
    }

    /// Dispatch a batch that filled up on join under a slot taken before the join
    pub(crate) fn flush_full(&self, in_flight: InFlight, batch: Batch) {
        self.processor.dispatch(in_flight, batch, FlushReason::Size);
    }

    /// Flush every open batch now; returns the number flushed
    pub fn flush_all(&self) -> usize {
        let hold = self.processor.track();
        let batches = self.manager.drain();
        let count = batches.len();
        for batch in batches {
            self.processor.dispatch(self.processor.track(), batch, FlushReason::Explicit);
        }
        drop(hold);
        count
    }
}
