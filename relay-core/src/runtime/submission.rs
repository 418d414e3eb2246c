//! Handle to an enqueued request.

use crate::batch::{BatchKey, BatchManager};
use crate::error::RelayError;
use crate::metrics::{names, MetricsCollector};
use crate::types::Completion;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Done,
    Cancelled,
}

/// Where the request waits, for cancellation before flush
#[derive(Debug)]
pub(crate) struct Placement {
    pub manager: Arc<BatchManager>,
    pub key: BatchKey,
    pub batch_id: u64,
    pub metrics: Arc<MetricsCollector>,
}

/// Future resolving to the result of an enqueued request.
///
/// Cancelling (or dropping) the submission before its batch flushes
/// removes the request from the batch and releases its reservations.
/// After the flush the call still completes, but its result is discarded
/// and the submission resolves to [`RelayError::Cancelled`].
#[derive(Debug)]
pub struct Submission {
    request_id: uuid::Uuid,
    batch_id: u64,
    rx: oneshot::Receiver<Result<Completion, RelayError>>,
    placement: Option<Placement>,
    state: State,
}

impl Submission {
    pub(crate) fn new(
        request_id: uuid::Uuid,
        rx: oneshot::Receiver<Result<Completion, RelayError>>,
        placement: Placement,
    ) -> Self {
        Self {
            request_id,
            batch_id: placement.batch_id,
            rx,
            placement: Some(placement),
            state: State::Pending,
        }
    }

    /// Id of the submitted request
    pub fn request_id(&self) -> uuid::Uuid {
        self.request_id
    }

    /// Id of the batch the request joined
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    /// Cancel the request.
    ///
    /// Returns `true` if the request was removed from a still-open batch.
    pub fn cancel(&mut self) -> bool {
        if self.state != State::Pending {
            return false;
        }
        self.state = State::Cancelled;
        self.rx.close();

        let Some(placement) = self.placement.take() else {
            return false;
        };
        placement
            .metrics
            .increment(names::REQUESTS_CANCELLED, &[]);

        match placement
            .manager
            .cancel(&placement.key, placement.batch_id, self.request_id)
        {
            Some(entry) => {
                entry.release();
                tracing::debug!(
                    "request cancelled before flush: request_id={}, batch_id={}",
                    self.request_id,
                    placement.batch_id
                );
                true
            }
            None => {
                tracing::debug!(
                    "request cancelled after flush, result will be discarded: request_id={}",
                    self.request_id
                );
                false
            }
        }
    }
}

impl Future for Submission {
    type Output = Result<Completion, RelayError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.state != State::Pending {
            return Poll::Ready(Err(RelayError::Cancelled));
        }

        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.state = State::Done;
                this.placement = None;
                // Sender dropped without a result: the request was discarded
                Poll::Ready(result.unwrap_or(Err(RelayError::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        self.cancel();
    }
}
