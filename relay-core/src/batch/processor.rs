//! Batch execution.
//!
//! One provider call per flushed batch. Results are demultiplexed by
//! position; reservations are settled and every caller completed exactly
//! once. The call outcome is reported to the metrics collector, which is
//! the only path into load balancer and breaker state.
//!
//! A call is bounded by the call timeout alone. A member whose own deadline
//! passes mid-call gets its own timeout while its peers keep waiting.

use super::{Batch, BatchState, FlushInfo, FlushReason, PendingRequest};
use crate::balancer::Endpoint;
use crate::breaker::CircuitBreaker;
use crate::budget::{BudgetScope, TokenBudgetTracker};
use crate::error::RelayError;
use crate::hook::HookEngine;
use crate::metrics::{names, MetricsCollector};
use crate::provider::check_result_count;
use crate::router::Router;
use crate::types::{
    BatchCall, CallEvent, CallOutcome, Completion, EndpointId, ItemOutput, ItemResult, Request,
};
use futures::future::join_all;
use pin_project::pin_project;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Upper bound of one provider call
    pub call_timeout_ms: u64,
    /// Retry failed items once on a different endpoint
    pub retry_partial: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            retry_partial: true,
        }
    }
}

impl ProcessorConfig {
    /// Call timeout as a duration
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Future wrapper measuring how long the inner future took
#[pin_project]
struct Timed<F> {
    #[pin]
    inner: F,
    started: Instant,
}

impl<F> Timed<F> {
    fn new(inner: F) -> Self {
        Self {
            inner,
            started: Instant::now(),
        }
    }
}

impl<F: Future> Future for Timed<F> {
    type Output = (F::Output, Duration);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(output) => Poll::Ready((output, this.started.elapsed())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Result delivered to one caller, kept for hooks
type Settled = (Request, Result<Completion, RelayError>);

/// Failure of a whole call
struct CallFailure {
    error: RelayError,
    outcome: CallOutcome,
}

/// Executes flushed batches
pub struct BatchProcessor {
    config: ProcessorConfig,
    router: Arc<Router>,
    breaker: Arc<CircuitBreaker>,
    budget: Arc<TokenBudgetTracker>,
    metrics: Arc<MetricsCollector>,
    hooks: HookEngine,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Counts a batch from the moment it leaves the manager until it finishes
pub(crate) struct InFlight(Arc<BatchProcessor>);

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl BatchProcessor {
    /// Create a processor
    pub fn new(
        config: ProcessorConfig,
        router: Arc<Router>,
        breaker: Arc<CircuitBreaker>,
        budget: Arc<TokenBudgetTracker>,
        metrics: Arc<MetricsCollector>,
        hooks: HookEngine,
    ) -> Self {
        Self {
            config,
            router,
            breaker,
            budget,
            metrics,
            hooks,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Hook engine shared with the dispatcher
    pub fn hooks(&self) -> &HookEngine {
        &self.hooks
    }

    /// Batches dispatched but not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Take an in-flight slot ahead of removing a batch from the manager
    pub(crate) fn track(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight(Arc::clone(self))
    }

    /// Execute a flushed batch on its own task, holding its slot until done
    pub(crate) fn dispatch(
        self: &Arc<Self>,
        in_flight: InFlight,
        batch: Batch,
        reason: FlushReason,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.process(batch, reason).await;
            drop(in_flight);
        })
    }

    /// Wait until no dispatched batch is running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn process(&self, mut batch: Batch, reason: FlushReason) {
        let endpoint = Arc::clone(batch.endpoint());
        let batch_id = batch.id();
        let model = batch.key().model.clone();
        let waited = batch.created_at().elapsed();

        // Callers that went away after the batch left the registry
        let entries: Vec<PendingRequest> = batch
            .take_entries()
            .into_iter()
            .filter(|e| !e.is_abandoned())
            .collect();
        if entries.is_empty() {
            batch.set_state(BatchState::Closed);
            return;
        }

        let now = Instant::now();
        let mut settled = Vec::with_capacity(entries.len());
        let (expired, entries): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| e.request.context.deadline.is_some_and(|d| d <= now));
        for entry in expired {
            settled.push(self.settle(
                entry,
                Err(RelayError::timeout("request deadline passed before dispatch")),
            ));
        }

        let probe = entries.iter().any(|e| e.probe.is_some());
        let info = FlushInfo {
            batch_id,
            endpoint: endpoint.id().clone(),
            model: model.clone(),
            size: entries.len(),
            reason,
            waited,
            probe,
        };
        self.metrics.increment(
            names::BATCHES_FLUSHED,
            &[("endpoint", endpoint.id().as_str()), ("reason", reason.as_str())],
        );
        tracing::debug!(
            "batch flushed: batch_id={}, endpoint={}, model={}, size={}, reason={}, waited={:?}",
            batch_id,
            endpoint.id(),
            model,
            entries.len(),
            reason.as_str(),
            waited
        );

        if !entries.is_empty() {
            self.hooks.on_flush(&info).await;
            settled.extend(self.execute(&endpoint, batch_id, &model, entries, probe).await);
        }

        batch.set_state(BatchState::Closed);
        self.run_result_hooks(settled).await;
    }

    async fn execute(
        &self,
        endpoint: &Arc<Endpoint>,
        batch_id: u64,
        model: &str,
        mut entries: Vec<PendingRequest>,
        probe: bool,
    ) -> Vec<Settled> {
        let Ok(permit) = Arc::clone(endpoint.semaphore()).acquire_owned().await else {
            return self.fail_all(entries, RelayError::ShuttingDown);
        };

        if !self.breaker.permits_dispatch(endpoint.id(), probe) {
            self.metrics
                .increment(names::CIRCUIT_REJECTIONS, &[("endpoint", endpoint.id().as_str())]);
            tracing::debug!(
                "batch rejected at flush, circuit open: batch_id={}, endpoint={}",
                batch_id,
                endpoint.id()
            );
            return self.fail_all(entries, RelayError::circuit_open(endpoint.id().as_str()));
        }

        for entry in entries.iter_mut() {
            if let Some(ticket) = entry.probe.as_mut() {
                ticket.mark_dispatched();
            }
        }

        let deadline = Instant::now() + self.config.call_timeout();
        let call = BatchCall {
            batch_id,
            endpoint: endpoint.id().clone(),
            model: model.to_string(),
            inputs: entries.iter().map(|e| e.request.payload.clone()).collect(),
            deadline,
            context: entries[0].request.context.clone(),
        };
        let size = call.len();

        let mut slots: Vec<Option<PendingRequest>> = entries.into_iter().map(Some).collect();
        let mut settled = Vec::with_capacity(slots.len());
        let invoke = Timed::new(tokio::time::timeout_at(
            deadline,
            endpoint.provider().invoke(call),
        ));
        tokio::pin!(invoke);
        let (result, latency) = loop {
            let next = slots
                .iter()
                .flatten()
                .filter_map(|e| e.request.context.deadline)
                .min();
            tokio::select! {
                biased;
                output = &mut invoke => break output,
                _ = sleep_until_some(next) => {
                    settled.extend(self.expire_members(&mut slots, Instant::now()));
                }
            }
        };

        let items = self.classify(endpoint.id(), batch_id, size, result, latency);
        let (outcome, tokens) = match &items {
            Ok(items) => {
                let failed = items.iter().filter(|r| r.is_err()).count();
                let tokens = items
                    .iter()
                    .filter_map(|r| r.as_ref().ok())
                    .map(|o| o.tokens_used)
                    .sum();
                let outcome = if failed == 0 {
                    CallOutcome::Success
                } else {
                    CallOutcome::PartialFailure { failed }
                };
                (outcome, tokens)
            }
            Err(failure) => (failure.outcome, 0),
        };
        self.metrics.record_call(
            &CallEvent::new(endpoint.id().clone(), latency, outcome)
                .with_tokens(tokens)
                .with_batch_size(size)
                .as_probe(probe),
        );
        drop(permit);

        let items = match items {
            Ok(items) => items,
            Err(failure) => {
                let live = slots.into_iter().flatten().collect();
                settled.extend(self.fail_all(live, failure.error));
                return settled;
            }
        };

        let mut retries = Vec::new();
        for (slot, item) in slots.into_iter().zip(items) {
            let Some(entry) = slot else {
                continue;
            };
            match item {
                Ok(output) => {
                    let completion =
                        completion(&entry.request, endpoint.id(), batch_id, output, false);
                    settled.push(self.settle(entry, Ok(completion)));
                }
                Err(error) => {
                    self.metrics
                        .increment(names::ITEM_FAILURES, &[("endpoint", endpoint.id().as_str())]);
                    if self.config.retry_partial {
                        retries.push((entry, error));
                    } else {
                        settled.push(self.settle(entry, Err(error)));
                    }
                }
            }
        }

        let retried = join_all(
            retries
                .into_iter()
                .map(|(entry, error)| self.retry_item(entry, error, endpoint.id(), batch_id)),
        )
        .await;
        settled.extend(retried);
        settled
    }

    /// Time out members whose own deadline passed while their call runs
    fn expire_members(&self, slots: &mut [Option<PendingRequest>], now: Instant) -> Vec<Settled> {
        let mut expired = Vec::new();
        for slot in slots.iter_mut() {
            let due = slot
                .as_ref()
                .and_then(|e| e.request.context.deadline)
                .is_some_and(|d| d <= now);
            if !due {
                continue;
            }
            if let Some(entry) = slot.take() {
                tracing::debug!(
                    "request deadline passed during call: request_id={}",
                    entry.request.id
                );
                expired.push(self.settle(entry, Err(member_timeout())));
            }
        }
        expired
    }

    /// Turn a raw call result into per-item results or a call failure
    fn classify(
        &self,
        endpoint: &EndpointId,
        batch_id: u64,
        expected: usize,
        result: Result<Result<Vec<ItemResult>, RelayError>, tokio::time::error::Elapsed>,
        latency: Duration,
    ) -> Result<Vec<ItemResult>, CallFailure> {
        let failure = match result {
            Err(_) => {
                self.metrics
                    .increment(names::BATCH_TIMEOUTS, &[("endpoint", endpoint.as_str())]);
                CallFailure {
                    error: RelayError::batch_timeout(batch_id, latency.as_millis() as u64),
                    outcome: CallOutcome::Timeout,
                }
            }
            Ok(Ok(items)) => match check_result_count(endpoint, expected, &items) {
                Ok(()) => {
                    tracing::debug!(
                        "batch call finished: batch_id={}, endpoint={}, latency={:?}",
                        batch_id,
                        endpoint,
                        latency
                    );
                    return Ok(items);
                }
                Err(error) => CallFailure {
                    error,
                    outcome: CallOutcome::Failure,
                },
            },
            Ok(Err(error)) => {
                let outcome = if error.is_endpoint_failure() {
                    CallOutcome::Failure
                } else {
                    CallOutcome::PartialFailure { failed: expected }
                };
                CallFailure { error, outcome }
            }
        };

        self.metrics
            .increment(names::PROVIDER_FAILURES, &[("endpoint", endpoint.as_str())]);
        tracing::error!(
            "batch call failed: batch_id={}, endpoint={}, size={}, latency={:?}, error={}",
            batch_id,
            endpoint,
            expected,
            latency,
            failure.error
        );
        Err(failure)
    }

    /// Retry one failed item on a different endpoint, at most once
    async fn retry_item(
        &self,
        mut entry: PendingRequest,
        error: RelayError,
        failed: &EndpointId,
        batch_id: u64,
    ) -> Settled {
        let Ok(mut decision) = self
            .router
            .route_excluding(&entry.request, std::slice::from_ref(failed))
        else {
            return self.settle(entry, Err(error));
        };
        let target = Arc::clone(&decision.endpoint);

        let scope = BudgetScope::endpoint(target.id().clone());
        let reservation = match self.budget.reserve(&scope, entry.request.estimated_tokens) {
            Ok(reservation) => reservation,
            Err(_) => return self.settle(entry, Err(error)),
        };
        entry
            .reservations
            .retain(|r| !matches!(r.scope(), BudgetScope::Endpoint(_)));
        if reservation.is_metered() {
            entry.reservations.push(reservation);
        }
        entry.load = target.begin_call();

        self.metrics.increment(
            names::PARTIAL_RETRIES,
            &[("from", failed.as_str()), ("to", target.id().as_str())],
        );
        tracing::debug!(
            "retrying item: request_id={}, from={}, to={}",
            entry.request.id,
            failed,
            target.id()
        );

        let Ok(permit) = Arc::clone(target.semaphore()).acquire_owned().await else {
            return self.settle(entry, Err(error));
        };
        if !self.breaker.permits_dispatch(target.id(), decision.is_probe()) {
            return self.settle(entry, Err(error));
        }
        let probe = decision.is_probe();
        if let Some(ticket) = decision.probe.as_mut() {
            ticket.mark_dispatched();
        }

        let deadline = Instant::now() + self.config.call_timeout();
        let call = BatchCall {
            batch_id,
            endpoint: target.id().clone(),
            model: entry.request.model.clone(),
            inputs: vec![entry.request.payload.clone()],
            deadline,
            context: entry.request.context.clone(),
        };

        let invoke = Timed::new(tokio::time::timeout_at(deadline, target.provider().invoke(call)));
        tokio::pin!(invoke);
        let first = tokio::select! {
            biased;
            output = &mut invoke => Some(output),
            _ = sleep_until_some(entry.request.context.deadline) => None,
        };
        let Some((result, latency)) = first else {
            // The caller times out now; the call still settles the endpoint
            let settled = self.settle(entry, Err(member_timeout()));
            let (result, latency) = invoke.await;
            drop(permit);
            let _ = self.observe_retry(target.id(), batch_id, result, latency, probe);
            return settled;
        };
        drop(permit);

        match self.observe_retry(target.id(), batch_id, result, latency, probe) {
            Ok(output) => {
                let completion = completion(&entry.request, target.id(), batch_id, output, true);
                self.settle(entry, Ok(completion))
            }
            Err(error) => self.settle(entry, Err(error)),
        }
    }

    /// Report a single-item retry call and extract its one result
    fn observe_retry(
        &self,
        target: &EndpointId,
        batch_id: u64,
        result: Result<Result<Vec<ItemResult>, RelayError>, tokio::time::error::Elapsed>,
        latency: Duration,
        probe: bool,
    ) -> ItemResult {
        let item = match self.classify(target, batch_id, 1, result, latency) {
            Ok(items) => match <[ItemResult; 1]>::try_from(items) {
                Ok([item]) => item,
                Err(_) => Err(RelayError::provider("unexpected result count")),
            },
            Err(failure) => {
                self.record_retry(target, latency, failure.outcome, 0, probe);
                return Err(failure.error);
            }
        };

        match &item {
            Ok(output) => {
                self.record_retry(target, latency, CallOutcome::Success, output.tokens_used, probe)
            }
            Err(_) => {
                let outcome = CallOutcome::PartialFailure { failed: 1 };
                self.record_retry(target, latency, outcome, 0, probe);
                self.metrics
                    .increment(names::ITEM_FAILURES, &[("endpoint", target.as_str())]);
            }
        }
        item
    }

    fn record_retry(
        &self,
        endpoint: &EndpointId,
        latency: Duration,
        outcome: CallOutcome,
        tokens: u64,
        probe: bool,
    ) {
        self.metrics.record_call(
            &CallEvent::new(endpoint.clone(), latency, outcome)
                .with_tokens(tokens)
                .as_probe(probe),
        );
    }

    fn fail_all(&self, entries: Vec<PendingRequest>, error: RelayError) -> Vec<Settled> {
        entries
            .into_iter()
            .map(|entry| self.settle(entry, Err(error.clone())))
            .collect()
    }

    /// Settle reservations, count the result and complete the caller
    fn settle(&self, entry: PendingRequest, result: Result<Completion, RelayError>) -> Settled {
        match &result {
            Ok(completion) => {
                entry.reconcile(completion.tokens_used);
                self.metrics.increment(names::REQUESTS_COMPLETED, &[]);
            }
            Err(error) => {
                entry.release();
                self.metrics
                    .increment(names::REQUESTS_FAILED, &[("error", error.kind())]);
            }
        }

        let PendingRequest {
            request,
            reservations,
            probe,
            load,
            responder,
        } = entry;
        drop(reservations);
        drop(probe);
        drop(load);

        if responder.send(result.clone()).is_err() {
            tracing::debug!("result discarded, caller gone: request_id={}", request.id);
        }
        (request, result)
    }

    async fn run_result_hooks(&self, settled: Vec<Settled>) {
        if self.hooks.is_empty() {
            return;
        }
        join_all(settled.iter().map(|(request, result)| async move {
            match result {
                Ok(completion) => self.hooks.on_complete(request, completion).await,
                Err(error) => self.hooks.on_error(request, error).await,
            }
        }))
        .await;
    }
}

fn member_timeout() -> RelayError {
    RelayError::timeout("request deadline passed during call")
}

/// Sleep until a deadline, or forever without one
async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn completion(
    request: &Request,
    endpoint: &EndpointId,
    batch_id: u64,
    output: ItemOutput,
    retried: bool,
) -> Completion {
    Completion {
        request_id: request.id,
        endpoint: endpoint.clone(),
        model: request.model.clone(),
        output: output.value,
        tokens_used: output.tokens_used,
        batch_id,
        retried,
    }
}
