//! Hook system for dispatch lifecycle side effects.

use crate::batch::FlushInfo;
use crate::error::RelayError;
use crate::metrics::{names, MetricsCollector};
use crate::types::{Completion, Request};
use async_trait::async_trait;
use futures::future::join_all;
use std::fmt::Debug;
use std::sync::Arc;

/// Hook trait for lifecycle callbacks.
///
/// Hooks observe dispatch; they cannot alter requests or results. A failing
/// hook is logged and counted, and never aborts dispatch.
#[async_trait]
pub trait Hook: Send + Sync + Debug + 'static {
    /// Hook name
    fn name(&self) -> &str;

    /// Called when a request has joined a batch
    async fn on_enqueue(&self, _request: &Request) -> Result<(), RelayError> {
        Ok(())
    }

    /// Called when a batch flushes
    async fn on_flush(&self, _batch: &FlushInfo) -> Result<(), RelayError> {
        Ok(())
    }

    /// Called when a request completed successfully
    async fn on_complete(
        &self,
        _request: &Request,
        _completion: &Completion,
    ) -> Result<(), RelayError> {
        Ok(())
    }

    /// Called when a request failed
    async fn on_error(&self, _request: &Request, _error: &RelayError) -> Result<(), RelayError> {
        Ok(())
    }
}

/// Hook execution engine.
///
/// Runs every hook of a phase concurrently.
#[derive(Debug, Clone)]
pub struct HookEngine {
    hooks: Vec<Arc<dyn Hook>>,
    metrics: Arc<MetricsCollector>,
}

impl HookEngine {
    /// Create a new hook engine
    pub fn new(hooks: Vec<Arc<dyn Hook>>, metrics: Arc<MetricsCollector>) -> Self {
        Self { hooks, metrics }
    }

    /// Get all hooks
    pub fn hooks(&self) -> &[Arc<dyn Hook>] {
        &self.hooks
    }

    /// Whether no hook is registered
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run on_enqueue hooks
    pub async fn on_enqueue(&self, request: &Request) {
        if self.is_empty() {
            return;
        }
        let results = join_all(self.hooks.iter().map(|h| h.on_enqueue(request))).await;
        self.report("on_enqueue", results);
    }

    /// Run on_flush hooks
    pub async fn on_flush(&self, batch: &FlushInfo) {
        if self.is_empty() {
            return;
        }
        let results = join_all(self.hooks.iter().map(|h| h.on_flush(batch))).await;
        self.report("on_flush", results);
    }

    /// Run on_complete hooks
    pub async fn on_complete(&self, request: &Request, completion: &Completion) {
        if self.is_empty() {
            return;
        }
        let results = join_all(self.hooks.iter().map(|h| h.on_complete(request, completion))).await;
        self.report("on_complete", results);
    }

    /// Run on_error hooks
    pub async fn on_error(&self, request: &Request, error: &RelayError) {
        if self.is_empty() {
            return;
        }
        let results = join_all(self.hooks.iter().map(|h| h.on_error(request, error))).await;
        self.report("on_error", results);
    }

    fn report(&self, phase: &'static str, results: Vec<Result<(), RelayError>>) {
        for (hook, result) in self.hooks.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!("hook failed: hook={}, phase={}, error={}", hook.name(), phase, e);
                self.metrics
                    .increment(names::HOOK_FAILURES, &[("hook", hook.name()), ("phase", phase)]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingHook {
        enqueued: AtomicUsize,
    }

    #[async_trait]
    impl Hook for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_enqueue(&self, _request: &Request) -> Result<(), RelayError> {
            self.enqueued.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FailingHook;

    #[async_trait]
    impl Hook for FailingHook {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_enqueue(&self, _request: &Request) -> Result<(), RelayError> {
            Err(RelayError::hook("failing", "boom"))
        }
    }

    #[tokio::test]
    async fn test_failing_hook_is_counted_not_fatal() {
        let metrics = Arc::new(MetricsCollector::new());
        let counting = Arc::new(CountingHook::default());
        let engine = HookEngine::new(
            vec![Arc::new(FailingHook), counting.clone()],
            Arc::clone(&metrics),
        );

        let request = Request::new("embed", serde_json::json!("hi"));
        engine.on_enqueue(&request).await;
        engine.on_enqueue(&request).await;

        assert_eq!(counting.enqueued.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.counter(names::HOOK_FAILURES), 2);
    }
}
