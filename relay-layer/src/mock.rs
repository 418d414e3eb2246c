//! Provider double shared by the layer tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_core::error::RelayError;
use relay_core::provider::Provider;
use relay_core::types::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Echoes each input; inputs equal to `"bad"` fail individually.
#[derive(Debug)]
pub struct MockProvider {
    info: Arc<ProviderInfo>,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    delay: Option<Duration>,
    failures: Mutex<VecDeque<RelayError>>,
}

impl MockProvider {
    pub fn new(id: &str) -> Self {
        Self {
            info: Arc::new(ProviderInfo::new(id, format!("Mock {}", id))),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: None,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn single_input(mut self) -> Self {
        self.info = Arc::new(self.info.as_ref().clone().with_max_batch_size(1));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next call with this error
    pub fn fail_next(&self, error: RelayError) {
        self.failures.lock().push_back(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most calls observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    async fn invoke(&self, call: BatchCall) -> Result<Vec<ItemResult>, RelayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        Ok(call
            .inputs
            .iter()
            .map(|input| {
                if input == "bad" {
                    Err(RelayError::provider("rejected input"))
                } else {
                    Ok(ItemOutput::new(
                        serde_json::json!({ "echo": input }),
                        estimate_tokens(input),
                    ))
                }
            })
            .collect())
    }
}

/// Call with `n` distinct inputs and a 30s deadline
pub fn call_with(n: usize) -> BatchCall {
    inputs_call((0..n).map(|i| serde_json::json!(i)).collect())
}

pub fn inputs_call(inputs: Vec<serde_json::Value>) -> BatchCall {
    BatchCall {
        batch_id: 1,
        endpoint: EndpointId::new("mock"),
        model: "test-model".to_string(),
        inputs,
        deadline: tokio::time::Instant::now() + Duration::from_secs(30),
        context: RequestContext::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_failures_apply_in_order() {
        let provider = MockProvider::new("m");
        provider.fail_next(RelayError::rate_limit("first"));
        provider.fail_next(RelayError::timeout("second"));

        let first = provider.invoke(call_with(1)).await.unwrap_err();
        let second = provider.invoke(call_with(1)).await.unwrap_err();
        let third = provider.invoke(call_with(2)).await.unwrap();

        assert!(matches!(first, RelayError::RateLimit(_)));
        assert!(matches!(second, RelayError::Timeout(_)));
        assert_eq!(third.len(), 2);
        assert_eq!(provider.calls(), 3);
    }
}
