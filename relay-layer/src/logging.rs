//! Logging layer for provider calls.

use relay_core::error::RelayError;
use relay_core::layer::{Layer, LayeredProvider};
use relay_core::provider::Provider;
use relay_core::types::*;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Logging layer that logs provider calls.
#[derive(Debug, Clone)]
pub struct LoggingLayer {
    prefix: String,
}

impl LoggingLayer {
    /// Create a new logging layer
    pub fn new() -> Self {
        Self {
            prefix: "[Relay]".to_string(),
        }
    }

    /// Create a logging layer with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LoggingLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Provider> Layer<P> for LoggingLayer {
    type LayeredProvider = LoggingProvider<P>;

    fn layer(&self, inner: P) -> Self::LayeredProvider {
        LoggingProvider {
            inner,
            prefix: self.prefix.clone(),
        }
    }
}

/// Provider wrapped with logging
#[derive(Debug)]
pub struct LoggingProvider<P> {
    inner: P,
    prefix: String,
}

#[async_trait]
impl<P: Provider> LayeredProvider for LoggingProvider<P> {
    type Inner = P;

    fn inner(&self) -> &Self::Inner {
        &self.inner
    }

    async fn layered_invoke(&self, call: BatchCall) -> Result<Vec<ItemResult>, RelayError> {
        let batch_id = call.batch_id;
        let endpoint = call.endpoint.clone();
        tracing::debug!(
            "{} invoke request: endpoint={}, batch_id={}, model={}, inputs={}",
            self.prefix,
            endpoint,
            batch_id,
            call.model,
            call.len()
        );

        let start = std::time::Instant::now();
        let result = self.inner.invoke(call).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(items) => {
                let failed = items.iter().filter(|item| item.is_err()).count();
                let tokens: u64 = items
                    .iter()
                    .filter_map(|item| item.as_ref().ok())
                    .map(|output| output.tokens_used)
                    .sum();
                tracing::debug!(
                    "{} invoke success: endpoint={}, batch_id={}, items={}, failed={}, tokens={}, elapsed={:?}",
                    self.prefix,
                    endpoint,
                    batch_id,
                    items.len(),
                    failed,
                    tokens,
                    elapsed
                );
            }
            Err(e) => {
                tracing::error!(
                    "{} invoke error: endpoint={}, batch_id={}, error={:?}, elapsed={:?}",
                    self.prefix,
                    endpoint,
                    batch_id,
                    e,
                    elapsed
                );
            }
        }

        result
    }
}

#[async_trait]
impl<P: Provider> Provider for LoggingProvider<P> {
    fn info(&self) -> Arc<ProviderInfo> {
        LayeredProvider::layered_info(self)
    }

    async fn invoke(&self, call: BatchCall) -> Result<Vec<ItemResult>, RelayError> {
        LayeredProvider::layered_invoke(self, call).await
    }
}
