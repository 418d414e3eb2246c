//! Fan-out adapter for backends without native batching.
//!
//! The wrapped provider receives one single-input call per batch member.
//! Calls run concurrently under a parallelism bound and their results are
//! reassembled by position, so the batch interface sees one result per
//! input in input order.

use async_trait::async_trait;
use futures::future::join_all;
use relay_core::error::RelayError;
use relay_core::layer::{Layer, LayeredProvider};
use relay_core::provider::{check_result_count, Provider};
use relay_core::types::*;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Layer turning a single-input provider into a batch provider
#[derive(Debug, Clone)]
pub struct UnbatchedLayer {
    max_parallel: usize,
    max_batch_size: Option<usize>,
}

impl UnbatchedLayer {
    /// Create an unbatched layer running up to 4 calls at once
    pub fn new() -> Self {
        Self {
            max_parallel: 4,
            max_batch_size: None,
        }
    }

    /// Set how many single-input calls may run at once
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Advertise a batch size cap instead of none
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }
}

impl Default for UnbatchedLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Provider> Layer<P> for UnbatchedLayer {
    type LayeredProvider = UnbatchedProvider<P>;

    fn layer(&self, inner: P) -> Self::LayeredProvider {
        let info = inner.info();
        let info = ProviderInfo {
            max_batch_size: self.max_batch_size,
            ..info.as_ref().clone()
        };
        UnbatchedProvider {
            inner,
            info: Arc::new(info),
            max_parallel: self.max_parallel,
        }
    }
}

/// Provider fanning batch calls out to single-input calls
#[derive(Debug)]
pub struct UnbatchedProvider<P> {
    inner: P,
    info: Arc<ProviderInfo>,
    max_parallel: usize,
}

impl<P: Provider> UnbatchedProvider<P> {
    async fn invoke_one(&self, semaphore: &Semaphore, call: BatchCall) -> ItemResult {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| RelayError::other("fan-out semaphore closed"))?;

        let endpoint = call.endpoint.clone();
        let results = self.inner.invoke(call).await?;
        check_result_count(&endpoint, 1, &results)?;
        results
            .into_iter()
            .next()
            .unwrap_or_else(|| Err(RelayError::other("single-input call lost its result")))
    }
}

#[async_trait]
impl<P: Provider> LayeredProvider for UnbatchedProvider<P> {
    type Inner = P;

    fn inner(&self) -> &Self::Inner {
        &self.inner
    }

    fn layered_info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    async fn layered_invoke(&self, call: BatchCall) -> Result<Vec<ItemResult>, RelayError> {
        let semaphore = Semaphore::new(self.max_parallel);
        let tasks: Vec<_> = call
            .inputs
            .iter()
            .map(|input| self.invoke_one(&semaphore, call.single(input.clone())))
            .collect();

        let results = join_all(tasks).await;

        tracing::trace!(
            "fan-out finished: batch_id={}, inputs={}, failed={}",
            call.batch_id,
            results.len(),
            results.iter().filter(|r| r.is_err()).count()
        );

        // Every member failing the same way is an endpoint failure, not a partial one
        if !results.is_empty() && results.iter().all(|r| matches!(r, Err(e) if e.is_endpoint_failure()))
        {
            if let Some(Err(first)) = results.into_iter().next() {
                return Err(first);
            }
            return Err(RelayError::other("fan-out lost its results"));
        }

        Ok(results)
    }
}

relay_core::impl_layered_provider!(UnbatchedProvider);
