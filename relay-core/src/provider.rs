//! Provider trait and core abstractions.

use crate::error::RelayError;
use crate::types::*;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Type-erased provider shared between endpoints and tasks
pub type BoxedProvider = Arc<dyn Provider>;

/// Core provider trait for model backends.
///
/// A provider receives one call per flushed batch and answers with one
/// result per input, in input order. Returning `Err` fails the whole batch;
/// returning `Ok` with individual `Err` items signals partial success.
#[async_trait]
pub trait Provider: Send + Sync + Debug + 'static {
    /// Get provider information
    fn info(&self) -> Arc<ProviderInfo>;

    /// Invoke the backend for a batch of inputs
    async fn invoke(&self, call: BatchCall) -> Result<Vec<ItemResult>, RelayError>;
}

#[async_trait]
impl<P: Provider + ?Sized> Provider for Arc<P> {
    fn info(&self) -> Arc<ProviderInfo> {
        (**self).info()
    }

    async fn invoke(&self, call: BatchCall) -> Result<Vec<ItemResult>, RelayError> {
        (**self).invoke(call).await
    }
}

/// Check that a provider answered once per input.
pub fn check_result_count(
    endpoint: &EndpointId,
    expected: usize,
    results: &[ItemResult],
) -> Result<(), RelayError> {
    if results.len() != expected {
        return Err(RelayError::provider(format!(
            "endpoint {} returned {} results for {} inputs",
            endpoint,
            results.len(),
            expected
        )));
    }
    Ok(())
}
