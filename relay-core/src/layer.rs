//! Layer trait and abstractions.
//!
//! Layers wrap a provider with cross-cutting concerns like logging, retry or
//! fan-out for backends without native batching. Layers compose statically;
//! an endpoint erases the final type once when it is registered.

use crate::error::RelayError;
use crate::provider::Provider;
use crate::types::*;
use async_trait::async_trait;
use std::sync::Arc;

/// Layer trait for wrapping providers.
///
/// Each layer wraps an inner provider and returns a new provider with
/// enhanced capabilities.
pub trait Layer<P: Provider> {
    /// The type of the layered provider
    type LayeredProvider: Provider;

    /// Wrap the inner provider with this layer
    fn layer(&self, inner: P) -> Self::LayeredProvider;
}

/// Helper trait for layered providers.
///
/// Provides default forwarding implementations for provider methods.
/// Implementers only override the methods they want to intercept.
#[async_trait]
pub trait LayeredProvider: Sized + Provider {
    /// The inner provider type
    type Inner: Provider;

    /// Get a reference to the inner provider
    fn inner(&self) -> &Self::Inner;

    /// Default implementation for info - forwards to inner
    fn layered_info(&self) -> Arc<ProviderInfo> {
        self.inner().info()
    }

    /// Default implementation for invoke - forwards to inner
    async fn layered_invoke(&self, call: BatchCall) -> Result<Vec<ItemResult>, RelayError> {
        self.inner().invoke(call).await
    }
}

/// Macro to implement Provider trait by forwarding to LayeredProvider methods.
#[macro_export]
macro_rules! impl_layered_provider {
    ($type:ident) => {
        #[async_trait::async_trait]
        impl<P: $crate::provider::Provider> $crate::provider::Provider for $type<P> {
            fn info(&self) -> std::sync::Arc<$crate::types::ProviderInfo> {
                $crate::layer::LayeredProvider::layered_info(self)
            }

            async fn invoke(
                &self,
                call: $crate::types::BatchCall,
            ) -> Result<Vec<$crate::types::ItemResult>, $crate::error::RelayError> {
                $crate::layer::LayeredProvider::layered_invoke(self, call).await
            }
        }
    };
}
