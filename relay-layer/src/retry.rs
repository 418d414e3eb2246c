//! Retry layer with exponential backoff.

use async_trait::async_trait;
use relay_core::error::RelayError;
use relay_core::layer::{Layer, LayeredProvider};
use relay_core::provider::Provider;
use relay_core::types::*;
use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;

/// Retry layer configuration
#[derive(Debug, Clone)]
pub struct RetryLayer {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl RetryLayer {
    /// Create a new retry layer with default settings
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculate delay for a given attempt
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }
}

impl Default for RetryLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Provider> Layer<P> for RetryLayer {
    type LayeredProvider = RetryProvider<P>;

    fn layer(&self, inner: P) -> Self::LayeredProvider {
        RetryProvider {
            inner,
            config: self.clone(),
        }
    }
}

/// Provider wrapped with retry logic
#[derive(Debug)]
pub struct RetryProvider<P> {
    inner: P,
    config: RetryLayer,
}

#[async_trait]
impl<P: Provider> LayeredProvider for RetryProvider<P> {
    type Inner = P;

    fn inner(&self) -> &Self::Inner {
        &self.inner
    }

    async fn layered_invoke(&self, call: BatchCall) -> Result<Vec<ItemResult>, RelayError> {
        let mut attempt = 0;

        loop {
            match self.inner.invoke(call.clone()).await {
                Ok(results) => return Ok(results),
                Err(e) => {
                    if !e.is_retryable() || attempt >= self.config.max_retries {
                        return Err(e);
                    }

                    let delay = self.config.calculate_delay(attempt);
                    // A retry that cannot start before the deadline is pointless
                    if Instant::now() + delay >= call.deadline {
                        tracing::debug!(
                            "Retry skipped, deadline too close: batch_id={}, delay={:?}",
                            call.batch_id,
                            delay
                        );
                        return Err(e);
                    }

                    tracing::debug!(
                        "Retry attempt {}/{}: batch_id={}, waiting {:?}",
                        attempt + 1,
                        self.config.max_retries,
                        call.batch_id,
                        delay
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

relay_core::impl_layered_provider!(RetryProvider);
