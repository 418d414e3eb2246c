//! # Relay Layers
//!
//! Built-in provider layers for Relay.
//!
//! Currently implemented layers:
//! - `LoggingLayer`: Logs every batch call with timing information
//! - `RetryLayer`: Retries retryable call failures with exponential backoff
//! - `UnbatchedLayer`: Serves batch calls from a backend that only takes one input per call
//!
//! ## Usage
//!
//! ```ignore
//! use relay_core::{Dispatcher, EndpointBuilder, EndpointConfig};
//! use relay_layer::{LoggingLayer, RetryLayer, UnbatchedLayer};
//!
//! let endpoint = EndpointBuilder::new(EndpointConfig::new("primary"), provider)
//!     .layer(UnbatchedLayer::new().with_max_parallel(8))
//!     .layer(RetryLayer::new().with_max_retries(2))
//!     .layer(LoggingLayer::new());
//!
//! let dispatcher = Dispatcher::builder().add_endpoint(endpoint).build()?;
//! ```

pub mod logging;
pub mod retry;
pub mod unbatched;

#[cfg(test)]
mod mock;

// Re-exports
pub use logging::LoggingLayer;
pub use retry::RetryLayer;
pub use unbatched::UnbatchedLayer;
