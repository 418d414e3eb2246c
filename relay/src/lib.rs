//! # Relay
//!
//! Request optimization layer for model backends.
//!
//! Relay sits between callers and a set of model endpoints. Each request is
//! routed to an endpoint, metered against token budgets, grouped with
//! compatible requests into a batch and sent as one provider call. Circuit
//! breakers keep failing endpoints out of rotation and a metrics collector
//! feeds observed latency and errors back into routing.
//!
//! ## Features
//!
//! - **Batching**: size and time based flushes, per endpoint, model and compatibility tag
//! - **Routing**: round robin, weighted random, least loaded and latency aware strategies
//! - **Circuit breaking**: consecutive or windowed failure tracking with half-open probes
//! - **Token budgets**: per tenant and per endpoint quotas with reservation and refill
//! - **Composable layers**: logging, retry and fan-out around any provider
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! relay = { version = "0.1", features = ["layers"] }
//! ```
//!
//! ```ignore
//! use relay::prelude::*;
//!
//! # async fn example(provider: impl Provider) -> Result<()> {
//! let dispatcher = Dispatcher::builder()
//!     .max_batch_size(16)
//!     .max_wait(std::time::Duration::from_millis(20))
//!     .add_endpoint(
//!         EndpointBuilder::new(EndpointConfig::new("primary"), provider)
//!             .layer(RetryLayer::new())
//!             .layer(LoggingLayer::new()),
//!     )
//!     .build()?;
//!
//! let completion = dispatcher
//!     .submit("embed-small", serde_json::json!("hello"), SubmitOptions::default())
//!     .await?;
//! println!("{}", completion.output);
//!
//! dispatcher.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `default`: Includes `layers`
//! - `layers`: Built-in layers (logging, retry, fan-out)
//! - `full`: All features enabled

// Re-export core types and traits
pub use relay_core::*;

// Re-export layers under `layer` module
#[cfg(feature = "relay-layer")]
pub mod layer {
    //! Built-in provider layers.
    pub use relay_layer::*;
}

/// Prelude module for convenient imports
pub mod prelude {
    //! Prelude module containing the most commonly used types and traits.
    //!
    //! ```
    //! use relay::prelude::*;
    //! ```

    pub use crate::{
        Completion, Dispatcher, EndpointBuilder, EndpointConfig, EndpointId, Hook, Layer,
        Provider, RelayError, Result, RoutingStrategy, SubmitOptions, Submission,
    };

    #[cfg(feature = "relay-layer")]
    pub use crate::layer::*;
}
