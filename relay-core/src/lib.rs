//! # Relay Core
//!
//! Core abstractions and runtime for dispatching model calls.
//!
//! This crate provides the request optimization layer: requests are routed
//! to one of several endpoints, grouped into batches, metered against token
//! budgets and shielded from failing endpoints by circuit breakers.

pub mod balancer;
pub mod batch;
pub mod breaker;
pub mod budget;
pub mod error;
pub mod hook;
pub mod layer;
pub mod metrics;
pub mod provider;
pub mod router;
pub mod runtime;
pub mod strategy;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use balancer::{
    Endpoint, EndpointConfig, EndpointSnapshot, HealthState, LoadBalancer, LoadBalancerConfig,
};
pub use batch::{BatchKey, FlushInfo, FlushReason};
pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, FailureWindow};
pub use budget::{
    BudgetConfig, BudgetQueueConfig, BudgetScope, BudgetSnapshot, RefillPolicy, Reservation,
    TokenBudgetTracker,
};
pub use error::RelayError;
pub use hook::{Hook, HookEngine};
pub use layer::{Layer, LayeredProvider};
pub use metrics::{
    CallObserver, ChannelSink, Metric, MetricsCollector, MetricsSink, MetricsSnapshot,
};
pub use provider::{BoxedProvider, Provider};
pub use router::{ProbePolicy, RouteDecision, Router, RoutingConfig};
pub use runtime::{Dispatcher, DispatcherBuilder, DispatcherConfig, EndpointBuilder, Submission};
pub use strategy::RoutingStrategy;
pub use types::*;

/// Result type alias for dispatch operations
pub type Result<T> = std::result::Result<T, RelayError>;
