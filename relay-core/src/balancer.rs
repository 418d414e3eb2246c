//! Load balancing state for endpoint distribution
//!
//! Holds every registered endpoint together with its live statistics:
//! in-flight count, exponentially decayed latency and error rate, health.
//! Statistics change only through observed call events, using atomic
//! compare-and-swap updates per endpoint.

use crate::breaker::CircuitState;
use crate::metrics::CallObserver;
use crate::provider::BoxedProvider;
use crate::types::{CallEvent, EndpointId};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Health status of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    /// Breaker is open
    Unavailable,
}

impl HealthState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HealthState::Healthy,
            1 => HealthState::Degraded,
            _ => HealthState::Unavailable,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HealthState::Healthy => 0,
            HealthState::Degraded => 1,
            HealthState::Unavailable => 2,
        }
    }
}

fn default_weight() -> u32 {
    1
}

fn default_concurrency_limit() -> usize {
    4
}

/// Static endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: EndpointId,
    /// Capacity weight for weighted-random routing
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Maximum concurrent provider calls to this endpoint
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Models served; empty serves all
    #[serde(default)]
    pub models: Vec<String>,
}

impl EndpointConfig {
    /// Create a config with default weight and concurrency
    pub fn new(id: impl Into<EndpointId>) -> Self {
        Self {
            id: id.into(),
            weight: default_weight(),
            concurrency_limit: default_concurrency_limit(),
            models: Vec::new(),
        }
    }

    /// Set weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set concurrency limit
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Restrict served models
    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }
}

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Weight of the newest sample in the moving averages
    pub decay: f64,
    /// Error-rate average above which an endpoint is degraded
    pub degraded_error_rate: f64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            decay: 0.2,
            degraded_error_rate: 0.5,
        }
    }
}

/// A registered endpoint and its live statistics
pub struct Endpoint {
    config: EndpointConfig,
    provider: BoxedProvider,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    samples: AtomicU64,
    latency_ms: AtomicU64,
    error_rate: AtomicU64,
    health: AtomicU8,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("config", &self.config)
            .field("provider", &self.provider.info().id)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Endpoint {
    /// Create an endpoint around a provider
    pub fn new(config: EndpointConfig, provider: BoxedProvider) -> Self {
        let permits = config.concurrency_limit.max(1);
        Self {
            config,
            provider,
            semaphore: Arc::new(Semaphore::new(permits)),
            in_flight: AtomicUsize::new(0),
            samples: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0f64.to_bits()),
            error_rate: AtomicU64::new(0f64.to_bits()),
            health: AtomicU8::new(HealthState::Healthy.as_u8()),
        }
    }

    /// Endpoint id
    pub fn id(&self) -> &EndpointId {
        &self.config.id
    }

    /// Static configuration
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Provider behind this endpoint
    pub fn provider(&self) -> &BoxedProvider {
        &self.provider
    }

    /// Per-endpoint concurrency semaphore
    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }

    /// Whether this endpoint serves a model
    pub fn serves(&self, model: &str) -> bool {
        self.config.models.is_empty() || self.config.models.iter().any(|m| m == model)
    }

    /// Effective batch size cap advertised by the provider
    pub fn max_batch_size(&self) -> Option<usize> {
        self.provider.info().max_batch_size
    }

    /// Requests routed here and not yet settled, queued or in a call
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Count a request against this endpoint until the guard drops
    pub fn begin_call(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            endpoint: Arc::clone(self),
        }
    }

    /// Moving-average latency, if any call completed
    pub fn latency_ms(&self) -> Option<f64> {
        if self.samples.load(Ordering::Acquire) == 0 {
            None
        } else {
            Some(f64::from_bits(self.latency_ms.load(Ordering::Acquire)))
        }
    }

    /// Moving-average error rate in `[0, 1]`
    pub fn error_rate(&self) -> f64 {
        f64::from_bits(self.error_rate.load(Ordering::Acquire))
    }

    /// Health derived from the error rate
    pub fn health(&self) -> HealthState {
        HealthState::from_u8(self.health.load(Ordering::Acquire))
    }

    fn record(&self, event: &CallEvent, config: &LoadBalancerConfig) {
        let first = self.samples.fetch_add(1, Ordering::AcqRel) == 0;
        let failure = if event.outcome.is_failure() { 1.0 } else { 0.0 };
        ewma(&self.latency_ms, event.latency_ms(), config.decay, first);
        ewma(&self.error_rate, failure, config.decay, first);

        let health = if self.error_rate() > config.degraded_error_rate {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        let previous = self.health.swap(health.as_u8(), Ordering::AcqRel);
        if previous != health.as_u8() {
            tracing::warn!(
                "endpoint health changed: endpoint={}, health={:?}, error_rate={:.2}",
                self.id(),
                health,
                self.error_rate()
            );
        }
    }

    /// Snapshot for routing decisions
    pub fn snapshot(&self, circuit: CircuitState) -> EndpointSnapshot {
        EndpointSnapshot {
            id: self.config.id.clone(),
            weight: self.config.weight,
            in_flight: self.in_flight(),
            latency_ms: self.latency_ms(),
            error_rate: self.error_rate(),
            health: match circuit {
                CircuitState::Open => HealthState::Unavailable,
                _ => self.health(),
            },
            circuit,
        }
    }
}

/// Lock-free exponential moving average update on f64 bits
fn ewma(cell: &AtomicU64, sample: f64, decay: f64, first: bool) {
    let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
        let next = if first {
            sample
        } else {
            decay * sample + (1.0 - decay) * f64::from_bits(bits)
        };
        Some(next.to_bits())
    });
}

/// Decrements the endpoint's in-flight count when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    endpoint: Arc<Endpoint>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.endpoint.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time view of an endpoint used by routing strategies
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub id: EndpointId,
    pub weight: u32,
    pub in_flight: usize,
    pub latency_ms: Option<f64>,
    pub error_rate: f64,
    pub health: HealthState,
    pub circuit: CircuitState,
}

/// Load balancer holding all endpoints
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    endpoints: DashMap<EndpointId, Arc<Endpoint>>,
    order: ArcSwap<Vec<EndpointId>>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("config", &self.config)
            .field("endpoints", &self.order.load())
            .finish()
    }
}

impl LoadBalancer {
    /// Create an empty load balancer
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            config,
            endpoints: DashMap::new(),
            order: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Register an endpoint; replaces one with the same id
    pub fn add(&self, endpoint: Endpoint) -> Arc<Endpoint> {
        let endpoint = Arc::new(endpoint);
        let id = endpoint.id().clone();
        if self.endpoints.insert(id.clone(), Arc::clone(&endpoint)).is_none() {
            self.order.rcu(|order| {
                let mut next = order.as_ref().clone();
                next.push(id.clone());
                next
            });
        }
        endpoint
    }

    /// Look up an endpoint
    pub fn get(&self, id: &EndpointId) -> Option<Arc<Endpoint>> {
        self.endpoints.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Registered endpoint ids in registration order
    pub fn ids(&self) -> Vec<EndpointId> {
        self.order.load().as_ref().clone()
    }

    /// Endpoints serving a model, in registration order
    pub fn candidates_for(&self, model: &str) -> Vec<Arc<Endpoint>> {
        self.order
            .load()
            .iter()
            .filter_map(|id| self.get(id))
            .filter(|e| e.serves(model))
            .collect()
    }

    /// Number of registered endpoints
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether no endpoint is registered
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl CallObserver for LoadBalancer {
    fn observe(&self, event: &CallEvent) {
        if let Some(endpoint) = self.endpoints.get(&event.endpoint) {
            endpoint.record(event, &self.config);
        }
    }
}
