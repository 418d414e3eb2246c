//! Request routing.
//!
//! The router reads breaker state and load balancer snapshots, claims the
//! half-open probe slot when it sends a probe, and otherwise delegates the
//! choice to the configured [`RoutingStrategy`]. It never mutates endpoint
//! statistics.

use crate::balancer::{Endpoint, EndpointSnapshot, LoadBalancer};
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::error::RelayError;
use crate::metrics::{names, MetricsCollector};
use crate::strategy::RoutingStrategy;
use crate::types::{EndpointId, Request};
use arc_swap::ArcSwap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// When half-open endpoints receive their probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbePolicy {
    /// The next eligible request probes before the strategy is consulted
    #[default]
    Eager,
    /// Probe only when no closed endpoint is available
    Fallback,
}

/// Routing configuration, swappable at runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub strategy: RoutingStrategy,
    pub probe_policy: ProbePolicy,
}

impl RoutingConfig {
    /// Set strategy
    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set probe policy
    pub fn with_probe_policy(mut self, policy: ProbePolicy) -> Self {
        self.probe_policy = policy;
        self
    }
}

/// A claimed half-open probe slot.
///
/// Returns the slot to the breaker when dropped before dispatch.
pub struct ProbeTicket {
    endpoint: EndpointId,
    breaker: Arc<CircuitBreaker>,
    armed: bool,
}

impl ProbeTicket {
    /// Endpoint being probed
    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    /// The probe reached the endpoint; its outcome settles the slot
    pub fn mark_dispatched(&mut self) {
        self.armed = false;
    }
}

impl std::fmt::Debug for ProbeTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeTicket")
            .field("endpoint", &self.endpoint)
            .field("armed", &self.armed)
            .finish()
    }
}

impl Drop for ProbeTicket {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("probe abandoned: endpoint={}", self.endpoint);
            self.breaker.abandon_probe(&self.endpoint);
        }
    }
}

/// Result of routing a request
#[derive(Debug)]
pub struct RouteDecision {
    pub endpoint: Arc<Endpoint>,
    /// Set when this request is the endpoint's half-open probe
    pub probe: Option<ProbeTicket>,
}

impl RouteDecision {
    /// Whether the request probes a half-open endpoint
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

/// Router
pub struct Router {
    balancer: Arc<LoadBalancer>,
    breaker: Arc<CircuitBreaker>,
    config: ArcSwap<RoutingConfig>,
    cursor: AtomicUsize,
    metrics: Arc<MetricsCollector>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config.load())
            .field("balancer", &self.balancer)
            .finish()
    }
}

impl Router {
    /// Create a new router
    pub fn new(
        config: RoutingConfig,
        balancer: Arc<LoadBalancer>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            balancer,
            breaker,
            config: ArcSwap::from_pointee(config),
            cursor: AtomicUsize::new(0),
            metrics,
        }
    }

    /// Current routing configuration
    pub fn config(&self) -> RoutingConfig {
        self.config.load().as_ref().clone()
    }

    /// Replace the routing strategy; in-progress decisions are unaffected
    pub fn set_strategy(&self, strategy: RoutingStrategy) {
        self.config
            .rcu(|current| current.as_ref().clone().with_strategy(strategy));
        tracing::info!("routing strategy changed: strategy={}", strategy);
    }

    /// Replace the probe policy
    pub fn set_probe_policy(&self, policy: ProbePolicy) {
        self.config
            .rcu(|current| current.as_ref().clone().with_probe_policy(policy));
    }

    /// Route a request to one of the endpoints serving its model
    pub fn route(&self, request: &Request) -> Result<RouteDecision, RelayError> {
        self.route_excluding(request, &[])
    }

    /// Route a request, skipping the given endpoints
    pub fn route_excluding(
        &self,
        request: &Request,
        excluded: &[EndpointId],
    ) -> Result<RouteDecision, RelayError> {
        let candidates: Vec<Arc<Endpoint>> = self
            .balancer
            .candidates_for(&request.model)
            .into_iter()
            .filter(|e| !excluded.contains(e.id()))
            .collect();

        if candidates.is_empty() {
            return Err(self.fail(RelayError::routing(format!(
                "no endpoint serves model {}",
                request.model
            ))));
        }

        let config = self.config.load();
        let mut closed = Vec::with_capacity(candidates.len());
        let mut half_open = Vec::new();
        for endpoint in candidates {
            match self.breaker.state(endpoint.id()) {
                CircuitState::Closed => closed.push(endpoint),
                CircuitState::HalfOpen => half_open.push(endpoint),
                CircuitState::Open => {}
            }
        }

        if config.probe_policy == ProbePolicy::Eager || closed.is_empty() {
            if let Some(decision) = self.claim_probe(&half_open) {
                return Ok(decision);
            }
        }

        let snapshots: Vec<EndpointSnapshot> = closed
            .iter()
            .map(|e| e.snapshot(CircuitState::Closed))
            .collect();
        let tick = self.cursor.fetch_add(1, Ordering::Relaxed);
        let roll = match config.strategy {
            RoutingStrategy::WeightedRandom => rand::thread_rng().gen::<f64>(),
            _ => 0.0,
        };

        match config.strategy.select(&snapshots, tick, roll) {
            Some(index) => {
                let endpoint = Arc::clone(&closed[index]);
                tracing::debug!(
                    "routed request: request_id={}, endpoint={}, strategy={}",
                    request.id,
                    endpoint.id(),
                    config.strategy
                );
                Ok(RouteDecision {
                    endpoint,
                    probe: None,
                })
            }
            None => Err(self.fail(RelayError::no_healthy_endpoint())),
        }
    }

    /// Route a request to one specific endpoint
    pub fn route_pinned(
        &self,
        request: &Request,
        endpoint_id: &EndpointId,
    ) -> Result<RouteDecision, RelayError> {
        let endpoint = match self.balancer.get(endpoint_id) {
            Some(endpoint) if endpoint.serves(&request.model) => endpoint,
            Some(_) => {
                return Err(self.fail(RelayError::routing(format!(
                    "endpoint {} does not serve model {}",
                    endpoint_id, request.model
                ))))
            }
            None => {
                return Err(self.fail(RelayError::routing(format!(
                    "unknown endpoint {}",
                    endpoint_id
                ))))
            }
        };

        match self.breaker.state(endpoint_id) {
            CircuitState::Closed => Ok(RouteDecision {
                endpoint,
                probe: None,
            }),
            CircuitState::HalfOpen => match self.claim_probe(std::slice::from_ref(&endpoint)) {
                Some(decision) => Ok(decision),
                None => Err(self.reject_open(endpoint_id)),
            },
            CircuitState::Open => Err(self.reject_open(endpoint_id)),
        }
    }

    /// Snapshots of every registered endpoint
    pub fn snapshots(&self) -> Vec<EndpointSnapshot> {
        self.balancer
            .ids()
            .iter()
            .filter_map(|id| self.balancer.get(id))
            .map(|e| e.snapshot(self.breaker.state(e.id())))
            .collect()
    }

    fn claim_probe(&self, half_open: &[Arc<Endpoint>]) -> Option<RouteDecision> {
        half_open.iter().find_map(|endpoint| {
            if !self.breaker.try_acquire_probe(endpoint.id()) {
                return None;
            }
            Some(RouteDecision {
                endpoint: Arc::clone(endpoint),
                probe: Some(ProbeTicket {
                    endpoint: endpoint.id().clone(),
                    breaker: Arc::clone(&self.breaker),
                    armed: true,
                }),
            })
        })
    }

    fn reject_open(&self, endpoint: &EndpointId) -> RelayError {
        self.metrics
            .increment(names::CIRCUIT_REJECTIONS, &[("endpoint", endpoint.as_str())]);
        RelayError::circuit_open(endpoint.as_str())
    }

    fn fail(&self, error: RelayError) -> RelayError {
        self.metrics.increment(names::ROUTING_FAILURES, &[]);
        tracing::debug!("routing failed: {}", error);
        error
    }
}
