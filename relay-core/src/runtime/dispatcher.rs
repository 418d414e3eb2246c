//! Dispatcher implementation.
//!
//! The dispatcher owns every component of the request optimization layer
//! and wires them together: routing, token budgets, batching, execution,
//! breaker and load balancer feedback through the metrics collector.

use super::submission::{Placement, Submission};
use crate::balancer::{
    Endpoint, EndpointConfig, EndpointSnapshot, LoadBalancer, LoadBalancerConfig,
};
use crate::batch::{
    BatchKey, BatchManager, BatchProcessor, BatchScheduler, JoinOutcome, PendingRequest,
    ProcessorConfig,
};
use crate::breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use crate::budget::{
    BudgetConfig, BudgetQueueConfig, BudgetScope, BudgetSnapshot, Reservation,
    TokenBudgetTracker,
};
use crate::error::RelayError;
use crate::hook::{Hook, HookEngine};
use crate::layer::Layer;
use crate::metrics::{names, CallObserver, MetricsCollector, MetricsSink, MetricsSnapshot};
use crate::provider::{BoxedProvider, Provider};
use crate::router::{Router, RoutingConfig};
use crate::strategy::RoutingStrategy;
use crate::types::{Completion, EndpointId, Request, SubmitOptions};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Dispatcher configuration.
///
/// Durations are in milliseconds so the struct can be loaded by a host
/// application from any serde format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Largest number of requests per provider call
    pub max_batch_size: usize,
    /// Longest a batch waits after its first request
    pub max_wait_ms: u64,
    #[serde(flatten)]
    pub processor: ProcessorConfig,
    pub routing: RoutingConfig,
    pub balancer: LoadBalancerConfig,
    pub breaker: CircuitBreakerConfig,
    pub budget_queue: BudgetQueueConfig,
    /// Budgets keyed by tenant
    pub tenant_budgets: HashMap<String, BudgetConfig>,
    /// Budgets keyed by endpoint id
    pub endpoint_budgets: HashMap<String, BudgetConfig>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_wait_ms: 50,
            processor: ProcessorConfig::default(),
            routing: RoutingConfig::default(),
            balancer: LoadBalancerConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            budget_queue: BudgetQueueConfig::default(),
            tenant_budgets: HashMap::new(),
            endpoint_budgets: HashMap::new(),
        }
    }
}

impl DispatcherConfig {
    /// Maximum batch wait as a duration
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.max_batch_size == 0 {
            return Err(RelayError::configuration("max_batch_size must be at least 1"));
        }
        if self.processor.call_timeout_ms == 0 {
            return Err(RelayError::configuration("call_timeout_ms must be positive"));
        }
        if !(self.balancer.decay > 0.0 && self.balancer.decay <= 1.0) {
            return Err(RelayError::configuration("balancer decay must be in (0, 1]"));
        }
        self.breaker.validate().map_err(RelayError::configuration)?;
        for (scope, budget) in self
            .tenant_budgets
            .iter()
            .chain(self.endpoint_budgets.iter())
        {
            if budget.ceiling == 0 {
                return Err(RelayError::configuration(format!(
                    "budget ceiling for {} must be positive",
                    scope
                )));
            }
        }
        Ok(())
    }
}

/// Builder for a single endpoint.
///
/// Layers wrap the provider with static dispatch; the provider is type
/// erased once when the endpoint is built.
///
/// # Example
///
/// ```ignore
/// let endpoint = EndpointBuilder::new(EndpointConfig::new("primary"), provider)
///     .layer(RetryLayer::new())
///     .layer(LoggingLayer::new());
/// ```
pub struct EndpointBuilder<P> {
    config: EndpointConfig,
    provider: P,
}

impl<P: Provider> EndpointBuilder<P> {
    /// Create a builder around a provider
    pub fn new(config: EndpointConfig, provider: P) -> Self {
        Self { config, provider }
    }

    /// Add a layer to wrap the provider
    pub fn layer<L>(self, layer: L) -> EndpointBuilder<L::LayeredProvider>
    where
        L: Layer<P>,
    {
        EndpointBuilder {
            config: self.config,
            provider: layer.layer(self.provider),
        }
    }

    /// Finish building the endpoint
    pub fn finish(self) -> Endpoint {
        let provider: BoxedProvider = Arc::new(self.provider);
        Endpoint::new(self.config, provider)
    }
}

/// Builder for a [`Dispatcher`]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    endpoints: Vec<Endpoint>,
    hooks: Vec<Arc<dyn Hook>>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl DispatcherBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig::default(),
            endpoints: Vec::new(),
            hooks: Vec::new(),
            sink: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Set maximum batch size
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.config.max_batch_size = size;
        self
    }

    /// Set maximum batch wait
    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.config.max_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Set provider call timeout
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.processor.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable the per-item retry on another endpoint
    pub fn retry_partial(mut self, enabled: bool) -> Self {
        self.config.processor.retry_partial = enabled;
        self
    }

    /// Set routing strategy
    pub fn routing_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.config.routing.strategy = strategy;
        self
    }

    /// Set circuit breaker configuration
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.breaker = config;
        self
    }

    /// Set budget queue configuration
    pub fn budget_queue(mut self, config: BudgetQueueConfig) -> Self {
        self.config.budget_queue = config;
        self
    }

    /// Meter a tenant
    pub fn tenant_budget(mut self, tenant: impl Into<String>, budget: BudgetConfig) -> Self {
        self.config.tenant_budgets.insert(tenant.into(), budget);
        self
    }

    /// Meter an endpoint
    pub fn endpoint_budget(mut self, endpoint: impl Into<String>, budget: BudgetConfig) -> Self {
        self.config.endpoint_budgets.insert(endpoint.into(), budget);
        self
    }

    /// Register an endpoint backed by a provider
    pub fn endpoint<P: Provider>(self, config: EndpointConfig, provider: P) -> Self {
        self.add_endpoint(EndpointBuilder::new(config, provider))
    }

    /// Register an endpoint composed with layers
    pub fn add_endpoint<P: Provider>(mut self, endpoint: EndpointBuilder<P>) -> Self {
        self.endpoints.push(endpoint.finish());
        self
    }

    /// Add a hook
    pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Emit metrics to a sink
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the dispatcher.
    ///
    /// Must be called within a tokio runtime; the budget refill task is
    /// spawned here.
    pub fn build(self) -> Result<Dispatcher, RelayError> {
        self.config.validate()?;
        if self.endpoints.is_empty() {
            return Err(RelayError::configuration("at least one endpoint is required"));
        }
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if !seen.insert(endpoint.id().clone()) {
                return Err(RelayError::configuration(format!(
                    "duplicate endpoint id {}",
                    endpoint.id()
                )));
            }
        }
        tokio::runtime::Handle::try_current().map_err(|_| {
            RelayError::configuration("dispatcher must be built inside a tokio runtime")
        })?;

        let config = self.config;
        let metrics = Arc::new(match self.sink {
            Some(sink) => MetricsCollector::with_sink(sink),
            None => MetricsCollector::new(),
        });

        let budget = Arc::new(TokenBudgetTracker::new(
            config.budget_queue.clone(),
            Arc::clone(&metrics),
        ));
        for (tenant, limit) in &config.tenant_budgets {
            budget.set_budget(BudgetScope::tenant(tenant.as_str()), *limit);
        }
        for (endpoint, limit) in &config.endpoint_budgets {
            budget.set_budget(BudgetScope::endpoint(endpoint.as_str()), *limit);
        }

        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone(), Arc::clone(&metrics)));
        let balancer = Arc::new(LoadBalancer::new(config.balancer.clone()));
        for endpoint in self.endpoints {
            breaker.register(endpoint.id());
            tracing::debug!(
                "endpoint registered: endpoint={}, provider={}, weight={}, concurrency_limit={}",
                endpoint.id(),
                endpoint.provider().info().id,
                endpoint.config().weight,
                endpoint.config().concurrency_limit
            );
            balancer.add(endpoint);
        }

        let balancer_observer: Arc<dyn CallObserver> = balancer.clone();
        let breaker_observer: Arc<dyn CallObserver> = breaker.clone();
        metrics.subscribe(Arc::downgrade(&balancer_observer));
        metrics.subscribe(Arc::downgrade(&breaker_observer));

        let router = Arc::new(Router::new(
            config.routing.clone(),
            Arc::clone(&balancer),
            Arc::clone(&breaker),
            Arc::clone(&metrics),
        ));
        let hooks = HookEngine::new(self.hooks, Arc::clone(&metrics));
        let processor = Arc::new(BatchProcessor::new(
            config.processor.clone(),
            Arc::clone(&router),
            Arc::clone(&breaker),
            Arc::clone(&budget),
            Arc::clone(&metrics),
            hooks,
        ));
        let manager = Arc::new(BatchManager::new(config.max_wait()));
        let scheduler = BatchScheduler::new(Arc::clone(&manager), Arc::clone(&processor));

        let refill_task = budget.spawn_refill(budget.refill_period());

        tracing::info!(
            "dispatcher started: endpoints={}, strategy={}, max_batch_size={}, max_wait_ms={}",
            balancer.len(),
            config.routing.strategy,
            config.max_batch_size,
            config.max_wait_ms
        );

        Ok(Dispatcher {
            config,
            metrics,
            budget,
            breaker,
            balancer,
            router,
            manager,
            processor,
            scheduler,
            shutting_down: AtomicBool::new(false),
            refill_task,
        })
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Request dispatcher.
///
/// This is the main entry point: callers enqueue requests and await the
/// returned [`Submission`].
pub struct Dispatcher {
    config: DispatcherConfig,
    metrics: Arc<MetricsCollector>,
    budget: Arc<TokenBudgetTracker>,
    breaker: Arc<CircuitBreaker>,
    balancer: Arc<LoadBalancer>,
    router: Arc<Router>,
    manager: Arc<BatchManager>,
    processor: Arc<BatchProcessor>,
    scheduler: BatchScheduler,
    shutting_down: AtomicBool,
    refill_task: JoinHandle<()>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("router", &self.router)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl Dispatcher {
    /// Create a new builder
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Enqueue a request.
    ///
    /// Routes the request, reserves its estimated tokens (waiting in the
    /// budget queue if the scope is exhausted) and adds it to a batch. The
    /// returned submission resolves once the batch has been executed.
    pub async fn enqueue(
        &self,
        model: impl Into<String>,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<Submission, RelayError> {
        if self.is_shutting_down() {
            return Err(self.reject(RelayError::ShuttingDown));
        }

        let pinned = options.endpoint.clone();
        let request = Request::from_options(model, payload, options);
        self.metrics
            .increment(names::REQUESTS_SUBMITTED, &[("priority", request.priority.as_str())]);
        if request.model.is_empty() {
            return Err(self.reject(RelayError::invalid_request("model must not be empty")));
        }

        let decision = match &pinned {
            Some(endpoint) => self.router.route_pinned(&request, endpoint),
            None => self.router.route(&request),
        }
        .map_err(|e| self.reject(e))?;
        let endpoint = Arc::clone(&decision.endpoint);
        let load = endpoint.begin_call();

        let mut reservations = Vec::with_capacity(2);
        if let Some(tenant) = request.tenant() {
            let scope = BudgetScope::tenant(tenant);
            reservations.extend(self.reserve(&scope, request.estimated_tokens).await?);
        }
        let scope = BudgetScope::endpoint(endpoint.id().clone());
        reservations.extend(self.reserve(&scope, request.estimated_tokens).await?);

        let key = BatchKey::new(endpoint.id().clone(), &request);
        let max_size = endpoint
            .max_batch_size()
            .map_or(self.config.max_batch_size, |cap| cap.min(self.config.max_batch_size))
            .max(1);
        let request_id = request.id;
        let hook_request = (!self.processor.hooks().is_empty()).then(|| request.clone());
        let (tx, rx) = oneshot::channel();
        let entry = PendingRequest {
            request,
            reservations,
            probe: decision.probe,
            load,
            responder: tx,
        };

        let in_flight = self.processor.track();
        let batch_id = match self.manager.join(key.clone(), &endpoint, max_size, entry) {
            JoinOutcome::Queued {
                batch_id,
                created,
                flush_deadline,
            } => {
                drop(in_flight);
                if created {
                    self.scheduler.arm(key.clone(), batch_id, flush_deadline);
                }
                batch_id
            }
            JoinOutcome::Full(batch) => {
                let batch_id = batch.id();
                self.scheduler.flush_full(in_flight, batch);
                batch_id
            }
            JoinOutcome::Rejected(entry) => {
                drop(in_flight);
                drop(entry);
                return Err(self.reject(RelayError::ShuttingDown));
            }
        };

        tracing::debug!(
            "request enqueued: request_id={}, endpoint={}, batch_id={}",
            request_id,
            endpoint.id(),
            batch_id
        );

        let submission = Submission::new(
            request_id,
            rx,
            Placement {
                manager: Arc::clone(&self.manager),
                key,
                batch_id,
                metrics: Arc::clone(&self.metrics),
            },
        );

        if let Some(request) = hook_request {
            self.processor.hooks().on_enqueue(&request).await;
        }
        Ok(submission)
    }

    /// Enqueue a request and wait for its result
    pub async fn submit(
        &self,
        model: impl Into<String>,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<Completion, RelayError> {
        self.enqueue(model, payload, options).await?.await
    }

    /// Flush every open batch now; returns the number of batches flushed
    pub fn flush(&self) -> usize {
        self.scheduler.flush_all()
    }

    /// Flush all open batches, wait for in-flight calls and reject every
    /// later submission with [`RelayError::ShuttingDown`].
    pub async fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::info!("dispatcher shutting down");
        }
        self.manager.close();
        let flushed = self.scheduler.flush_all();
        self.processor.wait_idle().await;
        self.refill_task.abort();
        tracing::info!("dispatcher stopped: flushed_batches={}", flushed);
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Swap the routing strategy at runtime
    pub fn set_routing_strategy(&self, strategy: RoutingStrategy) {
        self.router.set_strategy(strategy);
    }

    /// Dispatcher configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Token budget tracker
    pub fn budget(&self) -> &Arc<TokenBudgetTracker> {
        &self.budget
    }

    /// Router
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Snapshot of all counters and per-endpoint call statistics
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Snapshot of every endpoint's routing state
    pub fn endpoint_snapshots(&self) -> Vec<EndpointSnapshot> {
        self.router.snapshots()
    }

    /// Breaker snapshot of one endpoint
    pub fn breaker_snapshot(&self, endpoint: &EndpointId) -> Option<BreakerSnapshot> {
        self.breaker.snapshot(endpoint)
    }

    /// Snapshot of every metered budget scope
    pub fn budget_snapshot(&self) -> Vec<BudgetSnapshot> {
        self.budget.snapshot()
    }

    /// Requests waiting in open batches
    pub fn pending_requests(&self) -> usize {
        self.manager.pending_requests()
    }

    /// Number of registered endpoints
    pub fn endpoint_count(&self) -> usize {
        self.balancer.len()
    }

    /// Reserve on a scope; `None` for unmetered scopes
    async fn reserve(
        &self,
        scope: &BudgetScope,
        tokens: u64,
    ) -> Result<Option<Reservation>, RelayError> {
        if !self.budget.is_metered(scope) {
            return Ok(None);
        }
        let reservation = self
            .budget
            .reserve_queued(scope, tokens)
            .await
            .map_err(|e| self.reject(e))?;
        Ok(Some(reservation))
    }

    /// Count a request that failed before joining a batch
    fn reject(&self, error: RelayError) -> RelayError {
        self.metrics
            .increment(names::REQUESTS_FAILED, &[("error", error.kind())]);
        error
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.refill_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitState, FailureWindow};
    use crate::testing::{ScriptedProvider, Step};
    use crate::types::Priority;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn payload(i: usize) -> serde_json::Value {
        serde_json::json!(format!("input-{}", i))
    }

    fn dispatcher_with(
        providers: &[(&str, Arc<ScriptedProvider>)],
        configure: impl FnOnce(DispatcherBuilder) -> DispatcherBuilder,
    ) -> Dispatcher {
        let builder = providers.iter().fold(Dispatcher::builder(), |b, (id, p)| {
            b.endpoint(EndpointConfig::new(*id), Arc::clone(p))
        });
        configure(builder).build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_a_forty_requests_make_two_batches() {
        let provider = Arc::new(ScriptedProvider::new("e1"));
        let dispatcher = dispatcher_with(&[("e1", provider.clone())], |b| b.max_batch_size(32));

        let mut submissions = Vec::new();
        for i in 0..40 {
            submissions.push(
                dispatcher
                    .enqueue("embed", payload(i), SubmitOptions::new())
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(dispatcher.pending_requests(), 8);

        let results = futures::future::join_all(submissions).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(provider.batch_sizes(), vec![32, 8]);

        let first = results[0].as_ref().unwrap();
        let last = results[39].as_ref().unwrap();
        assert_ne!(first.batch_id, last.batch_id);
        assert_eq!(last.output, serde_json::json!({ "echo": "input-39" }));
        assert_eq!(dispatcher.metrics().counter(names::BATCHES_FLUSHED), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inputs_keep_insertion_order() {
        let provider = Arc::new(ScriptedProvider::new("e1"));
        let dispatcher = dispatcher_with(&[("e1", provider.clone())], |b| b.max_batch_size(4));

        let mut submissions = Vec::new();
        for i in 0..4 {
            submissions.push(
                dispatcher
                    .enqueue("embed", payload(i), SubmitOptions::new())
                    .await
                    .unwrap(),
            );
        }
        let results = futures::future::join_all(submissions).await;

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].inputs, (0..4).map(payload).collect::<Vec<_>>());
        for (i, result) in results.iter().enumerate() {
            assert_eq!(
                result.as_ref().unwrap().output,
                serde_json::json!({ "echo": format!("input-{}", i) })
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_on_max_wait() {
        let provider = Arc::new(ScriptedProvider::new("e1"));
        let dispatcher = dispatcher_with(&[("e1", provider.clone())], |b| {
            b.max_wait(Duration::from_millis(50))
        });

        let submission = dispatcher
            .enqueue("embed", payload(0), SubmitOptions::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(49)).await;
        assert_eq!(provider.call_count(), 0);

        let started = tokio::time::Instant::now();
        let completion = submission.await.unwrap();
        assert!(started.elapsed() <= Duration::from_millis(2));
        assert_eq!(completion.endpoint.as_str(), "e1");
        assert_eq!(provider.batch_sizes(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compat_tags_do_not_share_batches() {
        let provider = Arc::new(ScriptedProvider::new("e1"));
        let dispatcher = dispatcher_with(&[("e1", provider.clone())], |b| b);

        let a = dispatcher
            .enqueue("embed", payload(0), SubmitOptions::new().with_compat("dims=256"))
            .await
            .unwrap();
        let b = dispatcher
            .enqueue("embed", payload(1), SubmitOptions::new().with_compat("dims=512"))
            .await
            .unwrap();
        let (a, b) = tokio::join!(a, b);
        assert_ne!(a.unwrap().batch_id, b.unwrap().batch_id);
        assert_eq!(provider.batch_sizes(), vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_batch_cap() {
        let provider = Arc::new(ScriptedProvider::new("e1").with_max_batch_size(3));
        let dispatcher = dispatcher_with(&[("e1", provider.clone())], |b| b.max_batch_size(32));

        let mut submissions = Vec::new();
        for i in 0..7 {
            submissions.push(
                dispatcher
                    .enqueue("embed", payload(i), SubmitOptions::new())
                    .await
                    .unwrap(),
            );
        }
        futures::future::join_all(submissions).await;
        assert_eq!(provider.batch_sizes(), vec![3, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_b_open_endpoint_gets_no_calls() {
        let e1 = Arc::new(ScriptedProvider::new("e1"));
        let e2 = Arc::new(ScriptedProvider::new("e2"));
        let dispatcher = dispatcher_with(&[("e1", e1.clone()), ("e2", e2.clone())], |b| {
            b.max_batch_size(1).circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_failure_threshold(5)
                    .with_open_duration(Duration::from_secs(10)),
            )
        });

        e1.set_failing(true);
        for i in 0..5 {
            let result = dispatcher
                .submit(
                    "embed",
                    payload(i),
                    SubmitOptions::new().with_endpoint("e1"),
                )
                .await;
            assert!(matches!(result, Err(RelayError::Provider(_))));
        }
        assert_eq!(dispatcher.breaker.state(&EndpointId::new("e1")), CircuitState::Open);
        assert_eq!(e1.call_count(), 5);

        for i in 0..20 {
            let completion = dispatcher
                .submit("embed", payload(i), SubmitOptions::new())
                .await
                .unwrap();
            assert_eq!(completion.endpoint.as_str(), "e2");
            tokio::time::advance(Duration::from_millis(400)).await;
        }
        assert_eq!(e1.call_count(), 5);

        // Open duration elapsed: exactly one probe reaches e1 and closes it
        tokio::time::advance(Duration::from_secs(2)).await;
        e1.set_failing(false);
        let probe = dispatcher
            .submit("embed", payload(99), SubmitOptions::new())
            .await
            .unwrap();
        assert_eq!(probe.endpoint.as_str(), "e1");
        assert_eq!(e1.call_count(), 6);
        assert_eq!(dispatcher.breaker.state(&EndpointId::new("e1")), CircuitState::Closed);
        assert_eq!(
            dispatcher
                .breaker_snapshot(&EndpointId::new("e1"))
                .unwrap()
                .consecutive_failures,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_to_open_endpoint_is_rejected() {
        let e1 = Arc::new(ScriptedProvider::new("e1"));
        let dispatcher = dispatcher_with(&[("e1", e1.clone())], |b| {
            b.max_batch_size(1)
                .circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(1))
        });

        e1.set_failing(true);
        let _ = dispatcher.submit("embed", payload(0), SubmitOptions::new()).await;

        let err = dispatcher
            .submit("embed", payload(1), SubmitOptions::new().with_endpoint("e1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::CircuitOpen { .. }));

        let err = dispatcher
            .submit("embed", payload(2), SubmitOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Routing(_)));
        assert_eq!(e1.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_rejected_when_breaker_trips_before_flush() {
        let e1 = Arc::new(ScriptedProvider::new("e1"));
        let dispatcher = dispatcher_with(&[("e1", e1.clone())], |b| {
            b.max_batch_size(8).circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_failure_threshold(1)
                    .with_window(FailureWindow::Calls { calls: 4 }),
            )
        });

        let waiting = dispatcher
            .enqueue("embed", payload(0), SubmitOptions::new().with_compat("a"))
            .await
            .unwrap();

        // A different batch to the same endpoint fails and trips the breaker
        e1.push(Step::Fail(RelayError::provider("down")));
        let tripping = dispatcher
            .enqueue("embed", payload(1), SubmitOptions::new().with_compat("b"))
            .await
            .unwrap();
        assert_eq!(dispatcher.flush(), 2);

        let (waiting, tripping) = tokio::join!(waiting, tripping);
        let outcomes = [waiting, tripping];
        assert_eq!(e1.call_count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(RelayError::CircuitOpen { .. }))));
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(RelayError::Provider(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_c_cancel_releases_budget() {
        let provider = Arc::new(ScriptedProvider::new("e1"));
        let dispatcher = dispatcher_with(&[("e1", provider.clone())], |b| {
            b.tenant_budget("acme", BudgetConfig::new(1000))
                .budget_queue(BudgetQueueConfig {
                    enabled: false,
                    ..Default::default()
                })
        });
        let options = || SubmitOptions::new().with_tenant("acme").with_estimated_tokens(600);
        let scope = BudgetScope::tenant("acme");

        let mut first = dispatcher.enqueue("embed", payload(0), options()).await.unwrap();
        assert_eq!(dispatcher.budget().remaining(&scope), Some(400));

        let err = dispatcher
            .enqueue("embed", payload(1), options())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::TokenBudgetExceeded { .. }));

        assert!(first.cancel());
        assert_eq!(dispatcher.budget().remaining(&scope), Some(1000));
        assert!(matches!(first.await, Err(RelayError::Cancelled)));
        assert_eq!(dispatcher.pending_requests(), 0);

        let second = dispatcher.enqueue("embed", payload(1), options()).await.unwrap();
        let completion = second.await.unwrap();
        assert_eq!(provider.call_count(), 1);
        assert_eq!(provider.calls()[0].inputs, vec![payload(1)]);
        // Reconciled to actual usage
        assert_eq!(
            dispatcher.budget().remaining(&scope),
            Some(1000 - completion.tokens_used)
        );
        assert_eq!(dispatcher.metrics().counter(names::REQUESTS_CANCELLED), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_c_queued_reservation_wakes_on_release() {
        let provider = Arc::new(ScriptedProvider::new("e1"));
        let dispatcher = Arc::new(dispatcher_with(&[("e1", provider.clone())], |b| {
            b.tenant_budget("acme", BudgetConfig::new(1000))
        }));
        let options = || SubmitOptions::new().with_tenant("acme").with_estimated_tokens(600);

        let first = dispatcher.enqueue("embed", payload(0), options()).await.unwrap();
        let queued = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.enqueue("embed", payload(1), options()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(first);

        let second = queued.await.unwrap().unwrap();
        assert!(second.await.is_ok());
        assert_eq!(dispatcher.metrics().counter(names::BUDGET_QUEUED), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_flush_does_not_affect_peers() {
        let provider = Arc::new(ScriptedProvider::new("e1"));
        provider.push(Step::Delay(Duration::from_millis(100)));
        let dispatcher = dispatcher_with(&[("e1", provider.clone())], |b| b.max_batch_size(2));

        let mut first = dispatcher
            .enqueue("embed", payload(0), SubmitOptions::new())
            .await
            .unwrap();
        let second = dispatcher
            .enqueue("embed", payload(1), SubmitOptions::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(provider.call_count(), 1);

        assert!(!first.cancel());
        assert!(matches!(first.await, Err(RelayError::Cancelled)));
        assert_eq!(
            second.await.unwrap().output,
            serde_json::json!({ "echo": "input-1" })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_retries_on_other_endpoint() {
        let e1 = Arc::new(ScriptedProvider::new("e1"));
        let e2 = Arc::new(ScriptedProvider::new("e2"));
        e1.push(Step::FailItems(vec![1]));
        let dispatcher = dispatcher_with(&[("e1", e1.clone()), ("e2", e2.clone())], |b| {
            b.max_batch_size(3)
        });

        let mut submissions = Vec::new();
        for i in 0..3 {
            submissions.push(
                dispatcher
                    .enqueue("embed", payload(i), SubmitOptions::new().with_endpoint("e1"))
                    .await
                    .unwrap(),
            );
        }
        let results = futures::future::join_all(submissions).await;

        let retried = results[1].as_ref().unwrap();
        assert!(retried.retried);
        assert_eq!(retried.endpoint.as_str(), "e2");
        assert!(!results[0].as_ref().unwrap().retried);
        assert_eq!(e2.calls()[0].inputs, vec![payload(1)]);
        assert_eq!(dispatcher.metrics().counter(names::PARTIAL_RETRIES), 1);
        assert_eq!(dispatcher.metrics().counter(names::ITEM_FAILURES), 1);
        // Partial failure does not count against the breaker
        assert_eq!(
            dispatcher
                .breaker_snapshot(&EndpointId::new("e1"))
                .unwrap()
                .consecutive_failures,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_terminal_without_retry() {
        let e1 = Arc::new(ScriptedProvider::new("e1"));
        let e2 = Arc::new(ScriptedProvider::new("e2"));
        e1.push(Step::FailItems(vec![0]));
        let dispatcher = dispatcher_with(&[("e1", e1.clone()), ("e2", e2.clone())], |b| {
            b.max_batch_size(1).retry_partial(false)
        });

        let err = dispatcher
            .submit("embed", payload(0), SubmitOptions::new().with_endpoint("e1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Provider(_)));
        assert_eq!(e2.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_count_mismatch_fails_batch() {
        let e1 = Arc::new(ScriptedProvider::new("e1"));
        e1.push(Step::ShortResults);
        let dispatcher = dispatcher_with(&[("e1", e1.clone())], |b| b.max_batch_size(2));

        let a = dispatcher.enqueue("embed", payload(0), SubmitOptions::new()).await.unwrap();
        let b = dispatcher.enqueue("embed", payload(1), SubmitOptions::new()).await.unwrap();
        let (a, b) = tokio::join!(a, b);
        assert!(matches!(a, Err(RelayError::Provider(_))));
        assert!(matches!(b, Err(RelayError::Provider(_))));
        assert_eq!(dispatcher.metrics().counter(names::PROVIDER_FAILURES), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_fails_all_members() {
        let e1 = Arc::new(ScriptedProvider::new("e1"));
        e1.push(Step::Delay(Duration::from_secs(5)));
        let dispatcher = dispatcher_with(&[("e1", e1.clone())], |b| {
            b.max_batch_size(2).call_timeout(Duration::from_secs(1))
        });

        let a = dispatcher.enqueue("embed", payload(0), SubmitOptions::new()).await.unwrap();
        let b = dispatcher.enqueue("embed", payload(1), SubmitOptions::new()).await.unwrap();
        let (a, b) = tokio::join!(a, b);
        assert!(matches!(a, Err(RelayError::BatchTimeout { .. })));
        assert!(matches!(b, Err(RelayError::BatchTimeout { .. })));
        assert_eq!(dispatcher.metrics().counter(names::BATCH_TIMEOUTS), 1);
        assert_eq!(
            dispatcher
                .breaker_snapshot(&EndpointId::new("e1"))
                .unwrap()
                .consecutive_failures,
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_deadline_times_out_only_that_member() {
        let e1 = Arc::new(ScriptedProvider::new("e1"));
        e1.push(Step::Delay(Duration::from_millis(200)));
        let dispatcher = dispatcher_with(&[("e1", e1.clone())], |b| b.max_batch_size(2));

        let started = tokio::time::Instant::now();
        let short = dispatcher
            .enqueue(
                "embed",
                payload(0),
                SubmitOptions::new().with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();
        let patient = dispatcher.enqueue("embed", payload(1), SubmitOptions::new()).await.unwrap();

        let (short, patient) = tokio::join!(
            async move {
                let result = short.await;
                (result, started.elapsed())
            },
            patient
        );
        let (short, short_after) = short;
        assert!(matches!(short, Err(RelayError::Timeout(_))));
        assert!(short_after < Duration::from_millis(150));
        assert_eq!(patient.unwrap().output, serde_json::json!({ "echo": "input-1" }));

        // The call itself succeeded; only the call timeout bounds it
        assert_eq!(e1.call_count(), 1);
        assert!(e1.calls()[0].deadline >= started + Duration::from_secs(30));
        assert_eq!(dispatcher.metrics().counter(names::BATCH_TIMEOUTS), 0);
        let breaker = dispatcher.breaker_snapshot(&EndpointId::new("e1")).unwrap();
        assert_eq!(breaker.consecutive_failures, 0);
        assert_eq!(breaker.state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_least_loaded_counts_queued_requests() {
        let e1 = Arc::new(ScriptedProvider::new("e1"));
        let e2 = Arc::new(ScriptedProvider::new("e2"));
        e1.push(Step::Delay(Duration::from_secs(1)));
        let dispatcher = dispatcher_with(&[("e1", e1.clone()), ("e2", e2.clone())], |b| {
            b.max_batch_size(2).routing_strategy(RoutingStrategy::LeastLoaded)
        });

        let first = dispatcher.enqueue("embed", payload(0), SubmitOptions::new()).await.unwrap();
        let loads: Vec<_> = dispatcher
            .endpoint_snapshots()
            .into_iter()
            .map(|s| (s.id.to_string(), s.in_flight))
            .collect();
        assert_eq!(loads, vec![("e1".to_string(), 1), ("e2".to_string(), 0)]);

        let mut submissions = vec![first];
        for i in 1..10 {
            submissions.push(
                dispatcher
                    .enqueue("embed", payload(i), SubmitOptions::new())
                    .await
                    .unwrap(),
            );
        }
        let results = futures::future::join_all(submissions).await;
        assert!(results.iter().all(|r| r.is_ok()));

        assert_eq!(e1.batch_sizes().iter().sum::<usize>(), 5);
        assert_eq!(e2.batch_sizes().iter().sum::<usize>(), 5);
        assert!(dispatcher.endpoint_snapshots().iter().all(|s| s.in_flight == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_aware_prefers_fast_endpoint() {
        let e1 = Arc::new(ScriptedProvider::new("e1"));
        let e2 = Arc::new(ScriptedProvider::new("e2"));
        e1.push(Step::Delay(Duration::from_millis(200)));
        let dispatcher = dispatcher_with(&[("e1", e1.clone()), ("e2", e2.clone())], |b| {
            b.max_batch_size(1).routing_strategy(RoutingStrategy::LatencyAware)
        });

        // Neither endpoint has samples yet, so the first request goes to e1
        let warm = dispatcher.submit("embed", payload(0), SubmitOptions::new()).await.unwrap();
        assert_eq!(warm.endpoint.as_str(), "e1");

        for i in 1..6 {
            let completion = dispatcher
                .submit("embed", payload(i), SubmitOptions::new())
                .await
                .unwrap();
            assert_eq!(completion.endpoint.as_str(), "e2");
        }
        assert_eq!(e1.call_count(), 1);
        assert_eq!(e2.call_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_weighted_random_follows_weights() {
        let e1 = Arc::new(ScriptedProvider::new("e1"));
        let e2 = Arc::new(ScriptedProvider::new("e2"));
        let dispatcher = Dispatcher::builder()
            .endpoint(EndpointConfig::new("e1").with_weight(3), Arc::clone(&e1))
            .endpoint(EndpointConfig::new("e2").with_weight(1), Arc::clone(&e2))
            .routing_strategy(RoutingStrategy::WeightedRandom)
            .build()
            .unwrap();

        let mut submissions = Vec::new();
        for i in 0..400 {
            submissions.push(
                dispatcher
                    .enqueue("embed", payload(i), SubmitOptions::new())
                    .await
                    .unwrap(),
            );
        }
        let results = futures::future::join_all(submissions).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let to_e1: usize = e1.batch_sizes().iter().sum();
        let to_e2: usize = e2.batch_sizes().iter().sum();
        assert_eq!(to_e1 + to_e2, 400);
        // Expected 300 / 100; the bounds sit several deviations out
        assert!((240..=360).contains(&to_e1), "e1 received {}", to_e1);
        assert!(to_e2 > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_and_rejects() {
        let provider = Arc::new(ScriptedProvider::new("e1"));
        let dispatcher = dispatcher_with(&[("e1", provider.clone())], |b| {
            b.max_wait(Duration::from_secs(60))
        });

        let pending = dispatcher
            .enqueue("embed", payload(0), SubmitOptions::new().with_priority(Priority::High))
            .await
            .unwrap();
        dispatcher.shutdown().await;
        assert_eq!(provider.call_count(), 1);
        assert!(pending.await.is_ok());

        let err = dispatcher
            .enqueue("embed", payload(1), SubmitOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_batch_leaving_the_manager() {
        let provider = Arc::new(ScriptedProvider::new("e1"));
        let dispatcher = Arc::new(dispatcher_with(&[("e1", provider.clone())], |b| b));

        // A flush path holds its slot before taking the batch out
        let slot = dispatcher.processor.track();
        let stopping = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!stopping.is_finished());

        drop(slot);
        stopping.await.unwrap();
        assert_eq!(dispatcher.processor.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_after_timer_flush_waits_for_call() {
        let provider = Arc::new(ScriptedProvider::new("e1"));
        provider.push(Step::Delay(Duration::from_secs(1)));
        let dispatcher = dispatcher_with(&[("e1", provider.clone())], |b| {
            b.max_wait(Duration::from_millis(50))
        });

        let submission = dispatcher
            .enqueue("embed", payload(0), SubmitOptions::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(dispatcher.pending_requests(), 0);

        dispatcher.shutdown().await;
        assert_eq!(provider.call_count(), 1);
        assert_eq!(dispatcher.processor.in_flight(), 0);
        assert!(submission.await.is_ok());
    }

    #[derive(Debug, Default)]
    struct RecordingHook {
        flushed: AtomicUsize,
        completed: AtomicUsize,
        errors: AtomicUsize,
    }

    #[async_trait]
    impl Hook for RecordingHook {
        fn name(&self) -> &str {
            "recording"
        }

        async fn on_flush(&self, _batch: &crate::batch::FlushInfo) -> Result<(), RelayError> {
            self.flushed.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::hook("recording", "flush hook failed"))
        }

        async fn on_complete(
            &self,
            _request: &Request,
            _completion: &Completion,
        ) -> Result<(), RelayError> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_error(
            &self,
            _request: &Request,
            _error: &RelayError,
        ) -> Result<(), RelayError> {
            self.errors.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hooks_run_and_failures_are_counted() {
        let provider = Arc::new(ScriptedProvider::new("e1"));
        provider.push(Step::FailItems(vec![1]));
        let hook = Arc::new(RecordingHook::default());
        let dispatcher = dispatcher_with(&[("e1", provider.clone())], |b| {
            b.max_batch_size(2).hook(hook.clone())
        });

        let a = dispatcher.enqueue("embed", payload(0), SubmitOptions::new()).await.unwrap();
        let b = dispatcher.enqueue("embed", payload(1), SubmitOptions::new()).await.unwrap();
        let (a, b) = tokio::join!(a, b);
        assert!(a.is_ok());
        assert!(b.is_err());
        dispatcher.shutdown().await;

        assert_eq!(hook.flushed.load(Ordering::SeqCst), 1);
        assert_eq!(hook.completed.load(Ordering::SeqCst), 1);
        assert_eq!(hook.errors.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.metrics().counter(names::HOOK_FAILURES), 1);
    }

    #[tokio::test]
    async fn test_build_rejects_bad_config() {
        let err = Dispatcher::builder().build().unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));

        let err = Dispatcher::builder()
            .endpoint(EndpointConfig::new("a"), ScriptedProvider::new("a"))
            .endpoint(EndpointConfig::new("a"), ScriptedProvider::new("a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));

        let err = Dispatcher::builder()
            .endpoint(EndpointConfig::new("a"), ScriptedProvider::new("a"))
            .max_batch_size(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));
    }

    #[test]
    fn test_config_from_json() {
        let config: DispatcherConfig = serde_json::from_value(serde_json::json!({
            "max_batch_size": 16,
            "call_timeout_ms": 5000,
            "routing": { "strategy": "least-loaded" },
            "tenant_budgets": { "acme": { "ceiling": 1000 } }
        }))
        .unwrap();
        assert_eq!(config.max_batch_size, 16);
        assert_eq!(config.max_wait_ms, 50);
        assert_eq!(config.processor.call_timeout_ms, 5000);
        assert!(config.processor.retry_partial);
        assert_eq!(config.routing.strategy, RoutingStrategy::LeastLoaded);
        assert_eq!(config.tenant_budgets["acme"].ceiling, 1000);
        assert!(config.validate().is_ok());
    }
}
