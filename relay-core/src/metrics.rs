//! Metrics collection and call-outcome fan-out.
//!
//! The collector is an explicit instance shared by `Arc` into the router,
//! breaker, budget tracker and batch processor. `record_call` is the only
//! path by which call outcomes reach load balancer and breaker state.

use crate::types::{CallEvent, EndpointId};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Counter names
pub mod names {
    pub const REQUESTS_SUBMITTED: &str = "requests.submitted";
    pub const REQUESTS_COMPLETED: &str = "requests.completed";
    pub const REQUESTS_FAILED: &str = "requests.failed";
    pub const REQUESTS_CANCELLED: &str = "requests.cancelled";
    pub const ROUTING_FAILURES: &str = "routing.failures";
    pub const CIRCUIT_REJECTIONS: &str = "circuit.rejections";
    pub const BREAKER_TRIPS: &str = "breaker.trips";
    pub const BREAKER_RECOVERIES: &str = "breaker.recoveries";
    pub const BUDGET_REJECTIONS: &str = "budget.rejections";
    pub const BUDGET_QUEUED: &str = "budget.queued";
    pub const BATCHES_FLUSHED: &str = "batches.flushed";
    pub const BATCH_TIMEOUTS: &str = "batches.timeouts";
    pub const CALLS: &str = "calls.total";
    pub const CALL_FAILURES: &str = "calls.failures";
    pub const PROVIDER_FAILURES: &str = "provider.failures";
    pub const ITEM_FAILURES: &str = "items.failures";
    pub const PARTIAL_RETRIES: &str = "items.retries";
    pub const TOKENS_USED: &str = "tokens.used";
    pub const HOOK_FAILURES: &str = "hook.failures";
}

/// A single write-once metric sample.
#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
    pub timestamp: SystemTime,
}

impl Metric {
    /// Create a metric stamped now
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            tags: BTreeMap::new(),
            timestamp: SystemTime::now(),
        }
    }

    /// Add a tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Destination for emitted metrics. Storage and display live outside the core.
pub trait MetricsSink: Send + Sync + Debug {
    fn emit(&self, metric: &Metric);
}

/// Receives every recorded call outcome.
pub trait CallObserver: Send + Sync {
    fn observe(&self, event: &CallEvent);
}

/// Stream of metrics produced by a [`ChannelSink`]
pub type MetricStream = UnboundedReceiverStream<Metric>;

/// Sink forwarding metrics into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Metric>,
}

impl ChannelSink {
    /// Create a sink and the stream draining it
    pub fn new() -> (Self, MetricStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UnboundedReceiverStream::new(rx))
    }
}

impl MetricsSink for ChannelSink {
    fn emit(&self, metric: &Metric) {
        // Receiver gone means nobody is listening
        let _ = self.tx.send(metric.clone());
    }
}

#[derive(Debug, Default)]
struct EndpointCounters {
    calls: AtomicU64,
    failures: AtomicU64,
    tokens: AtomicU64,
    latency_sum_us: AtomicU64,
}

/// Metrics collector
pub struct MetricsCollector {
    counters: DashMap<&'static str, AtomicU64>,
    endpoints: DashMap<EndpointId, EndpointCounters>,
    sink: Option<Arc<dyn MetricsSink>>,
    observers: ArcSwap<Vec<Weak<dyn CallObserver>>>,
    start_time: Instant,
}

impl Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("counters", &self.counters.len())
            .field("endpoints", &self.endpoints.len())
            .field("sink", &self.sink)
            .finish()
    }
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            endpoints: DashMap::new(),
            sink: None,
            observers: ArcSwap::from_pointee(Vec::new()),
            start_time: Instant::now(),
        }
    }

    /// Create a collector emitting to a sink
    pub fn with_sink(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new()
        }
    }

    /// Register an observer of call outcomes.
    ///
    /// Observers are held weakly; dropped observers are skipped.
    pub fn subscribe(&self, observer: Weak<dyn CallObserver>) {
        self.observers.rcu(|current| {
            let mut next: Vec<Weak<dyn CallObserver>> = current
                .iter()
                .filter(|o| o.strong_count() > 0)
                .cloned()
                .collect();
            next.push(observer.clone());
            next
        });
    }

    /// Increment a counter by one
    pub fn increment(&self, name: &'static str, tags: &[(&str, &str)]) {
        self.increment_by(name, 1, tags);
    }

    /// Increment a counter and emit the increment as a metric
    pub fn increment_by(&self, name: &'static str, value: u64, tags: &[(&str, &str)]) {
        self.bump(name, value);
        if let Some(sink) = &self.sink {
            let metric = tags
                .iter()
                .fold(Metric::new(name, value as f64), |m, (k, v)| m.with_tag(*k, *v));
            sink.emit(&metric);
        }
    }

    fn bump(&self, name: &'static str, value: u64) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name)
            .or_default()
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Record a completed provider call and forward it to observers
    pub fn record_call(&self, event: &CallEvent) {
        self.bump(names::CALLS, 1);
        self.bump(names::TOKENS_USED, event.tokens_used);
        if event.outcome.is_failure() {
            self.bump(names::CALL_FAILURES, 1);
        }

        {
            let stats = self.endpoints.entry(event.endpoint.clone()).or_default();
            stats.calls.fetch_add(1, Ordering::Relaxed);
            stats.tokens.fetch_add(event.tokens_used, Ordering::Relaxed);
            stats
                .latency_sum_us
                .fetch_add(event.latency.as_micros() as u64, Ordering::Relaxed);
            if event.outcome.is_failure() {
                stats.failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(sink) = &self.sink {
            let metric = Metric {
                name: "call.latency_ms".to_string(),
                value: event.latency_ms(),
                tags: BTreeMap::new(),
                timestamp: event.timestamp,
            }
            .with_tag("endpoint", event.endpoint.as_str())
            .with_tag("outcome", event.outcome.as_str())
            .with_tag("batch_size", event.batch_size.to_string());
            sink.emit(&metric);

            let tokens = Metric {
                name: "call.tokens".to_string(),
                value: event.tokens_used as f64,
                tags: BTreeMap::new(),
                timestamp: event.timestamp,
            }
            .with_tag("endpoint", event.endpoint.as_str());
            sink.emit(&tokens);
        }

        for observer in self.observers.load().iter() {
            if let Some(observer) = observer.upgrade() {
                observer.observe(event);
            }
        }
    }

    /// Current value of a counter
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
            .collect();

        let endpoints = self
            .endpoints
            .iter()
            .map(|entry| {
                let calls = entry.calls.load(Ordering::Relaxed);
                let latency_sum = entry.latency_sum_us.load(Ordering::Relaxed);
                (
                    entry.key().clone(),
                    EndpointCallStats {
                        calls,
                        failures: entry.failures.load(Ordering::Relaxed),
                        tokens: entry.tokens.load(Ordering::Relaxed),
                        avg_latency_us: if calls > 0 { latency_sum / calls } else { 0 },
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            counters,
            endpoints,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-endpoint call statistics
#[derive(Debug, Clone, Serialize)]
pub struct EndpointCallStats {
    pub calls: u64,
    pub failures: u64,
    pub tokens: u64,
    pub avg_latency_us: u64,
}

/// Metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub endpoints: BTreeMap<EndpointId, EndpointCallStats>,
    pub uptime_seconds: u64,
}
