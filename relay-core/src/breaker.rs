//! Per-endpoint circuit breaker.
//!
//! Classic three-state machine. State transitions happen only when a call
//! event is observed through the metrics collector; the router reads the
//! state and claims the half-open probe slot.

use crate::metrics::{names, CallObserver, MetricsCollector};
use crate::types::{CallEvent, EndpointId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Window in which consecutive failures are counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureWindow {
    /// Failures of a streak must all fall within this span
    Time { window_ms: u64 },
    /// Only the last `calls` outcomes are considered
    Calls { calls: u32 },
}

impl Default for FailureWindow {
    fn default() -> Self {
        FailureWindow::Time { window_ms: 30_000 }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub window: FailureWindow,
    pub open_duration_ms: u64,
    pub backoff_multiplier: f64,
    pub max_open_duration_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: FailureWindow::default(),
            open_duration_ms: 10_000,
            backoff_multiplier: 2.0,
            max_open_duration_ms: 300_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set failure window
    pub fn with_window(mut self, window: FailureWindow) -> Self {
        self.window = window;
        self
    }

    /// Set base open duration
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration_ms = duration.as_millis() as u64;
        self
    }

    /// Set maximum open duration
    pub fn with_max_open_duration(mut self, duration: Duration) -> Self {
        self.max_open_duration_ms = duration.as_millis() as u64;
        self
    }

    /// Open duration after `trips` consecutive trips
    fn open_duration(&self, trips: u32) -> Duration {
        let base = self.open_duration_ms as f64 * self.backoff_multiplier.powi(trips as i32);
        Duration::from_millis(base.min(self.max_open_duration_ms as f64) as u64)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        if let FailureWindow::Calls { calls } = self.window {
            if calls < self.failure_threshold {
                return Err(format!(
                    "call window of {} cannot hold {} consecutive failures",
                    calls, self.failure_threshold
                ));
            }
        }
        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be >= 1.0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BreakerCell {
    state: CircuitState,
    consecutive_failures: u32,
    /// First failure of the current streak
    streak_start: Option<Instant>,
    /// Recent outcomes (true = failure) for call windows
    recent: VecDeque<bool>,
    open_until: Option<Instant>,
    trips: u32,
    probe_in_flight: bool,
}

impl BreakerCell {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            streak_start: None,
            recent: VecDeque::new(),
            open_until: None,
            trips: 0,
            probe_in_flight: false,
        }
    }

    fn effective_state(&self, now: Instant) -> CircuitState {
        match (self.state, self.open_until) {
            (CircuitState::Open, Some(until)) if now >= until => CircuitState::HalfOpen,
            (state, _) => state,
        }
    }
}

/// Breaker snapshot for one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trips: u32,
    pub probe_in_flight: bool,
    /// Time left until an open breaker admits a probe
    pub retry_after: Option<Duration>,
}

/// Circuit breaker registry, one cell per endpoint
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    cells: DashMap<EndpointId, Mutex<BreakerCell>>,
    metrics: Arc<MetricsCollector>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("endpoints", &self.cells.len())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new breaker registry
    pub fn new(config: CircuitBreakerConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            config,
            cells: DashMap::new(),
            metrics,
        }
    }

    /// Start tracking an endpoint (closed)
    pub fn register(&self, endpoint: &EndpointId) {
        self.cells
            .entry(endpoint.clone())
            .or_insert_with(|| Mutex::new(BreakerCell::new()));
    }

    /// Effective state of an endpoint; unknown endpoints are closed
    pub fn state(&self, endpoint: &EndpointId) -> CircuitState {
        let now = Instant::now();
        self.cells
            .get(endpoint)
            .map(|cell| cell.lock().effective_state(now))
            .unwrap_or(CircuitState::Closed)
    }

    /// Whether a half-open endpoint's probe slot is free
    pub fn probe_available(&self, endpoint: &EndpointId) -> bool {
        let now = Instant::now();
        self.cells
            .get(endpoint)
            .map(|cell| {
                let cell = cell.lock();
                cell.effective_state(now) == CircuitState::HalfOpen && !cell.probe_in_flight
            })
            .unwrap_or(false)
    }

    /// Claim the single probe slot of a half-open endpoint
    pub fn try_acquire_probe(&self, endpoint: &EndpointId) -> bool {
        let now = Instant::now();
        let Some(cell) = self.cells.get(endpoint) else {
            return false;
        };
        let mut cell = cell.lock();
        if cell.effective_state(now) != CircuitState::HalfOpen || cell.probe_in_flight {
            return false;
        }
        cell.state = CircuitState::HalfOpen;
        cell.probe_in_flight = true;
        tracing::debug!("breaker probe claimed: endpoint={}", endpoint);
        true
    }

    /// Return a claimed probe slot that never reached the endpoint
    pub fn abandon_probe(&self, endpoint: &EndpointId) {
        if let Some(cell) = self.cells.get(endpoint) {
            let mut cell = cell.lock();
            if cell.state == CircuitState::HalfOpen {
                cell.probe_in_flight = false;
            }
        }
    }

    /// Whether a flushed batch may still be sent to the endpoint
    pub fn permits_dispatch(&self, endpoint: &EndpointId, probe: bool) -> bool {
        match self.state(endpoint) {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => probe,
            CircuitState::Open => false,
        }
    }

    /// Snapshot of an endpoint's breaker
    pub fn snapshot(&self, endpoint: &EndpointId) -> Option<BreakerSnapshot> {
        let now = Instant::now();
        self.cells.get(endpoint).map(|cell| {
            let cell = cell.lock();
            let state = cell.effective_state(now);
            BreakerSnapshot {
                state,
                consecutive_failures: cell.consecutive_failures,
                trips: cell.trips,
                probe_in_flight: cell.probe_in_flight,
                retry_after: match state {
                    CircuitState::Open => cell
                        .open_until
                        .map(|until| until.saturating_duration_since(now)),
                    _ => None,
                },
            }
        })
    }

    fn record_failure(&self, cell: &mut BreakerCell, now: Instant) -> u32 {
        match self.config.window {
            FailureWindow::Time { window_ms } => {
                let window = Duration::from_millis(window_ms);
                match cell.streak_start {
                    Some(start) if now.saturating_duration_since(start) <= window => {
                        cell.consecutive_failures += 1;
                    }
                    _ => {
                        cell.streak_start = Some(now);
                        cell.consecutive_failures = 1;
                    }
                }
            }
            FailureWindow::Calls { calls } => {
                push_outcome(&mut cell.recent, calls as usize, true);
                cell.consecutive_failures =
                    cell.recent.iter().rev().take_while(|failed| **failed).count() as u32;
            }
        }
        cell.consecutive_failures
    }

    fn record_success(&self, cell: &mut BreakerCell) {
        cell.consecutive_failures = 0;
        cell.streak_start = None;
        if let FailureWindow::Calls { calls } = self.config.window {
            push_outcome(&mut cell.recent, calls as usize, false);
        }
    }

    fn trip(&self, endpoint: &EndpointId, cell: &mut BreakerCell, now: Instant) {
        let duration = self.config.open_duration(cell.trips);
        cell.state = CircuitState::Open;
        cell.open_until = Some(now + duration);
        cell.trips += 1;
        cell.probe_in_flight = false;
        cell.consecutive_failures = 0;
        cell.streak_start = None;
        cell.recent.clear();

        self.metrics
            .increment(names::BREAKER_TRIPS, &[("endpoint", endpoint.as_str())]);
        tracing::warn!(
            "circuit opened: endpoint={}, trips={}, open_for={:?}",
            endpoint,
            cell.trips,
            duration
        );
    }

    fn close(&self, endpoint: &EndpointId, cell: &mut BreakerCell) {
        *cell = BreakerCell::new();
        self.metrics
            .increment(names::BREAKER_RECOVERIES, &[("endpoint", endpoint.as_str())]);
        tracing::info!("circuit closed: endpoint={}", endpoint);
    }
}

fn push_outcome(recent: &mut VecDeque<bool>, capacity: usize, failed: bool) {
    if recent.len() == capacity.max(1) {
        recent.pop_front();
    }
    recent.push_back(failed);
}

impl CallObserver for CircuitBreaker {
    fn observe(&self, event: &CallEvent) {
        let now = Instant::now();
        let cell = self
            .cells
            .entry(event.endpoint.clone())
            .or_insert_with(|| Mutex::new(BreakerCell::new()));
        let mut cell = cell.lock();
        let failed = event.outcome.is_failure();

        match cell.state {
            CircuitState::Closed => {
                if failed {
                    if self.record_failure(&mut cell, now) >= self.config.failure_threshold {
                        self.trip(&event.endpoint, &mut cell, now);
                    }
                } else {
                    self.record_success(&mut cell);
                }
            }
            CircuitState::HalfOpen if event.probe => {
                if failed {
                    self.trip(&event.endpoint, &mut cell, now);
                } else {
                    self.close(&event.endpoint, &mut cell);
                }
            }
            // Late results of calls started before the trip carry no signal
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }
}
