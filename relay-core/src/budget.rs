//! Token budget tracking.
//!
//! Reservations are optimistic: the estimate is subtracted up front so that
//! concurrent requests see an accurate balance, and the difference to actual
//! usage is reconciled once the call completes.
//!
//! # Features
//!
//! - Per tenant or per endpoint scopes; unconfigured scopes are unmetered
//! - Fixed-window or leaky-bucket refill, never above the ceiling
//! - Bounded wait queue with timeout for exhausted scopes
//! - Reservations release themselves on drop

use crate::error::RelayError;
use crate::metrics::{names, MetricsCollector};
use crate::types::EndpointId;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What a budget is accounted against
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum BudgetScope {
    Tenant(String),
    Endpoint(EndpointId),
}

impl BudgetScope {
    /// Tenant scope
    pub fn tenant(tenant: impl Into<String>) -> Self {
        Self::Tenant(tenant.into())
    }

    /// Endpoint scope
    pub fn endpoint(endpoint: impl Into<EndpointId>) -> Self {
        Self::Endpoint(endpoint.into())
    }
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetScope::Tenant(t) => write!(f, "tenant:{}", t),
            BudgetScope::Endpoint(e) => write!(f, "endpoint:{}", e),
        }
    }
}

/// How a scope regains quota
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RefillPolicy {
    /// Top back up to the ceiling once per interval
    FixedWindow { interval_ms: u64 },
    /// Regain quota continuously
    LeakyBucket { tokens_per_sec: f64 },
}

impl Default for RefillPolicy {
    fn default() -> Self {
        RefillPolicy::FixedWindow { interval_ms: 60_000 }
    }
}

/// Budget configuration for one scope
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub ceiling: u64,
    #[serde(default)]
    pub refill: RefillPolicy,
}

impl BudgetConfig {
    /// Fixed window budget refilled every 60 seconds
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            refill: RefillPolicy::default(),
        }
    }

    /// Set refill policy
    pub fn with_refill(mut self, refill: RefillPolicy) -> Self {
        self.refill = refill;
        self
    }
}

/// Wait queue behaviour for exhausted scopes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetQueueConfig {
    /// Queue instead of failing immediately
    pub enabled: bool,
    /// Maximum concurrent waiters per scope
    pub max_queue_depth: usize,
    /// How long a waiter may wait before failing
    pub wait_timeout_ms: u64,
}

impl Default for BudgetQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_queue_depth: 1024,
            wait_timeout_ms: 2_000,
        }
    }
}

impl BudgetQueueConfig {
    /// Wait timeout as a duration
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

struct BudgetState {
    remaining: u64,
    last_refill: Instant,
    /// Leaky bucket carry below one token
    carry: f64,
    waiters: usize,
}

struct ScopeBudget {
    config: BudgetConfig,
    state: Mutex<BudgetState>,
    notify: Notify,
}

impl ScopeBudget {
    fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BudgetState {
                remaining: config.ceiling,
                last_refill: Instant::now(),
                carry: 0.0,
                waiters: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Apply any refill due at `now`. Returns whether quota was added.
    fn refill(&self, state: &mut BudgetState, now: Instant) -> bool {
        let before = state.remaining;
        match self.config.refill {
            RefillPolicy::FixedWindow { interval_ms } => {
                let interval = Duration::from_millis(interval_ms);
                if now.saturating_duration_since(state.last_refill) >= interval {
                    state.remaining = self.config.ceiling;
                    state.last_refill = now;
                }
            }
            RefillPolicy::LeakyBucket { tokens_per_sec } => {
                let elapsed = now.saturating_duration_since(state.last_refill);
                let gained = elapsed.as_secs_f64() * tokens_per_sec + state.carry;
                let whole = gained.floor();
                state.carry = gained - whole;
                state.remaining = state
                    .remaining
                    .saturating_add(whole as u64)
                    .min(self.config.ceiling);
                if state.remaining == self.config.ceiling {
                    state.carry = 0.0;
                }
                state.last_refill = now;
            }
        }
        state.remaining > before
    }

    fn try_take(&self, tokens: u64) -> Result<(), u64> {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        if state.remaining >= tokens {
            state.remaining -= tokens;
            Ok(())
        } else {
            Err(state.remaining)
        }
    }

    fn credit(&self, tokens: u64) {
        if tokens == 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            state.remaining = state.remaining.saturating_add(tokens).min(self.config.ceiling);
        }
        self.notify.notify_waiters();
    }

    fn debit(&self, tokens: u64) {
        let mut state = self.state.lock();
        state.remaining = state.remaining.saturating_sub(tokens);
    }

    fn remaining(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.remaining
    }
}

const RESERVED: u8 = 0;
const RECONCILED: u8 = 1;
const RELEASED: u8 = 2;

/// Provisional deduction against a scope.
///
/// Settles exactly once: `reconcile` applies the actual usage, `release`
/// returns the estimate if nothing was reconciled. Dropping an unsettled
/// reservation releases it.
pub struct Reservation {
    id: uuid::Uuid,
    scope: BudgetScope,
    estimated: u64,
    budget: Option<Arc<ScopeBudget>>,
    state: AtomicU8,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("estimated", &self.estimated)
            .field("metered", &self.budget.is_some())
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}

impl Reservation {
    fn new(scope: BudgetScope, estimated: u64, budget: Option<Arc<ScopeBudget>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            scope,
            estimated,
            budget,
            state: AtomicU8::new(RESERVED),
        }
    }

    /// Reservation id
    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    /// Scope this reservation draws from
    pub fn scope(&self) -> &BudgetScope {
        &self.scope
    }

    /// Estimated tokens deducted at reservation time
    pub fn estimated(&self) -> u64 {
        self.estimated
    }

    /// Whether the scope is metered
    pub fn is_metered(&self) -> bool {
        self.budget.is_some()
    }

    /// Whether the reservation has been reconciled or released
    pub fn is_settled(&self) -> bool {
        self.state.load(Ordering::Acquire) != RESERVED
    }

    /// Adjust the balance by the difference between estimate and actual
    /// usage. Returns `false` if the reservation was already settled.
    pub fn reconcile(&self, actual: u64) -> bool {
        if self
            .state
            .compare_exchange(RESERVED, RECONCILED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(budget) = &self.budget {
            if actual < self.estimated {
                budget.credit(self.estimated - actual);
            } else if actual > self.estimated {
                budget.debit(actual - self.estimated);
            }
        }
        true
    }

    /// Release the reservation. Idempotent; returns whether the estimate
    /// was given back to the scope.
    pub fn release(&self) -> bool {
        match self.state.swap(RELEASED, Ordering::AcqRel) {
            RESERVED => {
                if let Some(budget) = &self.budget {
                    budget.credit(self.estimated);
                }
                true
            }
            _ => false,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}

/// Snapshot of one scope
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub scope: BudgetScope,
    pub ceiling: u64,
    pub remaining: u64,
    pub waiters: usize,
}

/// Token budget tracker
pub struct TokenBudgetTracker {
    scopes: DashMap<BudgetScope, Arc<ScopeBudget>>,
    queue: BudgetQueueConfig,
    metrics: Arc<MetricsCollector>,
}

impl fmt::Debug for TokenBudgetTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBudgetTracker")
            .field("scopes", &self.scopes.len())
            .field("queue", &self.queue)
            .finish()
    }
}

impl TokenBudgetTracker {
    /// Create a new tracker with no metered scopes
    pub fn new(queue: BudgetQueueConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            scopes: DashMap::new(),
            queue,
            metrics,
        }
    }

    /// Configure (or replace) the budget of a scope
    pub fn set_budget(&self, scope: BudgetScope, config: BudgetConfig) {
        self.scopes.insert(scope, Arc::new(ScopeBudget::new(config)));
    }

    /// Whether a scope is metered
    pub fn is_metered(&self, scope: &BudgetScope) -> bool {
        self.scopes.contains_key(scope)
    }

    /// Remaining quota of a metered scope
    pub fn remaining(&self, scope: &BudgetScope) -> Option<u64> {
        self.scopes.get(scope).map(|b| b.remaining())
    }

    fn budget(&self, scope: &BudgetScope) -> Option<Arc<ScopeBudget>> {
        self.scopes.get(scope).map(|b| Arc::clone(b.value()))
    }

    fn reject(&self, scope: &BudgetScope, requested: u64, remaining: u64) -> RelayError {
        let label = scope.to_string();
        self.metrics
            .increment(names::BUDGET_REJECTIONS, &[("scope", label.as_str())]);
        tracing::debug!(
            "budget exhausted: scope={}, requested={}, remaining={}",
            label,
            requested,
            remaining
        );
        RelayError::budget_exceeded(label, requested, remaining)
    }

    /// Reserve tokens, failing fast when the scope is exhausted
    pub fn reserve(&self, scope: &BudgetScope, tokens: u64) -> Result<Reservation, RelayError> {
        let Some(budget) = self.budget(scope) else {
            return Ok(Reservation::new(scope.clone(), tokens, None));
        };
        match budget.try_take(tokens) {
            Ok(()) => Ok(Reservation::new(scope.clone(), tokens, Some(budget))),
            Err(remaining) => Err(self.reject(scope, tokens, remaining)),
        }
    }

    /// Reserve tokens, waiting in the scope's bounded queue when exhausted
    pub async fn reserve_queued(
        &self,
        scope: &BudgetScope,
        tokens: u64,
    ) -> Result<Reservation, RelayError> {
        let Some(budget) = self.budget(scope) else {
            return Ok(Reservation::new(scope.clone(), tokens, None));
        };

        if tokens > budget.config.ceiling {
            return Err(self.reject(scope, tokens, budget.remaining()));
        }

        let remaining = match budget.try_take(tokens) {
            Ok(()) => return Ok(Reservation::new(scope.clone(), tokens, Some(budget))),
            Err(remaining) => remaining,
        };

        if !self.queue.enabled {
            return Err(self.reject(scope, tokens, remaining));
        }

        {
            let mut state = budget.state.lock();
            if state.waiters >= self.queue.max_queue_depth {
                drop(state);
                return Err(self.reject(scope, tokens, remaining));
            }
            state.waiters += 1;
        }
        let _waiter = WaiterGuard(Arc::clone(&budget));
        self.metrics.increment(names::BUDGET_QUEUED, &[]);

        let deadline = Instant::now() + self.queue.wait_timeout();
        loop {
            let notified = budget.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match budget.try_take(tokens) {
                Ok(()) => {
                    return Ok(Reservation::new(
                        scope.clone(),
                        tokens,
                        Some(Arc::clone(&budget)),
                    ))
                }
                Err(_) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return match budget.try_take(tokens) {
                            Ok(()) => Ok(Reservation::new(
                                scope.clone(),
                                tokens,
                                Some(Arc::clone(&budget)),
                            )),
                            Err(remaining) => Err(self.reject(scope, tokens, remaining)),
                        };
                    }
                }
            }
        }
    }

    /// Reconcile a reservation against actual usage
    pub fn reconcile(&self, reservation: &Reservation, actual: u64) -> bool {
        reservation.reconcile(actual)
    }

    /// Release a reservation
    pub fn release(&self, reservation: &Reservation) -> bool {
        reservation.release()
    }

    /// Apply refills due now and wake waiters of refilled scopes
    pub fn refill_due(&self) {
        let now = Instant::now();
        for entry in self.scopes.iter() {
            let refilled = {
                let mut state = entry.state.lock();
                entry.refill(&mut state, now)
            };
            if refilled {
                tracing::debug!("budget refilled: scope={}", entry.key());
                entry.notify.notify_waiters();
            }
        }
    }

    /// Spawn the periodic refill task
    pub fn spawn_refill(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match tracker.upgrade() {
                    Some(tracker) => tracker.refill_due(),
                    None => break,
                }
            }
        })
    }

    /// Refill check period derived from configured policies
    pub fn refill_period(&self) -> Duration {
        self.scopes
            .iter()
            .filter_map(|b| match b.config.refill {
                RefillPolicy::FixedWindow { interval_ms } => Some(Duration::from_millis(interval_ms)),
                RefillPolicy::LeakyBucket { .. } => None,
            })
            .min()
            .unwrap_or(Duration::from_secs(1))
            .clamp(Duration::from_millis(10), Duration::from_secs(1))
    }

    /// Snapshot of every metered scope
    pub fn snapshot(&self) -> Vec<BudgetSnapshot> {
        let now = Instant::now();
        self.scopes
            .iter()
            .map(|entry| {
                let mut state = entry.state.lock();
                entry.refill(&mut state, now);
                BudgetSnapshot {
                    scope: entry.key().clone(),
                    ceiling: entry.config.ceiling,
                    remaining: state.remaining,
                    waiters: state.waiters,
                }
            })
            .collect()
    }
}

struct WaiterGuard(Arc<ScopeBudget>);

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.waiters = state.waiters.saturating_sub(1);
    }
}
