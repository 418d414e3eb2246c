//! Core types for dispatch operations.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Identifier of one addressable backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Create a new endpoint id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Request priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Metric tag value
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

/// Explicit per-request context threaded through enqueue, routing and invoke.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub tenant: Option<String>,
    pub deadline: Option<Instant>,
    pub metadata: Arc<HashMap<String, String>>,
}

impl RequestContext {
    /// Create a new request context with a fresh trace id
    pub fn new() -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            tenant: None,
            deadline: None,
            metadata: Arc::new(HashMap::new()),
        }
    }

    /// Set the tenant
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Set an absolute deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a trace id propagated from the caller
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Create context with metadata
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = Arc::new(metadata);
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Priority,
    pub tenant: Option<String>,
    /// Overrides the payload-size based token estimate
    pub estimated_tokens: Option<u64>,
    /// Compatibility tag; only requests with equal tags share a batch
    pub compat: Option<String>,
    /// Relative deadline for the whole request
    pub timeout: Option<Duration>,
    /// Route to this endpoint only
    pub endpoint: Option<EndpointId>,
    pub trace_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl SubmitOptions {
    /// Create default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set tenant
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Set estimated tokens
    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    /// Set compatibility tag
    pub fn with_compat(mut self, compat: impl Into<String>) -> Self {
        self.compat = Some(compat.into());
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Pin the request to one endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<EndpointId>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set trace id
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// An outbound model call. Immutable once created.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: uuid::Uuid,
    pub model: String,
    pub payload: serde_json::Value,
    pub estimated_tokens: u64,
    pub priority: Priority,
    pub compat: Option<String>,
    pub submitted_at: Instant,
    pub context: RequestContext,
}

impl Request {
    /// Create a request, estimating its token cost from the payload
    pub fn new(model: impl Into<String>, payload: serde_json::Value) -> Self {
        let estimated_tokens = estimate_tokens(&payload);
        Self {
            id: uuid::Uuid::new_v4(),
            model: model.into(),
            payload,
            estimated_tokens,
            priority: Priority::Normal,
            compat: None,
            submitted_at: Instant::now(),
            context: RequestContext::new(),
        }
    }

    /// Build a request from submission options
    pub fn from_options(
        model: impl Into<String>,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Self {
        let mut request = Self::new(model, payload);
        if let Some(tokens) = options.estimated_tokens {
            request.estimated_tokens = tokens;
        }
        request.priority = options.priority;
        request.compat = options.compat;

        let mut context = RequestContext::new().with_metadata(options.metadata);
        if let Some(tenant) = options.tenant {
            context = context.with_tenant(tenant);
        }
        if let Some(trace_id) = options.trace_id {
            context = context.with_trace_id(trace_id);
        }
        if let Some(timeout) = options.timeout {
            context = context.with_deadline(request.submitted_at + timeout);
        }
        request.context = context;
        request
    }

    /// Tenant shortcut
    pub fn tenant(&self) -> Option<&str> {
        self.context.tenant.as_deref()
    }
}

/// Rough token estimate: four bytes of serialized payload per token.
pub fn estimate_tokens(payload: &serde_json::Value) -> u64 {
    let bytes = match payload {
        serde_json::Value::String(s) => s.len(),
        other => other.to_string().len(),
    };
    (bytes as u64).div_ceil(4).max(1)
}

/// Output of one input inside a batch call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutput {
    pub value: serde_json::Value,
    pub tokens_used: u64,
}

impl ItemOutput {
    /// Create a new item output
    pub fn new(value: serde_json::Value, tokens_used: u64) -> Self {
        Self { value, tokens_used }
    }
}

/// Per-item result inside an otherwise successful batch call
pub type ItemResult = Result<ItemOutput, RelayError>;

/// One provider call covering a whole batch.
#[derive(Debug, Clone)]
pub struct BatchCall {
    pub batch_id: u64,
    pub endpoint: EndpointId,
    pub model: String,
    /// Inputs in request insertion order
    pub inputs: Vec<serde_json::Value>,
    pub deadline: Instant,
    /// Context of the first member; members share the batch key, not the tenant
    pub context: RequestContext,
}

impl BatchCall {
    /// Number of inputs
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// Whether the call carries no inputs
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Copy of this call carrying a single input
    pub fn single(&self, input: serde_json::Value) -> Self {
        Self {
            batch_id: self.batch_id,
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            inputs: vec![input],
            deadline: self.deadline,
            context: self.context.clone(),
        }
    }
}

/// Successful result delivered to a caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub request_id: uuid::Uuid,
    pub endpoint: EndpointId,
    pub model: String,
    pub output: serde_json::Value,
    pub tokens_used: u64,
    pub batch_id: u64,
    /// Whether this result came from the one-time retry on another endpoint
    pub retried: bool,
}

/// Provider information
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    /// Largest number of inputs the provider accepts per call
    pub max_batch_size: Option<usize>,
}

impl ProviderInfo {
    /// Create provider info without a batch size cap
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            max_batch_size: None,
        }
    }

    /// Set the provider batch size cap
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = Some(size);
        self
    }
}

/// Outcome of one provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    /// The call succeeded but some items failed individually
    PartialFailure { failed: usize },
    Failure,
    Timeout,
}

impl CallOutcome {
    /// Whether the call counts as an endpoint failure
    pub fn is_failure(&self) -> bool {
        matches!(self, CallOutcome::Failure | CallOutcome::Timeout)
    }

    /// Metric tag value
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::PartialFailure { .. } => "partial_failure",
            CallOutcome::Failure => "failure",
            CallOutcome::Timeout => "timeout",
        }
    }
}

/// Call-outcome event; the sole input to load balancer and breaker state.
#[derive(Debug, Clone)]
pub struct CallEvent {
    pub endpoint: EndpointId,
    pub latency: Duration,
    pub outcome: CallOutcome,
    pub tokens_used: u64,
    pub batch_size: usize,
    /// Whether this call was a half-open probe
    pub probe: bool,
    pub timestamp: SystemTime,
}

impl CallEvent {
    /// Create a new event stamped now
    pub fn new(endpoint: EndpointId, latency: Duration, outcome: CallOutcome) -> Self {
        Self {
            endpoint,
            latency,
            outcome,
            tokens_used: 0,
            batch_size: 1,
            probe: false,
            timestamp: SystemTime::now(),
        }
    }

    /// Set tokens used
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Mark as a half-open probe
    pub fn as_probe(mut self, probe: bool) -> Self {
        self.probe = probe;
        self
    }

    /// Latency in milliseconds
    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(&serde_json::json!("")), 1);
        assert_eq!(estimate_tokens(&serde_json::json!("abcdefgh")), 2);
        assert_eq!(estimate_tokens(&serde_json::json!("abcdefghi")), 3);
    }

    #[tokio::test]
    async fn test_request_from_options() {
        let options = SubmitOptions::new()
            .with_tenant("acme")
            .with_priority(Priority::High)
            .with_estimated_tokens(600)
            .with_compat("dims=256")
            .with_timeout(Duration::from_secs(5));

        let request = Request::from_options("text-embedding", serde_json::json!("hi"), options);

        assert_eq!(request.tenant(), Some("acme"));
        assert_eq!(request.priority, Priority::High);
        assert_eq!(request.estimated_tokens, 600);
        assert_eq!(request.compat.as_deref(), Some("dims=256"));
        assert_eq!(
            request.context.deadline,
            Some(request.submitted_at + Duration::from_secs(5))
        );
    }

    #[test]
    fn test_outcome_failure() {
        assert!(CallOutcome::Failure.is_failure());
        assert!(CallOutcome::Timeout.is_failure());
        assert!(!CallOutcome::Success.is_failure());
        assert!(!CallOutcome::PartialFailure { failed: 2 }.is_failure());
    }
}
