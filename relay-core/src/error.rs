//! Error types for Relay operations.

/// The main error type for dispatch operations.
///
/// Errors are `Clone` because a batch-wide failure is delivered to every
/// member request with the same value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    /// No endpoint could be selected for a request
    #[error("Routing error: {0}")]
    Routing(String),

    /// Endpoint rejected fast because its circuit is open
    #[error("Circuit open for endpoint {endpoint}")]
    CircuitOpen { endpoint: String },

    /// Token quota exhausted (and any queue wait expired)
    #[error("Token budget exceeded for {scope}: requested {requested}, remaining {remaining}")]
    TokenBudgetExceeded {
        scope: String,
        requested: u64,
        remaining: u64,
    },

    /// Provider-side failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider signalled rate limiting
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// Provider-side timeout
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Batch call deadline expired before the provider answered
    #[error("Batch {batch_id} timed out after {elapsed_ms}ms")]
    BatchTimeout { batch_id: u64, elapsed_ms: u64 },

    /// Caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,

    /// Dispatcher is draining and rejects new submissions
    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    /// Invalid request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Hook errors
    #[error("Hook error ({hook}): {message}")]
    Hook { hook: String, message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors
    #[error("Error: {0}")]
    Other(String),
}

impl RelayError {
    /// Create a routing error
    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    /// Routing error for an empty healthy candidate set
    pub fn no_healthy_endpoint() -> Self {
        Self::Routing("no healthy endpoint".to_string())
    }

    /// Create a circuit-open error
    pub fn circuit_open(endpoint: impl Into<String>) -> Self {
        Self::CircuitOpen {
            endpoint: endpoint.into(),
        }
    }

    /// Create a token budget error
    pub fn budget_exceeded(scope: impl Into<String>, requested: u64, remaining: u64) -> Self {
        Self::TokenBudgetExceeded {
            scope: scope.into(),
            requested,
            remaining,
        }
    }

    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limit(msg: impl Into<String>) -> Self {
        Self::RateLimit(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a batch timeout error
    pub fn batch_timeout(batch_id: u64, elapsed_ms: u64) -> Self {
        Self::BatchTimeout {
            batch_id,
            elapsed_ms,
        }
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a hook error
    pub fn hook(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            hook: hook.into(),
            message: message.into(),
        }
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Timeout(_) | RelayError::RateLimit(_))
    }

    /// Whether this error counts against the endpoint that produced it.
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(
            self,
            RelayError::Provider(_)
                | RelayError::RateLimit(_)
                | RelayError::Timeout(_)
                | RelayError::BatchTimeout { .. }
        )
    }

    /// Short stable label used as a metric tag.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Routing(_) => "routing",
            RelayError::CircuitOpen { .. } => "circuit_open",
            RelayError::TokenBudgetExceeded { .. } => "token_budget",
            RelayError::Provider(_) => "provider",
            RelayError::RateLimit(_) => "rate_limit",
            RelayError::Timeout(_) => "timeout",
            RelayError::BatchTimeout { .. } => "batch_timeout",
            RelayError::Cancelled => "cancelled",
            RelayError::ShuttingDown => "shutting_down",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::Configuration(_) => "configuration",
            RelayError::Hook { .. } => "hook",
            RelayError::Serialization(_) => "serialization",
            RelayError::Other(_) => "other",
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<String> for RelayError {
    fn from(s: String) -> Self {
        Self::Other(s)
    }
}

impl From<&str> for RelayError {
    fn from(s: &str) -> Self {
        Self::Other(s.to_string())
    }
}
