use std::fmt;

/// Error taxonomy for the rate-limiting core.
///
/// Names are stable and used by callers to distinguish construction-time
/// failures (`BadConfig`) from call-time backend failures, which the
/// facade never lets escape to its own caller (see `facade::Limiter::check`).
#[derive(Debug)]
pub enum RateLimitError {
    /// Invalid rate spec, unknown algorithm, or an impossible policy
    /// combination. Raised at construction, or from `Check` only when the
    /// policy itself is malformed (including a malformed key selector).
    BadConfig(String),
    /// Network or timeout error talking to a backend. Feeds the circuit
    /// breaker with normal weight.
    BackendTransient(String),
    /// Protocol or script error from a backend. Feeds the circuit breaker
    /// with doubled weight.
    BackendFatal(String),
    /// Every backend in a multi-backend chain failed.
    BackendUnavailable,
    /// The circuit for the selected backend is open; treated the same as
    /// `BackendUnavailable` for policy purposes.
    CircuitOpen,
    /// The backend is mid-teardown and rejects new operations.
    BackendClosed,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::BadConfig(msg) => write!(f, "bad config: {msg}"),
            RateLimitError::BackendTransient(msg) => write!(f, "backend transient error: {msg}"),
            RateLimitError::BackendFatal(msg) => write!(f, "backend fatal error: {msg}"),
            RateLimitError::BackendUnavailable => write!(f, "no backend available"),
            RateLimitError::CircuitOpen => write!(f, "circuit open"),
            RateLimitError::BackendClosed => write!(f, "backend closed"),
        }
    }
}

impl std::error::Error for RateLimitError {}

impl RateLimitError {
    /// Whether this error should count as a single or doubled failure
    /// weight against the circuit breaker.
    pub fn circuit_weight(&self) -> u32 {
        match self {
            RateLimitError::BackendFatal(_) => 2,
            RateLimitError::BackendTransient(_) => 1,
            _ => 0,
        }
    }

    /// Whether the facade should treat this as "the backend could not be
    /// reached" for fail-open/fail-closed purposes.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            RateLimitError::BackendTransient(_)
                | RateLimitError::BackendFatal(_)
                | RateLimitError::BackendUnavailable
                | RateLimitError::CircuitOpen
                | RateLimitError::BackendClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, RateLimitError>;
