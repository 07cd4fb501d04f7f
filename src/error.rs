use std::time::Duration;
use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur while evaluating or guarding a call.
///
/// Store adapters translate their client-specific errors into these variants, so
/// nothing above the store layer ever sees a `redis` or `fred` error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// The window already admitted `limit` calls. The guarded operation was not run.
    #[error("Rate limit exceeded: {count} calls against a limit of {limit}")]
    RateLimitExceeded {
        count: u64,
        limit: u64,
        reset_after: Option<Duration>,
    },

    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The store did not answer in time. The increment may or may not have been
    /// applied on the server.
    #[error("Store command timed out after {0:?}")]
    Timeout(Duration),

    /// The store client gave up on a command it may already have sent, e.g. on its own
    /// timeout or because the connection was closed while the command was in flight.
    #[error("Store command outcome unknown: {0}")]
    Indeterminate(String),
}

impl RateLimitError {
    /// True for the rejection signal, the one variant callers are expected to back off on.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RateLimitError::RateLimitExceeded { .. })
    }

    /// True when the store-side effect of the failed call is unknown.
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            RateLimitError::Timeout(_) | RateLimitError::Indeterminate(_)
        )
    }

    /// Time until the window resets, when the store reported it.
    pub fn reset_after(&self) -> Option<Duration> {
        match self {
            RateLimitError::RateLimitExceeded { reset_after, .. } => *reset_after,
            _ => None,
        }
    }
}

impl From<std::io::Error> for RateLimitError {
    fn from(e: std::io::Error) -> Self {
        RateLimitError::Configuration(format!("Failed to read configuration: {}", e))
    }
}
