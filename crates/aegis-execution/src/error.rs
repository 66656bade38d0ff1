use std::fmt;

/// Failure taxonomy a backend may return from any operation (§4.5, §7).
/// Only `RateLimited` and `Unavailable` are retryable; the others are
/// terminal for the attempt that produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionError {
    InsufficientFunds,
    RateLimited { retry_after: chrono::Duration },
    Unavailable(String),
    Rejected(String),
    AuthFailed,
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionError::RateLimited { .. } | ExecutionError::Unavailable(_))
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::InsufficientFunds => write!(f, "insufficient funds"),
            ExecutionError::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {}s", retry_after.num_seconds())
            }
            ExecutionError::Unavailable(reason) => write!(f, "backend unavailable: {reason}"),
            ExecutionError::Rejected(reason) => write!(f, "order rejected: {reason}"),
            ExecutionError::AuthFailed => write!(f, "authentication failed"),
        }
    }
}

impl std::error::Error for ExecutionError {}

/// Refusal returned by the Execution Router itself, before a backend is
/// ever invoked (§4.6, §7). Distinct from `ExecutionError`, which a backend
/// returns after being invoked.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterError {
    /// The circuit breaker guarding the bound backend is open.
    BackendUnavailable,
    /// A swap is in progress and the drain deadline elapsed before a read
    /// lease could be taken (or, symmetrically, a swap could not acquire
    /// the write lease before its own deadline).
    Swapping,
    /// The bound backend rejected or failed the call.
    Backend(ExecutionError),
    /// The candidate backend failed its pre-swap health check.
    SwapRejected,
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::BackendUnavailable => write!(f, "execution backend circuit breaker open"),
            RouterError::Swapping => write!(f, "execution router is mid-swap"),
            RouterError::Backend(e) => write!(f, "{e}"),
            RouterError::SwapRejected => write!(f, "candidate backend failed health_check"),
        }
    }
}

impl std::error::Error for RouterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RouterError::Backend(e) => Some(e),
            _ => None,
        }
    }
}
