use std::fmt;

use aegis_schemas::PositionId;

/// Failures surfaced by the Portfolio State Store (§4.1, §7). `InvariantViolated`
/// is fatal: the caller (`aegis-engine`/`aegis-runtime`) must trigger
/// `emergency_stop()` and exit with code 40.
#[derive(Debug)]
pub enum PortfolioError {
    /// A re-asserted invariant (§3) failed after an `apply`. The in-memory
    /// mutation is never published and the write-ahead row is left
    /// `pending` — the store is left exactly as it was before the call.
    InvariantViolated(String),
    /// `PositionOpened` named a position id already present.
    DuplicatePosition(PositionId),
    /// `PositionClosed`/mark update referenced an id the store does not
    /// know about.
    UnknownPosition(PositionId),
    /// The durable write-ahead step failed; the in-memory mutation was
    /// never applied.
    Durable(anyhow::Error),
    /// The single-writer command queue is full.
    Overloaded,
    /// The actor task has stopped (e.g. during shutdown) and can no longer
    /// accept commands.
    ActorGone,
}

impl fmt::Display for PortfolioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortfolioError::InvariantViolated(reason) => write!(f, "portfolio invariant violated: {reason}"),
            PortfolioError::DuplicatePosition(id) => write!(f, "position {id} already exists"),
            PortfolioError::UnknownPosition(id) => write!(f, "unknown position {id}"),
            PortfolioError::Durable(e) => write!(f, "durable write failed: {e}"),
            PortfolioError::Overloaded => write!(f, "portfolio command queue overloaded"),
            PortfolioError::ActorGone => write!(f, "portfolio store actor is no longer running"),
        }
    }
}

impl std::error::Error for PortfolioError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PortfolioError::Durable(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}
