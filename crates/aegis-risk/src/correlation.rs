use aegis_schemas::Instrument;

/// Failure of the external correlation collaborator. The gate never
/// propagates this to its caller — see [`fallback_correlation`].
#[derive(Debug, PartialEq)]
pub enum CorrelationError {
    Unavailable,
}

impl std::fmt::Display for CorrelationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "correlation oracle unavailable")
    }
}

impl std::error::Error for CorrelationError {}

/// External collaborator supplying pairwise instrument correlation,
/// keyed by instrument pair. Implementations are expected to be wrapped
/// in the same [`aegis_modularity::CircuitBreaker`] substrate that
/// protects every other external dependency.
#[async_trait::async_trait]
pub trait CorrelationOracle: Send + Sync {
    async fn correlation(&self, a: &Instrument, b: &Instrument) -> Result<aegis_money::Ratio, CorrelationError>;
}

/// Deterministic fallback used when the oracle is unavailable (breaker
/// open or the call itself errors): a position is always perfectly
/// correlated with itself, and otherwise the gate assumes zero
/// correlation rather than blocking on a missing collaborator.
pub fn fallback_correlation(a: &Instrument, b: &Instrument) -> aegis_money::Ratio {
    if a == b {
        aegis_money::Ratio::ONE
    } else {
        aegis_money::Ratio::ZERO
    }
}
