//! Default `CorrelationOracle` wired at boot when no external correlation
//! service is configured. No such collaborator exists in this deployment
//! yet — this implementation always fails, driving the Risk Gate's
//! `check_correlation` onto [`aegis_risk::fallback_correlation`] through
//! the same breaker-gated path a genuine, occasionally-unreachable oracle
//! would take. Swapping in a real oracle later is a matter of implementing
//! the trait and wiring it in at boot — the gate itself does not change.

use aegis_money::Ratio;
use aegis_risk::{CorrelationError, CorrelationOracle};
use aegis_schemas::Instrument;
use async_trait::async_trait;

pub struct NullCorrelationOracle;

#[async_trait]
impl CorrelationOracle for NullCorrelationOracle {
    async fn correlation(&self, _a: &Instrument, _b: &Instrument) -> Result<Ratio, CorrelationError> {
        Err(CorrelationError::Unavailable)
    }
}
