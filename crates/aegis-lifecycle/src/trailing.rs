//! Trailing-stop policy (§4.8, Open Question 4): per-position and disabled
//! by default. When enabled, the effective stop ratchets with the best mark
//! seen since entry rather than staying pinned to the price recorded at
//! open.

use aegis_money::{Amount, Ratio};
use aegis_schemas::Side;

/// Whether, and by how much, a position's stop trails its favorable price
/// extreme. `trail_pct` is the distance (as a fraction of the extreme)
/// maintained behind it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrailingStopPolicy {
    pub enabled: bool,
    pub trail_pct: Ratio,
}

impl TrailingStopPolicy {
    /// Default policy: trailing stops are off unless a proposal opts in
    /// (Open Question 4 decision, recorded in the grounding ledger).
    pub fn off() -> Self {
        TrailingStopPolicy { enabled: false, trail_pct: Ratio::ZERO }
    }

    pub fn trailing(trail_pct: Ratio) -> Self {
        TrailingStopPolicy { enabled: true, trail_pct: trail_pct.abs() }
    }

    /// Computes the effective stop given the best favorable mark seen so
    /// far. Falls back to `static_stop` if the trail would move the stop
    /// in the wrong direction (e.g. immediately after entry, before any
    /// favorable move has happened) or on overflow.
    pub fn trailing_stop_from(&self, side: Side, favorable_extreme: Amount, static_stop: Amount) -> Amount {
        if !self.enabled {
            return static_stop;
        }
        let Some(offset) = favorable_extreme.checked_mul_ratio(self.trail_pct) else {
            return static_stop;
        };
        let trailed = match side {
            Side::Long => favorable_extreme - offset,
            Side::Short => favorable_extreme + offset,
        };
        match side {
            Side::Long => trailed.max(static_stop),
            Side::Short => trailed.min(static_stop),
        }
    }
}
