//! Position Sizer (C4): fractional-Kelly sizing with a volatility scalar,
//! bounded by the single-position cap and floored to an instrument lot
//! size. Pure function, no I/O — every intermediate scalar is carried on
//! the output for auditability.

use std::collections::BTreeMap;

use aegis_money::{Amount, Qty, Ratio};
use aegis_schemas::{Instrument, RiskLimits, Side, SizedProposal, TradeProposal};

/// Smallest representable quantity step (1e-8) — the floor used for any
/// instrument absent from a [`LotSizeTable`].
pub const DEFAULT_LOT_SIZE: Qty = Qty::new(1);

/// Per-instrument minimum tradable increment. Absent instruments fall back
/// to [`DEFAULT_LOT_SIZE`], i.e. no rounding beyond the quantity scale
/// itself.
#[derive(Clone, Debug, Default)]
pub struct LotSizeTable(BTreeMap<Instrument, Qty>);

impl LotSizeTable {
    pub fn new() -> Self {
        LotSizeTable(BTreeMap::new())
    }

    pub fn set(&mut self, instrument: Instrument, lot_size: Qty) {
        self.0.insert(instrument, lot_size);
    }

    pub fn get(&self, instrument: &Instrument) -> Qty {
        self.0.get(instrument).copied().unwrap_or(DEFAULT_LOT_SIZE)
    }
}

impl FromIterator<(Instrument, Qty)> for LotSizeTable {
    fn from_iter<I: IntoIterator<Item = (Instrument, Qty)>>(iter: I) -> Self {
        LotSizeTable(iter.into_iter().collect())
    }
}

/// Computes a bounded, lot-floored position from an advisory proposal and
/// the current portfolio equity.
///
/// Degenerate inputs never panic: a non-positive `advisory_stop_loss_pct`
/// makes the payoff ratio `b` undefined, so the Kelly fraction collapses to
/// zero rather than dividing by zero. The caller (the Risk Gate) will then
/// reject a zero-quantity proposal via the minimum-size floor.
pub fn size(proposal: &TradeProposal, total_value: Amount, limits: &RiskLimits, lot_sizes: &LotSizeTable) -> SizedProposal {
    let p = proposal.confidence;
    let b = proposal.advisory_take_profit_pct.checked_div(proposal.advisory_stop_loss_pct);

    let kelly_fraction = match b {
        Some(b) if b.raw() != 0 => {
            let edge = p.checked_mul(b).unwrap_or(Ratio::ZERO) - (Ratio::ONE - p);
            edge.checked_div(b).unwrap_or(Ratio::ZERO).clamp(Ratio::ZERO, Ratio::ONE)
        }
        _ => Ratio::ZERO,
    };

    let fractional_kelly = kelly_fraction.checked_mul(limits.fractional_kelly_coeff).unwrap_or(Ratio::ZERO);

    let vol_denominator = limits.vol_floor.max(proposal.volatility_forecast_annualized);
    let volatility_scalar = limits
        .vol_target
        .checked_div(vol_denominator)
        .unwrap_or(Ratio::ZERO)
        .min(Ratio::ONE);

    let kelly_and_vol = fractional_kelly.checked_mul(volatility_scalar).unwrap_or(Ratio::ZERO);
    let raw_position_value = total_value.checked_mul_ratio(kelly_and_vol).unwrap_or(Amount::ZERO);
    let cap_value = total_value.checked_mul_ratio(limits.max_single_position_pct).unwrap_or(Amount::ZERO);
    let bounded_value = raw_position_value.min(cap_value);

    let lot_size = lot_sizes.get(&proposal.instrument);
    let quantity = bounded_value
        .checked_div_price_floor_lot(proposal.reference_price, lot_size)
        .unwrap_or(Qty::ZERO);
    let position_value = quantity.checked_mul_price(proposal.reference_price).unwrap_or(Amount::ZERO);

    let (stop_loss_price, take_profit_price) = derive_stop_and_target(proposal);

    SizedProposal {
        instrument: proposal.instrument.clone(),
        side: proposal.side,
        reference_price: proposal.reference_price,
        quantity,
        position_value,
        raw_position_value,
        stop_loss_price,
        take_profit_price,
        leverage: proposal.advisory_leverage,
        kelly_fraction,
        fractional_kelly,
        volatility_scalar,
    }
}

/// Stop and target prices, direction-adjusted for `side`.
fn derive_stop_and_target(proposal: &TradeProposal) -> (Amount, Amount) {
    let reference = proposal.reference_price;
    let stop_delta = reference.checked_mul_ratio(proposal.advisory_stop_loss_pct).unwrap_or(Amount::ZERO);
    let target_delta = reference.checked_mul_ratio(proposal.advisory_take_profit_pct).unwrap_or(Amount::ZERO);
    match proposal.side {
        Side::Long => (reference - stop_delta, reference + target_delta),
        Side::Short => (reference + stop_delta, reference - target_delta),
    }
}
