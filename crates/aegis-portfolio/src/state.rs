//! Pure in-memory mutation logic for the Portfolio State Store (§4.1, §3).
//!
//! Kept free of I/O and `tokio` so the invariant-preserving rules can be
//! unit tested without an actor or a database, mirroring the teacher's
//! separation between its pure ledger mechanics and the façade that wraps
//! them with durability.

use std::collections::BTreeMap;

use aegis_money::{Amount, Ratio};
use aegis_schemas::{Instrument, PortfolioEvent, PortfolioSnapshot, PortfolioState, Position, PositionId, PositionStatus};
use chrono::{DateTime, Utc};

use crate::error::PortfolioError;

/// The store's full in-memory representation: the singleton state, every
/// position it has ever known about (terminal ones retained for lookup),
/// and the latest price mark per instrument.
#[derive(Clone, Debug)]
pub struct Internal {
    pub state: PortfolioState,
    pub positions: BTreeMap<PositionId, Position>,
    pub prices: BTreeMap<Instrument, Amount>,
}

impl Internal {
    pub fn opening(cash_balance: Amount, at: DateTime<Utc>) -> Self {
        Internal {
            state: PortfolioState::opening(cash_balance, at),
            positions: BTreeMap::new(),
            prices: BTreeMap::new(),
        }
    }

    /// Applies `event` to a clone of `self` and re-verifies every invariant
    /// before returning it, so a caller either gets the full post-event
    /// state or an error — the previous state is never partially mutated.
    pub fn apply(&self, event: &PortfolioEvent) -> Result<Internal, PortfolioError> {
        let mut next = self.clone();
        next.apply_mut(event)?;
        next.verify_invariants()?;
        Ok(next)
    }

    fn apply_mut(&mut self, event: &PortfolioEvent) -> Result<(), PortfolioError> {
        match event {
            PortfolioEvent::PositionOpened { position, cash_delta } => {
                if self.positions.contains_key(&position.id) {
                    return Err(PortfolioError::DuplicatePosition(position.id));
                }
                self.state.cash_balance += *cash_delta;
                self.positions.insert(position.id, (**position).clone());
                self.recompute_positions_value();
                self.recompute_total_value();
                self.recompute_drawdown();
                self.roll_day_if_needed(position.opened_at);
            }
            PortfolioEvent::PositionClosed {
                id,
                reason,
                exit_price,
                realized_pnl,
                fees,
                closed_at,
            } => {
                let position = self.positions.get_mut(id).ok_or(PortfolioError::UnknownPosition(*id))?;
                if position.status.is_terminal() {
                    // Idempotent close (§8): re-applying a terminal close is a no-op.
                    return Ok(());
                }
                position.status = PositionStatus::Closed(*reason);
                position.close_reason = Some(*reason);
                position.exit_price = Some(*exit_price);
                position.realized_pnl = Some(*realized_pnl);
                position.fees += *fees;

                let entry_value = position.entry_value;
                self.state.cash_balance += entry_value + *realized_pnl - *fees;
                self.state.total_pnl += *realized_pnl - *fees;
                self.recompute_positions_value();
                self.recompute_total_value();
                self.recompute_drawdown();
                self.roll_day_if_needed(*closed_at);
            }
            PortfolioEvent::PriceMarkUpdated { instrument, price, observed_at } => {
                self.prices.insert(instrument.clone(), *price);
                self.recompute_positions_value();
                self.recompute_total_value();
                self.recompute_drawdown();
                self.roll_day_if_needed(*observed_at);
            }
            PortfolioEvent::DayRolled { new_anchor_value, at } => {
                self.state.daily_anchor_value = *new_anchor_value;
                self.state.daily_anchor_at = *at;
                self.state.daily_pnl = self.state.total_value - self.state.daily_anchor_value;
            }
            PortfolioEvent::EmergencyHalt { .. } => {
                // Audit-only: the Portfolio State Store owns monetary state,
                // not the halt flag — refusing new opens under halt is the
                // Lifecycle Manager's responsibility (§4.8).
            }
        }
        Ok(())
    }

    fn mark_of(&self, position: &Position) -> Amount {
        self.prices.get(&position.instrument).copied().unwrap_or(position.entry_price)
    }

    fn recompute_positions_value(&mut self) {
        let mut total = Amount::ZERO;
        for position in self.positions.values() {
            if position.status.is_open() {
                let mark = self.mark_of(position);
                total = total.saturating_add(position.value_at(mark).unwrap_or(position.entry_value));
            }
        }
        self.state.positions_value = total;
    }

    fn recompute_total_value(&mut self) {
        self.state.total_value = self.state.cash_balance + self.state.positions_value;
    }

    /// Drawdown update rule (§4.1): recompute the high-water mark and
    /// current drawdown on any `total_value` change; `max_drawdown_pct`
    /// tracks the worst drawdown observed and never decreases.
    fn recompute_drawdown(&mut self) {
        self.state.peak_value = self.state.peak_value.max(self.state.total_value);
        self.state.current_drawdown_pct = if self.state.peak_value.is_zero() {
            Ratio::ZERO
        } else {
            (self.state.peak_value - self.state.total_value)
                .checked_div_to_ratio(self.state.peak_value)
                .unwrap_or(Ratio::ZERO)
        };
        self.state.max_drawdown_pct = self.state.max_drawdown_pct.max(self.state.current_drawdown_pct);
    }

    /// Rolls the daily anchor forward the first time an event fires whose
    /// UTC date differs from `daily_anchor_at`'s date (§4.1).
    fn roll_day_if_needed(&mut self, at: DateTime<Utc>) {
        if at.date_naive() != self.state.daily_anchor_at.date_naive() {
            self.state.daily_anchor_value = self.state.total_value;
            self.state.daily_anchor_at = at;
        }
        self.state.daily_pnl = self.state.total_value - self.state.daily_anchor_value;
    }

    fn verify_invariants(&self) -> Result<(), PortfolioError> {
        if !self.state.equity_identity_holds() {
            return Err(PortfolioError::InvariantViolated(format!(
                "equity identity broken: total_value={} cash_balance={} positions_value={}",
                self.state.total_value, self.state.cash_balance, self.state.positions_value
            )));
        }
        if self.state.total_value > self.state.peak_value {
            return Err(PortfolioError::InvariantViolated(format!(
                "peak_value {} fell below total_value {}",
                self.state.peak_value, self.state.total_value
            )));
        }
        if self.state.current_drawdown_pct.is_negative() {
            return Err(PortfolioError::InvariantViolated("current_drawdown_pct went negative".to_string()));
        }
        Ok(())
    }

    pub fn snapshot(&self, observed_at: DateTime<Utc>) -> PortfolioSnapshot {
        PortfolioSnapshot {
            state: self.state.clone(),
            open_positions: self.positions.values().filter(|p| p.status.is_open()).cloned().collect(),
            prices: self.prices.clone(),
            observed_at,
        }
    }

    pub fn list_open_positions(&self) -> Vec<Position> {
        self.positions.values().filter(|p| p.status.is_open()).cloned().collect()
    }

    pub fn get_position(&self, id: PositionId) -> Option<Position> {
        self.positions.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_schemas::{CloseReason, Side};
    use aegis_money::Qty;

    fn position(id: PositionId, entry_value: Amount, at: DateTime<Utc>) -> Position {
        Position {
            id,
            instrument: Instrument::new("BTCZAR"),
            side: Side::Long,
            quantity: Qty::new(100_000_000),
            entry_price: Amount::from_units_cents(1_200_000, 0),
            entry_value,
            leverage: Ratio::ONE,
            stop_loss_price: Amount::from_units_cents(1_176_000, 0),
            take_profit_price: Amount::from_units_cents(1_248_000, 0),
            opened_at: at,
            deadline: at + chrono::Duration::hours(72),
            status: PositionStatus::Open,
            close_reason: None,
            exit_price: None,
            realized_pnl: None,
            fees: Amount::ZERO,
        }
    }

    #[test]
    fn open_then_close_preserves_equity_identity() {
        let now = Utc::now();
        let internal = Internal::opening(Amount::from_units_cents(100_000, 0), now);
        let id = PositionId::new();
        let pos = position(id, Amount::from_units_cents(3_340, 0), now);

        let opened = internal
            .apply(&PortfolioEvent::PositionOpened {
                position: Box::new(pos.clone()),
                cash_delta: -Amount::from_units_cents(3_340, 0),
            })
            .unwrap();
        assert!(opened.state.equity_identity_holds());
        assert_eq!(opened.state.cash_balance, Amount::from_units_cents(96_660, 0));
        assert_eq!(opened.state.positions_value, Amount::from_units_cents(3_340, 0));

        let closed = opened
            .apply(&PortfolioEvent::PositionClosed {
                id,
                reason: CloseReason::ClosedByTarget,
                exit_price: Amount::from_units_cents(1_248_000, 0),
                realized_pnl: Amount::from_units_cents(200, 0),
                fees: Amount::from_units_cents(1, 0),
                closed_at: now,
            })
            .unwrap();
        assert!(closed.state.equity_identity_holds());
        assert_eq!(closed.state.positions_value, Amount::ZERO);
        assert_eq!(closed.get_position(id).unwrap().status, PositionStatus::Closed(CloseReason::ClosedByTarget));
    }

    #[test]
    fn closing_a_terminal_position_is_a_noop() {
        let now = Utc::now();
        let internal = Internal::opening(Amount::from_units_cents(100_000, 0), now);
        let id = PositionId::new();
        let pos = position(id, Amount::from_units_cents(3_340, 0), now);
        let opened = internal
            .apply(&PortfolioEvent::PositionOpened {
                position: Box::new(pos),
                cash_delta: -Amount::from_units_cents(3_340, 0),
            })
            .unwrap();
        let close_event = PortfolioEvent::PositionClosed {
            id,
            reason: CloseReason::ManualClose,
            exit_price: Amount::from_units_cents(1_200_000, 0),
            realized_pnl: Amount::ZERO,
            fees: Amount::ZERO,
            closed_at: now,
        };
        let closed_once = opened.apply(&close_event).unwrap();
        let closed_twice = closed_once.apply(&close_event).unwrap();
        assert_eq!(closed_once.state, closed_twice.state);
    }

    #[test]
    fn drawdown_recomputes_on_total_value_change() {
        let now = Utc::now();
        let internal = Internal::opening(Amount::from_units_cents(100_000, 0), now);
        let marked = internal
            .apply(&PortfolioEvent::PriceMarkUpdated {
                instrument: Instrument::new("BTCZAR"),
                price: Amount::from_units_cents(1_200_000, 0),
                observed_at: now,
            })
            .unwrap();
        // No open positions yet, so a price mark does not move total_value.
        assert_eq!(marked.state.current_drawdown_pct, Ratio::ZERO);

        // Simulate a drawdown by rolling the day to a lower anchor, which
        // moves daily_pnl but not total_value/peak — drawdown is driven
        // purely by total_value vs peak, confirmed by an explicit case
        // where a position loses value before close.
        let id = PositionId::new();
        let pos = position(id, Amount::from_units_cents(10_000, 0), now);
        let opened = marked
            .apply(&PortfolioEvent::PositionOpened {
                position: Box::new(pos),
                cash_delta: -Amount::from_units_cents(10_000, 0),
            })
            .unwrap();
        let devalued = opened
            .apply(&PortfolioEvent::PriceMarkUpdated {
                instrument: Instrument::new("BTCZAR"),
                price: Amount::from_units_cents(1_080_000, 0),
                observed_at: now,
            })
            .unwrap();
        assert!(devalued.state.total_value < devalued.state.peak_value);
        assert!(devalued.state.current_drawdown_pct > Ratio::ZERO);
    }

    #[test]
    fn day_roll_anchors_daily_pnl_to_new_date() {
        let now = Utc::now();
        let internal = Internal::opening(Amount::from_units_cents(100_000, 0), now);
        let tomorrow = now + chrono::Duration::days(1);
        let rolled = internal
            .apply(&PortfolioEvent::PriceMarkUpdated {
                instrument: Instrument::new("BTCZAR"),
                price: Amount::from_units_cents(1_200_000, 0),
                observed_at: tomorrow,
            })
            .unwrap();
        assert_eq!(rolled.state.daily_anchor_at.date_naive(), tomorrow.date_naive());
        assert_eq!(rolled.state.daily_pnl, Amount::ZERO);
    }

    #[test]
    fn unknown_position_close_is_rejected() {
        let now = Utc::now();
        let internal = Internal::opening(Amount::from_units_cents(100_000, 0), now);
        let err = internal
            .apply(&PortfolioEvent::PositionClosed {
                id: PositionId::new(),
                reason: CloseReason::ManualClose,
                exit_price: Amount::ZERO,
                realized_pnl: Amount::ZERO,
                fees: Amount::ZERO,
                closed_at: now,
            })
            .unwrap_err();
        assert!(matches!(err, PortfolioError::UnknownPosition(_)));
    }
}
