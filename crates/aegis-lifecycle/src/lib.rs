//! Position Lifecycle Manager (C8, §4.8): owns the full life of a single
//! position from the moment a `SizedProposal` is accepted through to its
//! terminal close, submitting every order through the Execution Router and
//! recording every state change in the Portfolio State Store.
//!
//! Mutations against the same position are serialized through a sharded set
//! of `tokio::sync::Mutex` guards keyed by [`PositionId`] rather than one
//! crate-wide lock, so concurrent work against unrelated positions never
//! contends.

mod locks;
mod trailing;

pub use locks::PositionLocks;
pub use trailing::TrailingStopPolicy;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use aegis_execution::{ExecutionRouter, PlaceOrderRequest, RouterError};
use aegis_money::Amount;
use aegis_portfolio::{PortfolioError, PortfolioStore};
use aegis_schemas::{CloseReason, Position, PositionId, PortfolioEvent, Side, SizedProposal};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

/// Failures surfaced by the Lifecycle Manager (§4.8, §7).
#[derive(Debug)]
pub enum LifecycleError {
    /// The manager is under an emergency halt (§4.8: "a position whose
    /// close order fails `max_close_attempts` times escalates to an
    /// emergency halt") and refuses to open new positions.
    Halted,
    /// `close`/`monitor_tick` referenced a position the store does not
    /// know about.
    UnknownPosition(PositionId),
    /// The router (swap in progress, breaker open, or the bound backend
    /// itself) failed the request.
    Router(RouterError),
    /// The Portfolio State Store refused or failed to apply the resulting
    /// event.
    Portfolio(PortfolioError),
    /// A close order failed `max_close_attempts` times in a row. The
    /// manager has entered the emergency halt; the caller (`aegis-engine`)
    /// is expected to escalate further (drain, then exit per §6's code 40
    /// taxonomy if the halt cannot be cleared by a later successful close).
    EscalatedToHalt { position_id: PositionId, attempts: u32, last_error: RouterError },
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleError::Halted => write!(f, "lifecycle manager is under emergency halt"),
            LifecycleError::UnknownPosition(id) => write!(f, "unknown position {id}"),
            LifecycleError::Router(e) => write!(f, "{e}"),
            LifecycleError::Portfolio(e) => write!(f, "{e}"),
            LifecycleError::EscalatedToHalt { position_id, attempts, last_error } => write!(
                f,
                "position {position_id} failed to close after {attempts} attempts, escalating to emergency halt: {last_error}"
            ),
        }
    }
}

impl std::error::Error for LifecycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LifecycleError::Router(e) => Some(e),
            LifecycleError::Portfolio(e) => Some(e),
            LifecycleError::EscalatedToHalt { last_error, .. } => Some(last_error),
            _ => None,
        }
    }
}

/// Result of a single `monitor_tick` sweep: which positions were closed and
/// why, in the order they were evaluated.
#[derive(Debug, Clone)]
pub struct MonitorOutcome {
    pub position_id: PositionId,
    pub reason: CloseReason,
}

/// Owns the serialization locks, trailing-stop state, and close-retry
/// bookkeeping for every open position. Cheap to share behind an `Arc`: the
/// heavy state (positions themselves) lives in the `PortfolioStore`, not
/// here.
pub struct LifecycleManager {
    store: PortfolioStore,
    router: std::sync::Arc<ExecutionRouter>,
    locks: PositionLocks,
    trailing: Mutex<BTreeMap<PositionId, TrailingStopPolicy>>,
    favorable_extreme: Mutex<BTreeMap<PositionId, Amount>>,
    close_attempts: Mutex<BTreeMap<PositionId, u32>>,
    halted: AtomicBool,
    max_close_attempts: u32,
    backoff_floor: StdDuration,
}

impl LifecycleManager {
    pub fn new(
        store: PortfolioStore,
        router: std::sync::Arc<ExecutionRouter>,
        max_close_attempts: u32,
    ) -> Self {
        LifecycleManager {
            store,
            router,
            locks: PositionLocks::new(),
            trailing: Mutex::new(BTreeMap::new()),
            favorable_extreme: Mutex::new(BTreeMap::new()),
            close_attempts: Mutex::new(BTreeMap::new()),
            halted: AtomicBool::new(false),
            max_close_attempts,
            backoff_floor: StdDuration::from_millis(250),
        }
    }

    /// Whether the manager is refusing new opens after exhausting retries
    /// on a close (§4.8). Cleared only by `clear_halt` — an explicit,
    /// operator-driven decision, never automatically.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn clear_halt(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    /// Opens a position for `sized`, submitting the entry order through the
    /// router and recording it in the Portfolio State Store. `max_hold`
    /// sets the deadline (§3: "a position held past `max_hold_duration`
    /// is force-closed").
    pub async fn open(
        &self,
        sized: &SizedProposal,
        client_order_id: String,
        max_hold: Duration,
        trailing: TrailingStopPolicy,
        now: DateTime<Utc>,
    ) -> Result<Position, LifecycleError> {
        if self.is_halted() {
            return Err(LifecycleError::Halted);
        }

        let req = PlaceOrderRequest {
            client_order_id,
            instrument: sized.instrument.clone(),
            side: sized.side,
            quantity: sized.quantity,
            reference_price: sized.reference_price,
        };
        let receipt = self.router.place_market_order(req, now).await.map_err(LifecycleError::Router)?;

        let entry_value = receipt
            .filled_quantity
            .checked_mul_price(receipt.average_fill_price)
            .unwrap_or(sized.position_value);

        let position = Position {
            id: PositionId::new(),
            instrument: sized.instrument.clone(),
            side: sized.side,
            quantity: receipt.filled_quantity,
            entry_price: receipt.average_fill_price,
            entry_value,
            leverage: sized.leverage,
            stop_loss_price: sized.stop_loss_price,
            take_profit_price: sized.take_profit_price,
            opened_at: now,
            deadline: now + max_hold,
            status: aegis_schemas::PositionStatus::Open,
            close_reason: None,
            exit_price: None,
            realized_pnl: None,
            fees: receipt.fees,
        };

        let cash_delta = -(entry_value + receipt.fees);
        let event = PortfolioEvent::PositionOpened { position: Box::new(position.clone()), cash_delta };
        self.store.apply(event, now).await.map_err(LifecycleError::Portfolio)?;

        self.trailing.lock().await.insert(position.id, trailing);
        self.favorable_extreme.lock().await.insert(position.id, position.entry_price);

        Ok(position)
    }

    /// Closes `position_id` for `reason` at `mark_price` (the fallback
    /// price for idempotent retries where no fresh mark is available).
    /// Idempotent: a position already in a terminal status is returned
    /// unchanged rather than re-closed (§3: "close is idempotent: closing
    /// an already-closed position is a no-op that returns the existing
    /// terminal state").
    ///
    /// Retries the closing order with backoff up to `max_close_attempts`
    /// times; exhausting the budget escalates to an emergency halt rather
    /// than returning a transient error (§4.8).
    pub async fn close(
        &self,
        position_id: PositionId,
        reason: CloseReason,
        mark_price: Option<Amount>,
        now: DateTime<Utc>,
    ) -> Result<Position, LifecycleError> {
        let _guard = self.locks.lock(position_id).await;

        let position = self.store.get_position(position_id).ok_or(LifecycleError::UnknownPosition(position_id))?;
        if position.status.is_terminal() {
            return Ok(position);
        }

        let exit_price = mark_price.unwrap_or(position.entry_price);
        let close_side = match position.side {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        };
        let req = PlaceOrderRequest {
            client_order_id: format!("close-{position_id}"),
            instrument: position.instrument.clone(),
            side: close_side,
            quantity: position.quantity,
            reference_price: exit_price,
        };

        match self.router.place_market_order(req, now).await {
            Ok(receipt) => {
                self.close_attempts.lock().await.remove(&position_id);
                let realized = realized_pnl(&position, receipt.average_fill_price);
                let event = PortfolioEvent::PositionClosed {
                    id: position_id,
                    reason,
                    exit_price: receipt.average_fill_price,
                    realized_pnl: realized,
                    fees: receipt.fees,
                    closed_at: now,
                };
                self.store.apply(event, now).await.map_err(LifecycleError::Portfolio)?;
                self.trailing.lock().await.remove(&position_id);
                self.favorable_extreme.lock().await.remove(&position_id);
                // `get_position` (unlike a snapshot's `open_positions`) retains
                // terminal positions, so the just-closed record is available here.
                self.store.get_position(position_id).ok_or(LifecycleError::UnknownPosition(position_id))
            }
            Err(e) => {
                let attempts = {
                    let mut guard = self.close_attempts.lock().await;
                    let count = guard.entry(position_id).or_insert(0);
                    *count += 1;
                    *count
                };
                if attempts >= self.max_close_attempts {
                    self.halted.store(true, Ordering::SeqCst);
                    tracing::error!(
                        position = %position_id,
                        attempts,
                        error = %e,
                        "close order failed repeatedly, escalating to emergency halt"
                    );
                    return Err(LifecycleError::EscalatedToHalt { position_id, attempts, last_error: e });
                }
                tracing::warn!(position = %position_id, attempts, error = %e, "close order failed, will retry");
                tokio::time::sleep(self.backoff_floor * attempts.min(8)).await;
                Err(LifecycleError::Router(e))
            }
        }
    }

    /// One sweep of every open position against a fresh set of marks, in
    /// stop-loss -> take-profit -> deadline precedence (§3: "when more than
    /// one exit condition is true in the same tick, stop-loss takes
    /// precedence over take-profit, and both take precedence over the
    /// deadline"). A trailing stop (if enabled for the position) is
    /// ratcheted against the new mark before the stop-loss check runs, so a
    /// favorable move tightens the effective stop before it is evaluated.
    pub async fn monitor_tick(
        &self,
        prices: &BTreeMap<aegis_schemas::Instrument, Amount>,
        now: DateTime<Utc>,
    ) -> Vec<MonitorOutcome> {
        let mut outcomes = Vec::new();
        let open_positions = self.store.list_open_positions();

        for position in open_positions {
            let Some(&price) = prices.get(&position.instrument) else {
                continue;
            };

            let effective_stop = self.ratchet_trailing_stop(&position, price).await;

            let reason = if position.side.stop_loss_hit(price, effective_stop) {
                Some(CloseReason::StoppedOut)
            } else if position.side.take_profit_hit(price, position.take_profit_price) {
                Some(CloseReason::ClosedByTarget)
            } else if now >= position.deadline {
                Some(CloseReason::TimedOut)
            } else {
                None
            };

            if let Some(reason) = reason {
                match self.close(position.id, reason, Some(price), now).await {
                    Ok(_) => outcomes.push(MonitorOutcome { position_id: position.id, reason }),
                    Err(e) => {
                        tracing::warn!(position = %position.id, error = %e, "monitor tick close attempt did not complete");
                    }
                }
            }
        }

        outcomes
    }

    /// Force-closes every still-open position with `EmergencyClose` and
    /// enters the halt, refusing further opens until `clear_halt` (§4.9:
    /// "`emergency_stop` closes every open position ... and refuses new
    /// work until explicitly cleared").
    pub async fn emergency_stop(&self, prices: &BTreeMap<aegis_schemas::Instrument, Amount>, now: DateTime<Utc>) -> Vec<MonitorOutcome> {
        self.halted.store(true, Ordering::SeqCst);
        let mut outcomes = Vec::new();
        for position in self.store.list_open_positions() {
            let mark = prices.get(&position.instrument).copied();
            match self.close(position.id, CloseReason::EmergencyClose, mark, now).await {
                Ok(_) => outcomes.push(MonitorOutcome { position_id: position.id, reason: CloseReason::EmergencyClose }),
                Err(e) => tracing::error!(position = %position.id, error = %e, "emergency close did not complete"),
            }
        }
        outcomes
    }

    async fn ratchet_trailing_stop(&self, position: &Position, mark: Amount) -> Amount {
        let mut policies = self.trailing.lock().await;
        let Some(policy) = policies.get(&position.id) else {
            return position.stop_loss_price;
        };
        if !policy.enabled {
            return position.stop_loss_price;
        }

        let mut extremes = self.favorable_extreme.lock().await;
        let extreme = extremes.entry(position.id).or_insert(position.entry_price);
        let improved = match position.side {
            Side::Long => mark > *extreme,
            Side::Short => mark < *extreme,
        };
        if improved {
            *extreme = mark;
        }

        policy.trailing_stop_from(position.side, *extreme, position.stop_loss_price)
    }
}

fn realized_pnl(position: &Position, exit_price: Amount) -> Amount {
    let delta = match position.side {
        Side::Long => exit_price - position.entry_price,
        Side::Short => position.entry_price - exit_price,
    };
    position.quantity.checked_mul_price(delta).unwrap_or(Amount::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_money::{Qty, Ratio};
    use aegis_schemas::{ExecutionMode, Instrument};
    use std::sync::Arc;

    fn sized(instrument: &str, side: Side, reference_price: Amount) -> SizedProposal {
        SizedProposal {
            instrument: Instrument::new(instrument),
            side,
            reference_price,
            quantity: Qty::new(100_000_000),
            position_value: reference_price,
            raw_position_value: reference_price,
            stop_loss_price: Amount::from_units_cents(90, 0),
            take_profit_price: Amount::from_units_cents(120, 0),
            leverage: Ratio::ONE,
            kelly_fraction: Ratio::ZERO,
            fractional_kelly: Ratio::ZERO,
            volatility_scalar: Ratio::ONE,
        }
    }

    async fn manager() -> (LifecycleManager, PortfolioStore) {
        let pool = sqlx::PgPool::connect_lazy("postgres://unused/unused").expect("lazy pool never connects eagerly");
        let store = PortfolioStore::opening(pool, Amount::from_units_cents(100_000, 0), Utc::now());
        let backend = Arc::new(aegis_broker_paper::PaperBroker::new(Ratio::ZERO));
        let router = Arc::new(ExecutionRouter::new(backend, ExecutionMode::Paper, chrono::Duration::seconds(5)));
        let manager = LifecycleManager::new(store.clone(), router, 3);
        (manager, store)
    }

    #[tokio::test]
    async fn open_then_close_is_idempotent_on_repeat_close() {
        let (manager, _store) = manager().await;
        let proposal = sized("BTCZAR", Side::Long, Amount::from_units_cents(100, 0));
        let now = Utc::now();
        let position = manager
            .open(&proposal, "order-1".to_string(), Duration::hours(72), TrailingStopPolicy::off(), now)
            .await
            .unwrap();

        let closed_once = manager
            .close(position.id, CloseReason::ManualClose, Some(Amount::from_units_cents(110, 0)), now)
            .await
            .unwrap();
        assert!(closed_once.status.is_terminal());

        let closed_again = manager.close(position.id, CloseReason::StoppedOut, None, now).await.unwrap();
        assert_eq!(closed_again.close_reason, closed_once.close_reason);
    }

    #[tokio::test]
    async fn monitor_tick_prefers_stop_loss_over_take_profit_and_deadline() {
        let (manager, _store) = manager().await;
        let proposal = sized("BTCZAR", Side::Long, Amount::from_units_cents(100, 0));
        let now = Utc::now();
        manager
            .open(&proposal, "order-2".to_string(), Duration::hours(72), TrailingStopPolicy::off(), now)
            .await
            .unwrap();

        // A mark at or below stop AND at or above target: stop-loss must win.
        let mut prices = BTreeMap::new();
        prices.insert(Instrument::new("BTCZAR"), Amount::from_units_cents(90, 0));
        let outcomes = manager.monitor_tick(&prices, now).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].reason, CloseReason::StoppedOut);
    }

    #[tokio::test]
    async fn monitor_tick_closes_on_deadline_when_no_price_threshold_is_crossed() {
        let (manager, _store) = manager().await;
        let proposal = sized("BTCZAR", Side::Long, Amount::from_units_cents(100, 0));
        let now = Utc::now();
        manager
            .open(&proposal, "order-3".to_string(), Duration::seconds(1), TrailingStopPolicy::off(), now)
            .await
            .unwrap();

        let mut prices = BTreeMap::new();
        prices.insert(Instrument::new("BTCZAR"), Amount::from_units_cents(105, 0));
        let later = now + Duration::seconds(2);
        let outcomes = manager.monitor_tick(&prices, later).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].reason, CloseReason::TimedOut);
    }

    #[tokio::test]
    async fn halted_manager_refuses_new_opens() {
        let (manager, _store) = manager().await;
        manager.halted.store(true, Ordering::SeqCst);
        let proposal = sized("BTCZAR", Side::Long, Amount::from_units_cents(100, 0));
        let err = manager
            .open(&proposal, "order-4".to_string(), Duration::hours(72), TrailingStopPolicy::off(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Halted));
    }

    #[tokio::test]
    async fn emergency_stop_closes_open_positions_and_sets_halt() {
        let (manager, _store) = manager().await;
        let proposal = sized("BTCZAR", Side::Long, Amount::from_units_cents(100, 0));
        let now = Utc::now();
        manager
            .open(&proposal, "order-5".to_string(), Duration::hours(72), TrailingStopPolicy::off(), now)
            .await
            .unwrap();

        let mut prices = BTreeMap::new();
        prices.insert(Instrument::new("BTCZAR"), Amount::from_units_cents(101, 0));
        let outcomes = manager.emergency_stop(&prices, now).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].reason, CloseReason::EmergencyClose);
        assert!(manager.is_halted());
    }
}
