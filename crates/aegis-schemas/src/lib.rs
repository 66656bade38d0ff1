//! Shared domain types for the portfolio risk and execution core.
//!
//! These are the nouns every other crate in the workspace passes across its
//! boundaries: `Instrument`, `Position`, `TradeProposal`, `RiskDecision`,
//! `PortfolioState` and the events that mutate it. None of this crate's
//! types carry behavior beyond small invariant-preserving constructors —
//! the engines that act on them live in `aegis-risk`, `aegis-sizer`,
//! `aegis-portfolio` and friends.

use std::collections::BTreeMap;
use std::fmt;

use aegis_money::{Amount, Qty, Ratio};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Symbolic instrument identifier (e.g. `BTCZAR`). Immutable, interned as a
/// plain `String` newtype so it can key maps and sets.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Instrument(String);

impl Instrument {
    pub fn new(symbol: impl Into<String>) -> Self {
        Instrument(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Instrument {
    fn from(s: &str) -> Self {
        Instrument::new(s)
    }
}

/// Trading sector, used by the sector-exposure check (§4.3 check 5). A
/// single configured table maps every instrument to a sector; instruments
/// absent from that table default to `"crypto"` (see DESIGN.md, Open
/// Question: sector taxonomy).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sector(String);

impl Sector {
    pub fn new(name: impl Into<String>) -> Self {
        Sector(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn default_crypto() -> Self {
        Sector("crypto".to_string())
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Sign applied to a price delta when computing unrealized PnL: a LONG
    /// benefits from price increases, a SHORT from decreases.
    pub fn pnl_sign(self) -> i64 {
        match self {
            Side::Long => 1,
            Side::Short => -1,
        }
    }

    /// Whether `price` has crossed `stop_loss_price` against this side.
    pub fn stop_loss_hit(self, price: Amount, stop_loss_price: Amount) -> bool {
        match self {
            Side::Long => price <= stop_loss_price,
            Side::Short => price >= stop_loss_price,
        }
    }

    /// Whether `price` has crossed `take_profit_price` in this side's favor.
    pub fn take_profit_hit(self, price: Amount, take_profit_price: Amount) -> bool {
        match self {
            Side::Long => price >= take_profit_price,
            Side::Short => price <= take_profit_price,
        }
    }
}

/// Opaque position identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionId(pub Uuid);

impl PositionId {
    pub fn new() -> Self {
        PositionId(Uuid::new_v4())
    }
}

impl Default for PositionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal reason a position was closed. Mirrors the terminal arm of
/// [`PositionStatus`] so callers of `close()` can name the reason without
/// constructing a full status.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    ClosedByTarget,
    StoppedOut,
    TimedOut,
    ManualClose,
    EmergencyClose,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::ClosedByTarget => "CLOSED_BY_TARGET",
            CloseReason::StoppedOut => "STOPPED_OUT",
            CloseReason::TimedOut => "TIMED_OUT",
            CloseReason::ManualClose => "MANUAL_CLOSE",
            CloseReason::EmergencyClose => "EMERGENCY_CLOSE",
        };
        write!(f, "{s}")
    }
}

/// Position status lifecycle: `Pending -> Open -> Closed(reason)`. Once
/// `Closed`, the status is terminal — the lifecycle manager enforces that
/// no further transition is ever applied to it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Pending,
    Open,
    Closed(CloseReason),
}

impl PositionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PositionStatus::Closed(_))
    }

    pub fn is_open(self) -> bool {
        matches!(self, PositionStatus::Open)
    }
}

/// A single position owned by the Portfolio State Store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: Qty,
    pub entry_price: Amount,
    pub entry_value: Amount,
    pub leverage: Ratio,
    pub stop_loss_price: Amount,
    pub take_profit_price: Amount,
    pub opened_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub exit_price: Option<Amount>,
    pub realized_pnl: Option<Amount>,
    pub fees: Amount,
}

impl Position {
    /// Current notional value of this position at `mark`.
    pub fn value_at(&self, mark: Amount) -> Option<Amount> {
        self.quantity.checked_mul_price(mark)
    }
}

/// Input to the Risk Gate and Position Sizer: one advisory trade idea.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeProposal {
    pub instrument: Instrument,
    pub side: Side,
    pub reference_price: Amount,
    pub advisory_size_pct: Ratio,
    pub advisory_leverage: Ratio,
    pub advisory_stop_loss_pct: Ratio,
    pub advisory_take_profit_pct: Ratio,
    /// Confidence in `[0, 1]`.
    pub confidence: Ratio,
    pub volatility_forecast_annualized: Ratio,
    pub rationale: String,
}

/// The seven ordered Risk Gate checks, in their fixed evaluation order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskCheckId {
    Drawdown,
    DailyLoss,
    RiskCapacity,
    SinglePositionSize,
    SectorExposure,
    Correlation,
    Leverage,
}

impl fmt::Display for RiskCheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskCheckId::Drawdown => "drawdown",
            RiskCheckId::DailyLoss => "daily_loss",
            RiskCheckId::RiskCapacity => "risk_capacity",
            RiskCheckId::SinglePositionSize => "single_position_size",
            RiskCheckId::SectorExposure => "sector_exposure",
            RiskCheckId::Correlation => "correlation",
            RiskCheckId::Leverage => "leverage",
        };
        write!(f, "{s}")
    }
}

/// A single failing check, reported with enough context to reproduce the
/// comparison independently (the observed value, the configured limit, and
/// a human-readable message).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViolatedCheck {
    pub check: RiskCheckId,
    pub observed: Ratio,
    pub limit: Ratio,
    pub message: String,
}

/// A position sized by the Position Sizer (C4), attached to a passing
/// `RiskDecision`. Every intermediate scalar is carried for auditability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SizedProposal {
    pub instrument: Instrument,
    pub side: Side,
    pub reference_price: Amount,
    pub quantity: Qty,
    pub position_value: Amount,
    pub raw_position_value: Amount,
    pub stop_loss_price: Amount,
    pub take_profit_price: Amount,
    pub leverage: Ratio,
    pub kelly_fraction: Ratio,
    pub fractional_kelly: Ratio,
    pub volatility_scalar: Ratio,
}

/// Output of the Risk Gate (C3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskDecision {
    pub passed: bool,
    /// Every failing check, in the fixed evaluation order — never just the
    /// first (Gate Completeness, §8).
    pub violated_checks: Vec<ViolatedCheck>,
    pub sized_proposal: Option<SizedProposal>,
}

impl RiskDecision {
    pub fn allow(sized: SizedProposal) -> Self {
        RiskDecision {
            passed: true,
            violated_checks: Vec::new(),
            sized_proposal: Some(sized),
        }
    }

    pub fn reject(violated_checks: Vec<ViolatedCheck>) -> Self {
        debug_assert!(!violated_checks.is_empty());
        RiskDecision {
            passed: false,
            violated_checks,
            sized_proposal: None,
        }
    }
}

/// Risk and engine configuration (§6). Loaded and hashed by `aegis-config`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_drawdown_pct: Ratio,
    pub daily_loss_limit_pct: Ratio,
    pub max_single_position_pct: Ratio,
    pub max_sector_exposure_pct: Ratio,
    pub max_correlation_threshold: Ratio,
    pub max_leverage: Ratio,
    pub max_portfolio_risk_exposure_pct: Ratio,
    pub min_position_size_pct: Ratio,
    pub fractional_kelly_coeff: Ratio,
    pub vol_target: Ratio,
    pub vol_floor: Ratio,
    pub max_hold_duration: chrono::Duration,
    pub monitor_interval: chrono::Duration,
    pub snapshot_interval: chrono::Duration,
    pub max_price_age: chrono::Duration,
    pub max_close_attempts: u32,
}

impl RiskLimits {
    /// Conservative defaults matching §6's stated typical values, used by
    /// tests and as a base layer before configuration overrides apply.
    pub fn sane_defaults() -> Self {
        RiskLimits {
            max_drawdown_pct: Ratio::from_decimal_str("0.15").unwrap(),
            daily_loss_limit_pct: Ratio::from_decimal_str("0.05").unwrap(),
            max_single_position_pct: Ratio::from_decimal_str("0.10").unwrap(),
            max_sector_exposure_pct: Ratio::from_decimal_str("0.30").unwrap(),
            max_correlation_threshold: Ratio::from_decimal_str("0.80").unwrap(),
            max_leverage: Ratio::from_decimal_str("3.0").unwrap(),
            max_portfolio_risk_exposure_pct: Ratio::from_decimal_str("0.15").unwrap(),
            min_position_size_pct: Ratio::from_decimal_str("0.001").unwrap(),
            fractional_kelly_coeff: Ratio::from_decimal_str("0.25").unwrap(),
            vol_target: Ratio::from_decimal_str("0.10").unwrap(),
            vol_floor: Ratio::from_decimal_str("0.05").unwrap(),
            max_hold_duration: chrono::Duration::hours(72),
            monitor_interval: chrono::Duration::seconds(1),
            snapshot_interval: chrono::Duration::seconds(60),
            max_price_age: chrono::Duration::seconds(60),
            max_close_attempts: 3,
        }
    }
}

/// Execution mode. `Transitioning` is a momentary router-internal state
/// during a hot-swap and is never the Mode Orchestrator's target.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Paper,
    Live,
    Transitioning,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionMode::Paper => "PAPER",
            ExecutionMode::Live => "LIVE",
            ExecutionMode::Transitioning => "TRANSITIONING",
        };
        write!(f, "{s}")
    }
}

/// Result of a completed order placement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub backend_order_id: String,
    pub filled_quantity: Qty,
    pub average_fill_price: Amount,
    pub fees: Amount,
    pub accepted_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Reference to an open (unsettled) order, as returned by
/// `ExecutionBackend::get_open_orders`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderRef {
    pub backend_order_id: String,
    pub client_order_id: String,
    pub instrument: Instrument,
}

/// Authoritative, singleton monetary state of the portfolio.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub total_value: Amount,
    pub cash_balance: Amount,
    pub positions_value: Amount,
    pub peak_value: Amount,
    pub current_drawdown_pct: Ratio,
    /// Worst `current_drawdown_pct` observed this session — monotone
    /// non-decreasing until the high-water mark is beaten (distinct from
    /// `RiskLimits::max_drawdown_pct`, the configured cap).
    pub max_drawdown_pct: Ratio,
    pub daily_pnl: Amount,
    pub total_pnl: Amount,
    pub daily_anchor_value: Amount,
    pub daily_anchor_at: DateTime<Utc>,
}

impl PortfolioState {
    pub fn opening(cash_balance: Amount, at: DateTime<Utc>) -> Self {
        PortfolioState {
            total_value: cash_balance,
            cash_balance,
            positions_value: Amount::ZERO,
            peak_value: cash_balance,
            current_drawdown_pct: Ratio::ZERO,
            max_drawdown_pct: Ratio::ZERO,
            daily_pnl: Amount::ZERO,
            total_pnl: Amount::ZERO,
            daily_anchor_value: cash_balance,
            daily_anchor_at: at,
        }
    }

    /// `total_value == cash_balance + positions_value`, exactly.
    pub fn equity_identity_holds(&self) -> bool {
        self.cash_balance + self.positions_value == self.total_value
    }
}

/// A consistent, immutable view of portfolio state and open positions at a
/// point in time, as returned by the Portfolio State Store's `snapshot()`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub state: PortfolioState,
    pub open_positions: Vec<Position>,
    pub prices: BTreeMap<Instrument, Amount>,
    pub observed_at: DateTime<Utc>,
}

impl PortfolioSnapshot {
    pub fn get_position(&self, id: PositionId) -> Option<&Position> {
        self.open_positions.iter().find(|p| p.id == id)
    }
}

/// Events applied to the Portfolio State Store — the only way its state
/// changes (§4.1). Every variant is durable before the store acknowledges
/// the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PortfolioEvent {
    PositionOpened {
        position: Box<Position>,
        cash_delta: Amount,
    },
    PositionClosed {
        id: PositionId,
        reason: CloseReason,
        exit_price: Amount,
        realized_pnl: Amount,
        fees: Amount,
        closed_at: DateTime<Utc>,
    },
    PriceMarkUpdated {
        instrument: Instrument,
        price: Amount,
        observed_at: DateTime<Utc>,
    },
    DayRolled {
        new_anchor_value: Amount,
        at: DateTime<Utc>,
    },
    EmergencyHalt {
        at: DateTime<Utc>,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_stop_loss_hit_directions() {
        let entry = Amount::from_units_cents(1_200_000, 0);
        let sl = Amount::from_units_cents(1_176_000, 0);
        assert!(!Side::Long.stop_loss_hit(entry, sl));
        assert!(Side::Long.stop_loss_hit(Amount::from_units_cents(1_175_500, 0), sl));
        assert!(!Side::Short.stop_loss_hit(entry, Amount::from_units_cents(1_224_000, 0)));
        assert!(Side::Short.stop_loss_hit(Amount::from_units_cents(1_225_000, 0), Amount::from_units_cents(1_224_000, 0)));
    }

    #[test]
    fn position_status_terminal() {
        assert!(!PositionStatus::Open.is_terminal());
        assert!(PositionStatus::Closed(CloseReason::StoppedOut).is_terminal());
    }

    #[test]
    fn portfolio_state_equity_identity() {
        let state = PortfolioState::opening(Amount::from_units_cents(100_000, 0), Utc::now());
        assert!(state.equity_identity_holds());
    }

    #[test]
    fn risk_decision_reject_carries_violations() {
        let v = ViolatedCheck {
            check: RiskCheckId::Drawdown,
            observed: Ratio::from_decimal_str("0.16").unwrap(),
            limit: Ratio::from_decimal_str("0.15").unwrap(),
            message: "drawdown exceeds limit".to_string(),
        };
        let decision = RiskDecision::reject(vec![v]);
        assert!(!decision.passed);
        assert_eq!(decision.violated_checks.len(), 1);
    }
}
