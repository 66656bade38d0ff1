//! Mode Orchestrator (C7, §4.7): gates PAPER <-> LIVE transitions of the
//! Execution Router behind pre-switch validation, an operator confirmation
//! token, and a durable audit trail. At most one mode change is ever in
//! flight; concurrent requests are rejected with `ModeChangeBusy` rather
//! than queued, since a transition's correctness depends on the exact
//! portfolio/backend state observed at its own start.
//!
//! Like the circuit breaker and feature-flag registry in `aegis-modularity`,
//! this crate stays free of I/O: every attempted transition (accepted or
//! rejected) is queued as a [`ModeTransition`] that `aegis-runtime` drains
//! into the durable `mode_audit` table and the hash-chained `aegis-audit`
//! log.

use std::sync::Arc;

use aegis_execution::ExecutionBackend;
use aegis_money::Ratio;
use aegis_schemas::{ExecutionMode, Position, RiskLimits};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// A single reason a requested transition was refused (§4.7, §7:
/// `ModeChangeRejected`). The orchestrator always collects every failing
/// condition, mirroring the Risk Gate's Gate Completeness property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeChangeReason {
    OpenPositionsExist,
    UnsettledOrdersExist,
    BackendUnhealthy,
    LimitsInconsistent(String),
    OperatorTokenMismatch,
}

impl std::fmt::Display for ModeChangeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModeChangeReason::OpenPositionsExist => write!(f, "open_positions_exist"),
            ModeChangeReason::UnsettledOrdersExist => write!(f, "unsettled_orders_exist"),
            ModeChangeReason::BackendUnhealthy => write!(f, "backend_unhealthy"),
            ModeChangeReason::LimitsInconsistent(why) => write!(f, "limits_inconsistent: {why}"),
            ModeChangeReason::OperatorTokenMismatch => write!(f, "operator_token_mismatch"),
        }
    }
}

#[derive(Debug)]
pub enum ModeChangeError {
    /// Another mode change is already in flight (§4.7 concurrency).
    Busy,
    /// Pre-switch validation failed; the router's bound backend is
    /// unchanged. Carries every failed condition, not just the first.
    Rejected(Vec<ModeChangeReason>),
}

impl std::fmt::Display for ModeChangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModeChangeError::Busy => write!(f, "a mode change is already in flight"),
            ModeChangeError::Rejected(reasons) => {
                write!(f, "mode change rejected: ")?;
                for (i, r) in reasons.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{r}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ModeChangeError {}

/// Outcome of a successful `request_mode` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChanged {
    pub from: ExecutionMode,
    pub to: ExecutionMode,
    pub at: DateTime<Utc>,
    /// `true` when the requested mode already matched the active one — no
    /// router swap occurred and no audit row was written (§8: "`set_mode
    /// (PAPER)` followed by `set_mode(PAPER)` is a no-op").
    pub was_noop: bool,
}

/// One attempted transition, queued for durable persistence (§4.7: "every
/// transition is appended to a durable audit log").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeTransition {
    pub from: ExecutionMode,
    pub to: ExecutionMode,
    pub operator: String,
    pub accepted: bool,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Checks `limits` for internal self-consistency (§4.7: "all required
/// risk-limit fields populated and self-consistent"). Every field on
/// `RiskLimits` is a required, strongly-typed value, so "populated" is
/// automatic; this enforces the bounded ranges §6 documents for each field.
pub fn limits_self_consistent(limits: &RiskLimits) -> Vec<String> {
    let mut problems = Vec::new();
    let unit_fields: [(&str, Ratio); 8] = [
        ("max_drawdown_pct", limits.max_drawdown_pct),
        ("daily_loss_limit_pct", limits.daily_loss_limit_pct),
        ("max_single_position_pct", limits.max_single_position_pct),
        ("max_sector_exposure_pct", limits.max_sector_exposure_pct),
        ("max_correlation_threshold", limits.max_correlation_threshold),
        ("max_portfolio_risk_exposure_pct", limits.max_portfolio_risk_exposure_pct),
        ("min_position_size_pct", limits.min_position_size_pct),
        ("fractional_kelly_coeff", limits.fractional_kelly_coeff),
    ];
    for (name, value) in unit_fields {
        if value.is_negative() || value > Ratio::ONE {
            problems.push(format!("{name}={value} is outside [0, 1]"));
        }
    }
    if limits.max_leverage < Ratio::ONE {
        problems.push(format!("max_leverage={} is below 1", limits.max_leverage));
    }
    if limits.min_position_size_pct > limits.max_single_position_pct {
        problems.push("min_position_size_pct exceeds max_single_position_pct".to_string());
    }
    if limits.vol_floor.is_negative() || limits.vol_floor.is_zero() {
        problems.push("vol_floor must be strictly positive".to_string());
    }
    if limits.max_hold_duration <= chrono::Duration::zero() {
        problems.push("max_hold_duration must be positive".to_string());
    }
    if limits.max_close_attempts == 0 {
        problems.push("max_close_attempts must be at least 1".to_string());
    }
    problems
}

/// Gates PAPER <-> LIVE transitions of a bound [`ExecutionRouter`].
pub struct ModeOrchestrator {
    router: Arc<aegis_execution::ExecutionRouter>,
    registered_operator_token: String,
    busy: Mutex<()>,
    pending: Mutex<Vec<ModeTransition>>,
}

impl ModeOrchestrator {
    pub fn new(router: Arc<aegis_execution::ExecutionRouter>, registered_operator_token: String) -> Self {
        ModeOrchestrator {
            router,
            registered_operator_token,
            busy: Mutex::new(()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Drain transitions recorded since the last drain, for persistence to
    /// `mode_audit` and the hash-chained `aegis-audit` log.
    pub async fn drain_transitions(&self) -> Vec<ModeTransition> {
        std::mem::take(&mut *self.pending.lock().await)
    }

    /// Requests a transition to `new_mode`. `candidate` is the backend to
    /// swap in; for a `PAPER` request the router is expected to already be
    /// bound to its paper backend instance so the swap is effectively a
    /// same-instance rebind.
    ///
    /// Transitions to `PAPER` are unconditional (the safety direction);
    /// transitions to `LIVE` require every condition in §4.7 to hold.
    pub async fn request_mode(
        &self,
        new_mode: ExecutionMode,
        operator_token: &str,
        open_positions: &[Position],
        limits: &RiskLimits,
        candidate: Arc<dyn ExecutionBackend>,
        at: DateTime<Utc>,
    ) -> Result<ModeChanged, ModeChangeError> {
        let _permit = self.busy.try_lock().map_err(|_| ModeChangeError::Busy)?;

        let current = self.router.active_mode().await;
        if current == new_mode {
            return Ok(ModeChanged { from: current, to: new_mode, at, was_noop: true });
        }

        if new_mode == ExecutionMode::Live {
            let mut reasons = Vec::new();
            if !open_positions.is_empty() {
                reasons.push(ModeChangeReason::OpenPositionsExist);
            }
            match candidate.get_open_orders().await {
                Ok(open) if !open.is_empty() => reasons.push(ModeChangeReason::UnsettledOrdersExist),
                Err(_) => reasons.push(ModeChangeReason::UnsettledOrdersExist),
                Ok(_) => {}
            }
            if !candidate.health_check().await {
                reasons.push(ModeChangeReason::BackendUnhealthy);
            }
            let consistency_problems = limits_self_consistent(limits);
            if !consistency_problems.is_empty() {
                reasons.push(ModeChangeReason::LimitsInconsistent(consistency_problems.join("; ")));
            }
            if operator_token != self.registered_operator_token {
                reasons.push(ModeChangeReason::OperatorTokenMismatch);
            }

            if !reasons.is_empty() {
                self.queue(current, new_mode, operator_token, false, Some(reasons.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ")), at)
                    .await;
                return Err(ModeChangeError::Rejected(reasons));
            }
        }

        if let Err(e) = self.router.swap(candidate, new_mode).await {
            tracing::error!(error = %e, "mode orchestrator swap failed after passing pre-switch validation");
            self.queue(current, new_mode, operator_token, false, Some(e.to_string()), at).await;
            return Err(ModeChangeError::Rejected(vec![ModeChangeReason::BackendUnhealthy]));
        }

        self.queue(current, new_mode, operator_token, true, None, at).await;
        Ok(ModeChanged { from: current, to: new_mode, at, was_noop: false })
    }

    async fn queue(&self, from: ExecutionMode, to: ExecutionMode, operator: &str, accepted: bool, reason: Option<String>, at: DateTime<Utc>) {
        self.pending.lock().await.push(ModeTransition {
            from,
            to,
            operator: operator.to_string(),
            accepted,
            reason,
            at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_broker_paper::PaperBroker;
    use aegis_money::Ratio;

    fn limits() -> RiskLimits {
        RiskLimits::sane_defaults()
    }

    #[test]
    fn limits_self_consistent_accepts_sane_defaults() {
        assert!(limits_self_consistent(&limits()).is_empty());
    }

    #[test]
    fn limits_self_consistent_flags_out_of_range_ratio() {
        let mut bad = limits();
        bad.max_drawdown_pct = Ratio::from_decimal_str("1.5").unwrap();
        assert!(!limits_self_consistent(&bad).is_empty());
    }

    #[test]
    fn limits_self_consistent_flags_leverage_below_one() {
        let mut bad = limits();
        bad.max_leverage = Ratio::from_decimal_str("0.5").unwrap();
        assert!(!limits_self_consistent(&bad).is_empty());
    }

    fn paper_backend() -> Arc<dyn ExecutionBackend> {
        Arc::new(PaperBroker::new(Ratio::from_decimal_str("0.0005").unwrap()))
    }

    fn position_stub() -> Position {
        use aegis_money::{Amount, Qty};
        use aegis_schemas::{Instrument, PositionId, PositionStatus, Side};
        let now = Utc::now();
        Position {
            id: PositionId::new(),
            instrument: Instrument::new("BTCZAR"),
            side: Side::Long,
            quantity: Qty::new(1),
            entry_price: Amount::from_units_cents(1_200_000, 0),
            entry_value: Amount::from_units_cents(12_000, 0),
            leverage: Ratio::ONE,
            stop_loss_price: Amount::from_units_cents(1_176_000, 0),
            take_profit_price: Amount::from_units_cents(1_248_000, 0),
            opened_at: now,
            deadline: now + chrono::Duration::hours(72),
            status: PositionStatus::Open,
            close_reason: None,
            exit_price: None,
            realized_pnl: None,
            fees: Amount::ZERO,
        }
    }

    #[tokio::test]
    async fn same_mode_request_is_a_noop_and_queues_nothing() {
        let router = Arc::new(aegis_execution::ExecutionRouter::new(paper_backend(), ExecutionMode::Paper, chrono::Duration::seconds(5)));
        let orchestrator = ModeOrchestrator::new(router, "correct-token".to_string());
        let now = Utc::now();
        let result = orchestrator
            .request_mode(ExecutionMode::Paper, "correct-token", &[], &limits(), paper_backend(), now)
            .await
            .unwrap();
        assert!(result.was_noop);
        assert!(orchestrator.drain_transitions().await.is_empty());
    }

    #[tokio::test]
    async fn live_transition_rejected_with_open_positions_and_bad_token() {
        let router = Arc::new(aegis_execution::ExecutionRouter::new(paper_backend(), ExecutionMode::Paper, chrono::Duration::seconds(5)));
        let orchestrator = ModeOrchestrator::new(router, "correct-token".to_string());
        let now = Utc::now();

        let err = orchestrator
            .request_mode(ExecutionMode::Live, "wrong-token", &[position_stub()], &limits(), paper_backend(), now)
            .await
            .unwrap_err();
        match err {
            ModeChangeError::Rejected(reasons) => {
                assert!(reasons.contains(&ModeChangeReason::OpenPositionsExist));
                assert!(reasons.contains(&ModeChangeReason::OperatorTokenMismatch));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        let transitions = orchestrator.drain_transitions().await;
        assert_eq!(transitions.len(), 1);
        assert!(!transitions[0].accepted);
    }

    #[tokio::test]
    async fn live_transition_accepted_swaps_router_and_queues_audit() {
        let router = Arc::new(aegis_execution::ExecutionRouter::new(paper_backend(), ExecutionMode::Paper, chrono::Duration::seconds(5)));
        let orchestrator = ModeOrchestrator::new(Arc::clone(&router), "correct-token".to_string());
        let now = Utc::now();

        let changed = orchestrator
            .request_mode(ExecutionMode::Live, "correct-token", &[], &limits(), paper_backend(), now)
            .await
            .unwrap();
        assert!(!changed.was_noop);
        assert_eq!(router.active_mode().await, ExecutionMode::Live);
        let transitions = orchestrator.drain_transitions().await;
        assert_eq!(transitions.len(), 1);
        assert!(transitions[0].accepted);
    }

    #[tokio::test]
    async fn second_request_while_first_holds_the_permit_is_busy() {
        let router = Arc::new(aegis_execution::ExecutionRouter::new(paper_backend(), ExecutionMode::Paper, chrono::Duration::seconds(5)));
        let orchestrator = ModeOrchestrator::new(router, "correct-token".to_string());
        let _held = orchestrator.busy.lock().await;
        let now = Utc::now();
        let err = orchestrator
            .request_mode(ExecutionMode::Live, "correct-token", &[], &limits(), paper_backend(), now)
            .await
            .unwrap_err();
        assert!(matches!(err, ModeChangeError::Busy));
    }
}
