//! Risk Gate (C3): `evaluate(proposal, snapshot, limits) -> RiskDecision`.
//!
//! Applies the seven checks of §4.3 in a fixed order, every one evaluated
//! regardless of earlier failures (Gate Completeness) so a caller sees
//! every reason a proposal was rejected, not just the first. All
//! arithmetic runs through `aegis_money`'s fixed-point types — no float
//! comparison anywhere on this path.

use aegis_money::{Amount, Ratio};
use aegis_schemas::{PortfolioSnapshot, Position, RiskCheckId, RiskDecision, RiskLimits, TradeProposal, ViolatedCheck};
use aegis_sizer::LotSizeTable;
use chrono::{DateTime, Utc};

use crate::correlation::{fallback_correlation, CorrelationOracle};
use crate::sectors::SectorTable;
use aegis_modularity::CircuitBreaker;

fn mark_of(position: &Position, snapshot: &PortfolioSnapshot) -> Amount {
    snapshot.prices.get(&position.instrument).copied().unwrap_or(position.entry_price)
}

/// Checks 1 and 2 need no sizing — they compare existing portfolio state
/// against its own limits.
fn check_drawdown(snapshot: &PortfolioSnapshot, limits: &RiskLimits, out: &mut Vec<ViolatedCheck>) {
    if snapshot.state.total_value.is_zero() {
        out.push(ViolatedCheck {
            check: RiskCheckId::Drawdown,
            observed: Ratio::ONE,
            limit: limits.max_drawdown_pct,
            message: "insufficient equity: total_value is zero".to_string(),
        });
        return;
    }
    if snapshot.state.current_drawdown_pct > limits.max_drawdown_pct {
        out.push(ViolatedCheck {
            check: RiskCheckId::Drawdown,
            observed: snapshot.state.current_drawdown_pct,
            limit: limits.max_drawdown_pct,
            message: "current drawdown exceeds the configured cap".to_string(),
        });
    }
}

fn check_daily_loss(snapshot: &PortfolioSnapshot, limits: &RiskLimits, out: &mut Vec<ViolatedCheck>) {
    if snapshot.state.total_value.is_zero() {
        out.push(ViolatedCheck {
            check: RiskCheckId::DailyLoss,
            observed: -Ratio::ONE,
            limit: limits.daily_loss_limit_pct,
            message: "insufficient equity: total_value is zero".to_string(),
        });
        return;
    }
    let floor = -limits.daily_loss_limit_pct;
    match snapshot.state.daily_pnl.checked_div_to_ratio(snapshot.state.daily_anchor_value) {
        None => out.push(ViolatedCheck {
            check: RiskCheckId::DailyLoss,
            observed: floor,
            limit: limits.daily_loss_limit_pct,
            message: "daily anchor value is zero".to_string(),
        }),
        Some(pnl_ratio) if pnl_ratio < floor => out.push(ViolatedCheck {
            check: RiskCheckId::DailyLoss,
            observed: pnl_ratio,
            limit: limits.daily_loss_limit_pct,
            message: "daily loss exceeds the configured limit".to_string(),
        }),
        Some(_) => {}
    }
}

fn check_risk_capacity(
    proposal: &TradeProposal,
    sized_position_value: Amount,
    snapshot: &PortfolioSnapshot,
    limits: &RiskLimits,
    out: &mut Vec<ViolatedCheck>,
) {
    let total_value = snapshot.state.total_value;
    if total_value.is_zero() {
        out.push(ViolatedCheck {
            check: RiskCheckId::RiskCapacity,
            observed: Ratio::ONE,
            limit: limits.max_portfolio_risk_exposure_pct,
            message: "insufficient equity: total_value is zero".to_string(),
        });
        return;
    }
    let mut existing_at_risk = Amount::ZERO;
    for position in &snapshot.open_positions {
        let stop_loss_pct = (position.entry_price - position.stop_loss_price)
            .abs()
            .checked_div_to_ratio(position.entry_price)
            .unwrap_or(Ratio::ZERO);
        let at_risk = position.entry_value.checked_mul_ratio(stop_loss_pct).unwrap_or(Amount::ZERO);
        existing_at_risk = existing_at_risk.saturating_add(at_risk);
    }
    let proposed_at_risk = sized_position_value.checked_mul_ratio(proposal.advisory_stop_loss_pct).unwrap_or(Amount::ZERO);
    let projected_at_risk = existing_at_risk.saturating_add(proposed_at_risk);
    let observed = projected_at_risk.checked_div_to_ratio(total_value).unwrap_or(Ratio::ONE);
    if observed > limits.max_portfolio_risk_exposure_pct {
        out.push(ViolatedCheck {
            check: RiskCheckId::RiskCapacity,
            observed,
            limit: limits.max_portfolio_risk_exposure_pct,
            message: "projected at-risk exposure exceeds the portfolio risk budget".to_string(),
        });
    }
}

fn check_single_position_size(sized_position_value: Amount, snapshot: &PortfolioSnapshot, limits: &RiskLimits, out: &mut Vec<ViolatedCheck>) {
    let total_value = snapshot.state.total_value;
    if total_value.is_zero() {
        out.push(ViolatedCheck {
            check: RiskCheckId::SinglePositionSize,
            observed: Ratio::ONE,
            limit: limits.max_single_position_pct,
            message: "insufficient equity: total_value is zero".to_string(),
        });
        return;
    }
    let observed = sized_position_value.checked_div_to_ratio(total_value).unwrap_or(Ratio::ZERO);
    if observed > limits.max_single_position_pct {
        out.push(ViolatedCheck {
            check: RiskCheckId::SinglePositionSize,
            observed,
            limit: limits.max_single_position_pct,
            message: "sized position exceeds the single-position cap".to_string(),
        });
    } else if observed < limits.min_position_size_pct {
        out.push(ViolatedCheck {
            check: RiskCheckId::SinglePositionSize,
            observed,
            limit: limits.min_position_size_pct,
            message: "sized position falls below the minimum size floor".to_string(),
        });
    }
}

fn check_sector_exposure(
    proposal: &TradeProposal,
    sized_position_value: Amount,
    snapshot: &PortfolioSnapshot,
    limits: &RiskLimits,
    sectors: &SectorTable,
    out: &mut Vec<ViolatedCheck>,
) {
    let total_value = snapshot.state.total_value;
    if total_value.is_zero() {
        out.push(ViolatedCheck {
            check: RiskCheckId::SectorExposure,
            observed: Ratio::ONE,
            limit: limits.max_sector_exposure_pct,
            message: "insufficient equity: total_value is zero".to_string(),
        });
        return;
    }
    let proposal_sector = sectors.get(&proposal.instrument);
    let mut existing_sector_value = Amount::ZERO;
    for position in &snapshot.open_positions {
        if sectors.get(&position.instrument) == proposal_sector {
            let value = position.value_at(mark_of(position, snapshot)).unwrap_or(position.entry_value);
            existing_sector_value = existing_sector_value.saturating_add(value);
        }
    }
    let projected = existing_sector_value.saturating_add(sized_position_value);
    let observed = projected.checked_div_to_ratio(total_value).unwrap_or(Ratio::ONE);
    if observed > limits.max_sector_exposure_pct {
        out.push(ViolatedCheck {
            check: RiskCheckId::SectorExposure,
            observed,
            limit: limits.max_sector_exposure_pct,
            message: format!("{proposal_sector} sector exposure exceeds the configured cap"),
        });
    }
}

async fn resolve_correlation(
    oracle: &dyn CorrelationOracle,
    breaker: &CircuitBreaker,
    now: DateTime<Utc>,
    a: &aegis_schemas::Instrument,
    b: &aegis_schemas::Instrument,
) -> Ratio {
    match breaker.call(now, || oracle.correlation(a, b)).await {
        Ok(r) => r,
        Err(_) => fallback_correlation(a, b),
    }
}

async fn check_correlation(
    proposal: &TradeProposal,
    snapshot: &PortfolioSnapshot,
    limits: &RiskLimits,
    oracle: &dyn CorrelationOracle,
    breaker: &CircuitBreaker,
    now: DateTime<Utc>,
    out: &mut Vec<ViolatedCheck>,
) {
    let mut worst: Option<Ratio> = None;
    for position in &snapshot.open_positions {
        let corr = resolve_correlation(oracle, breaker, now, &proposal.instrument, &position.instrument).await;
        let abs_corr = corr.abs();
        if worst.map_or(true, |w| abs_corr > w) {
            worst = Some(abs_corr);
        }
    }
    if let Some(observed) = worst {
        if observed > limits.max_correlation_threshold {
            out.push(ViolatedCheck {
                check: RiskCheckId::Correlation,
                observed,
                limit: limits.max_correlation_threshold,
                message: "correlated exposure against an open position exceeds the threshold".to_string(),
            });
        }
    }
}

fn check_leverage(
    sized_position_value: Amount,
    sized_leverage: Ratio,
    snapshot: &PortfolioSnapshot,
    limits: &RiskLimits,
    out: &mut Vec<ViolatedCheck>,
) {
    let total_value = snapshot.state.total_value;
    if total_value.is_zero() {
        out.push(ViolatedCheck {
            check: RiskCheckId::Leverage,
            observed: Ratio::ONE,
            limit: limits.max_leverage,
            message: "insufficient equity: total_value is zero".to_string(),
        });
        return;
    }
    let mut existing_notional = Amount::ZERO;
    for position in &snapshot.open_positions {
        let value = position.value_at(mark_of(position, snapshot)).unwrap_or(position.entry_value);
        let notional = value.checked_mul_ratio(position.leverage).unwrap_or(value);
        existing_notional = existing_notional.saturating_add(notional);
    }
    let sized_notional = sized_position_value.checked_mul_ratio(sized_leverage).unwrap_or(sized_position_value);
    let total_notional = existing_notional.saturating_add(sized_notional);
    let observed = total_notional.checked_div_to_ratio(total_value).unwrap_or(Ratio::ONE);
    if observed > limits.max_leverage {
        out.push(ViolatedCheck {
            check: RiskCheckId::Leverage,
            observed,
            limit: limits.max_leverage,
            message: "projected notional leverage exceeds the configured cap".to_string(),
        });
    }
}

/// Evaluates a proposal against every check in §4.3, in order, without
/// short-circuiting. Sizing runs first internally (checks 3, 4, 5 and 7
/// need `sized.position_value`/notional); on a pass, the same
/// [`aegis_sizer`] output is attached to the returned decision so the
/// caller never re-sizes the proposal.
pub async fn evaluate(
    proposal: &TradeProposal,
    snapshot: &PortfolioSnapshot,
    limits: &RiskLimits,
    sectors: &SectorTable,
    lot_sizes: &LotSizeTable,
    oracle: &dyn CorrelationOracle,
    correlation_breaker: &CircuitBreaker,
    now: DateTime<Utc>,
) -> RiskDecision {
    let sized = aegis_sizer::size(proposal, snapshot.state.total_value, limits, lot_sizes);

    let mut violated = Vec::new();
    check_drawdown(snapshot, limits, &mut violated);
    check_daily_loss(snapshot, limits, &mut violated);
    check_risk_capacity(proposal, sized.position_value, snapshot, limits, &mut violated);
    check_single_position_size(sized.position_value, snapshot, limits, &mut violated);
    check_sector_exposure(proposal, sized.position_value, snapshot, limits, sectors, &mut violated);
    check_correlation(proposal, snapshot, limits, oracle, correlation_breaker, now, &mut violated).await;
    check_leverage(sized.position_value, sized.leverage, snapshot, limits, &mut violated);

    if violated.is_empty() {
        RiskDecision::allow(sized)
    } else {
        RiskDecision::reject(violated)
    }
}
