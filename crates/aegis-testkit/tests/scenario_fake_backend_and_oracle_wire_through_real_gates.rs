use std::collections::BTreeMap;
use std::sync::Arc;

use aegis_execution::{ExecutionRouter, PlaceOrderRequest};
use aegis_modularity::{BreakerConfig, CircuitBreaker};
use aegis_risk::SectorTable;
use aegis_schemas::{ExecutionMode, Instrument, Position, PositionId, PositionStatus, PortfolioSnapshot, PortfolioState, Side};
use aegis_sizer::LotSizeTable;
use aegis_testkit::{qty, sample_risk_limits, sample_trade_proposal, FakeCorrelationOracle, FakeExecutionBackend};
use chrono::Utc;

/// `FakeExecutionBackend` behind a real `ExecutionRouter`: a market order
/// fills immediately, and resubmitting the same client order id returns the
/// original receipt rather than filling twice.
#[tokio::test]
async fn fake_backend_fills_through_router_and_is_idempotent() {
    let now = Utc::now();
    let backend = Arc::new(FakeExecutionBackend::new("fake"));
    let router = ExecutionRouter::new(backend.clone(), ExecutionMode::Paper, chrono::Duration::seconds(5));

    let req = PlaceOrderRequest {
        client_order_id: "order-1".to_string(),
        instrument: Instrument::new("BTCZAR"),
        side: aegis_schemas::Side::Long,
        quantity: qty("0.01"),
        reference_price: aegis_money::Amount::from_units_cents(1_200_000, 0),
    };

    let first = router.place_market_order(req.clone(), now).await.expect("healthy backend accepts the order");
    let second = router.place_market_order(req, now).await.expect("resubmission must also succeed");
    assert_eq!(first.backend_order_id, second.backend_order_id, "same client_order_id must not fill twice");
    assert_eq!(backend.call_count(), 2, "router must still forward both attempts to the backend");
}

/// `FakeCorrelationOracle` pinned above the configured threshold drives the
/// Risk Gate's correlation check to a rejection, with every other check
/// still evaluated (gate completeness).
#[tokio::test]
async fn fake_oracle_above_threshold_fails_correlation_check_only() {
    let now = Utc::now();
    let total_value = aegis_money::Amount::from_units_cents(100_000, 0);
    let held = Instrument::new("BTCZAR");
    let entry_price = aegis_money::Amount::from_units_cents(1_200_000, 0);
    let held_position = Position {
        id: PositionId::new(),
        instrument: held.clone(),
        side: Side::Long,
        quantity: qty("0.05"),
        entry_price,
        entry_value: aegis_money::Amount::from_units_cents(60_000, 0),
        leverage: aegis_money::Ratio::ONE,
        stop_loss_price: aegis_money::Amount::from_units_cents(1_176_000, 0),
        take_profit_price: aegis_money::Amount::from_units_cents(1_260_000, 0),
        opened_at: now,
        deadline: now + chrono::Duration::hours(72),
        status: PositionStatus::Open,
        close_reason: None,
        exit_price: None,
        realized_pnl: None,
        fees: aegis_money::Amount::ZERO,
    };
    let snapshot = PortfolioSnapshot {
        state: PortfolioState::opening(total_value, now),
        open_positions: vec![held_position],
        prices: BTreeMap::from([(held, entry_price)]),
        observed_at: now,
    };

    let mut limits = sample_risk_limits();
    limits.max_correlation_threshold = aegis_money::Ratio::from_decimal_str("0.50").unwrap();

    let proposal = sample_trade_proposal("ETHZAR");
    let sectors = SectorTable::new();
    let lots = LotSizeTable::new();
    let oracle = FakeCorrelationOracle::new(aegis_money::Ratio::from_decimal_str("0.90").unwrap());
    let breaker = CircuitBreaker::new("correlation", BreakerConfig::sane_defaults());

    let decision = aegis_risk::evaluate(&proposal, &snapshot, &limits, &sectors, &lots, &oracle, &breaker, now).await;

    assert!(!decision.passed);
    assert!(
        decision.violated_checks.iter().any(|c| matches!(c.check, aegis_schemas::RiskCheckId::Correlation)),
        "expected a correlation violation, got: {:?}",
        decision.violated_checks
    );
}
