//! Shared fixtures for scenario tests: sane-default risk limits, sample
//! proposals, and fake collaborators (`FakeExecutionBackend`,
//! `FakeCorrelationOracle`) standing in for a real exchange or correlation
//! service without a network dependency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use aegis_execution::{Balances, ExecutionBackend, ExecutionError, PlaceOrderRequest};
use aegis_money::{Amount, Qty, Ratio};
use aegis_risk::{CorrelationError, CorrelationOracle};
use aegis_schemas::{Instrument, OrderReceipt, OrderRef, RiskLimits, Side, TradeProposal};
use async_trait::async_trait;
use chrono::Utc;

/// `RiskLimits::sane_defaults()`, the base layer every scenario test starts
/// from before tweaking the one or two fields its scenario cares about.
pub fn sample_risk_limits() -> RiskLimits {
    RiskLimits::sane_defaults()
}

/// A plausible long proposal on `instrument`, sized well within every
/// sane-default limit so a test that widens exactly one limit field can
/// isolate that field's effect.
pub fn sample_trade_proposal(instrument: &str) -> TradeProposal {
    TradeProposal {
        instrument: Instrument::new(instrument),
        side: Side::Long,
        reference_price: Amount::from_units_cents(50_000, 0),
        advisory_size_pct: Ratio::from_decimal_str("0.05").unwrap(),
        advisory_leverage: Ratio::from_decimal_str("1.0").unwrap(),
        advisory_stop_loss_pct: Ratio::from_decimal_str("0.02").unwrap(),
        advisory_take_profit_pct: Ratio::from_decimal_str("0.04").unwrap(),
        confidence: Ratio::from_decimal_str("0.6").unwrap(),
        volatility_forecast_annualized: Ratio::from_decimal_str("0.40").unwrap(),
        rationale: "testkit fixture".to_string(),
    }
}

/// An `ExecutionBackend` that never touches the network: fills every order
/// immediately at its reference price, tracks accepted orders so a test can
/// assert on idempotent resubmission, and lets a test flip its health and
/// balance at will.
pub struct FakeExecutionBackend {
    pub label: &'static str,
    healthy: AtomicBool,
    available_cash: Mutex<Amount>,
    calls: AtomicU32,
    receipts: Mutex<BTreeMap<String, OrderReceipt>>,
}

impl FakeExecutionBackend {
    pub fn new(label: &'static str) -> Self {
        FakeExecutionBackend {
            label,
            healthy: AtomicBool::new(true),
            available_cash: Mutex::new(Amount::from_units_cents(1_000_000, 0)),
            calls: AtomicU32::new(0),
            receipts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_available_cash(&self, cash: Amount) {
        *self.available_cash.lock().unwrap() = cash;
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for FakeExecutionBackend {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn place_market_order(&self, req: PlaceOrderRequest) -> Result<OrderReceipt, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut receipts = self.receipts.lock().unwrap();
        if let Some(existing) = receipts.get(&req.client_order_id) {
            return Ok(existing.clone());
        }
        let receipt = OrderReceipt {
            backend_order_id: format!("{}-{}", self.label, req.client_order_id),
            filled_quantity: req.quantity,
            average_fill_price: req.reference_price,
            fees: Amount::ZERO,
            accepted_at: Utc::now(),
            settled_at: Some(Utc::now()),
        };
        receipts.insert(req.client_order_id, receipt.clone());
        Ok(receipt)
    }

    async fn cancel_order(&self, _backend_order_id: &str) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn get_balances(&self) -> Result<Balances, ExecutionError> {
        Ok(Balances { available_cash: *self.available_cash.lock().unwrap() })
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderRef>, ExecutionError> {
        Ok(Vec::new())
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// A `CorrelationOracle` returning a fixed ratio for every pair, so a test
/// can drive the Risk Gate's correlation check to a known value without a
/// real oracle.
pub struct FakeCorrelationOracle {
    pub fixed: Ratio,
}

impl FakeCorrelationOracle {
    pub fn new(fixed: Ratio) -> Self {
        FakeCorrelationOracle { fixed }
    }
}

#[async_trait]
impl CorrelationOracle for FakeCorrelationOracle {
    async fn correlation(&self, _a: &Instrument, _b: &Instrument) -> Result<Ratio, CorrelationError> {
        Ok(self.fixed)
    }
}

/// A `CorrelationOracle` that always fails, for exercising the fallback
/// path independent of `aegis-runtime`'s production `NullCorrelationOracle`.
pub struct UnavailableCorrelationOracle;

#[async_trait]
impl CorrelationOracle for UnavailableCorrelationOracle {
    async fn correlation(&self, _a: &Instrument, _b: &Instrument) -> Result<Ratio, CorrelationError> {
        Err(CorrelationError::Unavailable)
    }
}

/// Quantity helper: `qty("1.5")` for a test that would otherwise spell out
/// the 1e8 scale by hand.
pub fn qty(decimal: &str) -> Qty {
    let (whole, frac) = decimal.split_once('.').unwrap_or((decimal, ""));
    let whole: i64 = whole.parse().expect("valid whole part in test fixture quantity");
    let frac = format!("{frac:0<8}");
    let frac: i64 = frac[..8].parse().expect("valid fractional part in test fixture quantity");
    Qty::new(whole * aegis_money::QTY_SCALE + frac)
}
