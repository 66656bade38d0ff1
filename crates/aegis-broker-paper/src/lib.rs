//! Deterministic in-memory paper backend (§4.5).
//!
//! Design decisions, in the same spirit as the reference workspace's paper
//! adapter: `backend_order_id` is exactly `client_order_id`; submission is
//! idempotent on it; fills are immediate rather than generated by a later
//! tick. Unlike the reference adapter this one fills at
//! `reference_price * (1 +/- slippage_bps)` since §4.5 requires a simulated
//! fill, not a bare "accepted" acknowledgment.

use std::collections::BTreeMap;

use aegis_execution::{Balances, ExecutionBackend, ExecutionError, PlaceOrderRequest};
use aegis_money::{Amount, Ratio};
use aegis_schemas::{OrderReceipt, OrderRef, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

pub struct PaperBroker {
    slippage_bps: Ratio,
    orders: Mutex<BTreeMap<String, OrderReceipt>>,
}

impl PaperBroker {
    pub fn new(slippage_bps: Ratio) -> Self {
        PaperBroker {
            slippage_bps,
            orders: Mutex::new(BTreeMap::new()),
        }
    }

    fn fill_price(&self, side: Side, reference_price: Amount) -> Amount {
        let adverse = match side {
            Side::Long => Ratio::ONE + self.slippage_bps,
            Side::Short => Ratio::ONE - self.slippage_bps,
        };
        reference_price.checked_mul_ratio(adverse).unwrap_or(reference_price)
    }
}

#[async_trait]
impl ExecutionBackend for PaperBroker {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn place_market_order(&self, req: PlaceOrderRequest) -> Result<OrderReceipt, ExecutionError> {
        let mut orders = self.orders.lock().await;
        if let Some(existing) = orders.get(&req.client_order_id) {
            return Ok(existing.clone());
        }

        let fill_price = self.fill_price(req.side, req.reference_price);
        let now = chrono_now();
        let receipt = OrderReceipt {
            backend_order_id: req.client_order_id.clone(),
            filled_quantity: req.quantity,
            average_fill_price: fill_price,
            fees: Amount::ZERO,
            accepted_at: now,
            settled_at: Some(now),
        };
        orders.insert(req.client_order_id, receipt.clone());
        Ok(receipt)
    }

    async fn cancel_order(&self, _backend_order_id: &str) -> Result<(), ExecutionError> {
        // Paper fills are immediate, so by the time a cancel could arrive
        // there is nothing left open to cancel. A deterministic no-op,
        // same as the reference adapter's idempotent cancel on a missing id.
        Ok(())
    }

    async fn get_balances(&self) -> Result<Balances, ExecutionError> {
        Ok(Balances { available_cash: Amount::ZERO })
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderRef>, ExecutionError> {
        // Every paper order settles synchronously on submission, so none
        // are ever left open.
        Ok(Vec::new())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn chrono_now() -> DateTime<Utc> {
    Utc::now()
}
