//! `ExecutionBackend`: the capability contract every broker adapter
//! implements (§4.5). Generalized to `async fn` via `#[async_trait]` since
//! the live backend performs real network I/O — the paper backend is
//! simply async and resolves immediately.

use aegis_money::{Amount, Qty};
use aegis_schemas::{Instrument, OrderReceipt, OrderRef, Side};
use async_trait::async_trait;

use crate::error::ExecutionError;

/// A request to place a market order, identified by a caller-chosen
/// `client_order_id` so repeated submission (e.g. after a timeout) is
/// idempotent at the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaceOrderRequest {
    pub client_order_id: String,
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: Qty,
    pub reference_price: Amount,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Balances {
    pub available_cash: Amount,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// A short, stable label for logging and audit (`"paper"`, `"live"`).
    fn name(&self) -> &'static str;

    /// Idempotent on `client_order_id`: resubmitting the same id returns
    /// the original receipt rather than placing a second order.
    async fn place_market_order(&self, req: PlaceOrderRequest) -> Result<OrderReceipt, ExecutionError>;

    async fn cancel_order(&self, backend_order_id: &str) -> Result<(), ExecutionError>;

    async fn get_balances(&self) -> Result<Balances, ExecutionError>;

    async fn get_open_orders(&self) -> Result<Vec<OrderRef>, ExecutionError>;

    /// Used both by the Module Registry's swap gate and by the Mode
    /// Orchestrator's pre-switch validation before arming LIVE.
    async fn health_check(&self) -> bool;
}
