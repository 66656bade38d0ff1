//! Execution backend capability contract (C5) and the Execution Router
//! (C6) that hot-swaps between implementations of it (§4.5, §4.6).

mod backend;
mod error;
mod router;

pub use backend::{Balances, ExecutionBackend, PlaceOrderRequest};
pub use error::{ExecutionError, RouterError};
pub use router::ExecutionRouter;
