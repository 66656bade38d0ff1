//! Portfolio State Store (§4.1): the single authoritative owner of cash,
//! positions, and derived risk metrics (drawdown, daily P&L). Every other
//! component reads it through immutable snapshots and writes to it only by
//! submitting a `PortfolioEvent`.

mod error;
mod state;
mod store;

pub use error::PortfolioError;
pub use state::Internal;
pub use store::PortfolioStore;
