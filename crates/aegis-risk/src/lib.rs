//! Risk Gate (C3): stateless, non-short-circuiting evaluation of a
//! `TradeProposal` against the portfolio's configured risk limits.

pub mod correlation;
pub mod engine;
pub mod sectors;

pub use correlation::{fallback_correlation, CorrelationError, CorrelationOracle};
pub use engine::evaluate;
pub use sectors::SectorTable;
