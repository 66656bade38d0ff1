//! Live exchange backend (§4.5): a signed HTTP client implementing
//! `ExecutionBackend` against a real exchange REST API.
//!
//! Grounded on the `hmac`/`sha2`-based request signing used throughout the
//! retrieval pack's own exchange adapters (e.g. `BinanceExecutionService::
//! sign_request`): a query string is HMAC-SHA256'd with the API secret and
//! hex-encoded, with the signed `timestamp` param itself acting as the
//! signature's time window — a stale, replayed request fails signature
//! verification server-side once its timestamp falls outside the
//! exchange's accepted skew.

mod client;
mod signing;

pub use client::LiveBroker;
