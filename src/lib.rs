//! Scalpstream Library
//!
//! Bounded realtime market-data collection against the KIS Open API:
//! slot-managed WebSocket subscriptions, credential lifecycle, and
//! feed-silence detection. Exposed for the binary and for integration
//! tests.

pub mod collector;
pub mod config;
pub mod engine;
pub mod gap;
pub mod kis;
pub mod ledger;
pub mod lifecycle;
pub mod models;
pub mod slot;
