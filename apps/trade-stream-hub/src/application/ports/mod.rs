//! Port Interfaces
//!
//! Contracts that infrastructure adapters implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`TradeStore`]: durable append/query persistence of trades
//! - [`FeedPort`]: opens sessions against the upstream trade feed

mod feed_port;
mod trade_store;

pub use feed_port::{FeedError, FeedPort, FeedSession, SessionEvent};
pub use trade_store::{StoreError, TradeStore};

#[cfg(test)]
pub use trade_store::MockTradeStore;
