//! Trade Store Port (Driven Port)
//!
//! Append-only persistence of trades with a bounded, descending range query.

use async_trait::async_trait;

use crate::domain::trade::{PersistedTrade, TimeRange, Trade};

/// Errors raised by a trade store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be opened or initialized.
    #[error("failed to open trade store: {0}")]
    Open(String),

    /// A query or statement failed.
    #[error("trade store query failed: {0}")]
    Query(String),

    /// The trade cannot be represented in the store (e.g. a non-finite price).
    #[error("invalid trade: {0}")]
    InvalidTrade(String),

    /// A stored row could not be decoded.
    #[error("corrupt trade row: {0}")]
    CorruptRow(String),

    /// The blocking worker running the query panicked or was cancelled.
    #[error("trade store worker failed: {0}")]
    Worker(String),
}

/// Durable trade persistence.
///
/// Implementations assign `id`, `created_at` and `updated_at`. Both queries
/// return rows in descending timestamp order (ties broken by descending id).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Persist one trade.
    async fn insert(&self, trade: &Trade) -> Result<PersistedTrade, StoreError>;

    /// Trades whose timestamp lies in `range`, newest first, at most `limit`.
    async fn find_in_range(
        &self,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<PersistedTrade>, StoreError>;

    /// The `limit` most recent trades, newest first.
    async fn find_latest(&self, limit: usize) -> Result<Vec<PersistedTrade>, StoreError>;
}
