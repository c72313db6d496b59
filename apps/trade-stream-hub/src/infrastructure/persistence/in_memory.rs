//! In-memory trade store for testing and development.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::application::ports::{StoreError, TradeStore};
use crate::domain::trade::{PersistedTrade, TimeRange, Trade};

/// In-memory implementation of [`TradeStore`].
///
/// Suitable for testing and development. Not for production use.
#[derive(Debug)]
pub struct InMemoryTradeStore {
    trades: RwLock<Vec<PersistedTrade>>,
    available: AtomicBool,
}

impl Default for InMemoryTradeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTradeStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            trades: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Get the number of stored trades.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trades.read().len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trades.read().is_empty()
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Query("store unavailable".to_string()))
        }
    }

    fn newest_first<'a>(
        trades: impl Iterator<Item = &'a PersistedTrade>,
        limit: usize,
    ) -> Vec<PersistedTrade> {
        let mut selected: Vec<PersistedTrade> = trades.cloned().collect();
        selected.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        selected.truncate(limit);
        selected
    }
}

#[async_trait]
impl TradeStore for InMemoryTradeStore {
    async fn insert(&self, trade: &Trade) -> Result<PersistedTrade, StoreError> {
        self.ensure_available()?;

        let mut trades = self.trades.write();
        let id = i64::try_from(trades.len()).unwrap_or(i64::MAX - 1) + 1;
        let persisted = PersistedTrade::from_trade(id, trade, Utc::now())
            .map_err(|e| StoreError::InvalidTrade(e.to_string()))?;
        trades.push(persisted.clone());

        Ok(persisted)
    }

    async fn find_in_range(
        &self,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<PersistedTrade>, StoreError> {
        self.ensure_available()?;

        let trades = self.trades.read();
        Ok(Self::newest_first(
            trades
                .iter()
                .filter(|t| range.contains(t.timestamp_millis())),
            limit,
        ))
    }

    async fn find_latest(&self, limit: usize) -> Result<Vec<PersistedTrade>, StoreError> {
        self.ensure_available()?;

        let trades = self.trades.read();
        Ok(Self::newest_first(trades.iter(), limit))
    }
}
