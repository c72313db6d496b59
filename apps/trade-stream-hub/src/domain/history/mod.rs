//! Recent History Window
//!
//! Bounded, minute-deduplicated window of the most recent trades. New viewers
//! are seeded from a snapshot of this window before they receive live
//! batches.
//!
//! # Append semantics
//!
//! Each batch is deduplicated, then merged onto the tail of the window as if
//! the deduplicator had run over `tail ++ batch`: a first trade sharing the
//! tail's minute-of-hour replaces the tail. Trades older than the tail are not
//! added (they are still persisted and broadcast by the pipeline). The window
//! is then truncated oldest-first to `max_history`.
//!
//! Entries are reference counted, so [`HistoryWindow::shared_snapshot`] costs
//! one refcount bump per trade rather than a deep copy.

use std::collections::VecDeque;
use std::sync::Arc;

use super::dedup::dedupe_by_minute;
use super::trade::Trade;

/// Default number of trades kept in the window.
pub const DEFAULT_MAX_HISTORY: usize = 150_000;

/// Outcome of a single [`HistoryWindow::append`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Trades added as new window entries.
    pub appended: usize,
    /// Trades that replaced the previous entry of the same minute.
    pub replaced: usize,
    /// Trades older than the window tail and left out.
    pub skipped_late: usize,
    /// Oldest entries evicted to honor the capacity.
    pub evicted: usize,
}

/// Bounded window of recent trades, ascending by timestamp.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    trades: VecDeque<Arc<Trade>>,
    max_history: usize,
}

impl Default for HistoryWindow {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl HistoryWindow {
    /// Create an empty window holding at most `max_history` trades.
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        Self {
            trades: VecDeque::with_capacity(max_history.min(4_096)),
            max_history,
        }
    }

    /// Append a batch of trades.
    pub fn append(&mut self, batch: &[Trade]) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();

        for trade in dedupe_by_minute(batch) {
            match self.trades.back_mut() {
                Some(last) if trade.timestamp < last.timestamp => {
                    outcome.skipped_late += 1;
                }
                Some(last) if last.minute_of_hour() == trade.minute_of_hour() => {
                    *last = Arc::new(trade);
                    outcome.replaced += 1;
                }
                _ => {
                    self.trades.push_back(Arc::new(trade));
                    outcome.appended += 1;
                }
            }
        }

        while self.trades.len() > self.max_history {
            self.trades.pop_front();
            outcome.evicted += 1;
        }

        outcome
    }

    /// Owned copy of the current contents, ascending by timestamp.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Trade> {
        self.trades.iter().map(|trade| Trade::clone(trade)).collect()
    }

    /// Shared view of the current contents, ascending by timestamp.
    ///
    /// Later appends do not affect the returned entries.
    #[must_use]
    pub fn shared_snapshot(&self) -> Vec<Arc<Trade>> {
        self.trades.iter().cloned().collect()
    }

    /// Number of trades currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trades.len()
    }

    /// Check whether the window is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub const fn max_history(&self) -> usize {
        self.max_history
    }

    /// Most recent trade, if any.
    #[must_use]
    pub fn last(&self) -> Option<&Trade> {
        self.trades.back().map(|trade| &**trade)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const MINUTE: i64 = 60_000;
    /// 2024-01-15T10:00:00Z
    const TEN_AM: i64 = 1_705_312_800_000;

    fn trade(timestamp: i64, price: f64) -> Trade {
        Trade::new("BINANCE:BTCUSDT", price, 1.0, timestamp)
    }

    #[test]
    fn same_minute_within_batch_keeps_latest() {
        let mut window = HistoryWindow::new(10);

        window.append(&[
            trade(TEN_AM + 1_000, 100.0),
            trade(TEN_AM + 30_000, 101.0),
            trade(TEN_AM + MINUTE + 5_000, 102.0),
        ]);

        let snapshot = window.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].timestamp, TEN_AM + 30_000);
        assert_eq!(snapshot[1].timestamp, TEN_AM + MINUTE + 5_000);
    }

    #[test]
    fn same_minute_across_batches_replaces_tail() {
        let mut window = HistoryWindow::new(10);

        window.append(&[trade(TEN_AM + 1_000, 100.0)]);
        let outcome = window.append(&[trade(TEN_AM + 30_000, 101.0)]);
        window.append(&[trade(TEN_AM + MINUTE + 5_000, 102.0)]);

        assert_eq!(outcome.replaced, 1);
        let snapshot = window.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!((snapshot[0].price - 101.0).abs() < f64::EPSILON);
        assert!((snapshot[1].price - 102.0).abs() < f64::EPSILON);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut window = HistoryWindow::new(2);
        let a = trade(TEN_AM, 1.0);
        let b = trade(TEN_AM + MINUTE, 2.0);
        let c = trade(TEN_AM + 2 * MINUTE, 3.0);

        window.append(&[a]);
        window.append(&[b.clone()]);
        let outcome = window.append(&[c.clone()]);

        assert_eq!(outcome.evicted, 1);
        assert_eq!(window.snapshot(), vec![b, c]);
    }

    #[test]
    fn late_trades_are_left_out() {
        let mut window = HistoryWindow::new(10);
        window.append(&[trade(TEN_AM + 5 * MINUTE, 1.0)]);

        let outcome = window.append(&[trade(TEN_AM, 2.0)]);

        assert_eq!(outcome.skipped_late, 1);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_appends() {
        let mut window = HistoryWindow::new(10);
        window.append(&[trade(TEN_AM, 1.0)]);

        let snapshot = window.snapshot();
        window.append(&[trade(TEN_AM + MINUTE, 2.0)]);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn shared_snapshots_reuse_entries() {
        let mut window = HistoryWindow::new(10);
        window.append(&[trade(TEN_AM, 1.0), trade(TEN_AM + MINUTE, 2.0)]);

        let first = window.shared_snapshot();
        let second = window.shared_snapshot();

        assert!(first.iter().zip(&second).all(|(a, b)| Arc::ptr_eq(a, b)));
    }

    #[test]
    fn shared_snapshot_survives_tail_replacement() {
        let mut window = HistoryWindow::new(10);
        window.append(&[trade(TEN_AM + 1_000, 1.0)]);

        let shared = window.shared_snapshot();
        window.append(&[trade(TEN_AM + 2_000, 2.0)]);

        assert_eq!(shared.len(), 1);
        assert!((shared[0].price - 1.0).abs() < f64::EPSILON);
        assert!((window.snapshot()[0].price - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_capacity_stays_empty() {
        let mut window = HistoryWindow::new(0);
        window.append(&[trade(TEN_AM, 1.0)]);
        assert!(window.is_empty());
    }

    proptest! {
        #[test]
        fn window_is_bounded_and_ascending(
            batches in proptest::collection::vec(
                proptest::collection::vec(0i64..(6 * 60 * MINUTE), 0..20),
                0..30,
            ),
            max_history in 1usize..40,
        ) {
            let mut window = HistoryWindow::new(max_history);

            for batch in batches {
                let trades: Vec<Trade> = batch.iter().map(|&t| trade(t, 1.0)).collect();
                window.append(&trades);

                let snapshot = window.snapshot();
                prop_assert!(snapshot.len() <= max_history);
                prop_assert!(snapshot.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
            }
        }
    }
}
