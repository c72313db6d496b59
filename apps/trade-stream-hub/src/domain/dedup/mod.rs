//! Minute Deduplicator
//!
//! Reduces a trade sequence to chart cadence: scanning in time order, a trade
//! whose minute-of-hour matches the last retained trade replaces it, so the
//! latest trade in each displayed minute wins.
//!
//! Only the minute-of-hour (0-59) is compared, not the full calendar minute.
//! Two trades exactly one hour apart with no trade in between therefore
//! collapse into one. This is the established display behavior and is kept
//! as-is.

use super::trade::Trade;

/// Collapse same-minute trades, keeping the latest trade of each run.
///
/// The input does not need to be sorted. Output is ascending by timestamp and
/// never longer than the input. Trades with equal timestamps keep their input
/// order before collapsing, so the later one in the input wins.
#[must_use]
pub fn dedupe_by_minute(trades: &[Trade]) -> Vec<Trade> {
    let mut ordered: Vec<&Trade> = trades.iter().collect();
    ordered.sort_by_key(|trade| trade.timestamp);

    let mut retained: Vec<Trade> = Vec::with_capacity(ordered.len());
    for trade in ordered {
        match retained.last_mut() {
            Some(last) if last.minute_of_hour() == trade.minute_of_hour() => {
                *last = trade.clone();
            }
            _ => retained.push(trade.clone()),
        }
    }

    retained
}
