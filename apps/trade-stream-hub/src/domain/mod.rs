//! Domain Layer - Core trade types and cadence logic.
//!
//! This layer contains the trade model, the minute-of-hour deduplicator and
//! the bounded recent-history window. Nothing here performs I/O.

/// Trade types (live wire shape, persisted shape, query range).
pub mod trade;

/// Minute-of-hour cadence reduction.
pub mod dedup;

/// Bounded, deduplicated recent-history window.
pub mod history;
