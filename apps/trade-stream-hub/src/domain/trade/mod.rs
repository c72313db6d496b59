//! Trade Types
//!
//! Canonical representations of a market execution as it moves through the
//! service.
//!
//! - [`Trade`]: the live wire shape, shared by the upstream feed and the
//!   downstream WebSocket viewers (`{c, p, s, t, v}`).
//! - [`PersistedTrade`]: a trade after the store has assigned an id and audit
//!   timestamps. Price and volume are fixed-point decimals.
//! - [`TimeRange`]: inclusive millisecond range for historical queries.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

// =============================================================================
// Live Trade
// =============================================================================

/// A single market execution.
///
/// # Wire Format (JSON)
/// ```json
/// {"c": ["1"], "p": 100.5, "s": "BINANCE:BTCUSDT", "t": 1700000000000, "v": 0.25}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// Trade conditions, in feed order.
    #[serde(rename = "c", default, deserialize_with = "null_as_empty")]
    pub conditions: Vec<String>,

    /// Execution price.
    #[serde(rename = "p")]
    pub price: f64,

    /// Instrument symbol.
    #[serde(rename = "s")]
    pub symbol: String,

    /// Execution time in milliseconds since the Unix epoch.
    #[serde(rename = "t")]
    pub timestamp: i64,

    /// Executed volume.
    #[serde(rename = "v")]
    pub volume: f64,
}

impl Trade {
    /// Create a trade with no conditions.
    #[must_use]
    pub fn new(symbol: impl Into<String>, price: f64, volume: f64, timestamp: i64) -> Self {
        Self {
            conditions: Vec::new(),
            price,
            symbol: symbol.into(),
            timestamp,
            volume,
        }
    }

    /// Attach trade conditions.
    #[must_use]
    pub fn with_conditions(mut self, conditions: Vec<String>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Minute-of-hour (0-59, UTC) of the execution time.
    #[must_use]
    pub const fn minute_of_hour(&self) -> i64 {
        self.timestamp.div_euclid(60_000).rem_euclid(60)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

// =============================================================================
// Persisted Trade
// =============================================================================

/// A trade as stored by the trade store.
///
/// Created once per inbound [`Trade`]; only the audit timestamps are managed
/// by the store afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTrade {
    /// Store-assigned identifier.
    pub id: i64,
    /// Trade conditions.
    pub conditions: Vec<String>,
    /// Execution price (fixed-point).
    pub price: Decimal,
    /// Instrument symbol.
    pub symbol: String,
    /// Execution time.
    pub timestamp: DateTime<Utc>,
    /// Executed volume (fixed-point).
    pub volume: Decimal,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Row update time.
    pub updated_at: DateTime<Utc>,
}

impl PersistedTrade {
    /// Build the stored form of `trade`.
    ///
    /// # Errors
    ///
    /// Returns [`TradeError`] if price or volume is not finite, or the
    /// timestamp is outside the representable date range.
    pub fn from_trade(
        id: i64,
        trade: &Trade,
        recorded_at: DateTime<Utc>,
    ) -> Result<Self, TradeError> {
        let price = Decimal::try_from(trade.price).map_err(|_| TradeError::NonFinite {
            field: "price",
            value: trade.price,
        })?;
        let volume = Decimal::try_from(trade.volume).map_err(|_| TradeError::NonFinite {
            field: "volume",
            value: trade.volume,
        })?;
        let timestamp = DateTime::from_timestamp_millis(trade.timestamp)
            .ok_or(TradeError::TimestampOutOfRange(trade.timestamp))?;

        Ok(Self {
            id,
            conditions: trade.conditions.clone(),
            price,
            symbol: trade.symbol.clone(),
            timestamp,
            volume,
            created_at: recorded_at,
            updated_at: recorded_at,
        })
    }

    /// Execution time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Convert back to the live wire shape.
    ///
    /// Decimals that do not fit an `f64` fall back to zero.
    #[must_use]
    pub fn to_trade(&self) -> Trade {
        use rust_decimal::prelude::ToPrimitive;

        Trade {
            conditions: self.conditions.clone(),
            price: self.price.to_f64().unwrap_or_default(),
            symbol: self.symbol.clone(),
            timestamp: self.timestamp_millis(),
            volume: self.volume.to_f64().unwrap_or_default(),
        }
    }
}

/// A trade that cannot be given a stored form.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TradeError {
    /// Price or volume is NaN, infinite, or too large for a decimal.
    #[error("{field} is not representable as a decimal: {value}")]
    NonFinite {
        /// Offending field.
        field: &'static str,
        /// Offending value.
        value: f64,
    },

    /// Timestamp is outside the supported date range.
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(i64),
}

// =============================================================================
// Time Range
// =============================================================================

/// Inclusive range of execution times, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Lower bound (inclusive).
    pub from: i64,
    /// Upper bound (inclusive).
    pub to: i64,
}

impl TimeRange {
    /// Create a new range.
    #[must_use]
    pub const fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }

    /// Check whether a millisecond timestamp falls inside the range.
    #[must_use]
    pub const fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.from && timestamp <= self.to
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_decodes_wire_shape() {
        let json = r#"{"c":["1","12"],"p":7296.89,"s":"BINANCE:BTCUSDT","t":1575526691134,"v":0.011467}"#;
        let trade: Trade = serde_json::from_str(json).unwrap();

        assert_eq!(trade.symbol, "BINANCE:BTCUSDT");
        assert_eq!(trade.conditions, vec!["1", "12"]);
        assert_eq!(trade.timestamp, 1_575_526_691_134);
        assert!((trade.price - 7296.89).abs() < f64::EPSILON);
    }

    #[test]
    fn trade_null_or_missing_conditions_are_empty() {
        let null: Trade = serde_json::from_str(r#"{"c":null,"p":1,"s":"X","t":0,"v":1}"#).unwrap();
        let missing: Trade = serde_json::from_str(r#"{"p":1,"s":"X","t":0,"v":1}"#).unwrap();

        assert!(null.conditions.is_empty());
        assert!(missing.conditions.is_empty());
    }

    #[test]
    fn trade_encodes_short_keys() {
        let trade = Trade::new("AAPL", 150.0, 10.0, 1_000);
        let json = serde_json::to_value(&trade).unwrap();

        assert_eq!(json["s"], "AAPL");
        assert_eq!(json["t"], 1_000);
        assert!(json["c"].as_array().unwrap().is_empty());
    }

    #[test]
    fn minute_of_hour_wraps_each_hour() {
        assert_eq!(Trade::new("X", 1.0, 1.0, 0).minute_of_hour(), 0);
        assert_eq!(Trade::new("X", 1.0, 1.0, 61_000).minute_of_hour(), 1);
        assert_eq!(Trade::new("X", 1.0, 1.0, 3_600_000 + 61_000).minute_of_hour(), 1);
        assert_eq!(Trade::new("X", 1.0, 1.0, -1).minute_of_hour(), 59);
    }

    #[test]
    fn persisted_trade_serializes_camel_case() {
        let now = Utc::now();
        let persisted = PersistedTrade {
            id: 7,
            conditions: vec![],
            price: Decimal::new(10050, 2),
            symbol: "AAPL".to_string(),
            timestamp: now,
            volume: Decimal::ONE,
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_value(&persisted).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["price"], "100.50");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("updatedAt").is_some());
    }

    #[test]
    fn persisted_trade_round_trips_to_live_shape() {
        let timestamp = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let persisted = PersistedTrade {
            id: 1,
            conditions: vec!["1".to_string()],
            price: Decimal::new(10125, 2),
            symbol: "AAPL".to_string(),
            timestamp,
            volume: Decimal::new(5, 1),
            created_at: timestamp,
            updated_at: timestamp,
        };

        let trade = persisted.to_trade();
        assert_eq!(trade.timestamp, 1_700_000_000_123);
        assert!((trade.price - 101.25).abs() < f64::EPSILON);
        assert!((trade.volume - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn from_trade_converts_to_decimals() {
        let recorded_at = Utc::now();
        let trade = Trade::new("AAPL", 101.25, 0.5, 1_700_000_000_123)
            .with_conditions(vec!["12".to_string()]);

        let persisted = PersistedTrade::from_trade(3, &trade, recorded_at).unwrap();

        assert_eq!(persisted.id, 3);
        assert_eq!(persisted.price, Decimal::new(10125, 2));
        assert_eq!(persisted.volume, Decimal::new(5, 1));
        assert_eq!(persisted.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(persisted.created_at, recorded_at);
        assert_eq!(persisted.to_trade(), trade);
    }

    #[test]
    fn from_trade_rejects_non_finite_values() {
        let result = PersistedTrade::from_trade(1, &Trade::new("X", f64::NAN, 1.0, 0), Utc::now());
        assert!(matches!(
            result,
            Err(TradeError::NonFinite { field: "price", .. })
        ));

        let result =
            PersistedTrade::from_trade(1, &Trade::new("X", 1.0, f64::INFINITY, 0), Utc::now());
        assert!(matches!(
            result,
            Err(TradeError::NonFinite { field: "volume", .. })
        ));
    }

    #[test]
    fn time_range_is_inclusive() {
        let range = TimeRange::new(10, 20);
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(9));
        assert!(!range.contains(21));
    }
}
