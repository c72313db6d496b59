//! Feed Wire Messages
//!
//! JSON messages exchanged with the upstream trade feed. Every message is a
//! single object discriminated by its `type` field.
//!
//! # Inbound
//!
//! - `trade`: `{"type":"trade","data":[{c,p,s,t,v}, ...]}`
//! - `ping`: keep-alive, no payload
//! - `error`: `{"type":"error","msg":"..."}`
//!
//! # Outbound
//!
//! - `subscribe` / `unsubscribe`: `{"type":"subscribe","symbol":"BINANCE:BTCUSDT"}`

use serde::{Deserialize, Serialize};

use crate::domain::trade::Trade;

/// Message received from the feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedMessage {
    /// A batch of trades.
    Trade {
        /// Trades in the order the feed sent them.
        #[serde(default)]
        data: Vec<Trade>,
    },
    /// Keep-alive.
    Ping,
    /// Error reported by the feed.
    Error {
        /// Error text.
        #[serde(default)]
        msg: String,
    },
    /// Any other message type.
    #[serde(other)]
    Unknown,
}

/// Directive sent to the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedRequest {
    /// Start streaming trades for `symbol`.
    Subscribe {
        /// Subscription key.
        symbol: String,
    },
    /// Stop streaming trades for `symbol`.
    Unsubscribe {
        /// Subscription key.
        symbol: String,
    },
}

impl FeedRequest {
    /// Create a subscribe directive.
    #[must_use]
    pub fn subscribe(symbol: impl Into<String>) -> Self {
        Self::Subscribe {
            symbol: symbol.into(),
        }
    }

    /// Create an unsubscribe directive.
    #[must_use]
    pub fn unsubscribe(symbol: impl Into<String>) -> Self {
        Self::Unsubscribe {
            symbol: symbol.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_serializes_with_type_tag() {
        let json = serde_json::to_string(&FeedRequest::subscribe("BINANCE:BTCUSDT")).unwrap();
        assert_eq!(json, r#"{"type":"subscribe","symbol":"BINANCE:BTCUSDT"}"#);
    }

    #[test]
    fn unsubscribe_serializes_with_type_tag() {
        let json = serde_json::to_string(&FeedRequest::unsubscribe("AAPL")).unwrap();
        assert_eq!(json, r#"{"type":"unsubscribe","symbol":"AAPL"}"#);
    }

    #[test]
    fn trade_message_deserializes() {
        let json = r#"{"type":"trade","data":[
            {"c":["1"],"p":43000.5,"s":"BINANCE:BTCUSDT","t":1700000000000,"v":0.01},
            {"c":null,"p":43001.0,"s":"BINANCE:BTCUSDT","t":1700000000500,"v":0.02}
        ]}"#;

        let FeedMessage::Trade { data } = serde_json::from_str(json).unwrap() else {
            panic!("expected trade message");
        };

        assert_eq!(data.len(), 2);
        assert_eq!(data[0].conditions, vec!["1".to_string()]);
        assert!(data[1].conditions.is_empty());
        assert_eq!(data[1].timestamp, 1_700_000_000_500);
    }

    #[test]
    fn ping_and_unknown_types() {
        assert_eq!(
            serde_json::from_str::<FeedMessage>(r#"{"type":"ping"}"#).unwrap(),
            FeedMessage::Ping
        );
        assert_eq!(
            serde_json::from_str::<FeedMessage>(r#"{"type":"news","data":[]}"#).unwrap(),
            FeedMessage::Unknown
        );
    }

    #[test]
    fn error_message_deserializes() {
        let msg: FeedMessage =
            serde_json::from_str(r#"{"type":"error","msg":"Subscribing to too many symbols"}"#)
                .unwrap();
        assert_eq!(
            msg,
            FeedMessage::Error {
                msg: "Subscribing to too many symbols".to_string()
            }
        );
    }
}
