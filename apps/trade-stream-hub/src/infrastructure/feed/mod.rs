//! Upstream Feed Adapter
//!
//! WebSocket client for the upstream trade feed, implementing
//! [`FeedPort`](crate::application::ports::FeedPort).

pub mod client;
pub mod codec;
pub mod messages;
pub mod reconnect;

pub use client::{FeedClient, FeedClientConfig};
pub use codec::{CodecError, JsonCodec};
pub use messages::{FeedMessage, FeedRequest};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
