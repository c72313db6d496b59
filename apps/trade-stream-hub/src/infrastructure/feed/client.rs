//! Feed WebSocket Client
//!
//! Connects to the upstream trade feed, subscribes to one symbol, and pumps
//! decoded events into a [`FeedSession`].
//!
//! # Stream URL
//!
//! `<url>?token=<api key>`, e.g. `wss://ws.finnhub.io?token=...`
//!
//! # Protocol
//!
//! After connecting, the client sends one subscribe directive. The feed then
//! pushes JSON objects; only `trade` messages carry data. The client never
//! reconnects on its own; the ingestion pipeline opens a new session instead.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::JsonCodec;
use super::messages::{FeedMessage, FeedRequest};
use crate::application::ports::{FeedError, FeedPort, FeedSession, SessionEvent};
use crate::{Credentials, HubConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the feed client.
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    /// WebSocket endpoint, without the token query.
    pub url: String,
    /// API token.
    pub credentials: Credentials,
    /// Symbol to subscribe to.
    pub symbol: String,
    /// Capacity of the session event channel.
    pub channel_capacity: usize,
}

impl FeedClientConfig {
    /// Create a new configuration with the default channel capacity.
    #[must_use]
    pub fn new(url: impl Into<String>, credentials: Credentials, symbol: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials,
            symbol: symbol.into(),
            channel_capacity: 1_024,
        }
    }

    /// Build from the hub configuration.
    #[must_use]
    pub fn from_hub_config(config: &HubConfig) -> Self {
        Self {
            url: config.feed.url.clone(),
            credentials: config.credentials.clone(),
            symbol: config.feed.symbol.clone(),
            channel_capacity: config.feed.channel_capacity,
        }
    }

    /// URL including the token query parameter. Do not log this.
    #[must_use]
    pub fn connect_url(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{separator}token={}",
            self.url,
            self.credentials.api_key()
        )
    }
}

// =============================================================================
// Feed Client
// =============================================================================

/// WebSocket client for the upstream trade feed.
#[derive(Debug)]
pub struct FeedClient {
    config: FeedClientConfig,
    codec: JsonCodec,
}

impl FeedClient {
    /// Create a new feed client.
    #[must_use]
    pub const fn new(config: FeedClientConfig) -> Self {
        Self {
            config,
            codec: JsonCodec::new(),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &FeedClientConfig {
        &self.config
    }
}

#[async_trait]
impl FeedPort for FeedClient {
    async fn open(&self) -> Result<FeedSession, FeedError> {
        tracing::info!(url = %self.config.url, symbol = %self.config.symbol, "Connecting to trade feed");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.config.connect_url())
            .await
            .map_err(|e| FeedError::ConnectionFailed(e.to_string()))?;

        let (mut write, read) = ws_stream.split();

        let subscribe = self
            .codec
            .encode(&FeedRequest::subscribe(&self.config.symbol))
            .map_err(|e| FeedError::SubscribeFailed(e.to_string()))?;
        write
            .send(Message::Text(subscribe.into()))
            .await
            .map_err(|e| FeedError::SubscribeFailed(e.to_string()))?;

        tracing::info!(symbol = %self.config.symbol, "Subscribed to trade feed");

        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let cancel = CancellationToken::new();

        let reader = SessionReader {
            codec: self.codec,
            symbol: self.config.symbol.clone(),
            event_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(reader.run(write, read));

        Ok(FeedSession::new(event_rx, cancel))
    }
}

// =============================================================================
// Session Reader
// =============================================================================

struct SessionReader {
    codec: JsonCodec,
    symbol: String,
    event_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl SessionReader {
    async fn run(self, mut write: WsWrite, mut read: WsRead) {
        let reason = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.unsubscribe(&mut write).await;
                    return;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = interpret(&self.codec, &text) {
                                if !self.emit(event).await {
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let event = SessionEvent::DecodeFailed("unexpected binary frame".to_string());
                            if !self.emit(event).await {
                                return;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                break format!("failed to answer ping: {e}");
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map_or_else(
                                || "server closed connection".to_string(),
                                |f| format!("server closed connection ({})", u16::from(f.code)),
                            );
                        }
                        Some(Ok(_)) => {
                            // Pong and raw frames
                        }
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_string(),
                    }
                }
            }
        };

        tracing::warn!(%reason, "Trade feed connection lost");
        let _ = self.emit(SessionEvent::Closed { reason }).await;
    }

    /// Forward an event. Returns `false` once nobody is listening.
    async fn emit(&self, event: SessionEvent) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            sent = self.event_tx.send(event) => sent.is_ok(),
        }
    }

    async fn unsubscribe(&self, write: &mut WsWrite) {
        if let Ok(json) = self.codec.encode(&FeedRequest::unsubscribe(&self.symbol)) {
            let _ = write.send(Message::Text(json.into())).await;
        }
        let _ = write.close().await;
        tracing::debug!(symbol = %self.symbol, "Feed session cancelled");
    }
}

/// Map one text frame to the event it produces, if any.
fn interpret(codec: &JsonCodec, text: &str) -> Option<SessionEvent> {
    match codec.decode(text) {
        Ok(FeedMessage::Trade { data }) => Some(SessionEvent::Batch(data)),
        Ok(FeedMessage::Ping) => None,
        Ok(FeedMessage::Error { msg }) => {
            tracing::error!(msg = %msg, "Trade feed reported an error");
            None
        }
        Ok(FeedMessage::Unknown) => {
            tracing::debug!("Ignoring unknown feed message type");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to decode feed message");
            Some(SessionEvent::DecodeFailed(e.to_string()))
        }
    }
}
