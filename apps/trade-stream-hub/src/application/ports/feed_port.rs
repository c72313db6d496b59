//! Feed Port (Driven Port)
//!
//! A [`FeedPort`] opens one session against the upstream trade feed. A session
//! is a push-driven, non-restartable sequence of [`SessionEvent`]s fed by a
//! reader task through a bounded channel. Reconnection is the caller's job:
//! once a session reports [`SessionEvent::Closed`] (or its channel ends) it is
//! finished, and a new one must be opened.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::domain::trade::Trade;

/// Errors raised while opening a feed session.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Could not establish the connection.
    #[error("feed connection failed: {0}")]
    ConnectionFailed(String),

    /// Connected, but the subscribe directive could not be sent.
    #[error("feed subscribe failed: {0}")]
    SubscribeFailed(String),
}

/// Events produced by an open feed session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A batch of trades delivered together by the feed.
    Batch(Vec<Trade>),
    /// One inbound message could not be decoded. The session stays open.
    DecodeFailed(String),
    /// The connection ended. No further events follow.
    Closed {
        /// Why the connection ended.
        reason: String,
    },
}

impl SessionEvent {
    /// Check whether this event ends the session.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

/// An open feed session.
///
/// Dropping the session cancels its reader task.
#[derive(Debug)]
pub struct FeedSession {
    events: mpsc::Receiver<SessionEvent>,
    finished: bool,
    _guard: DropGuard,
}

impl FeedSession {
    /// Wrap a receiver fed by a reader task observing `cancel`.
    #[must_use]
    pub fn new(events: mpsc::Receiver<SessionEvent>, cancel: CancellationToken) -> Self {
        Self {
            events,
            finished: false,
            _guard: cancel.drop_guard(),
        }
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the session has finished. A reader that disappears
    /// without reporting is surfaced as a final [`SessionEvent::Closed`].
    pub async fn next(&mut self) -> Option<SessionEvent> {
        if self.finished {
            return None;
        }

        match self.events.recv().await {
            Some(event) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Some(event)
            }
            None => {
                self.finished = true;
                Some(SessionEvent::Closed {
                    reason: "feed reader stopped".to_string(),
                })
            }
        }
    }
}

/// Opens sessions against the upstream trade feed.
#[async_trait]
pub trait FeedPort: Send + Sync {
    /// Connect, send the subscribe directive, and start reading.
    async fn open(&self) -> Result<FeedSession, FeedError>;
}
