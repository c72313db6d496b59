//! Bounded per-subscriber message queue.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{BroadcastMessage, OverflowPolicy, SubscriberState};

/// Outcome of pushing a message onto a subscriber queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Enqueue {
    Queued,
    DroppedOldest,
    Overflow,
    Closed,
}

#[derive(Debug)]
struct Inner {
    messages: VecDeque<BroadcastMessage>,
    state: SubscriberState,
    /// The head of `messages` is the snapshot and has not been popped yet.
    snapshot_pending: bool,
}

impl Inner {
    /// Evict the oldest live message, never the pending snapshot.
    fn evict_oldest(&mut self) -> bool {
        let index = usize::from(self.snapshot_pending);
        self.messages.remove(index).is_some()
    }

    fn pop_front(&mut self) -> Option<BroadcastMessage> {
        let message = self.messages.pop_front();
        if message.is_some() {
            self.snapshot_pending = false;
        }
        message
    }
}

/// Single-consumer queue shared between the hub and one [`Subscription`].
///
/// [`Subscription`]: super::Subscription
#[derive(Debug)]
pub(super) struct SubscriberQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl SubscriberQueue {
    pub(super) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: VecDeque::new(),
                state: SubscriberState::Connecting,
                snapshot_pending: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Put the snapshot at the head of the queue and go active.
    ///
    /// Live messages queued while connecting stay behind it. The snapshot is
    /// pinned there until it is popped: overflow evicts live messages only.
    pub(super) fn activate(&self, snapshot: BroadcastMessage) {
        let mut inner = self.inner.lock();
        if inner.state != SubscriberState::Connecting {
            return;
        }
        inner.messages.push_front(snapshot);
        inner.snapshot_pending = true;
        inner.state = SubscriberState::Active;
        drop(inner);
        self.notify.notify_one();
    }

    pub(super) fn push(
        &self,
        message: BroadcastMessage,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Enqueue {
        let mut inner = self.inner.lock();
        if inner.state == SubscriberState::Closed {
            return Enqueue::Closed;
        }

        let outcome = if inner.messages.len() < capacity {
            Enqueue::Queued
        } else {
            match policy {
                OverflowPolicy::Disconnect => return Enqueue::Overflow,
                OverflowPolicy::DropOldest => {
                    // Zero capacity, or only the pinned snapshot is held.
                    if !inner.evict_oldest() {
                        return Enqueue::Overflow;
                    }
                    Enqueue::DroppedOldest
                }
            }
        };

        inner.messages.push_back(message);
        drop(inner);
        self.notify.notify_one();
        outcome
    }

    /// Close the queue. With `discard`, pending messages are dropped too.
    pub(super) fn close(&self, discard: bool) {
        let mut inner = self.inner.lock();
        inner.state = SubscriberState::Closed;
        if discard {
            inner.messages.clear();
            inner.snapshot_pending = false;
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub(super) fn state(&self) -> SubscriberState {
        self.inner.lock().state
    }

    pub(super) fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub(super) fn try_pop(&self) -> Option<BroadcastMessage> {
        self.inner.lock().pop_front()
    }

    pub(super) async fn pop(&self) -> Option<BroadcastMessage> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(message) = inner.pop_front() {
                    return Some(message);
                }
                if inner.state == SubscriberState::Closed {
                    return None;
                }
            }
            // notify_one stores a permit, so a push between the unlock above
            // and this await is not lost.
            self.notify.notified().await;
        }
    }
}
