//! Broadcast Hub
//!
//! Fans serialized trade batches out to every connected viewer.
//!
//! # Architecture
//!
//! Each subscriber owns a bounded queue drained by its own consumer task, so a
//! slow viewer never stalls delivery to the others. When a queue is full the
//! configured [`OverflowPolicy`] applies: drop the oldest queued message, or
//! disconnect the subscriber.
//!
//! # Ordering
//!
//! A new subscriber receives one snapshot message before any batch published
//! after its registration. Registration and publishing serialize on the
//! registry lock. [`BroadcastHub::publish_with`] runs a caller-supplied
//! mutation inside that same critical section, which keeps the history window
//! and the live stream consistent with each other. Within one subscriber,
//! messages arrive in publish order.
//!
//! The snapshot is pinned at the head of a new subscriber's queue until it is
//! consumed. Under [`OverflowPolicy::DropOldest`] live messages behind it are
//! evicted instead; if the snapshot alone fills the queue, the subscriber is
//! disconnected.
//!
//! Messages are serialized once per publish and shared as [`Utf8Bytes`], so
//! handing one to each viewer's socket is a refcount bump.

mod queue;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use axum::extract::ws::Utf8Bytes;
use parking_lot::Mutex;

use self::queue::{Enqueue, SubscriberQueue};
use crate::BroadcastSettings;
use crate::domain::trade::Trade;
use crate::infrastructure::metrics;

// =============================================================================
// Types
// =============================================================================

/// Opaque identifier for a connected subscriber.
pub type SubscriberId = u64;

/// A serialized JSON array of trades, shared by every recipient.
pub type BroadcastMessage = Utf8Bytes;

/// Lifecycle of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Registered, initial snapshot not yet queued.
    Connecting,
    /// Snapshot queued, receiving live batches.
    Active,
    /// Removed from the registry. Terminal.
    Closed,
}

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Discard the oldest queued message to make room.
    #[default]
    DropOldest,
    /// Unregister the lagging subscriber.
    Disconnect,
}

impl OverflowPolicy {
    /// Parse policy from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "disconnect" => Self::Disconnect,
            _ => Self::DropOldest,
        }
    }

    /// Get the policy name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DropOldest => "drop_oldest",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Errors raised by the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The hub has been shut down and accepts no new subscribers.
    #[error("broadcast hub is shut down")]
    ShutDown,

    /// A batch or snapshot could not be serialized.
    #[error("failed to encode broadcast message: {0}")]
    Encode(#[from] serde_json::Error),
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for per-subscriber delivery.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    /// Maximum queued messages per subscriber.
    pub queue_capacity: usize,
    /// Policy applied when a queue is full.
    pub overflow_policy: OverflowPolicy,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

impl From<BroadcastSettings> for BroadcastConfig {
    fn from(settings: BroadcastSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity,
            overflow_policy: settings.overflow_policy,
        }
    }
}

// =============================================================================
// Broadcast Hub
// =============================================================================

#[derive(Debug, Default)]
struct Registry {
    subscribers: BTreeMap<SubscriberId, Arc<SubscriberQueue>>,
    shut_down: bool,
}

#[derive(Debug, Default)]
struct HubCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    disconnected: AtomicU64,
}

/// Result of one publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers the batch was queued for.
    pub delivered: usize,
    /// Older messages discarded to make room.
    pub dropped: usize,
    /// Subscribers removed because their queue was closed or overflowed.
    pub disconnected: usize,
}

/// Registry of live subscribers with per-subscriber bounded queues.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use trade_stream_hub::infrastructure::broadcast::{BroadcastConfig, BroadcastHub};
/// use trade_stream_hub::domain::trade::Trade;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let hub = Arc::new(BroadcastHub::new(BroadcastConfig::default()));
/// let mut subscription = hub.register(Vec::new).unwrap();
///
/// hub.publish(&[Trade::new("AAPL", 150.0, 10.0, 0)]).unwrap();
///
/// assert_eq!(&*subscription.recv().await.unwrap(), "[]");
/// assert!(subscription.recv().await.unwrap().contains("AAPL"));
/// # }
/// ```
#[derive(Debug)]
pub struct BroadcastHub {
    config: BroadcastConfig,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    counters: HubCounters,
}

impl BroadcastHub {
    /// Create a new hub with the given configuration.
    #[must_use]
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            counters: HubCounters::default(),
        }
    }

    /// Create a new hub with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BroadcastConfig::default())
    }

    /// Register a subscriber seeded with `snapshot`.
    ///
    /// `snapshot` is evaluated under the registry lock, so no concurrent
    /// publish can fall between the snapshot and the subscriber's first live
    /// batch. It should only bump refcounts: every publish waits on it. The
    /// trades are serialized after the lock is released and placed ahead of
    /// anything published in the meantime.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::ShutDown`] after [`shutdown`](Self::shutdown), or
    /// [`HubError::Encode`] if the snapshot cannot be serialized.
    pub fn register<F>(self: &Arc<Self>, snapshot: F) -> Result<Subscription, HubError>
    where
        F: FnOnce() -> Vec<Arc<Trade>>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new());

        let (trades, subscriber_count) = {
            let mut registry = self.registry.lock();
            if registry.shut_down {
                return Err(HubError::ShutDown);
            }
            let trades = snapshot();
            registry.subscribers.insert(id, Arc::clone(&queue));
            (trades, registry.subscribers.len())
        };

        let subscription = Subscription {
            id,
            queue,
            hub: Arc::downgrade(self),
        };

        // Dropping `subscription` on the error path unregisters it.
        let payload: BroadcastMessage = serde_json::to_string(&trades)?.into();
        subscription.queue.activate(payload);

        metrics::set_subscribers(subscriber_count);
        tracing::debug!(
            subscriber_id = id,
            snapshot_len = trades.len(),
            subscribers = subscriber_count,
            "Subscriber registered"
        );

        Ok(subscription)
    }

    /// Publish a batch to every registered subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Encode`] if the batch cannot be serialized.
    pub fn publish(&self, batch: &[Trade]) -> Result<PublishReport, HubError> {
        self.publish_with(batch, || {})
    }

    /// Run `apply`, then publish `batch`, as one step with respect to
    /// registration.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Encode`] if the batch cannot be serialized. `apply`
    /// is not run in that case.
    pub fn publish_with<F>(&self, batch: &[Trade], apply: F) -> Result<PublishReport, HubError>
    where
        F: FnOnce(),
    {
        let payload: BroadcastMessage = serde_json::to_string(batch)?.into();
        let mut report = PublishReport::default();

        let mut registry = self.registry.lock();
        apply();

        let mut removed = Vec::new();
        for (&id, queue) in &registry.subscribers {
            match queue.push(
                payload.clone(),
                self.config.queue_capacity,
                self.config.overflow_policy,
            ) {
                Enqueue::Queued => report.delivered += 1,
                Enqueue::DroppedOldest => {
                    report.delivered += 1;
                    report.dropped += 1;
                }
                Enqueue::Overflow => {
                    tracing::warn!(subscriber_id = id, "Subscriber queue overflow, disconnecting");
                    queue.close(true);
                    removed.push(id);
                }
                Enqueue::Closed => removed.push(id),
            }
        }

        for id in &removed {
            registry.subscribers.remove(id);
        }
        report.disconnected = removed.len();
        let subscriber_count = registry.subscribers.len();
        drop(registry);

        self.record(report);
        if report.disconnected > 0 {
            metrics::set_subscribers(subscriber_count);
        }

        Ok(report)
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let (queue, subscriber_count) = {
            let mut registry = self.registry.lock();
            let queue = registry.subscribers.remove(&id);
            (queue, registry.subscribers.len())
        };

        let Some(queue) = queue else {
            return false;
        };

        queue.close(true);
        metrics::set_subscribers(subscriber_count);
        tracing::debug!(subscriber_id = id, subscribers = subscriber_count, "Subscriber unregistered");
        true
    }

    /// Close every subscriber and refuse new registrations.
    ///
    /// Messages already queued can still be drained; afterwards each
    /// subscription's `recv` returns `None`.
    pub fn shutdown(&self) {
        let subscribers = {
            let mut registry = self.registry.lock();
            registry.shut_down = true;
            std::mem::take(&mut registry.subscribers)
        };

        for queue in subscribers.values() {
            queue.close(false);
        }

        metrics::set_subscribers(0);
        tracing::info!(closed = subscribers.len(), "Broadcast hub shut down");
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().subscribers.len()
    }

    /// Check whether the hub has been shut down.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.registry.lock().shut_down
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            subscribers: self.subscriber_count(),
            messages_delivered: self.counters.delivered.load(Ordering::Relaxed),
            messages_dropped: self.counters.dropped.load(Ordering::Relaxed),
            subscribers_disconnected: self.counters.disconnected.load(Ordering::Relaxed),
        }
    }

    fn record(&self, report: PublishReport) {
        let delivered = report.delivered as u64;
        let dropped = report.dropped as u64;
        let disconnected = report.disconnected as u64;

        self.counters.delivered.fetch_add(delivered, Ordering::Relaxed);
        self.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
        self.counters
            .disconnected
            .fetch_add(disconnected, Ordering::Relaxed);

        metrics::record_messages_delivered(delivered);
        if dropped > 0 {
            metrics::record_messages_dropped(dropped);
        }
        if disconnected > 0 {
            metrics::record_subscribers_disconnected(disconnected);
        }
    }
}

/// Shared broadcast hub reference.
pub type SharedBroadcastHub = Arc<BroadcastHub>;

/// Statistics about the hub.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastStats {
    /// Registered subscribers.
    pub subscribers: usize,
    /// Messages queued for subscribers since startup.
    pub messages_delivered: u64,
    /// Messages discarded by the drop-oldest policy.
    pub messages_dropped: u64,
    /// Subscribers removed by the hub after a failed delivery.
    pub subscribers_disconnected: u64,
}

// =============================================================================
// Subscription
// =============================================================================

/// Handle held by a subscriber's consumer task.
///
/// Dropping the handle unregisters the subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    queue: Arc<SubscriberQueue>,
    hub: Weak<BroadcastHub>,
}

impl Subscription {
    /// Subscriber identifier.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SubscriberState {
        self.queue.state()
    }

    /// Messages waiting in this subscriber's queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the subscriber is closed and its queue is drained.
    pub async fn recv(&mut self) -> Option<BroadcastMessage> {
        self.queue.pop().await
    }

    /// Take the next message without waiting.
    pub fn try_recv(&mut self) -> Option<BroadcastMessage> {
        self.queue.try_pop()
    }

    /// Mark the subscriber's send path as gone.
    ///
    /// The hub removes it on the next publish, as it would for a peer that
    /// disconnected mid-delivery.
    pub fn close(&self) {
        self.queue.close(true);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unregister(self.id);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
