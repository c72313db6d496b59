//! Ingestion Pipeline
//!
//! Pulls trade batches from the upstream feed and, for each batch:
//!
//! 1. queues each trade for the store writer (fire-and-forget),
//! 2. records the batch in the history window,
//! 3. publishes the raw batch to every subscriber.
//!
//! Steps 2 and 3 happen inside one hub critical section, so a subscriber
//! registering concurrently either sees the batch in its snapshot or receives
//! it live, never both and never neither.
//!
//! # Persistence
//!
//! A single writer task drains a bounded channel into the trade store in
//! arrival order. When the channel is full the trade is dropped and counted;
//! ingestion never waits on the store.
//!
//! # States
//!
//! ```text
//! Idle ──► Running ◄──► Degraded ──► Stopped
//! ```
//!
//! The feed is reopened with exponential backoff while `Degraded`. History
//! survives reconnects.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::HubConfig;
use crate::application::ports::{FeedPort, FeedSession, SessionEvent, StoreError, TradeStore};
use crate::domain::history::{AppendOutcome, DEFAULT_MAX_HISTORY, HistoryWindow};
use crate::domain::trade::{PersistedTrade, Trade};
use crate::infrastructure::broadcast::{
    HubError, PublishReport, SharedBroadcastHub, Subscription,
};
use crate::infrastructure::feed::{ReconnectConfig, ReconnectPolicy};
use crate::infrastructure::metrics::{self, Outcome};

// =============================================================================
// Types
// =============================================================================

/// Lifecycle state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    /// Constructed, feed not yet opened.
    Idle = 0,
    /// Feed session open and streaming.
    Running = 1,
    /// Feed lost, reconnecting.
    Degraded = 2,
    /// Shut down. Terminal.
    Stopped = 3,
}

impl PipelineState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopped => "stopped",
        }
    }

    /// Numeric code, as exported in metrics.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Degraded,
            3 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that end a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The feed could not be reopened within the configured attempts.
    #[error("trade feed unavailable after {attempts} reconnect attempts")]
    ReconnectExhausted {
        /// Attempts made since the last successful open.
        attempts: u32,
    },

    /// The broadcast hub rejected an operation.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// The trade store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the history window.
    pub max_history: usize,
    /// How long shutdown waits for in-flight persistence.
    pub shutdown_grace: Duration,
    /// Trades that may wait for the store writer before new ones are dropped.
    pub persist_queue_capacity: usize,
    /// Backoff between feed reconnects.
    pub reconnect: ReconnectConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            shutdown_grace: Duration::from_secs(10),
            persist_queue_capacity: 8_192,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Build from the hub configuration.
    #[must_use]
    pub fn from_hub_config(config: &HubConfig) -> Self {
        Self {
            max_history: config.pipeline.max_history,
            shutdown_grace: config.pipeline.shutdown_grace,
            persist_queue_capacity: config.pipeline.persist_queue_capacity,
            reconnect: ReconnectConfig::from_feed_settings(&config.feed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Cancelled,
}

/// Both halves of the store writer channel.
///
/// The receiver is handed to the writer task on first use; the sender is
/// dropped on shutdown so the writer drains what is queued and exits.
struct PersistQueue {
    tx: Option<mpsc::Sender<Trade>>,
    rx: Option<mpsc::Receiver<Trade>>,
}

// =============================================================================
// Ingestion Pipeline
// =============================================================================

/// Owns the history window and feeds the broadcast hub.
pub struct IngestionPipeline {
    store: Arc<dyn TradeStore>,
    hub: SharedBroadcastHub,
    history: RwLock<HistoryWindow>,
    state: AtomicU8,
    persist: Mutex<PersistQueue>,
    persist_pending: Arc<AtomicUsize>,
    persist_dropped: AtomicU64,
    tracker: TaskTracker,
    config: PipelineConfig,
}

impl fmt::Debug for IngestionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionPipeline")
            .field("state", &self.state())
            .field("history_len", &self.history_len())
            .field("pending_persistence", &self.pending_persistence())
            .field("persistence_dropped", &self.persistence_dropped())
            .field("hub", &self.hub)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IngestionPipeline {
    /// Create a new pipeline in the `Idle` state.
    #[must_use]
    pub fn new(store: Arc<dyn TradeStore>, hub: SharedBroadcastHub, config: PipelineConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.persist_queue_capacity.max(1));
        Self {
            store,
            hub,
            history: RwLock::new(HistoryWindow::new(config.max_history)),
            state: AtomicU8::new(PipelineState::Idle.as_u8()),
            persist: Mutex::new(PersistQueue {
                tx: Some(tx),
                rx: Some(rx),
            }),
            persist_pending: Arc::new(AtomicUsize::new(0)),
            persist_dropped: AtomicU64::new(0),
            tracker: TaskTracker::new(),
            config,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: PipelineState) {
        let previous = PipelineState::from_u8(self.state.swap(state.as_u8(), Ordering::AcqRel));
        metrics::set_pipeline_state(state.as_u8());
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Pipeline state changed");
        }
    }

    /// The broadcast hub this pipeline publishes to.
    #[must_use]
    pub const fn hub(&self) -> &SharedBroadcastHub {
        &self.hub
    }

    /// Number of trades in the history window.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    /// Owned copy of the history window.
    #[must_use]
    pub fn history_snapshot(&self) -> Vec<Trade> {
        self.history.read().snapshot()
    }

    /// Trades queued for or being written by the store writer.
    #[must_use]
    pub fn pending_persistence(&self) -> usize {
        self.persist_pending.load(Ordering::Acquire)
    }

    /// Trades dropped because the store writer queue was full.
    #[must_use]
    pub fn persistence_dropped(&self) -> u64 {
        self.persist_dropped.load(Ordering::Relaxed)
    }

    /// Register a subscriber seeded with the current history window.
    ///
    /// # Errors
    ///
    /// Returns [`HubError`] if the hub is shut down or the snapshot cannot be
    /// encoded.
    pub fn subscribe(&self) -> Result<Subscription, HubError> {
        self.hub.register(|| self.history.read().shared_snapshot())
    }

    /// Seed the history window from the store's most recent trades.
    ///
    /// Returns the window length afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store query fails.
    pub async fn warm_start(&self) -> Result<usize, StoreError> {
        let latest = self.store.find_latest(self.config.max_history).await?;
        let trades: Vec<Trade> = latest.iter().rev().map(PersistedTrade::to_trade).collect();

        let mut history = self.history.write();
        let outcome = history.append(&trades);
        let len = history.len();
        drop(history);

        tracing::info!(
            loaded = trades.len(),
            retained = len,
            replaced = outcome.replaced,
            "History window seeded from trade store"
        );
        Ok(len)
    }

    /// Process one inbound batch.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Encode`] if the batch cannot be serialized. The
    /// trades are still queued for persistence in that case.
    pub fn ingest(&self, batch: &[Trade]) -> Result<PublishReport, HubError> {
        if batch.is_empty() {
            return Ok(PublishReport::default());
        }

        let started = Instant::now();
        metrics::record_batch_received(batch.len());

        self.persist(batch);

        let mut outcome = AppendOutcome::default();
        let report = self
            .hub
            .publish_with(batch, || outcome = self.history.write().append(batch))?;

        metrics::record_batch_duration(started.elapsed());
        tracing::debug!(
            trades = batch.len(),
            appended = outcome.appended,
            replaced = outcome.replaced,
            skipped_late = outcome.skipped_late,
            delivered = report.delivered,
            "Batch ingested"
        );

        Ok(report)
    }

    /// Queue `batch` for the store writer without waiting.
    fn persist(&self, batch: &[Trade]) {
        let mut queue = self.persist.lock();
        let Some(tx) = queue.tx.clone() else {
            drop(queue);
            self.record_persist_dropped(batch.len(), "stopped");
            return;
        };
        if let Some(rx) = queue.rx.take() {
            self.tracker.spawn(write_trades(
                Arc::clone(&self.store),
                rx,
                Arc::clone(&self.persist_pending),
            ));
        }
        drop(queue);

        let mut dropped = 0;
        let mut writer_gone = false;
        for trade in batch {
            self.persist_pending.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = tx.try_send(trade.clone()) {
                self.persist_pending.fetch_sub(1, Ordering::AcqRel);
                dropped += 1;
                writer_gone |= matches!(e, TrySendError::Closed(_));
            }
        }

        if dropped > 0 {
            let reason = if writer_gone { "writer gone" } else { "queue full" };
            self.record_persist_dropped(dropped, reason);
        }
    }

    fn record_persist_dropped(&self, count: usize, reason: &'static str) {
        let count = count as u64;
        let total = self.persist_dropped.fetch_add(count, Ordering::Relaxed) + count;
        metrics::record_persist_dropped(count);
        tracing::warn!(dropped = count, total, reason, "Trades dropped before persistence");
    }

    /// Stream from `feed` until cancelled, reconnecting as needed, then shut
    /// down.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ReconnectExhausted`] if the feed cannot be
    /// reopened within the configured attempts. The pipeline is shut down
    /// either way.
    pub async fn run(
        &self,
        feed: &dyn FeedPort,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            let opened = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                opened = feed.open() => opened,
            };

            match opened {
                Ok(mut session) => {
                    policy.reset();
                    self.set_state(PipelineState::Running);

                    if self.consume(&mut session, &cancel).await == SessionEnd::Cancelled {
                        break Ok(());
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to open trade feed");
                }
            }

            self.set_state(PipelineState::Degraded);

            let Some(delay) = policy.next_delay() else {
                break Err(PipelineError::ReconnectExhausted {
                    attempts: policy.attempt_count(),
                });
            };

            metrics::record_reconnect();
            tracing::info!(
                attempt = policy.attempt_count(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to trade feed"
            );

            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        };

        if let Err(e) = &result {
            tracing::error!(error = %e, "Pipeline stopping");
        }
        self.shutdown().await;
        result
    }

    async fn consume(&self, session: &mut FeedSession, cancel: &CancellationToken) -> SessionEnd {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return SessionEnd::Cancelled,
                event = session.next() => event,
            };

            match event {
                Some(SessionEvent::Batch(batch)) => {
                    if let Err(e) = self.ingest(&batch) {
                        tracing::warn!(error = %e, "Failed to publish batch");
                    }
                }
                Some(SessionEvent::DecodeFailed(reason)) => {
                    metrics::record_decode_failure();
                    tracing::debug!(%reason, "Skipped undecodable feed message");
                }
                Some(SessionEvent::Closed { reason }) => {
                    tracing::warn!(%reason, "Trade feed session closed");
                    return SessionEnd::Closed;
                }
                None => return SessionEnd::Closed,
            }
        }
    }

    /// Drain persistence within the grace period, close every subscriber,
    /// and move to `Stopped`.
    pub async fn shutdown(&self) {
        if self.state() == PipelineState::Stopped {
            return;
        }

        {
            let mut queue = self.persist.lock();
            queue.tx = None;
            queue.rx = None;
        }

        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                pending = self.pending_persistence(),
                "Shutdown grace period elapsed with persistence in flight"
            );
        }

        self.hub.shutdown();
        self.set_state(PipelineState::Stopped);
    }
}

/// Store writer: inserts queued trades one at a time, in arrival order.
async fn write_trades(
    store: Arc<dyn TradeStore>,
    mut rx: mpsc::Receiver<Trade>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(trade) = rx.recv().await {
        match store.insert(&trade).await {
            Ok(persisted) => {
                metrics::record_persisted(Outcome::Success);
                tracing::trace!(id = persisted.id, "Trade persisted");
            }
            Err(e) => {
                metrics::record_persisted(Outcome::Failure);
                tracing::warn!(
                    error = %e,
                    symbol = %trade.symbol,
                    timestamp = trade.timestamp,
                    "Failed to persist trade"
                );
            }
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }
    tracing::debug!("Trade store writer stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::{Semaphore, mpsc};

    use super::*;
    use crate::application::ports::{FeedError, MockTradeStore};
    use crate::domain::trade::TimeRange;
    use crate::infrastructure::broadcast::BroadcastHub;
    use crate::infrastructure::persistence::InMemoryTradeStore;

    /// Feed that plays back one script per `open` call.
    struct ScriptedFeed {
        scripts: Mutex<VecDeque<Result<Vec<SessionEvent>, String>>>,
    }

    impl ScriptedFeed {
        fn new(scripts: Vec<Result<Vec<SessionEvent>, String>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
            }
        }
    }

    #[async_trait]
    impl FeedPort for ScriptedFeed {
        async fn open(&self) -> Result<FeedSession, FeedError> {
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err("no more sessions".to_string()));
            let events = script.map_err(FeedError::ConnectionFailed)?;

            let (tx, rx) = mpsc::channel(events.len().max(1));
            for event in events {
                tx.try_send(event).unwrap();
            }
            Ok(FeedSession::new(rx, CancellationToken::new()))
        }
    }

    /// Feed whose single session stays open until cancelled.
    struct IdleFeed {
        senders: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
    }

    #[async_trait]
    impl FeedPort for IdleFeed {
        async fn open(&self) -> Result<FeedSession, FeedError> {
            let (tx, rx) = mpsc::channel(1);
            self.senders.lock().push(tx);
            Ok(FeedSession::new(rx, CancellationToken::new()))
        }
    }

    /// In-memory store whose inserts wait for a permit.
    struct GatedStore {
        inner: InMemoryTradeStore,
        gate: Semaphore,
    }

    #[async_trait]
    impl TradeStore for GatedStore {
        async fn insert(&self, trade: &Trade) -> Result<PersistedTrade, StoreError> {
            self.gate.acquire().await.unwrap().forget();
            self.inner.insert(trade).await
        }

        async fn find_in_range(
            &self,
            range: TimeRange,
            limit: usize,
        ) -> Result<Vec<PersistedTrade>, StoreError> {
            self.inner.find_in_range(range, limit).await
        }

        async fn find_latest(&self, limit: usize) -> Result<Vec<PersistedTrade>, StoreError> {
            self.inner.find_latest(limit).await
        }
    }

    fn trade(timestamp: i64, price: f64) -> Trade {
        Trade::new("BINANCE:BTCUSDT", price, 1.0, timestamp)
    }

    fn fast_config(max_attempts: u32) -> PipelineConfig {
        PipelineConfig {
            max_history: 100,
            shutdown_grace: Duration::from_secs(1),
            persist_queue_capacity: 64,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                ..ReconnectConfig::default()
            }
            .without_jitter()
            .with_max_attempts(max_attempts),
        }
    }

    fn pipeline_with(store: Arc<dyn TradeStore>, config: PipelineConfig) -> IngestionPipeline {
        IngestionPipeline::new(store, Arc::new(BroadcastHub::with_defaults()), config)
    }

    fn decode(message: &str) -> Vec<Trade> {
        serde_json::from_str(message).unwrap()
    }

    #[test]
    fn state_codes_round_trip() {
        for state in [
            PipelineState::Idle,
            PipelineState::Running,
            PipelineState::Degraded,
            PipelineState::Stopped,
        ] {
            assert_eq!(PipelineState::from_u8(state.as_u8()), state);
        }
        assert_eq!(PipelineState::Degraded.to_string(), "degraded");
    }

    #[tokio::test]
    async fn new_pipeline_is_idle_and_empty() {
        let pipeline = pipeline_with(Arc::new(InMemoryTradeStore::new()), fast_config(0));
        assert_eq!(pipeline.state(), PipelineState::Idle);
        assert_eq!(pipeline.history_len(), 0);
    }

    #[tokio::test]
    async fn ingest_persists_records_and_publishes() {
        let store = Arc::new(InMemoryTradeStore::new());
        let pipeline = pipeline_with(store.clone(), fast_config(0));
        let mut sub = pipeline.subscribe().unwrap();

        // Two trades in the same minute collapse in history but not on the wire.
        let batch = vec![trade(0, 1.0), trade(30_000, 2.0)];
        let report = pipeline.ingest(&batch).unwrap();
        pipeline.shutdown().await;

        assert_eq!(report.delivered, 1);
        assert_eq!(pipeline.history_snapshot(), vec![trade(30_000, 2.0)]);
        assert_eq!(store.len(), 2);
        assert!(decode(&sub.recv().await.unwrap()).is_empty());
        assert_eq!(decode(&sub.recv().await.unwrap()), batch);
    }

    #[tokio::test]
    async fn late_subscriber_gets_snapshot_then_live() {
        let pipeline = pipeline_with(Arc::new(InMemoryTradeStore::new()), fast_config(0));
        pipeline.ingest(&[trade(0, 1.0), trade(60_000, 2.0)]).unwrap();

        let mut sub = pipeline.subscribe().unwrap();
        pipeline.ingest(&[trade(120_000, 3.0)]).unwrap();

        assert_eq!(decode(&sub.recv().await.unwrap()).len(), 2);
        assert_eq!(decode(&sub.recv().await.unwrap()), vec![trade(120_000, 3.0)]);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_block_broadcast() {
        let mut store = MockTradeStore::new();
        store
            .expect_insert()
            .times(1)
            .returning(|_| Err(StoreError::Query("disk full".to_string())));

        let pipeline = pipeline_with(Arc::new(store), fast_config(0));
        let mut sub = pipeline.subscribe().unwrap();

        pipeline.ingest(&[trade(0, 1.0)]).unwrap();
        pipeline.shutdown().await;

        let _snapshot = sub.recv().await.unwrap();
        assert_eq!(decode(&sub.recv().await.unwrap()), vec![trade(0, 1.0)]);
        assert_eq!(pipeline.history_len(), 1);
    }

    #[tokio::test]
    async fn stalled_store_drops_overflow_without_blocking_broadcast() {
        let store = Arc::new(GatedStore {
            inner: InMemoryTradeStore::new(),
            gate: Semaphore::new(0),
        });
        let config = PipelineConfig {
            persist_queue_capacity: 2,
            ..fast_config(0)
        };
        let pipeline = pipeline_with(store.clone(), config);
        let mut sub = pipeline.subscribe().unwrap();

        let batch: Vec<Trade> = (0..10).map(|i| trade(i * 60_000, 1.0)).collect();
        let report = pipeline.ingest(&batch).unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(pipeline.persistence_dropped(), 8);
        assert_eq!(pipeline.pending_persistence(), 2);
        let _snapshot = sub.recv().await.unwrap();
        assert_eq!(decode(&sub.recv().await.unwrap()), batch);

        store.gate.add_permits(10);
        pipeline.shutdown().await;

        assert_eq!(store.inner.len(), 2);
        assert_eq!(pipeline.pending_persistence(), 0);
    }

    #[tokio::test]
    async fn trades_are_written_in_arrival_order() {
        let store = Arc::new(InMemoryTradeStore::new());
        let pipeline = pipeline_with(store.clone(), fast_config(0));

        pipeline.ingest(&[trade(300, 1.0), trade(100, 2.0)]).unwrap();
        pipeline.ingest(&[trade(200, 3.0)]).unwrap();
        pipeline.shutdown().await;

        let latest = store.find_latest(10).await.unwrap();
        let ids: Vec<(i64, i64)> = latest
            .iter()
            .map(|t| (t.timestamp_millis(), t.id))
            .collect();
        assert_eq!(ids, vec![(300, 1), (200, 3), (100, 2)]);
        assert_eq!(pipeline.persistence_dropped(), 0);
    }

    #[tokio::test]
    async fn ingest_after_shutdown_counts_drops() {
        let store = Arc::new(InMemoryTradeStore::new());
        let pipeline = pipeline_with(store.clone(), fast_config(0));
        pipeline.shutdown().await;

        let _ = pipeline.ingest(&[trade(0, 1.0)]);

        assert_eq!(pipeline.persistence_dropped(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn debug_output_skips_store() {
        let pipeline = pipeline_with(Arc::new(InMemoryTradeStore::new()), fast_config(0));

        let rendered = format!("{pipeline:?}");

        assert!(rendered.starts_with("IngestionPipeline"));
        assert!(rendered.contains("Idle"));
        assert!(!rendered.contains("store: "));
    }

    #[tokio::test]
    async fn empty_batch_is_ignored() {
        let mut store = MockTradeStore::new();
        store.expect_insert().never();

        let pipeline = pipeline_with(Arc::new(store), fast_config(0));
        let report = pipeline.ingest(&[]).unwrap();

        assert_eq!(report, PublishReport::default());
    }

    #[tokio::test]
    async fn warm_start_seeds_history_ascending() {
        let store = Arc::new(InMemoryTradeStore::new());
        for (t, p) in [(120_000, 3.0), (0, 1.0), (60_000, 2.0), (61_000, 2.5)] {
            store.insert(&trade(t, p)).await.unwrap();
        }

        let pipeline = pipeline_with(store, fast_config(0));
        let len = pipeline.warm_start().await.unwrap();

        assert_eq!(len, 3);
        assert_eq!(
            pipeline.history_snapshot(),
            vec![trade(0, 1.0), trade(61_000, 2.5), trade(120_000, 3.0)]
        );
    }

    #[tokio::test]
    async fn warm_start_propagates_store_errors() {
        let mut store = MockTradeStore::new();
        store
            .expect_find_latest()
            .returning(|_| Err(StoreError::Query("offline".to_string())));

        let pipeline = pipeline_with(Arc::new(store), fast_config(0));

        assert!(pipeline.warm_start().await.is_err());
        assert_eq!(pipeline.history_len(), 0);
    }

    #[tokio::test]
    async fn run_reconnects_and_keeps_history() {
        let store = Arc::new(InMemoryTradeStore::new());
        let pipeline = pipeline_with(store.clone(), fast_config(2));
        let feed = ScriptedFeed::new(vec![
            Ok(vec![SessionEvent::Batch(vec![trade(0, 1.0)])]),
            Err("refused".to_string()),
            Ok(vec![
                SessionEvent::DecodeFailed("garbage".to_string()),
                SessionEvent::Batch(vec![trade(60_000, 2.0)]),
                SessionEvent::Closed {
                    reason: "eof".to_string(),
                },
            ]),
        ]);

        let result = pipeline.run(&feed, CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(PipelineError::ReconnectExhausted { attempts: 2 })
        ));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(
            pipeline.history_snapshot(),
            vec![trade(0, 1.0), trade(60_000, 2.0)]
        );
        assert_eq!(store.len(), 2);
        assert!(pipeline.hub().is_shut_down());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let pipeline = Arc::new(pipeline_with(
            Arc::new(InMemoryTradeStore::new()),
            fast_config(0),
        ));
        let feed = Arc::new(IdleFeed {
            senders: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();

        let handle = {
            let pipeline = Arc::clone(&pipeline);
            let feed = Arc::clone(&feed);
            let cancel = cancel.clone();
            tokio::spawn(async move { pipeline.run(feed.as_ref(), cancel).await })
        };

        while pipeline.state() != PipelineState::Running {
            tokio::task::yield_now().await;
        }
        let mut sub = pipeline.subscribe().unwrap();
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(result.is_ok());
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
