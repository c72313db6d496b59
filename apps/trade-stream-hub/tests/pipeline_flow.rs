//! Ingestion Pipeline Integration Tests
//!
//! Drives the pipeline end to end against the in-memory trade store: history
//! shaping, snapshot-first delivery, subscriber isolation, and shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use trade_stream_hub::{
    BroadcastConfig, BroadcastHub, FeedError, FeedPort, FeedSession, InMemoryTradeStore,
    IngestionPipeline, OverflowPolicy, PipelineConfig, PipelineState, SessionEvent, Subscription,
    Trade,
};

/// 2024-01-01T10:00:00Z
const TEN_O_CLOCK: i64 = 1_704_103_200_000;

fn at(minutes: i64, seconds: i64, price: f64) -> Trade {
    Trade::new(
        "BINANCE:BTCUSDT",
        price,
        0.5,
        TEN_O_CLOCK + minutes * 60_000 + seconds * 1_000,
    )
}

fn pipeline(max_history: usize, broadcast: BroadcastConfig) -> (Arc<IngestionPipeline>, Arc<InMemoryTradeStore>) {
    let store = Arc::new(InMemoryTradeStore::new());
    let config = PipelineConfig {
        max_history,
        shutdown_grace: Duration::from_secs(2),
        ..PipelineConfig::default()
    };
    let pipeline = IngestionPipeline::new(
        Arc::clone(&store) as Arc<dyn trade_stream_hub::TradeStore>,
        Arc::new(BroadcastHub::new(broadcast)),
        config,
    );
    (Arc::new(pipeline), store)
}

async fn next_batch(subscription: &mut Subscription) -> Vec<Trade> {
    let message = timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("timed out waiting for message")
        .expect("subscription closed");
    serde_json::from_str(&message).unwrap()
}

/// Feed handing out one session driven by a test-held sender.
struct ChannelFeed {
    session: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
}

impl ChannelFeed {
    fn new() -> (Self, mpsc::Sender<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                session: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl FeedPort for ChannelFeed {
    async fn open(&self) -> Result<FeedSession, FeedError> {
        let rx = self.session.lock().take();
        match rx {
            Some(rx) => Ok(FeedSession::new(rx, CancellationToken::new())),
            None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

#[tokio::test]
async fn same_minute_trade_replaces_earlier_one() {
    let (pipeline, store) = pipeline(150_000, BroadcastConfig::default());

    pipeline.ingest(&[at(0, 1, 100.0)]).unwrap();
    pipeline.ingest(&[at(0, 30, 101.0)]).unwrap();
    pipeline.ingest(&[at(1, 5, 102.0)]).unwrap();

    assert_eq!(
        pipeline.history_snapshot(),
        vec![at(0, 30, 101.0), at(1, 5, 102.0)]
    );

    pipeline.shutdown().await;
    assert_eq!(store.len(), 3, "every inbound trade is persisted");
}

#[tokio::test]
async fn history_keeps_most_recent_entries() {
    let (pipeline, _store) = pipeline(2, BroadcastConfig::default());
    let (a, b, c) = (at(0, 0, 1.0), at(1, 0, 2.0), at(2, 0, 3.0));

    pipeline.ingest(&[a]).unwrap();
    pipeline.ingest(&[b.clone()]).unwrap();
    pipeline.ingest(&[c.clone()]).unwrap();

    assert_eq!(pipeline.history_snapshot(), vec![b, c]);
}

#[tokio::test]
async fn late_subscriber_gets_snapshot_then_raw_batches() {
    let (pipeline, _store) = pipeline(150_000, BroadcastConfig::default());
    pipeline.ingest(&[at(0, 1, 100.0), at(0, 30, 101.0)]).unwrap();

    let mut subscription = pipeline.subscribe().unwrap();

    let second = vec![at(1, 5, 102.0), at(1, 6, 103.0)];
    let third = vec![at(2, 0, 104.0)];
    pipeline.ingest(&second).unwrap();
    pipeline.ingest(&third).unwrap();

    assert_eq!(next_batch(&mut subscription).await, vec![at(0, 30, 101.0)]);
    // Live batches are forwarded as received, not deduplicated.
    assert_eq!(next_batch(&mut subscription).await, second);
    assert_eq!(next_batch(&mut subscription).await, third);
}

#[tokio::test]
async fn first_subscriber_on_empty_history_gets_empty_snapshot() {
    let (pipeline, _store) = pipeline(150_000, BroadcastConfig::default());

    let mut subscription = pipeline.subscribe().unwrap();

    assert!(next_batch(&mut subscription).await.is_empty());
}

#[tokio::test]
async fn stalled_subscriber_does_not_hold_back_others() {
    let (pipeline, _store) = pipeline(
        150_000,
        BroadcastConfig {
            queue_capacity: 2,
            overflow_policy: OverflowPolicy::DropOldest,
        },
    );

    pipeline.ingest(&[at(0, 0, 1.0)]).unwrap();
    let mut stalled = pipeline.subscribe().unwrap();
    let mut reader = pipeline.subscribe().unwrap();
    assert_eq!(next_batch(&mut reader).await, vec![at(0, 0, 1.0)]);

    for minute in 1..6 {
        let batch = vec![at(minute, 0, 1.0)];
        pipeline.ingest(&batch).unwrap();
        assert_eq!(next_batch(&mut reader).await, batch);
    }

    assert_eq!(stalled.pending(), 2);
    assert_eq!(pipeline.hub().subscriber_count(), 2);

    // The stalled viewer lost live batches, never its history.
    assert_eq!(next_batch(&mut stalled).await, vec![at(0, 0, 1.0)]);
    assert_eq!(next_batch(&mut stalled).await, vec![at(5, 0, 1.0)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subscribers_see_every_trade_exactly_once() {
    const BATCHES: usize = 400;
    const SUBSCRIBERS: usize = 8;

    let (pipeline, _store) = pipeline(150_000, BroadcastConfig::default());
    // One trade per minute, so the history window keeps every one of them.
    let trades: Vec<Trade> = (0..BATCHES)
        .map(|i| at(i64::try_from(i).unwrap(), 0, 1.0))
        .collect();
    let published = Arc::new(AtomicUsize::new(0));

    let viewers: Vec<_> = (0..SUBSCRIBERS)
        .map(|n| {
            let pipeline = Arc::clone(&pipeline);
            let published = Arc::clone(&published);
            tokio::spawn(async move {
                let start_at = n * BATCHES / SUBSCRIBERS;
                while published.load(Ordering::Acquire) < start_at {
                    tokio::task::yield_now().await;
                }
                pipeline.subscribe().unwrap()
            })
        })
        .collect();

    let producer = {
        let pipeline = Arc::clone(&pipeline);
        let published = Arc::clone(&published);
        let trades = trades.clone();
        tokio::spawn(async move {
            for trade in trades {
                pipeline.ingest(&[trade]).unwrap();
                published.fetch_add(1, Ordering::AcqRel);
                tokio::task::yield_now().await;
            }
        })
    };

    let mut subscriptions = Vec::with_capacity(SUBSCRIBERS);
    for viewer in viewers {
        subscriptions.push(timeout(Duration::from_secs(10), viewer).await.unwrap().unwrap());
    }
    timeout(Duration::from_secs(10), producer)
        .await
        .unwrap()
        .unwrap();

    for mut subscription in subscriptions {
        let snapshot = next_batch(&mut subscription).await;
        let mut received = snapshot.clone();
        while let Some(message) = subscription.try_recv() {
            let batch: Vec<Trade> = serde_json::from_str(&message).unwrap();
            received.extend(batch);
        }

        assert_eq!(
            received,
            trades,
            "subscriber {} (snapshot of {}) saw a gap or a duplicate",
            subscription.id(),
            snapshot.len()
        );
    }
    assert_eq!(pipeline.hub().stats().messages_dropped, 0);
}

#[tokio::test]
async fn disconnect_policy_removes_only_the_overflowing_subscriber() {
    let (pipeline, _store) = pipeline(
        150_000,
        BroadcastConfig {
            queue_capacity: 2,
            overflow_policy: OverflowPolicy::Disconnect,
        },
    );

    let mut stalled = pipeline.subscribe().unwrap();
    let mut reader = pipeline.subscribe().unwrap();
    assert!(next_batch(&mut reader).await.is_empty());

    for minute in 0..3 {
        pipeline.ingest(&[at(minute, 0, 1.0)]).unwrap();
        next_batch(&mut reader).await;
    }

    assert_eq!(pipeline.hub().subscriber_count(), 1);
    assert!(stalled.try_recv().is_none());
    assert_eq!(pipeline.hub().stats().subscribers_disconnected, 1);
}

#[tokio::test]
async fn dropped_subscription_unregisters() {
    let (pipeline, _store) = pipeline(150_000, BroadcastConfig::default());

    let subscription = pipeline.subscribe().unwrap();
    assert_eq!(pipeline.hub().subscriber_count(), 1);

    drop(subscription);
    assert_eq!(pipeline.hub().subscriber_count(), 0);

    pipeline.ingest(&[at(0, 0, 1.0)]).unwrap();
    assert_eq!(pipeline.hub().stats().subscribers_disconnected, 0);
}

#[tokio::test]
async fn run_streams_until_cancelled_then_drains() {
    let (pipeline, store) = pipeline(150_000, BroadcastConfig::default());
    let (feed, events) = ChannelFeed::new();
    let cancel = CancellationToken::new();

    let runner = Arc::clone(&pipeline);
    let run_cancel = cancel.clone();
    let task = tokio::spawn(async move { runner.run(&feed, run_cancel).await });

    let mut subscription = pipeline.subscribe().unwrap();
    assert!(next_batch(&mut subscription).await.is_empty());

    let batch = vec![at(0, 1, 100.0), at(0, 2, 100.5)];
    events.send(SessionEvent::Batch(batch.clone())).await.unwrap();
    events
        .send(SessionEvent::DecodeFailed("not json".to_string()))
        .await
        .unwrap();
    events.send(SessionEvent::Batch(Vec::new())).await.unwrap();

    assert_eq!(next_batch(&mut subscription).await, batch);
    assert_eq!(pipeline.state(), PipelineState::Running);

    cancel.cancel();
    timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(store.len(), 2);
    assert_eq!(subscription.recv().await, None);
    assert!(pipeline.subscribe().is_err());
}
