//! Prometheus Metrics Module
//!
//! Exposes application metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ingestion**: Trades and batches received, decode failures, reconnects
//! - **Persistence**: Store writes by outcome
//! - **Delivery**: Subscribers, messages delivered and dropped
//! - **Latency**: Batch processing time
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Ingestion
    describe_counter!(
        "trade_hub_trades_received_total",
        "Total trades received from the upstream feed"
    );
    describe_counter!(
        "trade_hub_batches_received_total",
        "Total trade batches received from the upstream feed"
    );
    describe_counter!(
        "trade_hub_decode_failures_total",
        "Total feed messages that could not be decoded"
    );
    describe_counter!(
        "trade_hub_feed_reconnects_total",
        "Total upstream feed reconnection attempts"
    );
    describe_gauge!(
        "trade_hub_pipeline_state",
        "Pipeline state (0=idle, 1=running, 2=degraded, 3=stopped)"
    );

    // Persistence
    describe_counter!(
        "trade_hub_trades_persisted_total",
        "Total trade store writes by outcome"
    );
    describe_counter!(
        "trade_hub_persist_dropped_total",
        "Total trades dropped because the store writer queue was full"
    );

    // Delivery
    describe_gauge!("trade_hub_subscribers", "Number of connected subscribers");
    describe_counter!(
        "trade_hub_messages_delivered_total",
        "Total messages queued for subscribers"
    );
    describe_counter!(
        "trade_hub_messages_dropped_total",
        "Total messages dropped from full subscriber queues"
    );
    describe_counter!(
        "trade_hub_subscribers_disconnected_total",
        "Total subscribers removed after a failed delivery"
    );

    // Range queries
    describe_counter!(
        "trade_hub_range_queries_total",
        "Total historical range queries by outcome"
    );

    // Latency
    describe_histogram!(
        "trade_hub_batch_processing_seconds",
        "Time to process one inbound batch"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Outcome label for store operations.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    /// Operation succeeded.
    Success,
    /// Operation failed.
    Failure,
}

impl Outcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Record one inbound batch of `trades` trades.
pub fn record_batch_received(trades: usize) {
    counter!("trade_hub_batches_received_total").increment(1);
    counter!("trade_hub_trades_received_total").increment(trades as u64);
}

/// Record a feed message that failed to decode.
pub fn record_decode_failure() {
    counter!("trade_hub_decode_failures_total").increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("trade_hub_feed_reconnects_total").increment(1);
}

/// Update the pipeline state gauge.
pub fn set_pipeline_state(code: u8) {
    gauge!("trade_hub_pipeline_state").set(f64::from(code));
}

/// Record a trade store write.
pub fn record_persisted(outcome: Outcome) {
    counter!(
        "trade_hub_trades_persisted_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record trades dropped before reaching the store writer.
pub fn record_persist_dropped(count: u64) {
    counter!("trade_hub_persist_dropped_total").increment(count);
}

/// Update the connected subscriber count.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscribers(count: usize) {
    gauge!("trade_hub_subscribers").set(count as f64);
}

/// Record messages queued for subscribers.
pub fn record_messages_delivered(count: u64) {
    counter!("trade_hub_messages_delivered_total").increment(count);
}

/// Record messages dropped from full queues.
pub fn record_messages_dropped(count: u64) {
    counter!("trade_hub_messages_dropped_total").increment(count);
}

/// Record subscribers removed by the hub.
pub fn record_subscribers_disconnected(count: u64) {
    counter!("trade_hub_subscribers_disconnected_total").increment(count);
}

/// Record a historical range query.
pub fn record_range_query(outcome: Outcome) {
    counter!(
        "trade_hub_range_queries_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record batch processing duration.
pub fn record_batch_duration(duration: Duration) {
    histogram!("trade_hub_batch_processing_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
