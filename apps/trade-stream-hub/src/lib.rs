#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Trade Stream Hub - Live Trade Fan-out
//!
//! Holds a single connection to an upstream trade feed, persists every trade,
//! keeps a bounded minute-deduplicated history window, and fans raw batches
//! out to many WebSocket viewers. Historical range queries are served from
//! the trade store.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Trade types and cadence logic
//!   - `trade`: Live and persisted trade shapes, time ranges
//!   - `dedup`: Minute-of-hour deduplication
//!   - `history`: Bounded recent-history window
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Trade store and upstream feed contracts
//!   - `services`: The ingestion pipeline
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `feed`: WebSocket client for the upstream feed
//!   - `broadcast`: Per-subscriber queues and fan-out
//!   - `persistence`: SQLite and in-memory trade stores
//!   - `http`: Live WebSocket stream and range query API
//!   - `health`: Health check HTTP endpoint
//!   - `config`: Configuration from the environment
//!
//! # Data Flow
//!
//! ```text
//!                         ┌──────────────┐
//!                    ┌───►│ Trade Store  │◄──── POST /api/trades
//!                    │    └──────────────┘
//! Upstream WS ──► Pipeline
//!                    │    ┌──────────────┐     ┌──────────┐
//!                    └───►│ History +    │────►│  /ws     │──► Viewer 1
//!                         │ Broadcast Hub│     │ sessions │──► Viewer 2
//!                         └──────────────┘     └──────────┘──► Viewer N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Trade types and cadence logic with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::dedup::dedupe_by_minute;
pub use domain::history::{AppendOutcome, HistoryWindow};
pub use domain::trade::{PersistedTrade, TimeRange, Trade};

// Ports and services
pub use application::ports::{FeedError, FeedPort, FeedSession, SessionEvent, StoreError, TradeStore};
pub use application::services::{IngestionPipeline, PipelineConfig, PipelineError, PipelineState};

// Infrastructure config
pub use infrastructure::config::{
    BroadcastSettings, ConfigError, Credentials, FeedSettings, HubConfig, PipelineSettings,
    ServerSettings, StoreBackend, StoreSettings,
};

// Broadcast hub
pub use infrastructure::broadcast::{
    BroadcastConfig, BroadcastHub, BroadcastStats, HubError, OverflowPolicy, PublishReport,
    SharedBroadcastHub, Subscription,
};

// Feed client
pub use infrastructure::feed::{FeedClient, FeedClientConfig};

// Trade stores
pub use infrastructure::persistence::{InMemoryTradeStore, SqliteTradeStore, open_store};

// API and health servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::http::{ApiServer, ApiState, ServerError, create_router};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};
