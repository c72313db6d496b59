//! Hub Configuration Settings
//!
//! Configuration types for the trade stream hub, loaded from environment
//! variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::history::DEFAULT_MAX_HISTORY;
use crate::infrastructure::broadcast::OverflowPolicy;

/// Default upstream feed endpoint.
pub const DEFAULT_FEED_URL: &str = "wss://ws.finnhub.io";

/// Default subscription key.
pub const DEFAULT_FEED_SYMBOL: &str = "BINANCE:BTCUSDT";

/// Which trade store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// SQLite file on disk.
    #[default]
    Sqlite,
    /// Process-local store, lost on restart.
    Memory,
}

impl StoreBackend {
    /// Parse backend from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" | "in_memory" => Self::Memory,
            _ => Self::Sqlite,
        }
    }

    /// Get the backend name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        }
    }
}

/// Upstream feed API token.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String) -> Self {
        Self { api_key }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Upstream feed connection settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// WebSocket endpoint, without the token query.
    pub url: String,
    /// Symbol to subscribe to.
    pub symbol: String,
    /// Capacity of the session event channel.
    pub channel_capacity: usize,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            symbol: DEFAULT_FEED_SYMBOL.to_string(),
            channel_capacity: 1_024,
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

/// Per-subscriber delivery settings.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastSettings {
    /// Maximum queued messages per subscriber.
    pub queue_capacity: usize,
    /// What to do when a subscriber's queue is full.
    pub overflow_policy: OverflowPolicy,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

/// Ingestion pipeline settings.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Capacity of the recent history window.
    pub max_history: usize,
    /// How long shutdown waits for in-flight persistence.
    pub shutdown_grace: Duration,
    /// Trades that may wait for the store writer before new ones are dropped.
    pub persist_queue_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
            shutdown_grace: Duration::from_secs(10),
            persist_queue_capacity: 8_192,
        }
    }
}

/// Trade store settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Backend selection.
    pub backend: StoreBackend,
    /// SQLite database file.
    pub db_path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            db_path: PathBuf::from("data/trades.db"),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    /// Port serving `/ws` and `/api/trades`.
    pub api_port: u16,
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            api_port: 3001,
            health_port: 8082,
        }
    }
}

/// Complete hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Feed API credentials.
    pub credentials: Credentials,
    /// Upstream feed settings.
    pub feed: FeedSettings,
    /// Pipeline settings.
    pub pipeline: PipelineSettings,
    /// Subscriber delivery settings.
    pub broadcast: BroadcastSettings,
    /// Trade store settings.
    pub store: StoreSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl HubConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `STOCK_API_KEY` is missing or empty, or if a
    /// capacity is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let api_key = env
            .get("STOCK_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("STOCK_API_KEY".to_string()))?;
        if api_key.is_empty() {
            return Err(ConfigError::EmptyValue("STOCK_API_KEY".to_string()));
        }

        let feed_defaults = FeedSettings::default();
        let feed = FeedSettings {
            url: env.get("FEED_URL").unwrap_or(feed_defaults.url),
            symbol: env.get("FEED_SYMBOL").unwrap_or(feed_defaults.symbol),
            channel_capacity: env.parse_positive(
                "FEED_CHANNEL_CAPACITY",
                feed_defaults.channel_capacity,
            )?,
            reconnect_delay_initial: env.duration_millis(
                "FEED_RECONNECT_DELAY_INITIAL_MS",
                feed_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.duration_secs(
                "FEED_RECONNECT_DELAY_MAX_SECS",
                feed_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse_or(
                "FEED_RECONNECT_DELAY_MULTIPLIER",
                feed_defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: env.parse_or(
                "FEED_MAX_RECONNECT_ATTEMPTS",
                feed_defaults.max_reconnect_attempts,
            ),
        };

        let pipeline_defaults = PipelineSettings::default();
        let pipeline = PipelineSettings {
            max_history: env.parse_positive("MAX_HISTORY", pipeline_defaults.max_history)?,
            shutdown_grace: env
                .duration_secs("SHUTDOWN_GRACE_SECS", pipeline_defaults.shutdown_grace),
            persist_queue_capacity: env.parse_positive(
                "PERSIST_QUEUE_CAPACITY",
                pipeline_defaults.persist_queue_capacity,
            )?,
        };

        let broadcast_defaults = BroadcastSettings::default();
        let broadcast = BroadcastSettings {
            queue_capacity: env.parse_positive(
                "SUBSCRIBER_QUEUE_CAPACITY",
                broadcast_defaults.queue_capacity,
            )?,
            overflow_policy: env
                .get("SUBSCRIBER_OVERFLOW_POLICY")
                .map(|s| OverflowPolicy::from_str_case_insensitive(&s))
                .unwrap_or_default(),
        };

        let store = StoreSettings {
            backend: env
                .get("TRADE_STORE")
                .map(|s| StoreBackend::from_str_case_insensitive(&s))
                .unwrap_or_default(),
            db_path: env
                .get("TRADE_DB_PATH")
                .map_or_else(|| StoreSettings::default().db_path, PathBuf::from),
        };

        let server = ServerSettings {
            api_port: env.parse_or("API_PORT", ServerSettings::default().api_port),
            health_port: env.parse_or("HEALTH_PORT", ServerSettings::default().health_port),
        };

        Ok(Self {
            credentials: Credentials::new(api_key),
            feed,
            pipeline,
            broadcast,
            store,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has a value outside its allowed range.
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn parse_positive(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        match self.parse_or(key, default) {
            0 => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: "must be greater than zero".to_string(),
            }),
            value => Ok(value),
        }
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
