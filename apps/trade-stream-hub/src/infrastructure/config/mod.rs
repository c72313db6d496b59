//! Configuration Module
//!
//! Configuration loading for the hub service.

mod settings;

pub use settings::{
    BroadcastSettings, ConfigError, Credentials, DEFAULT_FEED_SYMBOL, DEFAULT_FEED_URL,
    FeedSettings, HubConfig, PipelineSettings, ServerSettings, StoreBackend, StoreSettings,
};
