//! Reconnection Policy
//!
//! Exponential backoff with jitter between upstream connection attempts.

use std::time::Duration;

use rand::Rng;

use crate::FeedSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay, before jitter.
    pub max_delay: Duration,
    /// Growth factor applied after each attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Maximum attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Build from the feed settings with the default jitter.
    #[must_use]
    pub fn from_feed_settings(settings: &FeedSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            ..Self::default()
        }
        .with_max_attempts(settings.max_reconnect_attempts)
    }

    /// Set the attempt limit.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Disable jitter, mostly useful for deterministic tests.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }
}

/// Exponential backoff state for one reconnecting connection.
///
/// # Example
///
/// ```rust
/// use trade_stream_hub::infrastructure::feed::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
/// assert!(policy.next_delay().is_some());
///
/// // After a successful connection
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            current_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempt_count += 1;

        let delay = self.jittered(self.current_delay);
        self.current_delay = self.grow(self.current_delay);
        Some(delay)
    }

    /// Return to the initial delay after a successful connection.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn grow(&self, delay: Duration) -> Duration {
        let scaled = (delay.as_millis() as f64 * self.config.multiplier).round();
        let millis = if scaled.is_finite() && scaled > 0.0 {
            scaled as u128
        } else {
            0
        };
        let capped = millis.min(self.config.max_delay.as_millis());
        Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX))
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }

        let base = delay.as_millis() as f64;
        let spread = base * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);

        Duration::from_millis((base + offset).max(1.0) as u64)
    }
}
