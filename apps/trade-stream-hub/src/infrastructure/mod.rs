//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Per-subscriber fan-out of trade batches.
pub mod broadcast;

/// Configuration loaded from the environment.
pub mod config;

/// Upstream trade feed WebSocket client.
pub mod feed;

/// Health check HTTP endpoint.
pub mod health;

/// Public API: live WebSocket stream and range queries.
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Trade store adapters (SQLite, in-memory).
pub mod persistence;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;
