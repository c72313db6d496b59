//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, pipeline status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (pipeline streaming)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{IngestionPipeline, PipelineState};
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Ingestion pipeline status.
    pub pipeline: PipelineStatus,
    /// Live subscriber statistics.
    pub subscribers: SubscriberStatus,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Feed streaming.
    Healthy,
    /// Not streaming yet, or reconnecting.
    Degraded,
    /// Pipeline stopped.
    Unhealthy,
}

/// Ingestion pipeline status.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Lifecycle state name.
    pub state: &'static str,
    /// Trades in the history window.
    pub history_len: usize,
    /// Trades waiting for the store writer.
    pub pending_persistence: usize,
    /// Trades dropped because the store writer queue was full.
    pub persistence_dropped: u64,
}

/// Live subscriber statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStatus {
    /// Currently registered subscribers.
    pub active: usize,
    /// Messages enqueued since startup.
    pub messages_delivered: u64,
    /// Messages evicted by the drop-oldest policy.
    pub messages_dropped: u64,
    /// Subscribers removed for overflow or closure.
    pub disconnected: u64,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    pipeline: Arc<IngestionPipeline>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, pipeline: Arc<IngestionPipeline>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            pipeline,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Build the health router.
pub fn health_router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = health_router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.pipeline.state() == PipelineState::Running {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let pipeline_state = state.pipeline.state();
    let stats = state.pipeline.hub().stats();

    HealthResponse {
        status: determine_health_status(pipeline_state),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        pipeline: PipelineStatus {
            state: pipeline_state.as_str(),
            history_len: state.pipeline.history_len(),
            pending_persistence: state.pipeline.pending_persistence(),
            persistence_dropped: state.pipeline.persistence_dropped(),
        },
        subscribers: SubscriberStatus {
            active: stats.subscribers,
            messages_delivered: stats.messages_delivered,
            messages_dropped: stats.messages_dropped,
            disconnected: stats.subscribers_disconnected,
        },
    }
}

const fn determine_health_status(state: PipelineState) -> HealthStatus {
    match state {
        PipelineState::Running => HealthStatus::Healthy,
        PipelineState::Idle | PipelineState::Degraded => HealthStatus::Degraded,
        PipelineState::Stopped => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
