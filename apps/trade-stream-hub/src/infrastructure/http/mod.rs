//! Public API Server (Driver Adapter)
//!
//! Axum router serving the live trade stream and historical range queries.
//!
//! # Endpoints
//!
//! - `GET /ws` - WebSocket upgrade; history snapshot first, then live batches
//! - `POST /api/trades` - Persisted trades in `{from, to}`, newest first

mod live;
mod trades;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::application::ports::TradeStore;
use crate::application::services::IngestionPipeline;

pub use trades::{RANGE_QUERY_LIMIT, RangeRequestError, ValidationIssue, parse_range_request};

// =============================================================================
// State
// =============================================================================

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    /// Pipeline owning the history window and the broadcast hub.
    pub pipeline: Arc<IngestionPipeline>,
    /// Store backing range queries.
    pub store: Arc<dyn TradeStore>,
    /// Cancelled when the process is shutting down.
    pub shutdown: CancellationToken,
}

impl ApiState {
    /// Create new API state.
    #[must_use]
    pub const fn new(
        pipeline: Arc<IngestionPipeline>,
        store: Arc<dyn TradeStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            store,
            shutdown,
        }
    }
}

/// Create the public router.
pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(live::live_handler))
        .route("/api/trades", post(trades::range_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// Public API server.
pub struct ApiServer {
    port: u16,
    state: ApiState,
    cancel: CancellationToken,
}

impl ApiServer {
    /// Create a new API server.
    #[must_use]
    pub const fn new(port: u16, state: ApiState, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if binding fails or the HTTP server encounters a
    /// fatal error while running.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "API server listening");
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::ServerFailed` if the HTTP server fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let app = create_router(self.state);

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ServerError::ServerFailed(e.to_string()))?;

        tracing::info!("API server stopped");
        Ok(())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// API server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}
