//! HTTP and WebSocket front end.
//!
//! A thin façade over the [`Multiplexer`]: REST routes for session CRUD,
//! history and notification intake, plus a `/ws` endpoint that turns each
//! WebSocket into a multiplexer connection.

mod api;
mod ws;

pub use api::{ApiError, ApiResult, CreateSessionRequest, HealthResponse, NotifyAck};

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::multiplexer::Multiplexer;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub mux: Arc<Multiplexer>,
    /// Cancelled when the daemon shuts down; open WebSockets close on it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(mux: Arc<Multiplexer>, shutdown: CancellationToken) -> Self {
        Self { mux, shutdown }
    }
}

/// Builds the router with every route.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route(
            "/api/sessions",
            get(api::list_sessions).post(api::create_session),
        )
        .route(
            "/api/sessions/:session_id",
            get(api::get_session).delete(api::delete_session),
        )
        .route("/api/sessions/:session_id/output", get(api::session_output))
        .route(
            "/api/history",
            get(api::get_history).delete(api::clear_history),
        )
        .route("/api/notify", post(api::notify))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Serves the router on `listener` until `state.shutdown` is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "HTTP server listening");
    }

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}
