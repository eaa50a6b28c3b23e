//! HTTP service for the homecare patient memory system.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /api/v1/memories` - Extract and store memories from a conversation
//! - `POST /api/v1/memories/search` - Priority-ranked semantic search
//! - `GET /api/v1/memories/{id}` - Fetch one memory
//! - `PATCH /api/v1/memories/{id}` - Edit content or metadata
//! - `DELETE /api/v1/memories/{id}` - Soft-delete
//! - `GET /api/v1/patients/{patient_id}/summary` - Counts and recent observations
//!
//! Errors are returned as `{"error": ..., "code": ...}`.
//!
//! # Architecture
//!
//! ```text
//! Care assistant / caregiver app
//!    │
//!    ▼
//! ┌─────────────────┐
//! │   API Server    │ ◄── This crate
//! │     (Axum)      │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐      ┌─────────────────┐
//! │     Memory      │ ───► │ Fact extractor  │
//! │   Coordinator   │      │ and embedder    │
//! └────────┬────────┘      └─────────────────┘
//!          │
//!          ├──────────────────┐
//!          ▼                  ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │   Repository    │ │  Vector index   │
//! └─────────────────┘ └─────────────────┘
//! ```

pub mod config;
pub mod routes;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use config::{build_coordinator, ServiceConfig};
pub use state::AppState;

/// Request bodies above this size are rejected.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(allowed)
}

/// Create the API router with all routes configured.
pub fn create_router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/v1/memories", post(routes::ingest))
        .route("/api/v1/memories/search", post(routes::search))
        .route(
            "/api/v1/memories/{id}",
            get(routes::get_memory)
                .patch(routes::update_memory)
                .delete(routes::delete_memory),
        )
        .route(
            "/api/v1/patients/{patient_id}/summary",
            get(routes::patient_summary),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// Start the API server on the given address and run until Ctrl-C.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    cors_origins: &[String],
) -> anyhow::Result<()> {
    let router = create_router(state, cors_origins);

    info!(%addr, "Starting homecare memory API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
