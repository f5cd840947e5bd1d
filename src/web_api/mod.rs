//! WebAPI - REST endpoints and update subscriptions
//!
//! ## Responsibilities
//!
//! - Session and device lookups
//! - Group writes behind the cycle guard
//! - WebSocket subscriptions feeding the update fan-out

mod routes;
mod socket;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Server status endpoint
pub async fn server_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": state.connections.active_sessions().await,
        "hot_devices": state.hot_devices.len()
    }))
}
