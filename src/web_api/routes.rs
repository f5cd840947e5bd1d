//! API Routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::{ApiResponse, Group};
use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/healthz", get(super::health_check))
        .route("/api/server", get(super::server_status))
        // Sessions
        .route("/api/sessions/:device_id", get(get_session))
        // Devices
        .route("/api/devices", get(list_devices))
        // Groups
        .route("/api/groups", get(list_groups))
        .route("/api/groups", post(create_group))
        .route("/api/groups/:id", put(update_group))
        // Update subscriptions
        .route("/api/socket", get(super::socket::ws_handler))
        .with_state(state)
}

// ========================================
// Session Handlers
// ========================================

#[derive(Debug, Serialize)]
struct SessionInfo {
    device_id: i64,
    unique_id: String,
    protocol: String,
    remote_addr: String,
    channel: u64,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    user_id: Option<i64>,
}

async fn get_session(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
    Query(query): Query<SessionQuery>,
) -> Result<impl IntoResponse, Error> {
    if let Some(user_id) = query.user_id {
        if !state.permissions.check_device(user_id, device_id).await {
            return Err(Error::Forbidden(format!(
                "User {} cannot see device {}",
                user_id, device_id
            )));
        }
    }

    let session = state
        .connections
        .session(device_id)
        .await
        .ok_or_else(|| Error::NotFound(format!("No session for device {}", device_id)))?;

    let endpoint = session.endpoint();
    Ok(Json(ApiResponse::success(SessionInfo {
        device_id: session.device_id(),
        unique_id: session.unique_id().to_string(),
        protocol: session.protocol().to_string(),
        remote_addr: endpoint.remote_addr().to_string(),
        channel: endpoint.channel().0,
    })))
}

// ========================================
// Device Handlers
// ========================================

async fn list_devices(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    let devices = state.directory.all().await?;
    Ok(Json(ApiResponse::success(devices)))
}

// ========================================
// Group Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct GroupRequest {
    name: String,
    group_id: Option<i64>,
}

async fn list_groups(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.groups.all().await))
}

async fn create_group(
    State(state): State<AppState>,
    Json(req): Json<GroupRequest>,
) -> Result<impl IntoResponse, Error> {
    let group = state
        .groups
        .add(Group {
            id: 0,
            name: req.name,
            group_id: req.group_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(group))))
}

async fn update_group(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<GroupRequest>,
) -> Result<impl IntoResponse, Error> {
    let group = Group {
        id,
        name: req.name,
        group_id: req.group_id,
    };
    state.groups.update(group.clone()).await?;
    Ok(Json(ApiResponse::success(group)))
}
