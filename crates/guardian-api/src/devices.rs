use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::error;

use guardian_types::api::{ErrorResponse, HeartbeatRequest, RegisterDeviceRequest};

use crate::{AppState, error_response};

pub async fn register_device(
    State(state): State<AppState>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    if req.device_id.is_empty() || req.family_id.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "device_id and family_id must be non-empty".to_string(),
            }),
        ));
    }

    state
        .dispatcher
        .register_device(&req.device_id, &req.owner_member_id, &req.family_id)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
pub struct DeviceQuery {
    pub family_id: Option<String>,
}

pub async fn list_devices(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> impl IntoResponse {
    let devices = state.registry.snapshot(query.family_id.as_deref()).await;
    Json(devices)
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    state
        .registry
        .heartbeat(&device_id, req.reported_state, chrono::Utc::now())
        .await
        .map_err(|e| error_response(e.into()))?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn command_history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let limit = query.limit.min(200);

    // Run blocking DB reads off the async runtime
    let history = tokio::task::spawn_blocking(move || db.command_history(&device_id, limit))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(history))
}
