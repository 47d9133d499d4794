use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::error;

use guardian_types::api::{EmergencyRequest, EmergencyResponse, ErrorResponse};

use crate::{AppState, error_response};

pub async fn lockdown(
    State(state): State<AppState>,
    Path(family_id): Path<String>,
    Json(req): Json<EmergencyRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let (event_id, devices) = state
        .dispatcher
        .emergency_lockdown(&family_id, &req.issued_by)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(EmergencyResponse { event_id, devices }),
    ))
}

pub async fn release(
    State(state): State<AppState>,
    Path(family_id): Path<String>,
    Json(req): Json<EmergencyRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let (event_id, devices) = state
        .dispatcher
        .emergency_release(&family_id, &req.issued_by)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(EmergencyResponse { event_id, devices }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct EmergencyQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn list_emergencies(
    State(state): State<AppState>,
    Path(family_id): Path<String>,
    Query(query): Query<EmergencyQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let limit = query.limit.min(200);

    let events = tokio::task::spawn_blocking(move || db.family_emergencies(&family_id, limit))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(events))
}
