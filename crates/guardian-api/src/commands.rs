use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::warn;

use guardian_core::DispatchError;
use guardian_types::api::{
    AckCommandRequest, ErrorResponse, InterpretRequest, InterpretResponse, IssueCommandRequest,
    IssueCommandResponse,
};

use crate::{AppState, error_response};

pub async fn issue_command(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(req): Json<IssueCommandRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let outcome = state
        .dispatcher
        .issue(&device_id, req.action, &req.issued_by)
        .await
        .map_err(error_response)?;

    // 201 for a new command, 200 for an idempotent no-op
    let status = match outcome.command_id() {
        Some(_) => StatusCode::CREATED,
        None => StatusCode::OK,
    };
    Ok((
        status,
        Json(IssueCommandResponse {
            command_id: outcome.command_id(),
        }),
    ))
}

/// Device-facing acknowledgement. An unknown command id (stale or duplicate
/// ack, e.g. after a restart) is logged and swallowed so the device never
/// retries indefinitely.
pub async fn ack_command(
    State(state): State<AppState>,
    Path(command_id): Path<i64>,
    Json(req): Json<AckCommandRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    match state
        .dispatcher
        .acknowledge(command_id, req.reported_state)
        .await
    {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(DispatchError::CommandNotFound(id)) => {
            warn!("ack for unknown command {}, dropping", id);
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) => Err(error_response(e)),
    }
}

pub async fn interpret(
    State(state): State<AppState>,
    Json(req): Json<InterpretRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let (interpretation, outcome) = state
        .dispatcher
        .interpret_and_issue(&req.text, &req.issued_by)
        .await
        .map_err(error_response)?;

    // interpret_and_issue only succeeds with both parts present
    let (Some(action), Some(device_id)) =
        (interpretation.action, interpretation.target_device_id)
    else {
        return Err(error_response(DispatchError::Unintelligible));
    };

    Ok(Json(InterpretResponse {
        action,
        device_id,
        command_id: outcome.command_id(),
        confidence: interpretation.confidence,
    }))
}
