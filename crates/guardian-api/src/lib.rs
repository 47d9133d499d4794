pub mod commands;
pub mod connection;
pub mod devices;
pub mod emergency;

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;

use guardian_core::{CommandDispatcher, DeviceRegistry, DispatchError};
use guardian_db::Database;
use guardian_gateway::PresenceChannel;
use guardian_types::api::ErrorResponse;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub registry: DeviceRegistry,
    pub channel: PresenceChannel,
    pub dispatcher: CommandDispatcher,
}

/// Map dispatcher failures to the caller-facing codes: validation errors
/// are 404/409/422, interpretation failures 422, storage trouble 503.
pub fn error_response(e: DispatchError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        DispatchError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::CommandNotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::FamilyScoped(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DispatchError::InvalidTransition { .. } => StatusCode::CONFLICT,
        DispatchError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::Unintelligible => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}
