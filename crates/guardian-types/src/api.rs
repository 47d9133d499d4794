use serde::{Deserialize, Serialize};

use crate::models::{CommandAction, ReportedState};

// -- Devices --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterDeviceRequest {
    pub device_id: String,
    pub owner_member_id: String,
    pub family_id: String,
}

// -- Commands --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssueCommandRequest {
    pub action: CommandAction,
    pub issued_by: String,
}

/// `command_id` is absent when the device was already in the requested
/// state and no new command was created (idempotent no-op).
#[derive(Debug, Serialize)]
pub struct IssueCommandResponse {
    pub command_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AckCommandRequest {
    pub reported_state: ReportedState,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatRequest {
    pub reported_state: ReportedState,
}

// -- Emergency --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmergencyRequest {
    pub issued_by: String,
}

/// Per-device outcome of an emergency fan-out. Partial failure is not
/// fatal to the whole operation, so each device reports its own result.
#[derive(Debug, Serialize)]
pub struct EmergencyDeviceResult {
    pub device_id: String,
    pub command_id: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EmergencyResponse {
    pub event_id: i64,
    pub devices: Vec<EmergencyDeviceResult>,
}

// -- Natural-text interpretation --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterpretRequest {
    pub text: String,
    pub issued_by: String,
}

#[derive(Debug, Serialize)]
pub struct InterpretResponse {
    pub action: CommandAction,
    pub device_id: String,
    pub command_id: Option<i64>,
    pub confidence: f32,
}

// -- Errors --

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
