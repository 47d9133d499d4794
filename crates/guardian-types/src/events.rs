use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{CommandAction, Device, LockState, ReportedState};

/// Role of a connected observer. Dashboards receive every event; device
/// agents receive only commands addressed to their own device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverRole {
    Dashboard,
    DeviceAgent,
}

/// Events pushed to connected observers over the presence channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PresenceEvent {
    /// Server confirms the connection is registered
    Welcome {
        session_id: Uuid,
        role: ObserverRole,
    },

    /// Full registry state, sent to dashboards right after Welcome so a
    /// new tab is consistent without waiting for the next mutation
    Snapshot { devices: Vec<Device> },

    /// A command was issued against a device
    CommandIssued {
        device_id: String,
        command_id: i64,
        action: CommandAction,
        issued_by: String,
    },

    /// The target device confirmed a command
    CommandAcknowledged {
        command_id: i64,
        device_id: String,
        result_state: LockState,
    },

    /// A command went unacknowledged past the timeout window
    CommandExpired { command_id: i64, device_id: String },

    /// Family-wide lockdown was activated
    EmergencyLockdownActivated { event_id: i64, family_id: String },

    /// Family-wide lockdown was released
    EmergencyReleased { event_id: i64, family_id: String },
}

impl PresenceEvent {
    /// Returns the device_id if this event is scoped to a single device.
    /// Events that return `None` are family/global scope and go to every
    /// dashboard but to no device agent.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::CommandIssued { device_id, .. } => Some(device_id),
            Self::CommandAcknowledged { device_id, .. } => Some(device_id),
            Self::CommandExpired { device_id, .. } => Some(device_id),
            // Welcome, Snapshot and emergency events are not device-scoped
            _ => None,
        }
    }
}

/// Messages sent FROM a device agent TO the server over its socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AgentMessage {
    /// Periodic liveness/state report. The reported state is ground truth
    /// and reconciles registry divergence after missed commands.
    Heartbeat {
        device_id: String,
        reported_state: ReportedState,
    },

    /// Device confirms a previously issued command
    Ack {
        command_id: i64,
        reported_state: ReportedState,
    },
}
