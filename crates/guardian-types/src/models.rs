use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lock state of a device as tracked by the registry. The `Pending*`
/// variants are only valid while an unresolved command is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Unlocked,
    Locked,
    PendingLock,
    PendingUnlock,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unlocked => "unlocked",
            Self::Locked => "locked",
            Self::PendingLock => "pending_lock",
            Self::PendingUnlock => "pending_unlock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unlocked" => Some(Self::Unlocked),
            "locked" => Some(Self::Locked),
            "pending_lock" => Some(Self::PendingLock),
            "pending_unlock" => Some(Self::PendingUnlock),
            _ => None,
        }
    }
}

/// Connectivity is derived from heartbeat age by the offline sweep;
/// it is never set directly by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

/// The concrete lock state a device reports about itself (heartbeats and
/// acknowledgements). Devices never report pending states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedState {
    Locked,
    Unlocked,
}

impl ReportedState {
    pub fn lock_state(&self) -> LockState {
        match self {
            Self::Locked => LockState::Locked,
            Self::Unlocked => LockState::Unlocked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Lock,
    Unlock,
    Locate,
    EmergencyLockdown,
    EmergencyRelease,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::Locate => "locate",
            Self::EmergencyLockdown => "emergency_lockdown",
            Self::EmergencyRelease => "emergency_release",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lock" => Some(Self::Lock),
            "unlock" => Some(Self::Unlock),
            "locate" => Some(Self::Locate),
            "emergency_lockdown" => Some(Self::EmergencyLockdown),
            "emergency_release" => Some(Self::EmergencyRelease),
            _ => None,
        }
    }

    /// Pending lock state the registry shows while this action awaits an
    /// acknowledgement. `Locate` leaves the lock state untouched.
    pub fn pending_state(&self) -> Option<LockState> {
        match self {
            Self::Lock | Self::EmergencyLockdown => Some(LockState::PendingLock),
            Self::Unlock | Self::EmergencyRelease => Some(LockState::PendingUnlock),
            Self::Locate => None,
        }
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self, Self::EmergencyLockdown | Self::EmergencyRelease)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Issued,
    Acknowledged,
    Superseded,
    Expired,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Acknowledged => "acknowledged",
            Self::Superseded => "superseded",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "issued" => Some(Self::Issued),
            "acknowledged" => Some(Self::Acknowledged),
            "superseded" => Some(Self::Superseded),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Terminal commands are immutable; only `Issued` can transition.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Issued)
    }
}

/// One requested state transition targeting a single device.
/// `command_id` is the log's rowid: strictly increasing and sortable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: i64,
    pub device_id: String,
    pub action: CommandAction,
    pub issued_by: String,
    pub issued_at: DateTime<Utc>,
    pub status: CommandStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Registry view of one monitored device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub owner_member_id: String,
    pub family_id: String,
    pub lock_state: LockState,
    pub connectivity: Connectivity,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub pending_command_id: Option<i64>,
    pub pending_action: Option<CommandAction>,
}

/// Durable audit record of a family-wide lockdown or release. Out of the
/// hot broadcast path beyond triggering a single event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyEvent {
    pub event_id: i64,
    pub family_id: String,
    pub action: CommandAction,
    pub issued_by: String,
    pub issued_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
