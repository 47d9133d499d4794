//! Database row types — these map directly to SQLite rows.
//! Distinct from guardian-types domain models to keep the DB layer
//! independent; conversion happens at read time.

use chrono::{DateTime, Utc};
use guardian_types::models::{Command, CommandAction, CommandStatus, EmergencyEvent};

use crate::LogError;

pub struct CommandRow {
    pub id: i64,
    pub device_id: String,
    pub action: String,
    pub issued_by: String,
    pub issued_at: String,
    pub status: String,
    pub resolved_at: Option<String>,
}

impl CommandRow {
    pub fn into_command(self) -> Result<Command, LogError> {
        let action = CommandAction::parse(&self.action)
            .ok_or_else(|| LogError::Corrupt(format!("command {} action '{}'", self.id, self.action)))?;
        let status = CommandStatus::parse(&self.status)
            .ok_or_else(|| LogError::Corrupt(format!("command {} status '{}'", self.id, self.status)))?;

        Ok(Command {
            command_id: self.id,
            device_id: self.device_id,
            action,
            issued_by: self.issued_by,
            issued_at: parse_ts(&self.issued_at, self.id)?,
            status,
            resolved_at: match self.resolved_at {
                Some(ts) => Some(parse_ts(&ts, self.id)?),
                None => None,
            },
        })
    }
}

pub struct DeviceRow {
    pub id: String,
    pub owner_member_id: String,
    pub family_id: String,
}

pub struct EmergencyRow {
    pub id: i64,
    pub family_id: String,
    pub action: String,
    pub issued_by: String,
    pub issued_at: String,
    pub resolved_at: Option<String>,
}

impl EmergencyRow {
    pub fn into_event(self) -> Result<EmergencyEvent, LogError> {
        let action = CommandAction::parse(&self.action)
            .ok_or_else(|| LogError::Corrupt(format!("emergency {} action '{}'", self.id, self.action)))?;

        Ok(EmergencyEvent {
            event_id: self.id,
            family_id: self.family_id,
            action,
            issued_by: self.issued_by,
            issued_at: parse_ts(&self.issued_at, self.id)?,
            resolved_at: match self.resolved_at {
                Some(ts) => Some(parse_ts(&ts, self.id)?),
                None => None,
            },
        })
    }
}

fn parse_ts(s: &str, id: i64) -> Result<DateTime<Utc>, LogError> {
    s.parse::<DateTime<Utc>>()
        .map_err(|e| LogError::Corrupt(format!("row {} timestamp '{}': {}", id, s, e)))
}
