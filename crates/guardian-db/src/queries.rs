//! Device registration and emergency-event persistence.

use chrono::{DateTime, Utc};

use guardian_types::models::{CommandAction, EmergencyEvent};

use crate::models::{DeviceRow, EmergencyRow};
use crate::{Database, LogError};

impl Database {
    // -- Devices --

    /// Idempotent upsert: creates the device if new, leaves an existing
    /// row untouched.
    pub fn upsert_device(
        &self,
        device_id: &str,
        owner_member_id: &str,
        family_id: &str,
    ) -> Result<(), LogError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO devices (id, owner_member_id, family_id) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO NOTHING",
                (device_id, owner_member_id, family_id),
            )?;
            Ok(())
        })
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRow>, LogError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, owner_member_id, family_id FROM devices ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(DeviceRow {
                        id: row.get(0)?,
                        owner_member_id: row.get(1)?,
                        family_id: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn family_device_ids(&self, family_id: &str) -> Result<Vec<String>, LogError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM devices WHERE family_id = ?1 ORDER BY id")?;
            let ids = stmt
                .query_map([family_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    // -- Emergency events --

    pub fn record_emergency(
        &self,
        family_id: &str,
        action: CommandAction,
        issued_by: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<i64, LogError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO emergency_events (family_id, action, issued_by, issued_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![family_id, action.as_str(), issued_by, issued_at.to_rfc3339()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Close out every unresolved emergency for a family. Returns how many
    /// events were resolved.
    pub fn resolve_open_emergencies(
        &self,
        family_id: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<usize, LogError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE emergency_events SET resolved_at = ?1
                 WHERE family_id = ?2 AND resolved_at IS NULL",
                rusqlite::params![resolved_at.to_rfc3339(), family_id],
            )?;
            Ok(n)
        })
    }

    pub fn family_emergencies(
        &self,
        family_id: &str,
        limit: u32,
    ) -> Result<Vec<EmergencyEvent>, LogError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, family_id, action, issued_by, issued_at, resolved_at
                 FROM emergency_events WHERE family_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![family_id, limit], |row| {
                    Ok(EmergencyRow {
                        id: row.get(0)?,
                        family_id: row.get(1)?,
                        action: row.get(2)?,
                        issued_by: row.get(3)?,
                        issued_at: row.get(4)?,
                        resolved_at: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(EmergencyRow::into_event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_device("dev-1", "member-1", "fam-1").unwrap();
        // Re-registering must not clobber the original owner
        db.upsert_device("dev-1", "member-2", "fam-2").unwrap();

        let devices = db.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].owner_member_id, "member-1");
        assert_eq!(devices[0].family_id, "fam-1");
    }

    #[test]
    fn emergency_audit_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        let id = db
            .record_emergency("fam-1", CommandAction::EmergencyLockdown, "parent", now)
            .unwrap();
        assert_eq!(db.resolve_open_emergencies("fam-1", now).unwrap(), 1);
        assert_eq!(db.resolve_open_emergencies("fam-1", now).unwrap(), 0);

        let events = db.family_emergencies("fam-1", 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, id);
        assert_eq!(events[0].action, CommandAction::EmergencyLockdown);
        assert!(events[0].resolved_at.is_some());
    }
}
