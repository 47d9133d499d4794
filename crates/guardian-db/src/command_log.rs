//! Append-only, per-device ordered record of issued commands.
//!
//! Identifiers come from the table's AUTOINCREMENT rowid, so they are
//! strictly increasing and sortable. Entries are never deleted; resolution
//! only moves a command out of `issued` (audit trail).

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use guardian_types::models::{Command, CommandAction, CommandStatus};

use crate::models::CommandRow;
use crate::{Database, LogError};

const COMMAND_COLS: &str = "id, device_id, action, issued_by, issued_at, status, resolved_at";

impl Database {
    /// Append a new `issued` command and return its id.
    pub fn append_command(
        &self,
        device_id: &str,
        action: CommandAction,
        issued_by: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<i64, LogError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO commands (device_id, action, issued_by, issued_at, status)
                 VALUES (?1, ?2, ?3, ?4, 'issued')",
                rusqlite::params![
                    device_id,
                    action.as_str(),
                    issued_by,
                    issued_at.to_rfc3339()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_command(&self, command_id: i64) -> Result<Option<Command>, LogError> {
        let row = self.with_conn(|conn| query_command(conn, command_id))?;
        row.map(CommandRow::into_command).transpose()
    }

    /// The single `issued` command for a device, if any.
    pub fn get_pending(&self, device_id: &str) -> Result<Option<Command>, LogError> {
        let row = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM commands WHERE device_id = ?1 AND status = 'issued'",
                COMMAND_COLS
            ))?;
            let row = stmt.query_row([device_id], map_command_row).optional()?;
            Ok(row)
        })?;
        row.map(CommandRow::into_command).transpose()
    }

    /// Transition a command out of `issued`.
    ///
    /// Fails with `NotFound` for an unknown id and `AlreadyResolved` when
    /// the command is already terminal — the latter is a success for
    /// idempotence purposes and the caller must not re-publish.
    pub fn mark_resolved(
        &self,
        command_id: i64,
        new_status: CommandStatus,
        resolved_at: DateTime<Utc>,
    ) -> Result<(), LogError> {
        self.with_conn(|conn| {
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM commands WHERE id = ?1",
                    [command_id],
                    |row| row.get(0),
                )
                .optional()?;

            let current = current.ok_or(LogError::NotFound(command_id))?;
            let current = CommandStatus::parse(&current)
                .ok_or_else(|| LogError::Corrupt(format!("command {} status '{}'", command_id, current)))?;

            if current.is_terminal() {
                return Err(LogError::AlreadyResolved(command_id));
            }

            conn.execute(
                "UPDATE commands SET status = ?1, resolved_at = ?2 WHERE id = ?3",
                rusqlite::params![new_status.as_str(), resolved_at.to_rfc3339(), command_id],
            )?;
            Ok(())
        })
    }

    /// Command history for a device, newest first. Pure read, restartable.
    pub fn command_history(&self, device_id: &str, limit: u32) -> Result<Vec<Command>, LogError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM commands WHERE device_id = ?1 ORDER BY id DESC LIMIT ?2",
                COMMAND_COLS
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![device_id, limit], map_command_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(CommandRow::into_command).collect()
    }

    /// All `issued` commands older than the cutoff, for the expiry sweep.
    pub fn stale_commands(&self, cutoff: DateTime<Utc>) -> Result<Vec<Command>, LogError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM commands WHERE status = 'issued' AND issued_at < ?1 ORDER BY id",
                COMMAND_COLS
            ))?;
            let rows = stmt
                .query_map([cutoff.to_rfc3339()], map_command_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(CommandRow::into_command).collect()
    }

    /// Every unresolved command, for registry bootstrap after a restart.
    pub fn pending_commands(&self) -> Result<Vec<Command>, LogError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM commands WHERE status = 'issued' ORDER BY id",
                COMMAND_COLS
            ))?;
            let rows = stmt
                .query_map([], map_command_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(CommandRow::into_command).collect()
    }
}

fn query_command(conn: &Connection, command_id: i64) -> Result<Option<CommandRow>, LogError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM commands WHERE id = ?1",
        COMMAND_COLS
    ))?;
    let row = stmt.query_row([command_id], map_command_row).optional()?;
    Ok(row)
}

fn map_command_row(row: &rusqlite::Row<'_>) -> Result<CommandRow, rusqlite::Error> {
    Ok(CommandRow {
        id: row.get(0)?,
        device_id: row.get(1)?,
        action: row.get(2)?,
        issued_by: row.get(3)?,
        issued_at: row.get(4)?,
        status: row.get(5)?,
        resolved_at: row.get(6)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, LogError>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, LogError> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn db_with_device(device_id: &str) -> Database {
        let db = Database::open_in_memory().unwrap();
        db.upsert_device(device_id, "member-1", "fam-1").unwrap();
        db
    }

    #[test]
    fn append_assigns_increasing_ids() {
        let db = db_with_device("dev-1");
        let now = Utc::now();

        let first = db.append_command("dev-1", CommandAction::Lock, "parent", now).unwrap();
        db.mark_resolved(first, CommandStatus::Superseded, now).unwrap();
        let second = db.append_command("dev-1", CommandAction::Unlock, "parent", now).unwrap();

        assert!(second > first);
    }

    #[test]
    fn pending_returns_only_issued() {
        let db = db_with_device("dev-1");
        let now = Utc::now();

        let id = db.append_command("dev-1", CommandAction::Lock, "parent", now).unwrap();
        let pending = db.get_pending("dev-1").unwrap().unwrap();
        assert_eq!(pending.command_id, id);
        assert_eq!(pending.status, CommandStatus::Issued);

        db.mark_resolved(id, CommandStatus::Acknowledged, now).unwrap();
        assert!(db.get_pending("dev-1").unwrap().is_none());
    }

    #[test]
    fn resolve_is_idempotent() {
        let db = db_with_device("dev-1");
        let now = Utc::now();

        let id = db.append_command("dev-1", CommandAction::Lock, "parent", now).unwrap();
        db.mark_resolved(id, CommandStatus::Acknowledged, now).unwrap();

        // Second resolution is a typed no-op, and the status must not move
        let err = db.mark_resolved(id, CommandStatus::Expired, now).unwrap_err();
        assert!(matches!(err, LogError::AlreadyResolved(i) if i == id));

        let cmd = db.get_command(id).unwrap().unwrap();
        assert_eq!(cmd.status, CommandStatus::Acknowledged);
    }

    #[test]
    fn resolve_unknown_is_not_found() {
        let db = db_with_device("dev-1");
        let err = db
            .mark_resolved(999, CommandStatus::Acknowledged, Utc::now())
            .unwrap_err();
        assert!(matches!(err, LogError::NotFound(999)));
    }

    #[test]
    fn history_is_newest_first() {
        let db = db_with_device("dev-1");
        let now = Utc::now();

        let a = db.append_command("dev-1", CommandAction::Lock, "parent", now).unwrap();
        db.mark_resolved(a, CommandStatus::Superseded, now).unwrap();
        let b = db.append_command("dev-1", CommandAction::Unlock, "parent", now).unwrap();
        db.mark_resolved(b, CommandStatus::Acknowledged, now).unwrap();
        let c = db.append_command("dev-1", CommandAction::Lock, "parent", now).unwrap();

        let history = db.command_history("dev-1", 10).unwrap();
        let ids: Vec<i64> = history.iter().map(|c| c.command_id).collect();
        assert_eq!(ids, vec![c, b, a]);

        let limited = db.command_history("dev-1", 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn duplicate_pending_rejected_by_storage() {
        let db = db_with_device("dev-1");
        let now = Utc::now();

        db.append_command("dev-1", CommandAction::Lock, "parent", now).unwrap();
        // The partial unique index backs the single-outstanding invariant
        let err = db
            .append_command("dev-1", CommandAction::Unlock, "parent", now)
            .unwrap_err();
        assert!(matches!(err, LogError::StorageUnavailable(_)));
    }

    #[test]
    fn stale_sweep_selects_old_issued_only() {
        let db = db_with_device("dev-1");
        db.upsert_device("dev-2", "member-2", "fam-1").unwrap();

        let old = Utc::now() - chrono::Duration::seconds(120);
        let id = db.append_command("dev-1", CommandAction::Lock, "parent", old).unwrap();
        db.append_command("dev-2", CommandAction::Lock, "parent", Utc::now()).unwrap();

        let cutoff = Utc::now() - chrono::Duration::seconds(30);
        let stale = db.stale_commands(cutoff).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].command_id, id);
    }
}
