use crate::LogError;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<(), LogError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS devices (
            id               TEXT PRIMARY KEY,
            owner_member_id  TEXT NOT NULL,
            family_id        TEXT NOT NULL,
            registered_at    TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_devices_family
            ON devices(family_id);

        CREATE TABLE IF NOT EXISTS commands (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id   TEXT NOT NULL REFERENCES devices(id),
            action      TEXT NOT NULL,
            issued_by   TEXT NOT NULL,
            issued_at   TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'issued',
            resolved_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_commands_device
            ON commands(device_id, id DESC);

        -- At most one unresolved command per device, enforced durably
        CREATE UNIQUE INDEX IF NOT EXISTS idx_commands_pending
            ON commands(device_id) WHERE status = 'issued';

        CREATE TABLE IF NOT EXISTS emergency_events (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            family_id   TEXT NOT NULL,
            action      TEXT NOT NULL,
            issued_by   TEXT NOT NULL,
            issued_at   TEXT NOT NULL,
            resolved_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_emergency_family
            ON emergency_events(family_id, id DESC);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
