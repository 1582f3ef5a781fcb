//! Admin rows and the shared rotation cursor

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::models::{current_timestamp, Admin, AdminLevel};
use crate::error::EngineError;

/// Persisted rotation cursor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorState {
    pub position: i64,
    pub version: i64,
}

fn admin_from_row(row: &Row) -> Result<Admin, rusqlite::Error> {
    Ok(Admin {
        id: row.get("id")?,
        level: row.get("level")?,
        active: row.get("active")?,
        created_at: row.get("created_at")?,
    })
}

pub fn create_admin(
    conn: &Connection,
    id: &str,
    level: AdminLevel,
    active: bool,
) -> Result<Admin, EngineError> {
    if id.trim().is_empty() {
        return Err(EngineError::InvalidInput("admin id is required".into()));
    }

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO admins (id, level, active, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, level, active, current_timestamp()],
    )?;
    if inserted == 0 {
        return Err(EngineError::InvalidInput(format!("Admin already exists: {}", id)));
    }

    debug!(admin_id = %id, level = %level, active, "Created admin");
    get_admin(conn, id)?
        .ok_or_else(|| EngineError::ProcessingFailed("Failed to retrieve created admin".into()))
}

pub fn get_admin(conn: &Connection, id: &str) -> Result<Option<Admin>, EngineError> {
    Ok(conn
        .query_row("SELECT * FROM admins WHERE id = ?1", params![id], admin_from_row)
        .optional()?)
}

/// Toggle the active flag; returns false if the admin does not exist
pub fn set_active(conn: &Connection, id: &str, active: bool) -> Result<bool, EngineError> {
    let updated = conn.execute(
        "UPDATE admins SET active = ?1 WHERE id = ?2",
        params![active, id],
    )?;
    Ok(updated > 0)
}

/// Admins eligible for round-robin, ordered by id ascending
pub fn list_rotation_admins(conn: &Connection) -> Result<Vec<Admin>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM admins WHERE active = 1 AND level = 'low' ORDER BY id ASC",
    )?;
    let admins = stmt
        .query_map([], admin_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(admins)
}

pub fn list_admins(conn: &Connection) -> Result<Vec<Admin>, EngineError> {
    let mut stmt = conn.prepare("SELECT * FROM admins ORDER BY id ASC")?;
    let admins = stmt
        .query_map([], admin_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(admins)
}

// ============================================================================
// Rotation cursor
// ============================================================================

pub fn read_cursor(conn: &Connection) -> Result<CursorState, EngineError> {
    Ok(conn.query_row(
        "SELECT position, version FROM rotation_cursor WHERE id = 1",
        [],
        |row| {
            Ok(CursorState {
                position: row.get(0)?,
                version: row.get(1)?,
            })
        },
    )?)
}

/// Advance the cursor by one if nobody else moved it since `seen` was read
pub fn advance_cursor(conn: &Connection, seen: CursorState) -> Result<bool, EngineError> {
    let updated = conn.execute(
        "UPDATE rotation_cursor
         SET position = position + 1, version = version + 1, updated_at = ?1
         WHERE id = 1 AND version = ?2",
        params![current_timestamp(), seen.version],
    )?;
    Ok(updated == 1)
}

/// Reset the cursor to 0; the version still advances so in-flight CAS attempts lose
pub fn reset_cursor(conn: &Connection) -> Result<CursorState, EngineError> {
    conn.execute(
        "UPDATE rotation_cursor SET position = 0, version = version + 1, updated_at = ?1 WHERE id = 1",
        params![current_timestamp()],
    )?;
    read_cursor(conn)
}
