//! Audit log rows

use rusqlite::{params, Connection};
use uuid::Uuid;

use super::models::{current_timestamp, AuditLogEntry};
use crate::error::EngineError;

pub fn insert_entry(
    conn: &Connection,
    actor_id: &str,
    action: &str,
    description: &str,
    metadata: Option<&serde_json::Value>,
) -> Result<AuditLogEntry, EngineError> {
    let entry = AuditLogEntry {
        id: Uuid::new_v4().to_string(),
        actor_id: actor_id.to_string(),
        action: action.to_string(),
        description: description.to_string(),
        metadata_json: metadata.map(|m| m.to_string()),
        created_at: current_timestamp(),
    };

    conn.execute(
        "INSERT INTO audit_log (id, actor_id, action, description, metadata_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.id,
            entry.actor_id,
            entry.action,
            entry.description,
            entry.metadata_json,
            entry.created_at,
        ],
    )?;
    Ok(entry)
}

/// Entries for an action, newest first
pub fn entries_for_action(
    conn: &Connection,
    action: &str,
    limit: i64,
) -> Result<Vec<AuditLogEntry>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM audit_log WHERE action = ?1 ORDER BY created_at DESC LIMIT ?2",
    )?;
    let entries = stmt
        .query_map(params![action, limit], |row| {
            Ok(AuditLogEntry {
                id: row.get("id")?,
                actor_id: row.get("actor_id")?,
                action: row.get("action")?,
                description: row.get("description")?,
                metadata_json: row.get("metadata_json")?,
                created_at: row.get("created_at")?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}
