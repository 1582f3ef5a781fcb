//! User rows

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::models::{current_timestamp, User};
use crate::error::EngineError;

const USER_COLUMNS: &str = "id, inviter_id, balance, total_earnings, total_referral_bonus, \
     total_withdrawn, total_invested, vip_level, created_at";

fn user_from_row(row: &Row) -> Result<User, rusqlite::Error> {
    Ok(User {
        id: row.get("id")?,
        inviter_id: row.get("inviter_id")?,
        balance: row.get("balance")?,
        total_earnings: row.get("total_earnings")?,
        total_referral_bonus: row.get("total_referral_bonus")?,
        total_withdrawn: row.get("total_withdrawn")?,
        total_invested: row.get("total_invested")?,
        vip_level: row.get("vip_level")?,
        invite_counts: [0; 4], // Loaded separately
        created_at: row.get("created_at")?,
    })
}

/// Create a user with zeroed balances
pub fn create_user(conn: &Connection, id: &str) -> Result<User, EngineError> {
    if id.trim().is_empty() {
        return Err(EngineError::InvalidInput("user id is required".into()));
    }

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO users (id, created_at) VALUES (?1, ?2)",
        params![id, current_timestamp()],
    )?;
    if inserted == 0 {
        return Err(EngineError::InvalidInput(format!("User already exists: {}", id)));
    }

    debug!(user_id = %id, "Created user");
    require_user(conn, id)
}

/// Get user by ID, including per-level downline counts
pub fn get_user(conn: &Connection, id: &str) -> Result<Option<User>, EngineError> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
    let user = conn
        .query_row(&sql, params![id], |row| user_from_row(row))
        .optional()?;

    match user {
        Some(mut user) => {
            user.invite_counts = super::referrals::invite_counts(conn, id)?;
            Ok(Some(user))
        }
        None => Ok(None),
    }
}

/// Get user by ID or fail with `UserNotFound`
pub fn require_user(conn: &Connection, id: &str) -> Result<User, EngineError> {
    get_user(conn, id)?.ok_or_else(|| EngineError::UserNotFound(id.to_string()))
}

pub fn user_exists(conn: &Connection, id: &str) -> Result<bool, EngineError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Direct inviter of a user: `None` if the user does not exist, `Some(None)` at a root
pub fn get_inviter(conn: &Connection, id: &str) -> Result<Option<Option<String>>, EngineError> {
    Ok(conn
        .query_row("SELECT inviter_id FROM users WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?)
}

/// Set the inviter of a user that has none yet
pub fn set_inviter(conn: &Connection, id: &str, inviter_id: &str) -> Result<(), EngineError> {
    let updated = conn.execute(
        "UPDATE users SET inviter_id = ?1 WHERE id = ?2 AND inviter_id IS NULL",
        params![inviter_id, id],
    )?;
    if updated == 0 {
        return Err(EngineError::InvalidInput(format!("User {} already has an inviter", id)));
    }
    Ok(())
}

/// Level-1 invitees of a user, oldest first
pub fn direct_invitees(conn: &Connection, inviter_id: &str) -> Result<Vec<String>, EngineError> {
    let mut stmt = conn.prepare("SELECT id FROM users WHERE inviter_id = ?1 ORDER BY created_at, id")?;
    let ids = stmt
        .query_map(params![inviter_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}
