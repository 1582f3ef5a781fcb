//! Bonus records and earnings history (both append-only)

use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use super::models::{
    current_timestamp, BonusRecord, EarningsEntry, EarningsEntryType, SourceType,
};
use crate::error::EngineError;
use crate::money::Money;

/// Input for a bonus record; id and timestamp are assigned on insert
#[derive(Debug, Clone)]
pub struct NewBonusRecord<'a> {
    pub inviter_id: &'a str,
    pub invitee_id: &'a str,
    pub level: u8,
    pub amount: Money,
    pub source_type: SourceType,
    pub source_id: &'a str,
}

/// Input for an earnings entry
#[derive(Debug, Clone)]
pub struct NewEarningsEntry<'a> {
    pub user_id: &'a str,
    pub amount: Money,
    pub entry_type: EarningsEntryType,
    pub source_type: SourceType,
    pub source_id: &'a str,
    pub description: String,
}

/// Insert a bonus record; `None` when `(source_type, source_id, level)` was already paid
pub fn insert_bonus_record(
    conn: &Connection,
    input: &NewBonusRecord<'_>,
) -> Result<Option<BonusRecord>, EngineError> {
    let record = BonusRecord {
        id: Uuid::new_v4().to_string(),
        inviter_id: input.inviter_id.to_string(),
        invitee_id: input.invitee_id.to_string(),
        level: input.level,
        amount: input.amount,
        source_type: input.source_type,
        source_id: input.source_id.to_string(),
        created_at: current_timestamp(),
    };

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO bonus_records
            (id, inviter_id, invitee_id, level, amount, source_type, source_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.id,
            record.inviter_id,
            record.invitee_id,
            record.level as i64,
            record.amount,
            record.source_type,
            record.source_id,
            record.created_at,
        ],
    )?;

    Ok((inserted > 0).then_some(record))
}

/// All bonuses paid for one source event, by level
pub fn records_for_source(
    conn: &Connection,
    source_type: SourceType,
    source_id: &str,
) -> Result<Vec<BonusRecord>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM bonus_records WHERE source_type = ?1 AND source_id = ?2 ORDER BY level",
    )?;
    let records = stmt
        .query_map(params![source_type, source_id], bonus_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Bonuses received by an inviter, newest first
pub fn records_for_inviter(
    conn: &Connection,
    inviter_id: &str,
    limit: i64,
) -> Result<Vec<BonusRecord>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM bonus_records WHERE inviter_id = ?1
         ORDER BY created_at DESC, level LIMIT ?2",
    )?;
    let records = stmt
        .query_map(params![inviter_id, limit], bonus_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Insert an earnings entry; returns false if the same entry was already recorded
pub fn insert_earnings_entry(
    conn: &Connection,
    input: &NewEarningsEntry<'_>,
) -> Result<bool, EngineError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO earnings_history
            (id, user_id, amount, entry_type, source_type, source_id, description, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            Uuid::new_v4().to_string(),
            input.user_id,
            input.amount,
            input.entry_type,
            input.source_type,
            input.source_id,
            input.description,
            current_timestamp(),
        ],
    )?;
    Ok(inserted > 0)
}

/// Earnings history of a user, newest first
pub fn earnings_for_user(
    conn: &Connection,
    user_id: &str,
    limit: i64,
) -> Result<Vec<EarningsEntry>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM earnings_history WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2",
    )?;
    let entries = stmt
        .query_map(params![user_id, limit], |row| {
            Ok(EarningsEntry {
                id: row.get("id")?,
                user_id: row.get("user_id")?,
                amount: row.get("amount")?,
                entry_type: row.get("entry_type")?,
                source_type: row.get("source_type")?,
                source_id: row.get("source_id")?,
                description: row.get("description")?,
                created_at: row.get("created_at")?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

fn bonus_from_row(row: &Row) -> Result<BonusRecord, rusqlite::Error> {
    let level: i64 = row.get("level")?;
    Ok(BonusRecord {
        id: row.get("id")?,
        inviter_id: row.get("inviter_id")?,
        invitee_id: row.get("invitee_id")?,
        level: level as u8,
        amount: row.get("amount")?,
        source_type: row.get("source_type")?,
        source_id: row.get("source_id")?,
        created_at: row.get("created_at")?,
    })
}
