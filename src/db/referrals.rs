//! Materialized referral edges

use rusqlite::{params, Connection};

use super::models::{current_timestamp, ReferralEdge};
use crate::error::EngineError;

/// Deepest materialized edge level
pub const MAX_EDGE_LEVEL: u8 = 4;

/// Insert an edge if `(invitee, level)` has none yet; returns whether a row was written
pub fn insert_edge(conn: &Connection, edge: &ReferralEdge) -> Result<bool, EngineError> {
    if edge.level == 0 || edge.level > MAX_EDGE_LEVEL {
        return Err(EngineError::LevelOutOfRange(edge.level));
    }

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO referral_edges (inviter_id, invitee_id, level, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![edge.inviter_id, edge.invitee_id, edge.level as i64, current_timestamp()],
    )?;
    Ok(inserted > 0)
}

/// Ancestors of an invitee up to `max_level`, nearest first
pub fn ancestor_edges(
    conn: &Connection,
    invitee_id: &str,
    max_level: u8,
) -> Result<Vec<ReferralEdge>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT inviter_id, invitee_id, level FROM referral_edges
         WHERE invitee_id = ?1 AND level <= ?2
         ORDER BY level",
    )?;
    let edges = stmt
        .query_map(params![invitee_id, max_level as i64], edge_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(edges)
}

/// Downline of an inviter strictly above `below_level`, shallowest first
pub fn descendant_edges(
    conn: &Connection,
    inviter_id: &str,
    below_level: u8,
) -> Result<Vec<ReferralEdge>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT inviter_id, invitee_id, level FROM referral_edges
         WHERE inviter_id = ?1 AND level < ?2
         ORDER BY level, invitee_id",
    )?;
    let edges = stmt
        .query_map(params![inviter_id, below_level as i64], edge_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(edges)
}

/// Downline size per level, index 0 = level 1
pub fn invite_counts(conn: &Connection, inviter_id: &str) -> Result<[i64; 4], EngineError> {
    let mut stmt = conn.prepare(
        "SELECT level, COUNT(*) FROM referral_edges WHERE inviter_id = ?1 GROUP BY level",
    )?;
    let rows = stmt
        .query_map(params![inviter_id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = [0i64; 4];
    for (level, count) in rows {
        if (1..=MAX_EDGE_LEVEL as i64).contains(&level) {
            counts[(level - 1) as usize] = count;
        }
    }
    Ok(counts)
}

fn edge_from_row(row: &rusqlite::Row) -> Result<ReferralEdge, rusqlite::Error> {
    let level: i64 = row.get(2)?;
    Ok(ReferralEdge {
        inviter_id: row.get(0)?,
        invitee_id: row.get(1)?,
        level: level as u8,
    })
}
