//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::EngineError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), EngineError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, EngineError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| EngineError::ProcessingFailed(format!("Failed to create schema_version table: {}", e)))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), EngineError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), EngineError> {
    conn.execute_batch(USERS_SCHEMA)
        .map_err(|e| EngineError::ProcessingFailed(format!("Failed to create user tables: {}", e)))?;

    conn.execute_batch(REQUESTS_SCHEMA)
        .map_err(|e| EngineError::ProcessingFailed(format!("Failed to create request tables: {}", e)))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| EngineError::ProcessingFailed(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

/// Users, referral edges, bonuses and earnings history
const USERS_SCHEMA: &str = r#"
-- Money columns are integer cents
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY NOT NULL,
    inviter_id TEXT REFERENCES users(id),
    balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
    total_earnings INTEGER NOT NULL DEFAULT 0,
    total_referral_bonus INTEGER NOT NULL DEFAULT 0,
    total_withdrawn INTEGER NOT NULL DEFAULT 0,
    total_invested INTEGER NOT NULL DEFAULT 0,
    vip_level INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

-- Materialized ancestor edges, written once per (invitee, level)
CREATE TABLE IF NOT EXISTS referral_edges (
    inviter_id TEXT NOT NULL REFERENCES users(id),
    invitee_id TEXT NOT NULL REFERENCES users(id),
    level INTEGER NOT NULL CHECK (level BETWEEN 1 AND 4),
    created_at TEXT NOT NULL,
    PRIMARY KEY (invitee_id, level)
);

-- Append-only; the unique key makes cascades idempotent per source
CREATE TABLE IF NOT EXISTS bonus_records (
    id TEXT PRIMARY KEY NOT NULL,
    inviter_id TEXT NOT NULL REFERENCES users(id),
    invitee_id TEXT NOT NULL REFERENCES users(id),
    level INTEGER NOT NULL CHECK (level BETWEEN 1 AND 4),
    amount INTEGER NOT NULL CHECK (amount > 0),
    source_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (source_type, source_id, level)
);

CREATE TABLE IF NOT EXISTS earnings_history (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL REFERENCES users(id),
    amount INTEGER NOT NULL,
    entry_type TEXT NOT NULL,
    source_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    description TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (entry_type, source_type, source_id, user_id)
);
"#;

/// Admins, requests, rotation cursor and audit log
const REQUESTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS admins (
    id TEXT PRIMARY KEY NOT NULL,
    level TEXT NOT NULL CHECK (level IN ('high', 'low')),
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS requests (
    id TEXT PRIMARY KEY NOT NULL,
    request_type TEXT NOT NULL,
    user_id TEXT NOT NULL REFERENCES users(id),
    amount INTEGER NOT NULL CHECK (amount > 0),
    status TEXT NOT NULL DEFAULT 'pending',
    assigned_admin_id TEXT NOT NULL REFERENCES admins(id),
    created_at TEXT NOT NULL,
    processed_at TEXT,
    processed_by TEXT,
    admin_notes TEXT,
    metadata_json TEXT
);

-- Single shared rotation cursor; version guards the compare-and-swap
CREATE TABLE IF NOT EXISTS rotation_cursor (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    position INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT
);
INSERT OR IGNORE INTO rotation_cursor (id, position, version) VALUES (1, 0, 0);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY NOT NULL,
    actor_id TEXT NOT NULL,
    action TEXT NOT NULL,
    description TEXT NOT NULL,
    metadata_json TEXT,
    created_at TEXT NOT NULL
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_users_inviter ON users(inviter_id);
CREATE INDEX IF NOT EXISTS idx_edges_inviter ON referral_edges(inviter_id, level);
CREATE INDEX IF NOT EXISTS idx_bonus_inviter ON bonus_records(inviter_id);
CREATE INDEX IF NOT EXISTS idx_earnings_user ON earnings_history(user_id);
CREATE INDEX IF NOT EXISTS idx_requests_admin ON requests(assigned_admin_id, status);
CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status);
CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log(actor_id);
"#;
