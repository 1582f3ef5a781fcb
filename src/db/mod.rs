//! SQLite repository for users, referral edges, bonuses and requests
//!
//! ## Tables
//!
//! - `users` - Balances and aggregate counters (integer cents)
//! - `referral_edges` - Materialized ancestor edges, levels 1..=4
//! - `bonus_records` - Append-only referral bonuses, unique per source and level
//! - `earnings_history` - Append-only earnings entries
//! - `admins` - Reviewing administrators
//! - `requests` - Purchase/upgrade/withdrawal requests
//! - `rotation_cursor` - Shared round-robin cursor (single row)
//! - `audit_log` - Audit trail written after successful transitions
//!
//! Every grouped write runs through [`EngineDb::with_tx`], which opens a
//! `BEGIN IMMEDIATE` transaction: the write lock is taken up front so balance
//! rows are never read and then written under a weaker lock.

pub mod schema;
pub mod models;
pub mod users;
pub mod referrals;
pub mod bonuses;
pub mod admins;
pub mod requests;
pub mod audit_log;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::EngineError;

/// SQLite database shared by all engine components
pub struct EngineDb {
    conn: Mutex<Connection>,
}

impl EngineDb {
    /// Open or create the engine database
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, EngineError> {
        info!("Opening SQLite database at {:?}", path);

        let conn = Connection::open(path)
            .map_err(|e| EngineError::ProcessingFailed(format!("Failed to open SQLite: {}", e)))?;

        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| EngineError::ProcessingFailed(format!("Failed to set PRAGMA: {}", e)))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, EngineError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::ProcessingFailed(format!("Failed to open in-memory SQLite: {}", e)))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), EngineError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read (or single-statement write) against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, EngineError>,
    {
        let conn = self.conn.lock()
            .map_err(|e| EngineError::ProcessingFailed(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run `f` inside one immediate transaction: commit on `Ok`, roll back on `Err`
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, EngineError>,
    {
        let mut conn = self.conn.lock()
            .map_err(|e| EngineError::ProcessingFailed(format!("Lock poisoned: {}", e)))?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| EngineError::ProcessingFailed(format!("Failed to begin transaction: {}", e)))?;

        // Dropping an uncommitted transaction rolls it back
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| EngineError::ProcessingFailed(format!("Commit failed: {}", e)))?;
        Ok(value)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, EngineError> {
        self.with_conn(|conn| {
            let user_count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            let pending_requests: i64 = conn.query_row(
                "SELECT COUNT(*) FROM requests WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;
            let processed_requests: i64 = conn.query_row(
                "SELECT COUNT(*) FROM requests WHERE status != 'pending'",
                [],
                |row| row.get(0),
            )?;
            let (bonus_count, bonus_total): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(amount), 0) FROM bonus_records",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let active_admins: i64 = conn.query_row(
                "SELECT COUNT(*) FROM admins WHERE active = 1",
                [],
                |row| row.get(0),
            )?;

            Ok(DbStats {
                user_count,
                pending_requests,
                processed_requests,
                bonus_count,
                bonus_total: crate::money::Money::from_cents(bonus_total),
                active_admins,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbStats {
    pub user_count: i64,
    pub pending_requests: i64,
    pub processed_requests: i64,
    pub bonus_count: i64,
    pub bonus_total: crate::money::Money,
    pub active_admins: i64,
}

// Re-exports
pub use models::{
    current_timestamp, Admin, AdminLevel, AuditLogEntry, BonusRecord, EarningsEntry,
    EarningsEntryType, ReferralEdge, Request, RequestMetadata, RequestStatus, RequestType,
    SourceType, User,
};
