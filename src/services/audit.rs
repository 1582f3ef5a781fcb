//! Audit and notification collaborators
//!
//! Both are invoked only after a transaction commits. Neither may fail the
//! financial operation that triggered it: audit is fire-and-forget and
//! notification errors are logged and dropped by the caller.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::{audit_log, EngineDb};
use crate::error::EngineError;

/// Audit actions recorded by the engine
pub mod actions {
    pub const REFERRAL_REGISTERED: &str = "referral_registered";
    pub const EARNING_RECORDED: &str = "earning_recorded";
    pub const REQUEST_CREATED: &str = "request_created";
    pub const REQUEST_APPROVED: &str = "request_approved";
    pub const REQUEST_REJECTED: &str = "request_rejected";
    pub const ADMIN_STATUS_CHANGED: &str = "admin_status_changed";
    /// A transient failure outlived its retries and needs manual reconciliation
    pub const RECONCILIATION_REQUIRED: &str = "reconciliation_required";
}

/// Actor id used for engine-initiated audit entries
pub const SYSTEM_ACTOR: &str = "system";

pub trait AuditSink: Send + Sync {
    fn record(&self, actor_id: &str, action: &str, description: &str, metadata: serde_json::Value);
}

/// Writes audit entries to the `audit_log` table.
///
/// An entry the database refuses goes to the fallback sink instead, so a
/// reconciliation entry raised by a storage outage is not lost with it.
pub struct DbAuditSink {
    db: Arc<EngineDb>,
    fallback: Arc<dyn AuditSink>,
}

impl DbAuditSink {
    pub fn new(db: Arc<EngineDb>) -> Self {
        Self {
            db,
            fallback: Arc::new(TracingAuditSink),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn AuditSink>) -> Self {
        self.fallback = fallback;
        self
    }
}

impl AuditSink for DbAuditSink {
    fn record(&self, actor_id: &str, action: &str, description: &str, metadata: serde_json::Value) {
        let result = self.db.with_conn(|conn| {
            audit_log::insert_entry(conn, actor_id, action, description, Some(&metadata))
        });
        if let Err(e) = result {
            warn!(actor = %actor_id, action = %action, error = %e, "Failed to write audit entry");
            self.fallback.record(actor_id, action, description, metadata);
        }
    }
}

/// Emits audit entries as log lines only
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, actor_id: &str, action: &str, description: &str, metadata: serde_json::Value) {
        info!(actor = %actor_id, action = %action, metadata = %metadata, "{}", description);
    }
}

/// Who a notification is for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Recipient {
    User(String),
    Admin(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RequestAssigned,
    RequestApproved,
    RequestRejected,
    ReferralBonus,
    NewReferral,
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(
        &self,
        recipient: Recipient,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) -> Result<(), EngineError>;
}
