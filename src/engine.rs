//! Engine facade
//!
//! [`ReferralEngine`] is the async surface callers use. It runs each
//! operation's transaction through the services (retrying transient
//! failures), then records audit entries, emits events and sends
//! notifications once the transaction has committed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::requests::{self, RequestQuery};
use crate::db::{
    admins, bonuses, users, Admin, AdminLevel, BonusRecord, DbStats, EarningsEntry, EngineDb,
    Request, RequestMetadata, RequestStatus, RequestType, SourceType, User,
};
use crate::error::EngineError;
use crate::money::Money;
use crate::retry::RetryPolicy;
use crate::services::audit::{actions, SYSTEM_ACTOR};
use crate::services::referral_graph::attach_in;
use crate::services::{
    admin_pool, AttachOutcome, AuditSink, DbAuditSink, Decision, EarningOutcome, Effects,
    EngineEvent, EventBus, NotificationDispatcher, NotificationKind, Recipient, Services,
};

/// Engine-wide statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    #[serde(flatten)]
    pub db: DbStats,
    pub pool_generation: u64,
    pub pool_admin_ids: Vec<String>,
    pub assignment_counts: HashMap<String, usize>,
}

pub struct ReferralEngine {
    db: Arc<EngineDb>,
    services: Services,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn NotificationDispatcher>,
    retry: RetryPolicy,
    config: Config,
}

impl ReferralEngine {
    /// Open the database under `config.data_dir` and build the engine
    pub fn open(config: Config) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db = Arc::new(EngineDb::open(&config.database_path(), config.busy_timeout())?);
        Self::new(db, config)
    }

    /// Build the engine over an existing database.
    ///
    /// Audit goes to the `audit_log` table and notifications onto the event bus.
    pub fn new(db: Arc<EngineDb>, config: Config) -> Result<Self, EngineError> {
        config.validate()?;
        let services = Services::new(db.clone(), &config)?;

        Ok(Self {
            audit: Arc::new(DbAuditSink::new(db.clone())),
            notifier: services.events.clone(),
            retry: RetryPolicy::from(&config.retry),
            db,
            services,
            config,
        })
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn db(&self) -> &Arc<EngineDb> {
        &self.db
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.services.events.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ========================================================================
    // Referrals and earnings
    // ========================================================================

    /// Create a user and, if given, attach them to their inviter atomically
    pub async fn register_user(&self, user_id: &str, inviter_id: Option<&str>) -> Result<User, EngineError> {
        let max_walk = self.services.graph.max_walk();
        let (user, outcome) = self
            .retried("register_user", json!({ "userId": user_id }), || {
                self.db.with_tx(|tx| {
                    users::create_user(tx, user_id)?;
                    let outcome = match inviter_id {
                        Some(inviter) => Some(attach_in(tx, user_id, inviter, max_walk)?),
                        None => None,
                    };
                    Ok((users::require_user(tx, user_id)?, outcome))
                })
            })
            .await?;

        info!(user_id = %user_id, inviter = ?inviter_id, "User registered");
        if let (Some(inviter), Some(outcome)) = (inviter_id, outcome) {
            self.after_attach(user_id, inviter, &outcome).await;
        }
        Ok(user)
    }

    /// Attach `invitee_id` under `inviter_id`; repeating an existing link is a no-op
    pub async fn register_referral(&self, invitee_id: &str, inviter_id: &str) -> Result<AttachOutcome, EngineError> {
        let outcome = self
            .retried(
                "register_referral",
                json!({ "inviteeId": invitee_id, "inviterId": inviter_id }),
                || self.services.graph.attach(invitee_id, inviter_id),
            )
            .await?;

        self.after_attach(invitee_id, inviter_id, &outcome).await;
        Ok(outcome)
    }

    async fn after_attach(&self, invitee_id: &str, inviter_id: &str, outcome: &AttachOutcome) {
        if !outcome.newly_attached {
            return;
        }

        self.audit.record(
            SYSTEM_ACTOR,
            actions::REFERRAL_REGISTERED,
            &format!("{} joined under {}", invitee_id, inviter_id),
            json!({
                "inviteeId": invitee_id,
                "inviterId": inviter_id,
                "edgesWritten": outcome.edges_written,
            }),
        );
        self.services.events.emit(EngineEvent::ReferralAttached {
            invitee_id: invitee_id.to_string(),
            inviter_id: inviter_id.to_string(),
            edges_written: outcome.edges_written,
        });
        self.notify(
            Recipient::User(inviter_id.to_string()),
            NotificationKind::NewReferral,
            json!({ "inviteeId": invitee_id }),
        )
        .await;
    }

    /// Record an earning event and cascade referral bonuses up to four levels
    pub async fn record_earning_event(
        &self,
        source_type: SourceType,
        user_id: &str,
        source_id: &str,
        amount: Money,
    ) -> Result<EarningOutcome, EngineError> {
        let outcome = self
            .retried(
                "record_earning_event",
                json!({
                    "sourceType": source_type,
                    "userId": user_id,
                    "sourceId": source_id,
                    "amount": amount,
                }),
                || self.services.cascade.record_event(source_type, user_id, source_id, amount),
            )
            .await?;

        if outcome.earner_credited || !outcome.bonuses.is_empty() {
            self.audit.record(
                SYSTEM_ACTOR,
                actions::EARNING_RECORDED,
                &format!("{} earning {} for {}", source_type, amount, user_id),
                json!({
                    "sourceType": source_type,
                    "sourceId": source_id,
                    "userId": user_id,
                    "amount": amount,
                    "bonusCount": outcome.bonuses.len(),
                }),
            );
        }
        self.announce_bonuses(&outcome.bonuses).await;
        Ok(outcome)
    }

    async fn announce_bonuses(&self, records: &[BonusRecord]) {
        for record in records {
            self.services.events.emit(EngineEvent::BonusPaid {
                inviter_id: record.inviter_id.clone(),
                invitee_id: record.invitee_id.clone(),
                level: record.level,
                amount: record.amount,
                source_type: record.source_type,
                source_id: record.source_id.clone(),
            });
            self.notify(
                Recipient::User(record.inviter_id.clone()),
                NotificationKind::ReferralBonus,
                json!({
                    "amount": record.amount,
                    "level": record.level,
                    "fromUserId": record.invitee_id,
                    "sourceType": record.source_type,
                }),
            )
            .await;
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Create a pending request assigned to the next admin in rotation.
    ///
    /// `metadata` must be a JSON object when given; a `vipLevel` key is
    /// applied to the user when the request is approved.
    pub async fn create_request(
        &self,
        request_type: RequestType,
        user_id: &str,
        amount: Money,
        metadata: Option<serde_json::Value>,
    ) -> Result<Request, EngineError> {
        let metadata_json = match metadata {
            Some(value) if value.is_object() => {
                serde_json::from_value::<RequestMetadata>(value.clone())
                    .map_err(|e| EngineError::InvalidInput(format!("Invalid request metadata: {}", e)))?;
                Some(serde_json::to_string(&value)?)
            }
            Some(serde_json::Value::Null) | None => None,
            Some(_) => return Err(EngineError::InvalidInput("Request metadata must be an object".into())),
        };

        let request = match self
            .services
            .distributor
            .create_request(request_type, user_id, amount, metadata_json)
            .await
        {
            Ok(request) => request,
            Err(e) => {
                if e.is_retryable() {
                    self.escalate(
                        "create_request",
                        &e,
                        json!({ "requestType": request_type, "userId": user_id, "amount": amount }),
                    );
                }
                return Err(e);
            }
        };

        self.audit.record(
            user_id,
            actions::REQUEST_CREATED,
            &format!("{} request for {} assigned to {}", request.request_type, request.amount, request.assigned_admin_id),
            json!({
                "requestId": request.id,
                "requestType": request.request_type,
                "amount": request.amount,
                "assignedAdminId": request.assigned_admin_id,
            }),
        );
        self.services.events.emit(EngineEvent::RequestCreated {
            request_id: request.id.clone(),
            request_type: request.request_type,
            user_id: request.user_id.clone(),
            assigned_admin_id: request.assigned_admin_id.clone(),
        });
        self.notify(
            Recipient::Admin(request.assigned_admin_id.clone()),
            NotificationKind::RequestAssigned,
            json!({
                "requestId": request.id,
                "requestType": request.request_type,
                "userId": request.user_id,
                "amount": request.amount,
            }),
        )
        .await;

        Ok(request)
    }

    /// Approve or reject a pending request
    pub async fn process_request(
        &self,
        request_id: &str,
        admin_id: &str,
        decision: Decision,
        notes: Option<&str>,
    ) -> Result<Effects, EngineError> {
        let effects = self
            .retried(
                "process_request",
                json!({ "requestId": request_id, "adminId": admin_id, "decision": decision }),
                || self.services.approval.process_request(request_id, admin_id, decision, notes),
            )
            .await?;

        let request = &effects.request;
        let (action, kind) = match request.status {
            RequestStatus::Approved => (actions::REQUEST_APPROVED, NotificationKind::RequestApproved),
            _ => (actions::REQUEST_REJECTED, NotificationKind::RequestRejected),
        };

        self.audit.record(
            admin_id,
            action,
            &format!("{} {} request {}", admin_id, request.status, request.id),
            json!({
                "requestId": request.id,
                "requestType": request.request_type,
                "userId": request.user_id,
                "amount": request.amount,
                "ledger": effects.ledger,
                "bonusCount": effects.bonuses.len(),
                "notes": notes,
            }),
        );
        self.services.events.emit(EngineEvent::RequestResolved {
            request_id: request.id.clone(),
            status: request.status,
            admin_id: admin_id.to_string(),
        });
        self.notify(
            Recipient::User(request.user_id.clone()),
            kind,
            json!({
                "requestId": request.id,
                "requestType": request.request_type,
                "amount": request.amount,
                "notes": notes,
            }),
        )
        .await;
        self.announce_bonuses(&effects.bonuses).await;

        Ok(effects)
    }

    /// Requests assigned to an admin, oldest first
    pub async fn get_assigned_requests(
        &self,
        admin_id: &str,
        status: Option<RequestStatus>,
    ) -> Result<Vec<Request>, EngineError> {
        let query = RequestQuery {
            assigned_admin_id: Some(admin_id.to_string()),
            status,
            limit: u32::MAX,
            ..Default::default()
        };
        self.db.with_conn(|conn| requests::list_requests(conn, &query))
    }

    pub async fn get_request(&self, request_id: &str) -> Result<Request, EngineError> {
        self.db.with_conn(|conn| requests::require_request(conn, request_id))
    }

    // ========================================================================
    // Admins
    // ========================================================================

    pub async fn add_admin(&self, admin_id: &str, level: AdminLevel, active: bool) -> Result<Admin, EngineError> {
        let admin = self
            .retried("add_admin", json!({ "adminId": admin_id, "level": level }), || {
                self.db.with_tx(|tx| admins::create_admin(tx, admin_id, level, active))
            })
            .await?;

        self.audit.record(
            SYSTEM_ACTOR,
            actions::ADMIN_STATUS_CHANGED,
            &format!("Added {} admin {}", level, admin_id),
            json!({ "adminId": admin_id, "level": level, "active": active }),
        );
        if admin.in_rotation() {
            self.services.pool.refresh_if_changed()?;
        }
        Ok(admin)
    }

    /// Activate or deactivate an admin.
    ///
    /// The rotation restarts only when the set of active low-level admins
    /// actually changed.
    pub async fn set_admin_active(&self, admin_id: &str, active: bool) -> Result<Admin, EngineError> {
        let admin = self
            .retried("set_admin_active", json!({ "adminId": admin_id, "active": active }), || {
                self.db.with_tx(|tx| {
                    if !admins::set_active(tx, admin_id, active)? {
                        return Err(EngineError::InvalidInput(format!("Admin not found: {}", admin_id)));
                    }
                    admins::get_admin(tx, admin_id)?
                        .ok_or_else(|| EngineError::InvalidInput(format!("Admin not found: {}", admin_id)))
                })
            })
            .await?;

        self.audit.record(
            SYSTEM_ACTOR,
            actions::ADMIN_STATUS_CHANGED,
            &format!("{} admin {}", if active { "Activated" } else { "Deactivated" }, admin_id),
            json!({ "adminId": admin_id, "active": active }),
        );
        self.services.pool.refresh_if_changed()?;
        Ok(admin)
    }

    pub async fn list_admins(&self) -> Result<Vec<Admin>, EngineError> {
        self.db.with_conn(admins::list_admins)
    }

    /// Start the periodic admin pool refresh
    pub fn spawn_pool_refresh(&self) -> tokio::task::JoinHandle<()> {
        admin_pool::spawn_refresh_task(self.services.pool.clone(), self.config.pool_refresh_interval())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn user(&self, user_id: &str) -> Result<User, EngineError> {
        self.db.with_conn(|conn| users::require_user(conn, user_id))
    }

    pub async fn bonus_records_for(&self, inviter_id: &str, limit: u32) -> Result<Vec<BonusRecord>, EngineError> {
        self.db
            .with_conn(|conn| bonuses::records_for_inviter(conn, inviter_id, i64::from(limit)))
    }

    pub async fn earnings_for(&self, user_id: &str, limit: u32) -> Result<Vec<EarningsEntry>, EngineError> {
        self.db
            .with_conn(|conn| bonuses::earnings_for_user(conn, user_id, i64::from(limit)))
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let snapshot = self.services.pool.snapshot();
        Ok(EngineStats {
            db: self.db.stats()?,
            pool_generation: snapshot.generation,
            pool_admin_ids: snapshot.admin_ids(),
            assignment_counts: self.services.distributor.assignment_counts(),
        })
    }

    // ========================================================================
    // Collaborators
    // ========================================================================

    async fn retried<T, F>(&self, operation: &str, context: serde_json::Value, f: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Result<T, EngineError>,
    {
        match self.retry.run(operation, f).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_retryable() {
                    self.escalate(operation, &e, context);
                }
                Err(e)
            }
        }
    }

    /// A transient failure outlived its retries; leave a trail for manual reconciliation
    fn escalate(&self, operation: &str, e: &EngineError, context: serde_json::Value) {
        error!(operation, error = %e, context = %context, "Operation failed after retries, reconciliation required");
        self.audit.record(
            SYSTEM_ACTOR,
            actions::RECONCILIATION_REQUIRED,
            &format!("{} failed after {} attempts: {}", operation, self.retry.max_attempts, e),
            json!({ "operation": operation, "error": e.to_string(), "context": context }),
        );
    }

    async fn notify(&self, recipient: Recipient, kind: NotificationKind, payload: serde_json::Value) {
        if let Err(e) = self.notifier.notify(recipient.clone(), kind, payload).await {
            warn!(recipient = ?recipient, kind = ?kind, error = %e, "Notification failed");
        }
    }
}
