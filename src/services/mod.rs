//! Service layer for referral-core
//!
//! Services hold the business rules between the engine facade and the
//! repository modules. Each one either runs its own transaction or joins the
//! caller's (`*_in` functions take a `&Connection`).
//!
//! ## Architecture
//!
//! ```text
//! ReferralEngine (async facade, audit + notification after commit)
//!     ↓
//! Service Layer (graph, cascade, pool, distributor, approval)
//!     ↓
//! Repository Layer (db/*.rs, ledger.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod audit;
pub mod referral_graph;
pub mod bonus_cascade;
pub mod admin_pool;
pub mod distributor;
pub mod approval;

// Re-exports
pub use events::{EngineEvent, EventBus};
pub use audit::{AuditSink, DbAuditSink, NotificationDispatcher, NotificationKind, Recipient, TracingAuditSink};
pub use referral_graph::{Ancestor, AttachOutcome, ReferralGraph};
pub use bonus_cascade::{BonusCascadeEngine, BonusSchedule, EarningOutcome};
pub use admin_pool::{AdminPool, PoolSnapshot};
pub use distributor::RequestDistributor;
pub use approval::{ApprovalStateMachine, Decision, Effects, LedgerEffect};

use std::sync::Arc;

use crate::config::Config;
use crate::db::EngineDb;
use crate::error::EngineError;
use crate::retry::RetryPolicy;

/// Service container
///
/// Holds all services over one shared database.
pub struct Services {
    pub graph: Arc<ReferralGraph>,
    pub cascade: Arc<BonusCascadeEngine>,
    pub pool: Arc<AdminPool>,
    pub distributor: Arc<RequestDistributor>,
    pub approval: Arc<ApprovalStateMachine>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Create all services with shared database
    pub fn new(db: Arc<EngineDb>, config: &Config) -> Result<Self, EngineError> {
        let events = Arc::new(EventBus::new());

        let graph = Arc::new(ReferralGraph::new(db.clone(), config.max_ancestor_walk));
        let cascade = Arc::new(BonusCascadeEngine::from_config(db.clone(), config));
        let pool = Arc::new(AdminPool::new(db.clone())?.with_events(events.clone()));
        let distributor = Arc::new(RequestDistributor::new(
            db.clone(),
            pool.clone(),
            RetryPolicy::from(&config.retry),
        ));
        let approval = Arc::new(ApprovalStateMachine::new(db, cascade.clone()));

        Ok(Self {
            graph,
            cascade,
            pool,
            distributor,
            approval,
            events,
        })
    }
}
