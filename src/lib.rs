//! Referral Core - referral bonus cascade and request distribution engine
//!
//! Tracks who invited whom, pays a fixed share of every earning event to up
//! to four upline levels, and routes purchase/upgrade/withdrawal requests to
//! admins in round-robin order for approval.
//!
//! ## Architecture
//!
//! - **ReferralGraph**: invite links with materialized ancestor edges (levels 1-4)
//! - **BonusCascadeEngine**: 20% / 10% / 5% / 2% bonuses, idempotent per source
//! - **AdminPool**: active low-level admins, refreshed periodically
//! - **RequestDistributor**: shared versioned rotation cursor
//! - **ApprovalStateMachine**: `pending -> approved | rejected`, effects in one transaction
//!
//! Money is integer cents ([`Money`]); bonuses round half-up to the cent.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/referral-core/
//! ├── engine.db              # SQLite database (WAL)
//! └── config.toml            # Configuration
//! ```

pub mod config;
pub mod error;
pub mod money;
pub mod retry;
pub mod db;
pub mod ledger;
pub mod services;
pub mod engine;

// Re-exports
pub use config::Config;
pub use error::EngineError;
pub use money::{Money, Rate};
pub use retry::RetryPolicy;
pub use db::{
    Admin, AdminLevel, BonusRecord, EarningsEntry, EngineDb, Request, RequestStatus, RequestType,
    SourceType, User,
};
pub use engine::{EngineStats, ReferralEngine};
pub use services::{
    AuditSink, Decision, Effects, EngineEvent, EventBus, LedgerEffect, NotificationDispatcher,
    NotificationKind, Recipient,
};
