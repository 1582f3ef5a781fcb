//! Request lifecycle: `pending` -> `approved` | `rejected`
//!
//! The status write is conditional on `status = 'pending'` and runs in the
//! same transaction as the ledger effects it unlocks. Whoever wins the write
//! applies the effects; everyone else gets `RequestAlreadyProcessed` and
//! changes nothing.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::bonus_cascade::BonusCascadeEngine;
use crate::db::requests;
use crate::db::{admins, BonusRecord, EngineDb, Request, RequestStatus, RequestType};
use crate::error::EngineError;
use crate::ledger;
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn status(self) -> RequestStatus {
        match self {
            Decision::Approve => RequestStatus::Approved,
            Decision::Reject => RequestStatus::Rejected,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        })
    }
}

impl FromStr for Decision {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" | "approved" => Ok(Decision::Approve),
            "reject" | "rejected" => Ok(Decision::Reject),
            other => Err(EngineError::InvalidInput(format!("Unknown decision: {}", other))),
        }
    }
}

/// Balance effect of a resolved request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LedgerEffect {
    None,
    #[serde(rename_all = "camelCase")]
    Withdrawn { amount: Money, balance_after: Money },
    #[serde(rename_all = "camelCase")]
    Invested { amount: Money, vip_level: Option<i64> },
}

/// Everything a winning transition changed
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Effects {
    pub request: Request,
    pub ledger: LedgerEffect,
    pub bonuses: Vec<BonusRecord>,
}

pub struct ApprovalStateMachine {
    db: Arc<EngineDb>,
    cascade: Arc<BonusCascadeEngine>,
}

impl ApprovalStateMachine {
    pub fn new(db: Arc<EngineDb>, cascade: Arc<BonusCascadeEngine>) -> Self {
        Self { db, cascade }
    }

    /// Resolve a request in its own transaction
    pub fn process_request(
        &self,
        request_id: &str,
        admin_id: &str,
        decision: Decision,
        notes: Option<&str>,
    ) -> Result<Effects, EngineError> {
        let effects = self
            .db
            .with_tx(|tx| self.process_in(tx, request_id, admin_id, decision, notes))?;

        info!(
            request_id = %request_id,
            admin_id = %admin_id,
            status = %effects.request.status,
            bonuses = effects.bonuses.len(),
            "Request processed"
        );
        Ok(effects)
    }

    pub fn process_in(
        &self,
        conn: &Connection,
        request_id: &str,
        admin_id: &str,
        decision: Decision,
        notes: Option<&str>,
    ) -> Result<Effects, EngineError> {
        let request = requests::require_request(conn, request_id)?;
        authorize(conn, &request, admin_id)?;

        if request.status.is_terminal()
            || !requests::resolve_request(conn, request_id, decision.status(), admin_id, notes)?
        {
            debug!(request_id = %request_id, status = %request.status, "Request no longer pending");
            return Err(EngineError::RequestAlreadyProcessed(request_id.to_string()));
        }

        let mut bonuses = Vec::new();
        let ledger_effect = match (decision, request.request_type) {
            (Decision::Reject, _) => LedgerEffect::None,
            (Decision::Approve, RequestType::Withdrawal) => {
                let balance_after = ledger::debit_withdrawal(conn, &request.user_id, request.amount)?;
                LedgerEffect::Withdrawn {
                    amount: request.amount,
                    balance_after,
                }
            }
            (Decision::Approve, request_type) => {
                let vip_level = request.metadata()?.vip_level;
                ledger::credit_investment(conn, &request.user_id, request.amount, vip_level)?;

                if let Some(source_type) = request_type.bonus_source() {
                    bonuses = self.cascade.cascade_in(
                        conn,
                        source_type,
                        &request.user_id,
                        &request.id,
                        request.amount,
                    )?;
                }
                LedgerEffect::Invested {
                    amount: request.amount,
                    vip_level,
                }
            }
        };

        Ok(Effects {
            request: requests::require_request(conn, request_id)?,
            ledger: ledger_effect,
            bonuses,
        })
    }
}

/// The assignee may decide; an active high-level admin may override
fn authorize(conn: &Connection, request: &Request, admin_id: &str) -> Result<(), EngineError> {
    let allowed = match admins::get_admin(conn, admin_id)? {
        Some(admin) if admin.active => admin.id == request.assigned_admin_id || admin.can_override(),
        _ => false,
    };

    if !allowed {
        return Err(EngineError::NotOwner {
            request_id: request.id.clone(),
            admin_id: admin_id.to_string(),
        });
    }
    Ok(())
}
