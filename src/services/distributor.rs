//! Round-robin request distribution
//!
//! The cursor lives in the database so every engine instance sharing the file
//! continues one rotation. A pick reads `(position, version)`, takes
//! `pool[position % n]` and advances with a compare-and-swap on `version`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rusqlite::Connection;
use tracing::{debug, info};

use super::admin_pool::AdminPool;
use crate::db::requests::{self, NewRequest};
use crate::db::{admins, users, EngineDb, Request, RequestType};
use crate::error::EngineError;
use crate::money::Money;
use crate::retry::RetryPolicy;

pub struct RequestDistributor {
    db: Arc<EngineDb>,
    pool: Arc<AdminPool>,
    retry: RetryPolicy,
    /// admin_id -> assignments made by this instance
    counts: DashMap<String, AtomicUsize>,
}

impl RequestDistributor {
    pub fn new(db: Arc<EngineDb>, pool: Arc<AdminPool>, retry: RetryPolicy) -> Self {
        Self {
            db,
            pool,
            retry,
            counts: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &Arc<AdminPool> {
        &self.pool
    }

    /// One pick against the shared cursor inside the caller's transaction.
    ///
    /// A lost compare-and-swap is reported as [`EngineError::Contention`].
    pub fn assign_in(&self, conn: &Connection) -> Result<String, EngineError> {
        let snapshot = self.pool.snapshot();
        let seen = admins::read_cursor(conn)?;
        let admin = snapshot.at(seen.position)?;

        if !admins::advance_cursor(conn, seen)? {
            debug!(version = seen.version, "Rotation cursor moved, retrying");
            return Err(EngineError::Contention);
        }

        debug!(
            admin_id = %admin.id,
            position = seen.position,
            generation = snapshot.generation,
            "Picked admin"
        );
        Ok(admin.id.clone())
    }

    /// Pick the next admin for a request of this type and amount
    pub async fn assign(&self, request_type: RequestType, amount: Money) -> Result<String, EngineError> {
        let admin_id = self
            .retry
            .run("assign", || self.db.with_tx(|tx| self.assign_in(tx)))
            .await
            .map_err(exhausted)?;

        self.note_assignment(&admin_id);
        debug!(admin_id = %admin_id, request_type = %request_type, amount = %amount, "Assigned");
        Ok(admin_id)
    }

    /// Assign and insert a request in one transaction.
    ///
    /// A failed insert rolls the cursor advance back with it, so no rotation
    /// slot is consumed.
    pub async fn create_request(
        &self,
        request_type: RequestType,
        user_id: &str,
        amount: Money,
        metadata_json: Option<String>,
    ) -> Result<Request, EngineError> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidInput(format!("Amount must be positive, got {}", amount)));
        }

        let request = self
            .retry
            .run("create_request", || {
                self.db.with_tx(|tx| {
                    users::require_user(tx, user_id)?;
                    let admin_id = self.assign_in(tx)?;
                    requests::insert_request(tx, &NewRequest {
                        request_type,
                        user_id,
                        amount,
                        assigned_admin_id: &admin_id,
                        metadata_json: metadata_json.clone(),
                    })
                })
            })
            .await
            .map_err(exhausted)?;

        self.note_assignment(&request.assigned_admin_id);
        info!(
            request_id = %request.id,
            request_type = %request.request_type,
            user_id = %request.user_id,
            amount = %request.amount,
            admin_id = %request.assigned_admin_id,
            "Request created"
        );
        Ok(request)
    }

    fn note_assignment(&self, admin_id: &str) {
        self.counts
            .entry(admin_id.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Assignments made by this instance, per admin
    pub fn assignment_counts(&self) -> HashMap<String, usize> {
        self.counts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

/// Contention that outlived its retries is a processing failure to callers
fn exhausted(e: EngineError) -> EngineError {
    match e {
        EngineError::Contention => {
            EngineError::ProcessingFailed("Rotation cursor contention persisted after retries".into())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::AdminLevel;

    async fn setup(admin_ids: &[&str]) -> (Arc<EngineDb>, RequestDistributor) {
        let db = Arc::new(EngineDb::open_in_memory().unwrap());
        db.with_tx(|tx| {
            users::create_user(tx, "alice")?;
            for id in admin_ids {
                admins::create_admin(tx, id, AdminLevel::Low, true)?;
            }
            Ok(())
        })
        .unwrap();
        let pool = Arc::new(AdminPool::new(db.clone()).unwrap());
        let distributor = RequestDistributor::new(db.clone(), pool, RetryPolicy::once());
        (db, distributor)
    }

    fn m(s: &str) -> Money {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_seven_assignments_over_three_admins() {
        let (_db, distributor) = setup(&["C", "A", "B"]).await;

        let mut picks = vec![];
        for _ in 0..7 {
            picks.push(distributor.assign(RequestType::Purchase, m("10")).await.unwrap());
        }
        assert_eq!(picks, vec!["A", "B", "C", "A", "B", "C", "A"]);

        let counts = distributor.assignment_counts();
        assert_eq!(counts["A"], 3);
        assert_eq!(counts["B"], 2);
        assert_eq!(counts["C"], 2);
    }

    #[tokio::test]
    async fn test_spread_is_at_most_one() {
        let (_db, distributor) = setup(&["a1", "a2", "a3", "a4"]).await;

        for _ in 0..23 {
            distributor
                .create_request(RequestType::Withdrawal, "alice", m("1"), None)
                .await
                .unwrap();
        }

        let counts = distributor.assignment_counts();
        let max = counts.values().max().copied().unwrap();
        let min = counts.values().min().copied().unwrap();
        assert_eq!(counts.len(), 4);
        assert!(max - min <= 1);
    }

    #[tokio::test]
    async fn test_empty_pool_fails() {
        let (_db, distributor) = setup(&[]).await;
        let err = distributor.assign(RequestType::Upgrade, m("5")).await.unwrap_err();
        assert!(matches!(err, EngineError::AdminPoolEmpty));
    }

    #[tokio::test]
    async fn test_failed_insert_does_not_consume_slot() {
        let (db, distributor) = setup(&["A", "B"]).await;

        let err = distributor
            .create_request(RequestType::Purchase, "ghost", m("10"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UserNotFound(_)));
        assert_eq!(db.with_conn(admins::read_cursor).unwrap().position, 0);

        let request = distributor
            .create_request(RequestType::Purchase, "alice", m("10"), None)
            .await
            .unwrap();
        assert_eq!(request.assigned_admin_id, "A");
    }

    #[tokio::test]
    async fn test_refresh_restarts_rotation() {
        let (db, distributor) = setup(&["A", "B", "C"]).await;
        distributor.assign(RequestType::Purchase, m("1")).await.unwrap();
        distributor.assign(RequestType::Purchase, m("1")).await.unwrap();

        db.with_tx(|tx| admins::set_active(tx, "A", false)).unwrap();
        distributor.pool().refresh().unwrap();

        let next = distributor.assign(RequestType::Purchase, m("1")).await.unwrap();
        assert_eq!(next, "B");
    }
}
