//! Admin pool - the set of admins requests rotate over
//!
//! Only active low-level admins are in rotation; high-level admins review by
//! override. The pool keeps an in-memory snapshot ordered by admin id and a
//! generation counter. Every snapshot change resets the shared rotation
//! cursor to 0 so fairness restarts from the new membership.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use super::events::{EngineEvent, EventBus};
use crate::db::{admins, current_timestamp, Admin, EngineDb};
use crate::error::EngineError;

/// Immutable view of the rotation pool
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub admins: Vec<Admin>,
    pub generation: u64,
    pub refreshed_at: String,
}

impl PoolSnapshot {
    pub fn len(&self) -> usize {
        self.admins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admins.is_empty()
    }

    pub fn admin_ids(&self) -> Vec<String> {
        self.admins.iter().map(|a| a.id.clone()).collect()
    }

    /// Admin at a cursor position (wraps around the pool)
    pub fn at(&self, position: i64) -> Result<&Admin, EngineError> {
        if self.admins.is_empty() {
            return Err(EngineError::AdminPoolEmpty);
        }
        let index = position.rem_euclid(self.admins.len() as i64) as usize;
        Ok(&self.admins[index])
    }

    fn same_members(&self, admins: &[Admin]) -> bool {
        self.admins.len() == admins.len()
            && self.admins.iter().zip(admins).all(|(a, b)| a.id == b.id)
    }
}

pub struct AdminPool {
    db: Arc<EngineDb>,
    snapshot: RwLock<Arc<PoolSnapshot>>,
    generation: AtomicU64,
    events: Option<Arc<EventBus>>,
}

impl AdminPool {
    /// Load the current pool. The cursor is left where it is so a restart
    /// continues the rotation other instances are already following.
    pub fn new(db: Arc<EngineDb>) -> Result<Self, EngineError> {
        let admins = db.with_conn(admins::list_rotation_admins)?;
        info!(admins = admins.len(), "Admin pool loaded");

        Ok(Self {
            db,
            snapshot: RwLock::new(Arc::new(PoolSnapshot {
                admins,
                generation: 0,
                refreshed_at: current_timestamp(),
            })),
            generation: AtomicU64::new(0),
            events: None,
        })
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Active rotation admins, ordered by id ascending
    pub fn active_admins(&self) -> Vec<Admin> {
        self.snapshot().admins.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Re-read membership, replace the snapshot and reset the cursor
    pub fn refresh(&self) -> Result<Arc<PoolSnapshot>, EngineError> {
        let admins = self.db.with_tx(|tx| reload_and_reset(tx))?;
        Ok(self.install(admins))
    }

    /// Refresh only when membership changed since the last snapshot.
    ///
    /// Returns the new snapshot when one was installed.
    pub fn refresh_if_changed(&self) -> Result<Option<Arc<PoolSnapshot>>, EngineError> {
        let current = self.snapshot();
        let admins = self.db.with_tx(|tx| {
            let admins = admins::list_rotation_admins(tx)?;
            if current.same_members(&admins) {
                return Ok(None);
            }
            admins::reset_cursor(tx)?;
            Ok(Some(admins))
        })?;

        match admins {
            Some(admins) => Ok(Some(self.install(admins))),
            None => {
                debug!(generation = current.generation, "Admin pool unchanged");
                Ok(None)
            }
        }
    }

    fn install(&self, admins: Vec<Admin>) -> Arc<PoolSnapshot> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(PoolSnapshot {
            admins,
            generation,
            refreshed_at: current_timestamp(),
        });

        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot.clone(),
            Err(poisoned) => *poisoned.into_inner() = snapshot.clone(),
        }

        info!(generation, admins = snapshot.len(), "Admin pool refreshed, rotation cursor reset");
        if let Some(events) = &self.events {
            events.emit(EngineEvent::PoolRefreshed {
                generation,
                admin_ids: snapshot.admin_ids(),
            });
        }
        snapshot
    }
}

fn reload_and_reset(conn: &Connection) -> Result<Vec<Admin>, EngineError> {
    let admins = admins::list_rotation_admins(conn)?;
    admins::reset_cursor(conn)?;
    Ok(admins)
}

/// Spawn the periodic membership refresh
pub fn spawn_refresh_task(pool: Arc<AdminPool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; the pool was just loaded
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = pool.refresh_if_changed() {
                warn!(error = %e, "Periodic admin pool refresh failed");
            }
        }
    })
}
