//! Referral graph - inviter chains and materialized ancestor edges
//!
//! The authoritative link is `users.inviter_id`. At attach time the first four
//! ancestors are materialized into `referral_edges`, so bonus lookups read one
//! indexed query instead of re-walking the chain. Walks are iterative and
//! capped by `max_walk`; a revisit or an exhausted cap is treated as a cycle.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::db::referrals::{self, MAX_EDGE_LEVEL};
use crate::db::{users, EngineDb, ReferralEdge};
use crate::error::EngineError;

/// An upline member and its distance from the origin (1 = direct inviter)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ancestor {
    pub user_id: String,
    pub depth: u32,
}

/// Result of attaching an invitee
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachOutcome {
    /// Ancestors within the bonus horizon, nearest first
    pub ancestors: Vec<Ancestor>,
    /// Edges written by this call (0 on a clean retry)
    pub edges_written: usize,
    /// False when the invitee was already attached to this inviter
    pub newly_attached: bool,
}

/// Lazy walk up the `inviter_id` chain, nearest ancestor first.
///
/// Stops at the root or at `max_depth`; the first error ends the walk.
pub struct AncestorWalk<'c> {
    conn: &'c Connection,
    origin: String,
    next: Option<String>,
    depth: u32,
    max_depth: u32,
    max_walk: usize,
    visited: HashSet<String>,
    started: bool,
    done: bool,
}

impl<'c> AncestorWalk<'c> {
    pub fn new(conn: &'c Connection, origin: &str, max_depth: u32, max_walk: usize) -> Self {
        let mut visited = HashSet::new();
        visited.insert(origin.to_string());
        Self {
            conn,
            origin: origin.to_string(),
            next: None,
            depth: 0,
            max_depth,
            max_walk,
            visited,
            started: false,
            done: false,
        }
    }

    fn fail(&mut self, err: EngineError) -> Option<Result<Ancestor, EngineError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for AncestorWalk<'_> {
    type Item = Result<Ancestor, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.depth >= self.max_depth {
            return None;
        }

        if !self.started {
            self.started = true;
            match users::get_inviter(self.conn, &self.origin) {
                Ok(Some(inviter)) => self.next = inviter,
                Ok(None) => return self.fail(EngineError::UserNotFound(self.origin.clone())),
                Err(e) => return self.fail(e),
            }
        }

        let current = match self.next.take() {
            Some(id) => id,
            None => {
                self.done = true;
                return None;
            }
        };

        if self.visited.contains(&current) || self.visited.len() > self.max_walk {
            return self.fail(EngineError::CycleDetected {
                invitee: current,
                inviter: self.origin.clone(),
            });
        }
        self.visited.insert(current.clone());
        self.depth += 1;

        match users::get_inviter(self.conn, &current) {
            Ok(Some(inviter)) => self.next = inviter,
            Ok(None) => return self.fail(EngineError::UserNotFound(current)),
            Err(e) => return self.fail(e),
        }

        Some(Ok(Ancestor {
            user_id: current,
            depth: self.depth,
        }))
    }
}

/// Ancestors of `user_id` up to `max_depth`, nearest first.
///
/// Depths inside the bonus horizon come from materialized edges; deeper
/// requests walk the chain.
pub fn ancestors_in(
    conn: &Connection,
    user_id: &str,
    max_depth: u32,
    max_walk: usize,
) -> Result<Vec<Ancestor>, EngineError> {
    if max_depth == 0 {
        return Ok(vec![]);
    }
    if !users::user_exists(conn, user_id)? {
        return Err(EngineError::UserNotFound(user_id.to_string()));
    }

    if max_depth <= MAX_EDGE_LEVEL as u32 {
        let edges = referrals::ancestor_edges(conn, user_id, max_depth as u8)?;
        return Ok(edges
            .into_iter()
            .map(|edge| Ancestor {
                user_id: edge.inviter_id,
                depth: edge.level as u32,
            })
            .collect());
    }

    AncestorWalk::new(conn, user_id, max_depth, max_walk).collect()
}

/// Attach `invitee_id` under `inviter_id` inside the caller's transaction
pub fn attach_in(
    conn: &Connection,
    invitee_id: &str,
    inviter_id: &str,
    max_walk: usize,
) -> Result<AttachOutcome, EngineError> {
    if invitee_id == inviter_id {
        return Err(EngineError::CycleDetected {
            invitee: invitee_id.to_string(),
            inviter: inviter_id.to_string(),
        });
    }

    let current_inviter = users::get_inviter(conn, invitee_id)?
        .ok_or_else(|| EngineError::UserNotFound(invitee_id.to_string()))?;
    if !users::user_exists(conn, inviter_id)? {
        return Err(EngineError::InviterNotFound(inviter_id.to_string()));
    }

    let newly_attached = match current_inviter.as_deref() {
        None => true,
        Some(existing) if existing == inviter_id => false,
        Some(existing) => {
            return Err(EngineError::InvalidInput(format!(
                "User {} is already attached to inviter {}",
                invitee_id, existing
            )));
        }
    };

    // The whole chain is checked for the invitee, not just the bonus horizon
    let mut ancestors = vec![Ancestor {
        user_id: inviter_id.to_string(),
        depth: 1,
    }];
    for step in AncestorWalk::new(conn, inviter_id, u32::MAX, max_walk) {
        let step = step?;
        if step.user_id == invitee_id {
            return Err(EngineError::CycleDetected {
                invitee: invitee_id.to_string(),
                inviter: inviter_id.to_string(),
            });
        }
        if step.depth < MAX_EDGE_LEVEL as u32 {
            ancestors.push(Ancestor {
                user_id: step.user_id,
                depth: step.depth + 1,
            });
        }
    }

    if newly_attached {
        users::set_inviter(conn, invitee_id, inviter_id)?;
    }

    let mut edges_written = 0;
    for ancestor in &ancestors {
        let edge = ReferralEdge {
            inviter_id: ancestor.user_id.clone(),
            invitee_id: invitee_id.to_string(),
            level: ancestor.depth as u8,
        };
        if referrals::insert_edge(conn, &edge)? {
            edges_written += 1;
        }
    }

    // An invitee with its own downline links that downline to the new ancestors
    for below in referrals::descendant_edges(conn, invitee_id, MAX_EDGE_LEVEL)? {
        for ancestor in &ancestors {
            let level = below.level as u32 + ancestor.depth;
            if level > MAX_EDGE_LEVEL as u32 {
                continue;
            }
            let edge = ReferralEdge {
                inviter_id: ancestor.user_id.clone(),
                invitee_id: below.invitee_id.clone(),
                level: level as u8,
            };
            if referrals::insert_edge(conn, &edge)? {
                edges_written += 1;
            }
        }
    }

    debug!(
        invitee = %invitee_id,
        inviter = %inviter_id,
        ancestors = ancestors.len(),
        edges_written,
        "Attached referral"
    );

    Ok(AttachOutcome {
        ancestors,
        edges_written,
        newly_attached,
    })
}

/// Referral graph service
pub struct ReferralGraph {
    db: Arc<EngineDb>,
    max_walk: usize,
}

impl ReferralGraph {
    pub fn new(db: Arc<EngineDb>, max_walk: usize) -> Self {
        Self { db, max_walk }
    }

    pub fn max_walk(&self) -> usize {
        self.max_walk
    }

    /// Attach an invitee under an inviter; retrying the same pair is harmless
    pub fn attach(&self, invitee_id: &str, inviter_id: &str) -> Result<AttachOutcome, EngineError> {
        let outcome = self
            .db
            .with_tx(|tx| attach_in(tx, invitee_id, inviter_id, self.max_walk))?;

        if outcome.newly_attached {
            info!(invitee = %invitee_id, inviter = %inviter_id, "Referral registered");
        }
        Ok(outcome)
    }

    pub fn ancestors_of(&self, user_id: &str, max_depth: u32) -> Result<Vec<Ancestor>, EngineError> {
        self.db
            .with_conn(|conn| ancestors_in(conn, user_id, max_depth, self.max_walk))
    }

    /// Downline size per level, index 0 = level 1
    pub fn invite_counts(&self, user_id: &str) -> Result<[i64; 4], EngineError> {
        self.db.with_conn(|conn| {
            if !users::user_exists(conn, user_id)? {
                return Err(EngineError::UserNotFound(user_id.to_string()));
            }
            referrals::invite_counts(conn, user_id)
        })
    }

    pub fn direct_invitees(&self, user_id: &str) -> Result<Vec<String>, EngineError> {
        self.db.with_conn(|conn| users::direct_invitees(conn, user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_users(ids: &[&str]) -> ReferralGraph {
        let db = Arc::new(EngineDb::open_in_memory().unwrap());
        db.with_tx(|tx| {
            for id in ids {
                users::create_user(tx, id)?;
            }
            Ok(())
        })
        .unwrap();
        ReferralGraph::new(db, 1_000)
    }

    /// u0 invited by u1, u1 by u2, ... (u_{n-1} is the root)
    fn chain(graph: &ReferralGraph, len: usize) {
        for i in (0..len - 1).rev() {
            graph.attach(&format!("u{}", i), &format!("u{}", i + 1)).unwrap();
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("u{}", i)).collect()
    }

    #[test]
    fn test_ancestors_stop_at_horizon_and_root() {
        let names = ids(7);
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let graph = graph_with_users(&refs);
        chain(&graph, 7);

        let ancestors = graph.ancestors_of("u0", 4).unwrap();
        let got: Vec<(&str, u32)> = ancestors.iter().map(|a| (a.user_id.as_str(), a.depth)).collect();
        assert_eq!(got, vec![("u1", 1), ("u2", 2), ("u3", 3), ("u4", 4)]);

        // Near the root the chain is shorter than the horizon
        let ancestors = graph.ancestors_of("u4", 4).unwrap();
        assert_eq!(ancestors.len(), 2);

        // Beyond the horizon the chain is walked
        let ancestors = graph.ancestors_of("u0", 10).unwrap();
        assert_eq!(ancestors.len(), 6);
        assert_eq!(ancestors.last().unwrap().user_id, "u6");
        assert_eq!(ancestors.last().unwrap().depth, 6);

        // Restartable: a second call yields the same sequence
        assert_eq!(graph.ancestors_of("u0", 10).unwrap(), ancestors);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let graph = graph_with_users(&["a", "b", "c"]);
        graph.attach("b", "a").unwrap();
        graph.attach("c", "b").unwrap();

        let err = graph.attach("a", "c").unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected { .. }));

        let err = graph.attach("a", "a").unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected { .. }));

        // Nothing was written by the failed attach
        assert_eq!(graph.ancestors_of("a", 4).unwrap(), vec![]);
    }

    #[test]
    fn test_missing_inviter_and_invitee() {
        let graph = graph_with_users(&["a"]);
        assert!(matches!(
            graph.attach("a", "ghost").unwrap_err(),
            EngineError::InviterNotFound(id) if id == "ghost"
        ));
        assert!(matches!(
            graph.attach("ghost", "a").unwrap_err(),
            EngineError::UserNotFound(_)
        ));
    }

    #[test]
    fn test_attach_is_idempotent_and_single_inviter() {
        let graph = graph_with_users(&["a", "b", "c"]);
        let first = graph.attach("b", "a").unwrap();
        assert!(first.newly_attached);
        assert_eq!(first.edges_written, 1);

        let retry = graph.attach("b", "a").unwrap();
        assert!(!retry.newly_attached);
        assert_eq!(retry.edges_written, 0);

        let err = graph.attach("b", "c").unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_existing_downline_gets_new_ancestors() {
        let graph = graph_with_users(&["root", "mid", "leaf", "leaf2"]);
        graph.attach("leaf", "mid").unwrap();
        graph.attach("leaf2", "leaf").unwrap();

        // mid joins under root after already having a downline
        let outcome = graph.attach("mid", "root").unwrap();
        assert_eq!(outcome.edges_written, 3);

        let ancestors = graph.ancestors_of("leaf2", 4).unwrap();
        let got: Vec<&str> = ancestors.iter().map(|a| a.user_id.as_str()).collect();
        assert_eq!(got, vec!["leaf", "mid", "root"]);

        assert_eq!(graph.invite_counts("root").unwrap(), [1, 1, 1, 0]);
        assert_eq!(graph.direct_invitees("mid").unwrap(), vec!["leaf".to_string()]);
    }

    #[test]
    fn test_walk_cap_reports_cycle() {
        let names = ids(8);
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let db = Arc::new(EngineDb::open_in_memory().unwrap());
        db.with_tx(|tx| {
            for id in &refs {
                users::create_user(tx, id)?;
            }
            Ok(())
        })
        .unwrap();
        let graph = ReferralGraph::new(db, 1_000);
        chain(&graph, 8);

        let short = ReferralGraph::new(graph.db.clone(), 3);
        let err = short.ancestors_of("u0", 10).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected { .. }));
    }
}
