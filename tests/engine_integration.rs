//! Integration tests for the referral engine
//!
//! Each test drives the public async API over a file-backed database in a
//! temporary directory.

use std::sync::Arc;

use referral_core::db::AdminLevel;
use referral_core::services::events::EngineEvent;
use referral_core::{
    Config, Decision, EngineError, LedgerEffect, Money, ReferralEngine, RequestStatus, RequestType,
    SourceType,
};
use tempfile::TempDir;

fn m(s: &str) -> Money {
    s.parse().unwrap()
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

/// Helper to create an engine with a temporary data directory
fn create_engine() -> (ReferralEngine, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let engine = ReferralEngine::open(test_config(&temp_dir)).unwrap();
    (engine, temp_dir)
}

/// Register `names` so that names[i] is invited by names[i + 1]
async fn register_chain(engine: &ReferralEngine, names: &[&str]) {
    let mut inviter: Option<&str> = None;
    for name in names.iter().rev() {
        engine.register_user(name, inviter).await.unwrap();
        inviter = Some(*name);
    }
}

#[tokio::test]
async fn test_task_event_cascades_four_levels() {
    let (engine, _temp) = create_engine();
    register_chain(&engine, &["User0", "User1", "User2", "User3", "User4"]).await;

    let outcome = engine
        .record_earning_event(SourceType::Task, "User0", "task-1", m("10.00"))
        .await
        .unwrap();
    assert_eq!(outcome.bonuses.len(), 4);

    for (user, expected) in [("User1", "2.00"), ("User2", "1.00"), ("User3", "0.50"), ("User4", "0.20")] {
        let u = engine.user(user).await.unwrap();
        assert_eq!(u.balance, m(expected), "balance of {user}");
        assert_eq!(u.total_referral_bonus, m(expected));
    }

    // The earner's own task reward
    assert_eq!(engine.user("User0").await.unwrap().balance, m("10.00"));

    let history = engine.earnings_for("User3", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].amount, m("0.50"));
}

#[tokio::test]
async fn test_cascade_stops_at_level_four_and_at_root() {
    let (engine, _temp) = create_engine();
    register_chain(&engine, &["u0", "u1", "u2", "u3", "u4", "u5", "u6"]).await;

    let deep = engine
        .record_earning_event(SourceType::Purchase, "u0", "p-1", m("33.33"))
        .await
        .unwrap();
    let levels: Vec<u8> = deep.bonuses.iter().map(|b| b.level).collect();
    assert_eq!(levels, vec![1, 2, 3, 4]);
    // 33.33 * 2% = 0.6666 -> 0.67
    assert_eq!(deep.bonuses[3].amount, m("0.67"));
    assert_eq!(engine.user("u5").await.unwrap().balance, Money::ZERO);

    let shallow = engine
        .record_earning_event(SourceType::Purchase, "u4", "p-2", m("10.00"))
        .await
        .unwrap();
    assert_eq!(shallow.bonuses.len(), 2);
    assert!(!shallow.earner_credited);
}

#[tokio::test]
async fn test_repeated_earning_event_pays_once() {
    let (engine, _temp) = create_engine();
    register_chain(&engine, &["a", "b"]).await;

    engine.record_earning_event(SourceType::Task, "a", "t-9", m("5.00")).await.unwrap();
    let again = engine.record_earning_event(SourceType::Task, "a", "t-9", m("5.00")).await.unwrap();
    assert!(again.bonuses.is_empty());
    assert!(!again.earner_credited);

    assert_eq!(engine.user("b").await.unwrap().balance, m("1.00"));
    assert_eq!(engine.bonus_records_for("b", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cycle_is_rejected() {
    let (engine, _temp) = create_engine();
    register_chain(&engine, &["a", "b", "c"]).await;
    engine.register_user("d", None).await.unwrap();

    let err = engine.register_referral("c", "a").await.unwrap_err();
    assert!(matches!(err, EngineError::CycleDetected { .. }));

    let err = engine.register_referral("d", "nobody").await.unwrap_err();
    assert!(matches!(err, EngineError::InviterNotFound(_)));

    // Re-registering the existing link is a no-op
    let outcome = engine.register_referral("a", "b").await.unwrap();
    assert!(!outcome.newly_attached);
    assert_eq!(outcome.edges_written, 0);
}

#[tokio::test]
async fn test_round_robin_over_three_admins() {
    let (engine, _temp) = create_engine();
    engine.register_user("alice", None).await.unwrap();
    for id in ["C", "B", "A"] {
        engine.add_admin(id, AdminLevel::Low, true).await.unwrap();
    }

    let mut assigned = vec![];
    for _ in 0..7 {
        let request = engine
            .create_request(RequestType::Purchase, "alice", m("1.00"), None)
            .await
            .unwrap();
        assigned.push(request.assigned_admin_id);
    }
    assert_eq!(assigned, vec!["A", "B", "C", "A", "B", "C", "A"]);

    let pending = engine.get_assigned_requests("A", Some(RequestStatus::Pending)).await.unwrap();
    assert_eq!(pending.len(), 3);
    assert!(engine.get_assigned_requests("A", Some(RequestStatus::Approved)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unchanged_pool_keeps_spread_within_one() {
    let (engine, _temp) = create_engine();
    engine.register_user("alice", None).await.unwrap();
    for id in ["A", "B", "C"] {
        engine.add_admin(id, AdminLevel::Low, true).await.unwrap();
    }
    engine.add_admin("boss", AdminLevel::High, true).await.unwrap();

    for i in 0..9 {
        engine
            .create_request(RequestType::Purchase, "alice", m("1.00"), None)
            .await
            .unwrap();
        // None of these changes who is in rotation
        if i % 2 == 0 {
            engine.set_admin_active("boss", i % 4 != 0).await.unwrap();
        } else {
            engine.set_admin_active("B", true).await.unwrap();
        }
    }

    let counts = engine.stats().await.unwrap().assignment_counts;
    let max = counts.values().max().copied().unwrap();
    let min = ["A", "B", "C"].iter().map(|id| counts.get(*id).copied().unwrap_or(0)).min().unwrap();
    assert!(max - min <= 1, "spread {} in {:?}", max - min, counts);
}

#[tokio::test]
async fn test_two_instances_share_one_rotation() {
    let temp_dir = TempDir::new().unwrap();
    let first = ReferralEngine::open(test_config(&temp_dir)).unwrap();
    first.register_user("alice", None).await.unwrap();
    for id in ["A", "B", "C"] {
        first.add_admin(id, AdminLevel::Low, true).await.unwrap();
    }
    let second = ReferralEngine::open(test_config(&temp_dir)).unwrap();

    let mut assigned = vec![];
    for i in 0..6 {
        let engine = if i % 2 == 0 { &first } else { &second };
        let request = engine
            .create_request(RequestType::Upgrade, "alice", m("2.00"), None)
            .await
            .unwrap();
        assigned.push(request.assigned_admin_id);
    }
    assert_eq!(assigned, vec!["A", "B", "C", "A", "B", "C"]);
}

#[tokio::test]
async fn test_withdrawal_waits_for_sufficient_balance() {
    let (engine, _temp) = create_engine();
    engine.register_user("alice", None).await.unwrap();
    engine.add_admin("a1", AdminLevel::Low, true).await.unwrap();
    engine.record_earning_event(SourceType::Task, "alice", "t-1", m("999.99")).await.unwrap();

    let request = engine
        .create_request(RequestType::Withdrawal, "alice", m("1000.00"), None)
        .await
        .unwrap();

    let err = engine.process_request(&request.id, "a1", Decision::Approve, None).await.unwrap_err();
    assert!(matches!(err, EngineError::InsufficientBalance { .. }));
    assert_eq!(engine.get_request(&request.id).await.unwrap().status, RequestStatus::Pending);
    assert_eq!(engine.user("alice").await.unwrap().balance, m("999.99"));

    engine.record_earning_event(SourceType::Task, "alice", "t-2", m("0.01")).await.unwrap();
    let effects = engine.process_request(&request.id, "a1", Decision::Approve, None).await.unwrap();
    assert_eq!(
        effects.ledger,
        LedgerEffect::Withdrawn { amount: m("1000.00"), balance_after: Money::ZERO }
    );

    let alice = engine.user("alice").await.unwrap();
    assert_eq!(alice.balance, Money::ZERO);
    assert_eq!(alice.total_withdrawn, m("1000.00"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_approvals_apply_once() {
    let (engine, _temp) = create_engine();
    let engine = Arc::new(engine);
    register_chain(&engine, &["buyer", "sponsor"]).await;
    engine.add_admin("low-1", AdminLevel::Low, true).await.unwrap();
    engine.add_admin("high-1", AdminLevel::High, true).await.unwrap();

    let request = engine
        .create_request(RequestType::Purchase, "buyer", m("100.00"), Some(serde_json::json!({ "vipLevel": 3 })))
        .await
        .unwrap();

    let mut handles = vec![];
    for admin in ["low-1", "high-1", "low-1", "high-1"] {
        let engine = engine.clone();
        let id = request.id.clone();
        handles.push(tokio::spawn(async move {
            engine.process_request(&id, admin, Decision::Approve, None).await
        }));
    }

    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => assert!(e.is_already_processed(), "unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);

    let buyer = engine.user("buyer").await.unwrap();
    assert_eq!(buyer.total_invested, m("100.00"));
    assert_eq!(buyer.vip_level, 3);
    assert_eq!(engine.user("sponsor").await.unwrap().balance, m("20.00"));
}

#[tokio::test]
async fn test_events_follow_committed_operations() {
    let (engine, _temp) = create_engine();
    let mut events = engine.events().subscribe();

    register_chain(&engine, &["kid", "parent"]).await;
    engine.add_admin("a1", AdminLevel::Low, true).await.unwrap();
    let request = engine
        .create_request(RequestType::Upgrade, "kid", m("10.00"), None)
        .await
        .unwrap();
    engine.process_request(&request.id, "a1", Decision::Approve, None).await.unwrap();

    let mut seen = vec![];
    while let Ok(event) = events.try_recv() {
        seen.push(match event {
            EngineEvent::ReferralAttached { .. } => "attached",
            EngineEvent::BonusPaid { .. } => "bonus",
            EngineEvent::RequestCreated { .. } => "created",
            EngineEvent::RequestResolved { .. } => "resolved",
            EngineEvent::PoolRefreshed { .. } => "pool",
            EngineEvent::Notification { .. } => continue,
        });
    }
    assert_eq!(seen, vec!["attached", "pool", "created", "resolved", "bonus"]);
}

#[tokio::test]
async fn test_stats_reflect_activity() {
    let (engine, _temp) = create_engine();
    register_chain(&engine, &["x", "y"]).await;
    engine.add_admin("a1", AdminLevel::Low, true).await.unwrap();
    engine.record_earning_event(SourceType::Task, "x", "t-1", m("50.00")).await.unwrap();
    engine.create_request(RequestType::Purchase, "x", m("5.00"), None).await.unwrap();

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.db.user_count, 2);
    assert_eq!(stats.db.pending_requests, 1);
    assert_eq!(stats.db.bonus_count, 1);
    assert_eq!(stats.db.bonus_total, m("10.00"));
    assert_eq!(stats.assignment_counts["a1"], 1);
}

#[test]
fn test_invalid_config_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(&temp_dir);
    config.retry.max_attempts = 0;
    assert!(matches!(ReferralEngine::open(config), Err(EngineError::Config(_))));
}
