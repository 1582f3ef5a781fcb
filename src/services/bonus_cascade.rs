//! Bonus cascade - pays a share of an earning event to up to four ancestors
//!
//! Each ancestor is paid once at its own depth's rate; rates never compound.
//! All ledger writes, bonus records and earnings entries of one cascade share
//! a transaction. `(source_type, source_id, level)` is unique, so re-running a
//! cascade for the same source pays nothing twice.

use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use super::referral_graph::ancestors_in;
use crate::config::Config;
use crate::db::bonuses::{self, NewBonusRecord, NewEarningsEntry};
use crate::db::{BonusRecord, EarningsEntryType, EngineDb, SourceType};
use crate::error::EngineError;
use crate::ledger;
use crate::money::{Money, Rate};

/// Number of upline levels that receive a bonus
pub const BONUS_LEVELS: u8 = 4;

/// Per-level bonus rates, index 0 = level 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BonusSchedule {
    rates: [Rate; BONUS_LEVELS as usize],
}

impl BonusSchedule {
    /// 20% / 10% / 5% / 2%
    pub fn standard() -> Self {
        Self::from_bps([2_000, 1_000, 500, 200])
    }

    pub fn from_bps(bps: [u32; BONUS_LEVELS as usize]) -> Self {
        Self {
            rates: bps.map(Rate::from_bps),
        }
    }

    pub fn rate_for(&self, level: u8) -> Result<Rate, EngineError> {
        if level == 0 || level > BONUS_LEVELS {
            return Err(EngineError::LevelOutOfRange(level));
        }
        Ok(self.rates[(level - 1) as usize])
    }

    /// Bonus owed at `level` for an event of `amount`, rounded half-up to the cent
    pub fn bonus_for(&self, level: u8, amount: Money) -> Result<Money, EngineError> {
        Ok(amount.apply_rate(self.rate_for(level)?))
    }
}

impl Default for BonusSchedule {
    fn default() -> Self {
        Self::standard()
    }
}

/// Outcome of recording an earning event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EarningOutcome {
    /// The earner's own credit was applied by this call (task events only)
    pub earner_credited: bool,
    /// Bonuses newly paid by this call
    pub bonuses: Vec<BonusRecord>,
}

/// Bonus cascade engine
pub struct BonusCascadeEngine {
    db: Arc<EngineDb>,
    schedule: BonusSchedule,
    task_schedule: Option<BonusSchedule>,
    max_walk: usize,
}

impl BonusCascadeEngine {
    pub fn new(db: Arc<EngineDb>, schedule: BonusSchedule, max_walk: usize) -> Self {
        Self {
            db,
            schedule,
            task_schedule: None,
            max_walk,
        }
    }

    pub fn from_config(db: Arc<EngineDb>, config: &Config) -> Self {
        let mut engine = Self::new(
            db,
            BonusSchedule::from_bps(config.bonus.level_rates_bps),
            config.max_ancestor_walk,
        );
        engine.task_schedule = config.bonus.task_level_rates_bps.map(BonusSchedule::from_bps);
        engine
    }

    /// Use a distinct schedule for task earnings
    pub fn with_task_schedule(mut self, schedule: BonusSchedule) -> Self {
        self.task_schedule = Some(schedule);
        self
    }

    pub fn schedule_for(&self, source_type: SourceType) -> &BonusSchedule {
        match (source_type, &self.task_schedule) {
            (SourceType::Task, Some(task)) => task,
            _ => &self.schedule,
        }
    }

    /// Run a cascade in its own transaction
    pub fn cascade(
        &self,
        source_type: SourceType,
        source_user_id: &str,
        source_id: &str,
        amount: Money,
    ) -> Result<Vec<BonusRecord>, EngineError> {
        self.db
            .with_tx(|tx| self.cascade_in(tx, source_type, source_user_id, source_id, amount))
    }

    /// Run a cascade inside the caller's transaction
    pub fn cascade_in(
        &self,
        conn: &Connection,
        source_type: SourceType,
        source_user_id: &str,
        source_id: &str,
        amount: Money,
    ) -> Result<Vec<BonusRecord>, EngineError> {
        validate_event(source_id, amount)?;

        let schedule = self.schedule_for(source_type);
        let ancestors = ancestors_in(conn, source_user_id, BONUS_LEVELS as u32, self.max_walk)?;
        let mut paid = Vec::with_capacity(ancestors.len());

        for ancestor in ancestors {
            let level = u8::try_from(ancestor.depth)
                .map_err(|_| EngineError::LevelOutOfRange(u8::MAX))?;
            let bonus = schedule.bonus_for(level, amount)?;
            if !bonus.is_positive() {
                continue;
            }

            let record = bonuses::insert_bonus_record(conn, &NewBonusRecord {
                inviter_id: &ancestor.user_id,
                invitee_id: source_user_id,
                level,
                amount: bonus,
                source_type,
                source_id,
            })?;
            let Some(record) = record else {
                debug!(
                    source_type = %source_type,
                    source_id = %source_id,
                    bonus_level = level,
                    "Bonus already paid, skipping"
                );
                continue;
            };

            ledger::credit_referral_bonus(conn, &ancestor.user_id, bonus)?;
            bonuses::insert_earnings_entry(conn, &NewEarningsEntry {
                user_id: &ancestor.user_id,
                amount: bonus,
                entry_type: EarningsEntryType::ReferralBonus,
                source_type,
                source_id,
                description: format!(
                    "Level {} referral bonus from {} ({})",
                    level, source_user_id, source_type
                ),
            })?;

            paid.push(record);
        }

        if !paid.is_empty() {
            info!(
                source_type = %source_type,
                source_id = %source_id,
                amount = %amount,
                bonuses = paid.len(),
                "Referral bonuses paid"
            );
        }
        Ok(paid)
    }

    /// Record an earning event: credit the earner for task rewards, then cascade.
    ///
    /// Both happen in one transaction and both are keyed on `source_id`.
    pub fn record_event(
        &self,
        source_type: SourceType,
        user_id: &str,
        source_id: &str,
        amount: Money,
    ) -> Result<EarningOutcome, EngineError> {
        validate_event(source_id, amount)?;

        self.db.with_tx(|tx| {
            let mut earner_credited = false;
            if source_type == SourceType::Task {
                earner_credited = bonuses::insert_earnings_entry(tx, &NewEarningsEntry {
                    user_id,
                    amount,
                    entry_type: EarningsEntryType::Task,
                    source_type,
                    source_id,
                    description: format!("Task reward {}", source_id),
                })?;
                if earner_credited {
                    ledger::credit_earning(tx, user_id, amount)?;
                }
            }

            let bonuses = self.cascade_in(tx, source_type, user_id, source_id, amount)?;
            Ok(EarningOutcome { earner_credited, bonuses })
        })
    }

    pub fn records_for_source(
        &self,
        source_type: SourceType,
        source_id: &str,
    ) -> Result<Vec<BonusRecord>, EngineError> {
        self.db
            .with_conn(|conn| bonuses::records_for_source(conn, source_type, source_id))
    }
}

fn validate_event(source_id: &str, amount: Money) -> Result<(), EngineError> {
    if source_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("source id is required".into()));
    }
    if !amount.is_positive() {
        return Err(EngineError::InvalidInput(format!("Amount must be positive, got {}", amount)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::users;
    use crate::services::referral_graph::ReferralGraph;

    fn m(s: &str) -> Money {
        s.parse().unwrap()
    }

    /// Users u0..u{n-1}; u{i+1} invited u{i}
    fn setup(n: usize) -> (Arc<EngineDb>, BonusCascadeEngine) {
        let db = Arc::new(EngineDb::open_in_memory().unwrap());
        db.with_tx(|tx| {
            for i in 0..n {
                users::create_user(tx, &format!("u{}", i))?;
            }
            Ok(())
        })
        .unwrap();

        let graph = ReferralGraph::new(db.clone(), 1_000);
        for i in (0..n.saturating_sub(1)).rev() {
            graph.attach(&format!("u{}", i), &format!("u{}", i + 1)).unwrap();
        }

        let engine = BonusCascadeEngine::new(db.clone(), BonusSchedule::standard(), 1_000);
        (db, engine)
    }

    fn balance(db: &EngineDb, id: &str) -> Money {
        db.with_conn(|conn| users::require_user(conn, id)).unwrap().balance
    }

    #[test]
    fn test_schedule_rates() {
        let schedule = BonusSchedule::standard();
        assert_eq!(schedule.bonus_for(1, m("10.00")).unwrap(), m("2.00"));
        assert_eq!(schedule.bonus_for(4, m("10.00")).unwrap(), m("0.20"));
        assert!(matches!(schedule.rate_for(0), Err(EngineError::LevelOutOfRange(0))));
        assert!(matches!(schedule.rate_for(5), Err(EngineError::LevelOutOfRange(5))));
    }

    #[test]
    fn test_long_chain_pays_exactly_four_levels() {
        let (db, engine) = setup(7);
        let records = engine.cascade(SourceType::Purchase, "u0", "p-1", m("100.00")).unwrap();

        let got: Vec<(&str, u8, Money)> = records
            .iter()
            .map(|r| (r.inviter_id.as_str(), r.level, r.amount))
            .collect();
        assert_eq!(
            got,
            vec![
                ("u1", 1, m("20.00")),
                ("u2", 2, m("10.00")),
                ("u3", 3, m("5.00")),
                ("u4", 4, m("2.00")),
            ]
        );
        assert_eq!(balance(&db, "u5"), Money::ZERO);

        let u2 = db.with_conn(|conn| users::require_user(conn, "u2")).unwrap();
        assert_eq!(u2.total_referral_bonus, m("10.00"));
        assert_eq!(u2.total_earnings, m("10.00"));
    }

    #[test]
    fn test_short_chain_pays_existing_ancestors_only() {
        let (_db, engine) = setup(3);
        let records = engine.cascade(SourceType::Upgrade, "u0", "up-1", m("50.00")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].level, 2);

        let root_records = engine.cascade(SourceType::Upgrade, "u2", "up-2", m("50.00")).unwrap();
        assert!(root_records.is_empty());
    }

    #[test]
    fn test_retry_with_same_source_pays_once() {
        let (db, engine) = setup(3);
        let first = engine.cascade(SourceType::Purchase, "u0", "p-1", m("10.00")).unwrap();
        let second = engine.cascade(SourceType::Purchase, "u0", "p-1", m("10.00")).unwrap();

        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert_eq!(balance(&db, "u1"), m("2.00"));
        assert_eq!(engine.records_for_source(SourceType::Purchase, "p-1").unwrap().len(), 2);

        // Same id under another source type is a different event
        let task = engine.cascade(SourceType::Task, "u0", "p-1", m("10.00")).unwrap();
        assert_eq!(task.len(), 2);
    }

    #[test]
    fn test_tiny_amounts_skip_zero_bonuses() {
        let (_db, engine) = setup(5);
        // 0.10 -> 0.02, 0.01, 0.01 (0.005 rounds up), 0.00
        let records = engine.cascade(SourceType::Task, "u0", "t-1", m("0.10")).unwrap();
        let amounts: Vec<Money> = records.iter().map(|r| r.amount).collect();
        assert_eq!(amounts, vec![m("0.02"), m("0.01"), m("0.01")]);
    }

    #[test]
    fn test_task_event_credits_earner_once() {
        let (db, engine) = setup(2);
        let outcome = engine.record_event(SourceType::Task, "u0", "t-1", m("10.00")).unwrap();
        assert!(outcome.earner_credited);
        assert_eq!(outcome.bonuses.len(), 1);

        let retry = engine.record_event(SourceType::Task, "u0", "t-1", m("10.00")).unwrap();
        assert!(!retry.earner_credited);
        assert!(retry.bonuses.is_empty());

        assert_eq!(balance(&db, "u0"), m("10.00"));
        assert_eq!(balance(&db, "u1"), m("2.00"));
    }

    #[test]
    fn test_task_schedule_override() {
        let (_db, engine) = setup(2);
        let engine = engine.with_task_schedule(BonusSchedule::from_bps([1_000, 0, 0, 0]));
        let records = engine.cascade(SourceType::Task, "u0", "t-1", m("10.00")).unwrap();
        assert_eq!(records[0].amount, m("1.00"));

        let records = engine.cascade(SourceType::Purchase, "u0", "p-1", m("10.00")).unwrap();
        assert_eq!(records[0].amount, m("2.00"));
    }

    #[test]
    fn test_failure_rolls_back_whole_cascade() {
        let (db, engine) = setup(3);
        let err = engine.cascade(SourceType::Purchase, "ghost", "p-1", m("10.00")).unwrap_err();
        assert!(matches!(err, EngineError::UserNotFound(_)));

        let err = engine.cascade(SourceType::Purchase, "u0", "p-2", Money::ZERO).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert_eq!(balance(&db, "u1"), Money::ZERO);
    }
}
