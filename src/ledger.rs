//! Balance and aggregate mutations
//!
//! Every function here runs against a connection that the caller has already
//! placed inside a transaction (see [`EngineDb::with_tx`]). Nothing commits
//! on its own, so a cascade or an approval lands all of its mutations or none.
//!
//! [`EngineDb::with_tx`]: crate::db::EngineDb::with_tx

use rusqlite::{params, Connection};
use tracing::debug;

use crate::db::users;
use crate::error::EngineError;
use crate::money::Money;

/// Credit a referral bonus: balance, total earnings and total referral bonus
pub fn credit_referral_bonus(conn: &Connection, user_id: &str, amount: Money) -> Result<(), EngineError> {
    ensure_positive(amount)?;
    let updated = conn.execute(
        "UPDATE users
         SET balance = balance + ?1,
             total_earnings = total_earnings + ?1,
             total_referral_bonus = total_referral_bonus + ?1
         WHERE id = ?2",
        params![amount, user_id],
    )?;
    expect_one(updated, user_id)?;
    debug!(user_id = %user_id, amount = %amount, "Credited referral bonus");
    Ok(())
}

/// Credit a user's own earning (task reward): balance and total earnings
pub fn credit_earning(conn: &Connection, user_id: &str, amount: Money) -> Result<(), EngineError> {
    ensure_positive(amount)?;
    let updated = conn.execute(
        "UPDATE users
         SET balance = balance + ?1, total_earnings = total_earnings + ?1
         WHERE id = ?2",
        params![amount, user_id],
    )?;
    expect_one(updated, user_id)?;
    debug!(user_id = %user_id, amount = %amount, "Credited earning");
    Ok(())
}

/// Credit an approved purchase/upgrade and raise the VIP level if one is granted
pub fn credit_investment(
    conn: &Connection,
    user_id: &str,
    amount: Money,
    vip_level: Option<i64>,
) -> Result<(), EngineError> {
    ensure_positive(amount)?;
    let updated = conn.execute(
        "UPDATE users
         SET total_invested = total_invested + ?1,
             vip_level = MAX(vip_level, COALESCE(?2, vip_level))
         WHERE id = ?3",
        params![amount, vip_level, user_id],
    )?;
    expect_one(updated, user_id)?;
    debug!(user_id = %user_id, amount = %amount, ?vip_level, "Credited investment");
    Ok(())
}

/// Debit a withdrawal only if the balance covers it at this moment.
///
/// Returns the balance after the debit.
pub fn debit_withdrawal(conn: &Connection, user_id: &str, amount: Money) -> Result<Money, EngineError> {
    ensure_positive(amount)?;
    let updated = conn.execute(
        "UPDATE users
         SET balance = balance - ?1, total_withdrawn = total_withdrawn + ?1
         WHERE id = ?2 AND balance >= ?1",
        params![amount, user_id],
    )?;

    let user = users::require_user(conn, user_id)?;
    if updated == 0 {
        return Err(EngineError::InsufficientBalance {
            requested: amount,
            available: user.balance,
        });
    }

    debug!(user_id = %user_id, amount = %amount, balance = %user.balance, "Debited withdrawal");
    Ok(user.balance)
}

fn ensure_positive(amount: Money) -> Result<(), EngineError> {
    if !amount.is_positive() {
        return Err(EngineError::InvalidInput(format!("Amount must be positive, got {}", amount)));
    }
    Ok(())
}

fn expect_one(updated: usize, user_id: &str) -> Result<(), EngineError> {
    if updated == 0 {
        return Err(EngineError::UserNotFound(user_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EngineDb;

    fn m(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn db_with_user(id: &str) -> EngineDb {
        let db = EngineDb::open_in_memory().unwrap();
        db.with_tx(|tx| users::create_user(tx, id)).unwrap();
        db
    }

    #[test]
    fn test_bonus_credit_updates_all_aggregates() {
        let db = db_with_user("alice");
        db.with_tx(|tx| credit_referral_bonus(tx, "alice", m("2.50"))).unwrap();

        let user = db.with_conn(|conn| users::require_user(conn, "alice")).unwrap();
        assert_eq!(user.balance, m("2.50"));
        assert_eq!(user.total_earnings, m("2.50"));
        assert_eq!(user.total_referral_bonus, m("2.50"));
    }

    #[test]
    fn test_withdrawal_never_goes_negative() {
        let db = db_with_user("alice");
        db.with_tx(|tx| credit_earning(tx, "alice", m("999.99"))).unwrap();

        let err = db.with_tx(|tx| debit_withdrawal(tx, "alice", m("1000.00"))).unwrap_err();
        match err {
            EngineError::InsufficientBalance { requested, available } => {
                assert_eq!(requested, m("1000.00"));
                assert_eq!(available, m("999.99"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let after = db.with_tx(|tx| debit_withdrawal(tx, "alice", m("999.99"))).unwrap();
        assert_eq!(after, Money::ZERO);

        let user = db.with_conn(|conn| users::require_user(conn, "alice")).unwrap();
        assert_eq!(user.total_withdrawn, m("999.99"));
    }

    #[test]
    fn test_investment_only_raises_vip_level() {
        let db = db_with_user("alice");
        db.with_tx(|tx| credit_investment(tx, "alice", m("100"), Some(3))).unwrap();
        db.with_tx(|tx| credit_investment(tx, "alice", m("50"), Some(2))).unwrap();
        db.with_tx(|tx| credit_investment(tx, "alice", m("25"), None)).unwrap();

        let user = db.with_conn(|conn| users::require_user(conn, "alice")).unwrap();
        assert_eq!(user.vip_level, 3);
        assert_eq!(user.total_invested, m("175"));
    }

    #[test]
    fn test_unknown_user_is_reported() {
        let db = EngineDb::open_in_memory().unwrap();
        let err = db.with_tx(|tx| credit_earning(tx, "ghost", m("1"))).unwrap_err();
        assert!(matches!(err, EngineError::UserNotFound(id) if id == "ghost"));
    }
}
