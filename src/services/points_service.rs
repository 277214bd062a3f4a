//! Points service - loyalty credits, streaks and cashout
//!
//! Every credit carries an idempotency key, so replaying a settlement or a
//! streak award never credits twice.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::db::{self, events, ledger, points, PersistResult, PointTransactionRow, SettlementDb};
use crate::db::points::point_kinds;
use crate::error::SettlementError;
use crate::points::{daily_loyalty_bonus, meets_cashout_threshold, points_to_currency, weekly_loyalty_bonus};
use crate::split::conversion_plan;

use super::events::{EventBus, SettlementEvent};
use super::ledger_service::LedgerService;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreakAward {
    pub account_id: String,
    pub streak_kind: String,
    pub period: String,
    pub streak_length: i64,
    pub bonus: i64,
    /// `None` when this period was already awarded
    pub transaction: Option<PointTransactionRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CashoutReceipt {
    pub cashout_id: String,
    pub account_id: String,
    pub points_debited: i64,
    /// Minor units owed to the account
    pub amount: i64,
    pub remaining_points: i64,
    pub ledger: PersistResult,
}

/// Point ledger service
pub struct PointsService {
    db: Arc<SettlementDb>,
    events: Arc<EventBus>,
    ledger: Arc<LedgerService>,
    points_per_unit: i64,
    cashout_threshold: i64,
}

impl PointsService {
    pub fn new(
        db: Arc<SettlementDb>,
        events: Arc<EventBus>,
        ledger: Arc<LedgerService>,
        points_per_unit: i64,
        cashout_threshold: i64,
    ) -> Self {
        Self {
            db,
            events,
            ledger,
            points_per_unit,
            cashout_threshold,
        }
    }

    pub fn balance(&self, account_id: &str) -> Result<i64, SettlementError> {
        self.db.with_conn(|conn| points::balance(conn, account_id))
    }

    pub fn history(&self, account_id: &str, limit: i64) -> Result<Vec<PointTransactionRow>, SettlementError> {
        self.db.with_conn(|conn| points::history(conn, account_id, limit))
    }

    /// Credit points once per `idempotency_key`
    pub fn credit(
        &self,
        account_id: &str,
        kind: &str,
        amount: i64,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PointTransactionRow>, SettlementError> {
        if amount <= 0 {
            return Err(SettlementError::InvalidInput(format!(
                "credit must be positive (got {})",
                amount
            )));
        }
        let row = self.db.transaction(|conn| {
            points::apply_transaction(
                conn,
                &points::NewPointTransaction {
                    account_id,
                    kind,
                    amount,
                    related_entity_id: None,
                    related_entity_type: None,
                    idempotency_key,
                },
                now,
            )
        })?;
        if let Some(row) = &row {
            self.emit_credit(row);
        }
        Ok(row)
    }

    pub(crate) fn emit_credit(&self, row: &PointTransactionRow) {
        self.events.emit(SettlementEvent::PointsCredited {
            account_id: row.account_id.clone(),
            kind: row.kind.clone(),
            amount: row.amount,
        });
    }

    // =========================================================================
    // Streaks
    // =========================================================================

    /// Award the daily bonus for `date`; consecutive days grow the streak
    pub fn award_daily_streak(
        &self,
        account_id: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<StreakAward, SettlementError> {
        let period = db::date_key(date);
        let previous = db::date_key(date - Duration::days(1));
        self.award_streak(account_id, point_kinds::DAILY_STREAK, &period, &previous, daily_loyalty_bonus, now)
    }

    /// Award the weekly bonus for the ISO week containing `date`
    pub fn award_weekly_streak(
        &self,
        account_id: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<StreakAward, SettlementError> {
        let period = iso_week_key(date);
        let previous = iso_week_key(date - Duration::days(7));
        self.award_streak(account_id, point_kinds::WEEKLY_STREAK, &period, &previous, weekly_loyalty_bonus, now)
    }

    fn award_streak(
        &self,
        account_id: &str,
        streak_kind: &str,
        period: &str,
        previous_period: &str,
        bonus_for: fn(i64) -> i64,
        now: DateTime<Utc>,
    ) -> Result<StreakAward, SettlementError> {
        let award = self.db.transaction(|conn| {
            let length = match points::get_streak(conn, account_id, streak_kind)? {
                Some((last, length)) if last == period => {
                    return Ok(StreakAward {
                        account_id: account_id.to_string(),
                        streak_kind: streak_kind.to_string(),
                        period: period.to_string(),
                        streak_length: length,
                        bonus: bonus_for(length),
                        transaction: None,
                    });
                }
                Some((last, _)) if last.as_str() > period => {
                    return Err(SettlementError::InvalidInput(format!(
                        "{} streak for {} is already at {}",
                        streak_kind, account_id, last
                    )));
                }
                Some((last, length)) if last == previous_period => length + 1,
                _ => 1,
            };

            let bonus = bonus_for(length);
            let key = format!("{}:{}:{}", streak_kind, account_id, period);
            let transaction = points::apply_transaction(
                conn,
                &points::NewPointTransaction {
                    account_id,
                    kind: streak_kind,
                    amount: bonus,
                    related_entity_id: Some(period),
                    related_entity_type: Some("streak"),
                    idempotency_key: &key,
                },
                now,
            )?;
            points::set_streak(conn, account_id, streak_kind, period, length)?;

            Ok(StreakAward {
                account_id: account_id.to_string(),
                streak_kind: streak_kind.to_string(),
                period: period.to_string(),
                streak_length: length,
                bonus,
                transaction,
            })
        })?;

        if let Some(row) = &award.transaction {
            self.emit_credit(row);
        }
        Ok(award)
    }

    // =========================================================================
    // Cashout
    // =========================================================================

    /// Convert all whole units of an account's points to currency.
    ///
    /// Debits the points and records a conversion plan in the money ledger in
    /// one transaction. Leftover points below one unit stay on the account.
    pub fn cashout(&self, account_id: &str, now: DateTime<Utc>) -> Result<CashoutReceipt, SettlementError> {
        let unit = self.ledger.unit();
        let cashout_id = Uuid::new_v4().to_string();
        let event_id = format!("cashout:{}", cashout_id);

        let receipt = self.db.transaction(|conn| {
            let balance = points::balance(conn, account_id)?;
            if !meets_cashout_threshold(balance, self.cashout_threshold) {
                return Err(SettlementError::InvalidInput(format!(
                    "{} has {} points; cashout needs {}",
                    account_id, balance, self.cashout_threshold
                )));
            }

            let units = points_to_currency(balance, self.points_per_unit)?;
            let points_debited = units * self.points_per_unit;
            let amount = units * unit;

            let plan = conversion_plan(account_id, amount, unit)?;
            self.ledger.verify_plan(&event_id, &plan)?;

            let debit = points::apply_transaction(
                conn,
                &points::NewPointTransaction {
                    account_id,
                    kind: point_kinds::CONVERSION,
                    amount: -points_debited,
                    related_entity_id: Some(&cashout_id),
                    related_entity_type: Some("cashout"),
                    idempotency_key: &event_id,
                },
                now,
            )?
            .ok_or_else(|| SettlementError::Internal(format!("cashout {} applied twice", cashout_id)))?;

            let payload = serde_json::json!({
                "accountId": account_id,
                "points": points_debited,
                "amount": amount,
            });
            events::record_event(conn, &event_id, "points.cashout", &payload, now)?;
            let persisted = ledger::persist_plan(conn, &event_id, "points.cashout", &plan, now)?;
            events::mark_event_processed(conn, &event_id, now)?;

            Ok(CashoutReceipt {
                cashout_id: cashout_id.clone(),
                account_id: account_id.to_string(),
                points_debited,
                amount,
                remaining_points: debit.balance_after,
                ledger: persisted,
            })
        })?;

        info!(
            account_id = %account_id,
            points = receipt.points_debited,
            amount = receipt.amount,
            "Points cashed out"
        );
        self.events.emit(SettlementEvent::PlanPersisted {
            source_event_id: event_id,
            rule: crate::split::payout_rules::POINTS_CONVERSION.to_string(),
            gross: receipt.amount,
            inserted: receipt.ledger.inserted,
        });

        Ok(receipt)
    }
}

/// `YYYY-Www`, ISO week-numbering year
fn iso_week_key(date: NaiveDate) -> String {
    date.format("%G-W%V").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::DEFAULT_UNIT;

    fn service() -> PointsService {
        let db = Arc::new(SettlementDb::open_in_memory().unwrap());
        let events = Arc::new(EventBus::new());
        let ledger = Arc::new(LedgerService::new(db.clone(), events.clone(), DEFAULT_UNIT, 10, "platform"));
        PointsService::new(db, events, ledger, 100, 2_500)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[test]
    fn test_credit_is_idempotent() {
        let svc = service();
        let now = Utc::now();
        assert!(svc.credit("a1", point_kinds::BONUS, 500, "promo:a1", now).unwrap().is_some());
        assert!(svc.credit("a1", point_kinds::BONUS, 500, "promo:a1", now).unwrap().is_none());
        assert_eq!(svc.balance("a1").unwrap(), 500);
        assert!(svc.credit("a1", point_kinds::BONUS, 0, "zero", now).is_err());
    }

    #[test]
    fn test_daily_streak_grows_and_resets() {
        let svc = service();
        let now = Utc::now();
        let bonuses: Vec<i64> = (1..=8)
            .map(|d| svc.award_daily_streak("a1", day(d), now).unwrap().bonus)
            .collect();
        assert_eq!(bonuses, vec![10, 15, 20, 25, 30, 35, 50, 50]);

        // same day again: nothing new
        let again = svc.award_daily_streak("a1", day(8), now).unwrap();
        assert!(again.transaction.is_none());
        assert_eq!(again.streak_length, 8);

        // a gap resets the streak
        let after_gap = svc.award_daily_streak("a1", day(10), now).unwrap();
        assert_eq!(after_gap.streak_length, 1);
        assert_eq!(after_gap.bonus, 10);

        assert!(svc.award_daily_streak("a1", day(9), now).is_err());
        assert_eq!(svc.balance("a1").unwrap(), 10 + 15 + 20 + 25 + 30 + 35 + 50 + 50 + 10);
    }

    #[test]
    fn test_weekly_streak_uses_iso_weeks() {
        let svc = service();
        let now = Utc::now();
        assert_eq!(svc.award_weekly_streak("a1", day(3), now).unwrap().bonus, 30);
        // same ISO week
        assert!(svc.award_weekly_streak("a1", day(5), now).unwrap().transaction.is_none());
        assert_eq!(svc.award_weekly_streak("a1", day(10), now).unwrap().bonus, 40);
        assert_eq!(iso_week_key(NaiveDate::from_ymd_opt(2024, 12, 30).unwrap()), "2025-W01");
    }

    #[test]
    fn test_cashout_below_threshold_rejected() {
        let svc = service();
        let now = Utc::now();
        svc.credit("a1", point_kinds::BONUS, 2_499, "k", now).unwrap();
        assert!(matches!(svc.cashout("a1", now), Err(SettlementError::InvalidInput(_))));
        assert_eq!(svc.balance("a1").unwrap(), 2_499);
    }

    #[test]
    fn test_cashout_debits_whole_units() {
        let svc = service();
        let now = Utc::now();
        svc.credit("a1", point_kinds::BONUS, 2_599, "k", now).unwrap();

        let receipt = svc.cashout("a1", now).unwrap();
        assert_eq!(receipt.points_debited, 2_500);
        assert_eq!(receipt.amount, 2_500);
        assert_eq!(receipt.remaining_points, 99);
        assert_eq!(receipt.ledger.inserted, 1);
        assert_eq!(svc.balance("a1").unwrap(), 99);

        let entries = svc
            .ledger
            .entries_for_event(&format!("cashout:{}", receipt.cashout_id))
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].role, "points_conversion");
        assert_eq!(entries[0].recipient_account_id.as_deref(), Some("a1"));
    }
}
