//! Money ledger: distribution lines with per-line idempotency keys
//!
//! A line's key is derived from `(source event, recipient, role)`; the UNIQUE
//! constraint on `idempotency_key` makes re-submitting a plan a no-op. A
//! different plan under an event id that already has lines is a conflict.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use super::timestamp;
use crate::error::SettlementError;
use crate::split::{DistributionPlan, Recipient, SplitRole};

/// Valid ledger entry statuses
pub mod entry_status {
    pub const PENDING: &str = "pending";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

/// Ledger entry row from database
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntryRow {
    pub id: String,
    pub reference_event_id: String,
    pub reference_kind: String,
    /// `None` is the platform
    pub recipient_account_id: Option<String>,
    pub role: String,
    pub gross_amount: i64,
    pub net_amount: i64,
    pub fee_amount: i64,
    pub idempotency_key: String,
    pub status: String,
    pub external_transfer_id: Option<String>,
    pub failure_reason: Option<String>,
    pub payout_rule: String,
    pub note: Option<String>,
    pub created_at: String,
    pub processed_at: Option<String>,
}

impl LedgerEntryRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            reference_event_id: row.get("reference_event_id")?,
            reference_kind: row.get("reference_kind")?,
            recipient_account_id: row.get("recipient_account_id")?,
            role: row.get("role")?,
            gross_amount: row.get("gross_amount")?,
            net_amount: row.get("net_amount")?,
            fee_amount: row.get("fee_amount")?,
            idempotency_key: row.get("idempotency_key")?,
            status: row.get("status")?,
            external_transfer_id: row.get("external_transfer_id")?,
            failure_reason: row.get("failure_reason")?,
            payout_rule: row.get("payout_rule")?,
            note: row.get("note")?,
            created_at: row.get("created_at")?,
            processed_at: row.get("processed_at")?,
        })
    }

    pub fn recipient(&self) -> Recipient {
        match &self.recipient_account_id {
            Some(id) => Recipient::Account(id.clone()),
            None => Recipient::Platform,
        }
    }
}

/// Outcome of persisting one plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistResult {
    /// Lines written by this call
    pub inserted: u64,
    /// Lines whose key already existed
    pub already_present: u64,
    /// Zero-amount lines left out of the ledger
    pub skipped_zero: u64,
}

/// `sha256(event | recipient | role)` as lowercase hex
pub fn idempotency_key(source_event_id: &str, recipient: &Recipient, role: SplitRole) -> String {
    let recipient_part = match recipient {
        Recipient::Platform => "platform".to_string(),
        Recipient::Account(id) => format!("account:{}", id),
    };
    let mut hasher = Sha256::new();
    hasher.update(source_event_id.as_bytes());
    hasher.update(b"|");
    hasher.update(recipient_part.as_bytes());
    hasher.update(b"|");
    hasher.update(role.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Write every non-zero line of `plan` with insert-or-ignore.
///
/// The caller owns the transaction and must have verified the plan. If the
/// event already has lines they must be exactly this plan's lines, otherwise
/// the event total would drift away from its gross.
pub fn persist_plan(
    conn: &Connection,
    source_event_id: &str,
    reference_kind: &str,
    plan: &DistributionPlan,
    now: DateTime<Utc>,
) -> Result<PersistResult, SettlementError> {
    let existing: BTreeMap<String, i64> = entries_for_event(conn, source_event_id)?
        .into_iter()
        .map(|e| (e.idempotency_key, e.gross_amount))
        .collect();
    if !existing.is_empty() {
        let proposed: BTreeMap<String, i64> = plan
            .lines
            .iter()
            .filter(|line| line.amount != 0)
            .map(|line| (idempotency_key(source_event_id, &line.recipient, line.role), line.amount))
            .collect();
        if proposed != existing {
            return Err(SettlementError::Conflict(format!(
                "event {} already carries a different distribution ({} lines, total {})",
                source_event_id,
                existing.len(),
                existing.values().sum::<i64>()
            )));
        }
    }

    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO ledger_entries (
            id, reference_event_id, reference_kind, recipient_account_id, role,
            gross_amount, net_amount, fee_amount, idempotency_key, status,
            payout_rule, note, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0, ?7, 'pending', ?8, ?9, ?10)",
    )?;

    let created_at = timestamp(now);
    let mut result = PersistResult::default();

    for line in &plan.lines {
        if line.amount == 0 {
            result.skipped_zero += 1;
            continue;
        }
        let key = idempotency_key(source_event_id, &line.recipient, line.role);
        let inserted = stmt.execute(params![
            Uuid::new_v4().to_string(),
            source_event_id,
            reference_kind,
            line.recipient.account_id(),
            line.role.as_str(),
            line.amount,
            key,
            plan.rule,
            line.note,
            created_at,
        ])?;
        if inserted > 0 {
            result.inserted += 1;
        } else {
            result.already_present += 1;
        }
    }

    debug!(
        event_id = %source_event_id,
        inserted = result.inserted,
        already_present = result.already_present,
        "Plan persisted"
    );

    Ok(result)
}

/// Oldest pending entries first
pub fn get_pending_entries(conn: &Connection, limit: i64) -> Result<Vec<LedgerEntryRow>, SettlementError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM ledger_entries WHERE status = 'pending'
         ORDER BY created_at ASC, id ASC LIMIT ?",
    )?;
    let rows = stmt
        .query_map(params![limit], LedgerEntryRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_entry(conn: &Connection, id: &str) -> Result<Option<LedgerEntryRow>, SettlementError> {
    Ok(conn
        .query_row(
            "SELECT * FROM ledger_entries WHERE id = ?",
            params![id],
            LedgerEntryRow::from_row,
        )
        .optional()?)
}

pub fn entries_for_event(conn: &Connection, event_id: &str) -> Result<Vec<LedgerEntryRow>, SettlementError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM ledger_entries WHERE reference_event_id = ? ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map(params![event_id], LedgerEntryRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Sum of all entries recorded for an event
pub fn total_for_event(conn: &Connection, event_id: &str) -> Result<i64, SettlementError> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(gross_amount), 0) FROM ledger_entries WHERE reference_event_id = ?",
        params![event_id],
        |row| row.get(0),
    )?)
}

/// `pending → completed`. Returns `false` if the entry was not pending.
pub fn mark_completed(
    conn: &Connection,
    id: &str,
    external_transfer_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, SettlementError> {
    let changed = conn.execute(
        "UPDATE ledger_entries
         SET status = 'completed', external_transfer_id = ?2, processed_at = ?3
         WHERE id = ?1 AND status = 'pending'",
        params![id, external_transfer_id, timestamp(now)],
    )?;
    Ok(changed > 0)
}

/// `pending → failed`. Returns `false` if the entry was not pending.
pub fn mark_failed(
    conn: &Connection,
    id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool, SettlementError> {
    let changed = conn.execute(
        "UPDATE ledger_entries
         SET status = 'failed', failure_reason = ?2, processed_at = ?3
         WHERE id = ?1 AND status = 'pending'",
        params![id, reason, timestamp(now)],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SettlementDb;
    use crate::split::{closure_pot_split, direct_sale_split, DEFAULT_UNIT};

    #[test]
    fn test_key_is_stable_and_distinct() {
        let a = idempotency_key("evt_1", &Recipient::account("u1"), SplitRole::CreatorSale);
        let b = idempotency_key("evt_1", &Recipient::account("u1"), SplitRole::CreatorSale);
        let c = idempotency_key("evt_1", &Recipient::account("u1"), SplitRole::InvestorTopTier);
        let d = idempotency_key("evt_1", &Recipient::account("platform"), SplitRole::PlatformSale);
        let e = idempotency_key("evt_1", &Recipient::Platform, SplitRole::PlatformSale);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(d, e);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_persist_plan_twice_creates_no_duplicates() {
        let db = SettlementDb::open_in_memory().unwrap();
        let plan = direct_sale_split(999, "creator-1", DEFAULT_UNIT).unwrap();

        let first = db
            .with_conn(|conn| persist_plan(conn, "evt_1", "sale.completed", &plan, Utc::now()))
            .unwrap();
        assert_eq!(first.inserted, 2);

        let second = db
            .with_conn(|conn| persist_plan(conn, "evt_1", "sale.completed", &plan, Utc::now()))
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.already_present, 2);

        let entries = db.with_conn(|conn| entries_for_event(conn, "evt_1")).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(db.with_conn(|conn| total_for_event(conn, "evt_1")).unwrap(), 999);

        let platform = entries.iter().find(|e| e.role == "platform_sale").unwrap();
        assert_eq!(platform.recipient_account_id, None);
        assert_eq!(platform.recipient(), Recipient::Platform);
    }

    #[test]
    fn test_different_plan_for_same_event_conflicts() {
        let db = SettlementDb::open_in_memory().unwrap();
        let first = closure_pot_split(100_000, &["i1".to_string()], &[], &[], DEFAULT_UNIT).unwrap();
        let second = closure_pot_split(100_000, &["i2".to_string()], &[], &[], DEFAULT_UNIT).unwrap();

        db.with_conn(|conn| persist_plan(conn, "category:c1:closure", "category.closure", &first, Utc::now()))
            .unwrap();
        let err = db
            .with_conn(|conn| persist_plan(conn, "category:c1:closure", "category.closure", &second, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, SettlementError::Conflict(_)));

        assert_eq!(
            db.with_conn(|conn| total_for_event(conn, "category:c1:closure")).unwrap(),
            100_000
        );
    }

    #[test]
    fn test_zero_lines_are_skipped() {
        let db = SettlementDb::open_in_memory().unwrap();
        // 50 minor units: creator share floors to 0, platform takes all
        let plan = direct_sale_split(50, "creator-1", DEFAULT_UNIT).unwrap();
        let result = db
            .with_conn(|conn| persist_plan(conn, "evt_small", "sale.completed", &plan, Utc::now()))
            .unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.skipped_zero, 1);
        assert_eq!(db.with_conn(|conn| total_for_event(conn, "evt_small")).unwrap(), 50);
    }

    #[test]
    fn test_status_transitions_are_guarded() {
        let db = SettlementDb::open_in_memory().unwrap();
        let inv: Vec<String> = (1..=3).map(|i| format!("inv{}", i)).collect();
        let plan = closure_pot_split(100_000, &inv, &[], &[], DEFAULT_UNIT).unwrap();
        db.with_conn(|conn| persist_plan(conn, "pot_1", "pot.closed", &plan, Utc::now()))
            .unwrap();

        let pending = db.with_conn(|conn| get_pending_entries(conn, 10)).unwrap();
        assert_eq!(pending.len(), 4);

        let now = Utc::now();
        db.with_conn(|conn| {
            assert!(mark_completed(conn, &pending[0].id, "tr_1", now)?);
            assert!(mark_failed(conn, &pending[1].id, "account closed", now)?);
            // terminal states are not revisited
            assert!(!mark_failed(conn, &pending[0].id, "late", now)?);
            assert!(!mark_completed(conn, &pending[1].id, "tr_2", now)?);
            Ok(())
        })
        .unwrap();

        let failed = db.with_conn(|conn| get_entry(conn, &pending[1].id)).unwrap().unwrap();
        assert_eq!(failed.status, entry_status::FAILED);
        assert_eq!(failed.failure_reason.as_deref(), Some("account closed"));

        // siblings stay pending
        assert_eq!(db.with_conn(|conn| get_pending_entries(conn, 10)).unwrap().len(), 2);
    }
}
