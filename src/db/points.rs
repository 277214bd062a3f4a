//! Loyalty point ledger
//!
//! Append-only transactions carrying a balance snapshot, plus a running
//! balance per account. Callers run [`apply_transaction`] inside a database
//! transaction so the snapshot and the balance move together.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

use super::timestamp;
use crate::error::SettlementError;

/// Point transaction kinds
pub mod point_kinds {
    pub const DAILY_STREAK: &str = "daily_streak";
    pub const WEEKLY_STREAK: &str = "weekly_streak";
    pub const POT_TOP_TIER: &str = "pot_top_tier";
    pub const POT_BACKER: &str = "pot_backer";
    pub const WAGER_REFUND: &str = "wager_refund";
    pub const CONVERSION: &str = "conversion";
    pub const BONUS: &str = "bonus";

    pub const ALL: &[&str] = &[
        DAILY_STREAK,
        WEEKLY_STREAK,
        POT_TOP_TIER,
        POT_BACKER,
        WAGER_REFUND,
        CONVERSION,
        BONUS,
    ];

    pub fn is_valid(kind: &str) -> bool {
        ALL.contains(&kind)
    }
}

/// Point transaction row from database
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointTransactionRow {
    pub id: String,
    pub account_id: String,
    pub kind: String,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub related_entity_id: Option<String>,
    pub related_entity_type: Option<String>,
    pub idempotency_key: String,
    pub created_at: String,
}

impl PointTransactionRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            kind: row.get("kind")?,
            amount: row.get("amount")?,
            balance_before: row.get("balance_before")?,
            balance_after: row.get("balance_after")?,
            related_entity_id: row.get("related_entity_id")?,
            related_entity_type: row.get("related_entity_type")?,
            idempotency_key: row.get("idempotency_key")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// A credit (positive) or debit (negative) to apply
#[derive(Debug, Clone)]
pub struct NewPointTransaction<'a> {
    pub account_id: &'a str,
    pub kind: &'a str,
    pub amount: i64,
    pub related_entity_id: Option<&'a str>,
    pub related_entity_type: Option<&'a str>,
    pub idempotency_key: &'a str,
}

pub fn balance(conn: &Connection, account_id: &str) -> Result<i64, SettlementError> {
    let balance: Option<i64> = conn
        .query_row(
            "SELECT balance FROM point_balances WHERE account_id = ?",
            params![account_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(balance.unwrap_or(0))
}

pub fn find_by_key(conn: &Connection, key: &str) -> Result<Option<PointTransactionRow>, SettlementError> {
    Ok(conn
        .query_row(
            "SELECT * FROM point_transactions WHERE idempotency_key = ?",
            params![key],
            PointTransactionRow::from_row,
        )
        .optional()?)
}

/// Apply a transaction once per idempotency key.
///
/// Returns `None` when the key was already applied. A debit that would take
/// the balance below zero is rejected.
pub fn apply_transaction(
    conn: &Connection,
    tx: &NewPointTransaction<'_>,
    now: DateTime<Utc>,
) -> Result<Option<PointTransactionRow>, SettlementError> {
    if !point_kinds::is_valid(tx.kind) {
        return Err(SettlementError::InvalidInput(format!("Unknown point kind '{}'", tx.kind)));
    }
    if find_by_key(conn, tx.idempotency_key)?.is_some() {
        return Ok(None);
    }

    let before = balance(conn, tx.account_id)?;
    let after = before
        .checked_add(tx.amount)
        .ok_or_else(|| SettlementError::InvalidInput("point balance overflow".into()))?;
    if after < 0 {
        return Err(SettlementError::InvalidInput(format!(
            "{} has {} points, cannot debit {}",
            tx.account_id, before, -tx.amount
        )));
    }

    let id = Uuid::new_v4().to_string();
    let ts = timestamp(now);
    conn.execute(
        "INSERT INTO point_transactions
            (id, account_id, kind, amount, balance_before, balance_after,
             related_entity_id, related_entity_type, idempotency_key, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            tx.account_id,
            tx.kind,
            tx.amount,
            before,
            after,
            tx.related_entity_id,
            tx.related_entity_type,
            tx.idempotency_key,
            ts,
        ],
    )?;
    conn.execute(
        "INSERT INTO point_balances (account_id, balance, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(account_id) DO UPDATE SET balance = excluded.balance, updated_at = excluded.updated_at",
        params![tx.account_id, after, ts],
    )?;

    Ok(Some(PointTransactionRow {
        id,
        account_id: tx.account_id.to_string(),
        kind: tx.kind.to_string(),
        amount: tx.amount,
        balance_before: before,
        balance_after: after,
        related_entity_id: tx.related_entity_id.map(str::to_string),
        related_entity_type: tx.related_entity_type.map(str::to_string),
        idempotency_key: tx.idempotency_key.to_string(),
        created_at: ts,
    }))
}

/// Newest first
pub fn history(conn: &Connection, account_id: &str, limit: i64) -> Result<Vec<PointTransactionRow>, SettlementError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM point_transactions WHERE account_id = ?
         ORDER BY created_at DESC, rowid DESC LIMIT ?",
    )?;
    let rows = stmt
        .query_map(params![account_id, limit], PointTransactionRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============================================================================
// Streaks
// ============================================================================

/// `(last_period, length)` for an account's streak
pub fn get_streak(
    conn: &Connection,
    account_id: &str,
    streak_kind: &str,
) -> Result<Option<(String, i64)>, SettlementError> {
    Ok(conn
        .query_row(
            "SELECT last_period, length FROM point_streaks WHERE account_id = ?1 AND streak_kind = ?2",
            params![account_id, streak_kind],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

pub fn set_streak(
    conn: &Connection,
    account_id: &str,
    streak_kind: &str,
    period: &str,
    length: i64,
) -> Result<(), SettlementError> {
    conn.execute(
        "INSERT INTO point_streaks (account_id, streak_kind, last_period, length) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(account_id, streak_kind) DO UPDATE SET last_period = excluded.last_period, length = excluded.length",
        params![account_id, streak_kind, period, length],
    )?;
    Ok(())
}
