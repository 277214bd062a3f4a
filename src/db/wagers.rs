//! Monthly wagers

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{is_constraint_violation, timestamp};
use crate::error::SettlementError;

pub mod wager_status {
    pub const ACTIVE: &str = "active";
    pub const COMPLETED: &str = "completed";
}

/// Wager row from database
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WagerRow {
    pub id: String,
    pub holder_id: String,
    pub tier: i64,
    pub amount: i64,
    pub month_key: String,
    pub target_participant_id: Option<String>,
    pub final_rank: Option<i64>,
    pub refund_percentage: Option<i64>,
    pub refund_amount: Option<i64>,
    pub status: String,
    pub created_at: String,
    pub settled_at: Option<String>,
}

impl WagerRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            holder_id: row.get("holder_id")?,
            tier: row.get("tier")?,
            amount: row.get("amount")?,
            month_key: row.get("month_key")?,
            target_participant_id: row.get("target_participant_id")?,
            final_rank: row.get("final_rank")?,
            refund_percentage: row.get("refund_percentage")?,
            refund_amount: row.get("refund_amount")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            settled_at: row.get("settled_at")?,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == wager_status::ACTIVE
    }
}

/// One wager per holder per month; a second one is a `Conflict`
#[allow(clippy::too_many_arguments)]
pub fn insert_wager(
    conn: &Connection,
    id: &str,
    holder_id: &str,
    tier: i64,
    amount: i64,
    month_key: &str,
    target_participant_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<WagerRow, SettlementError> {
    conn.execute(
        "INSERT INTO wagers (id, holder_id, tier, amount, month_key, target_participant_id, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7)",
        params![id, holder_id, tier, amount, month_key, target_participant_id, timestamp(now)],
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            SettlementError::Conflict(format!(
                "{} already holds a wager for {}",
                holder_id, month_key
            ))
        } else {
            SettlementError::Database(e)
        }
    })?;

    get_wager(conn, id)?
        .ok_or_else(|| SettlementError::Internal(format!("Wager {} vanished after insert", id)))
}

pub fn get_wager(conn: &Connection, id: &str) -> Result<Option<WagerRow>, SettlementError> {
    Ok(conn
        .query_row("SELECT * FROM wagers WHERE id = ?", params![id], WagerRow::from_row)
        .optional()?)
}

pub fn active_wagers_for_month(conn: &Connection, month_key: &str) -> Result<Vec<WagerRow>, SettlementError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM wagers WHERE month_key = ? AND status = 'active' ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map(params![month_key], WagerRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_wagers(conn: &Connection, month_key: &str) -> Result<Vec<WagerRow>, SettlementError> {
    let mut stmt = conn.prepare("SELECT * FROM wagers WHERE month_key = ? ORDER BY created_at, id")?;
    let rows = stmt
        .query_map(params![month_key], WagerRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// `active → completed`, exactly once. Returns `false` if it was already completed.
pub fn complete_wager(
    conn: &Connection,
    id: &str,
    final_rank: Option<i64>,
    refund_percentage: i64,
    refund_amount: i64,
    now: DateTime<Utc>,
) -> Result<bool, SettlementError> {
    let changed = conn.execute(
        "UPDATE wagers
         SET status = 'completed', final_rank = ?2, refund_percentage = ?3,
             refund_amount = ?4, settled_at = ?5
         WHERE id = ?1 AND status = 'active'",
        params![id, final_rank, refund_percentage, refund_amount, timestamp(now)],
    )?;
    Ok(changed > 0)
}
