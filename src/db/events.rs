//! Monetary events received from the payment gateway

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::timestamp;
use crate::error::SettlementError;

/// Monetary event row from database
#[derive(Debug, Clone, Serialize)]
pub struct MonetaryEventRow {
    pub id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub recorded_at: String,
    pub processed_at: Option<String>,
}

impl MonetaryEventRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let payload_json: String = row.get("payload_json")?;
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
            recorded_at: row.get("recorded_at")?,
            processed_at: row.get("processed_at")?,
        })
    }
}

/// Whether an event id has already been recorded
pub fn is_event_processed(conn: &Connection, event_id: &str) -> Result<bool, SettlementError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM monetary_events WHERE id = ?",
            params![event_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Insert-or-ignore on the event id. Returns `true` when this call inserted it.
pub fn record_event(
    conn: &Connection,
    event_id: &str,
    kind: &str,
    payload: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<bool, SettlementError> {
    if event_id.is_empty() {
        return Err(SettlementError::InvalidInput("event id is required".into()));
    }
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO monetary_events (id, kind, payload_json, recorded_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![event_id, kind, serde_json::to_string(payload)?, timestamp(now)],
    )?;
    Ok(inserted > 0)
}

pub fn mark_event_processed(
    conn: &Connection,
    event_id: &str,
    now: DateTime<Utc>,
) -> Result<(), SettlementError> {
    conn.execute(
        "UPDATE monetary_events SET processed_at = ?2 WHERE id = ?1 AND processed_at IS NULL",
        params![event_id, timestamp(now)],
    )?;
    Ok(())
}

pub fn get_event(conn: &Connection, event_id: &str) -> Result<Option<MonetaryEventRow>, SettlementError> {
    Ok(conn
        .query_row(
            "SELECT * FROM monetary_events WHERE id = ?",
            params![event_id],
            MonetaryEventRow::from_row,
        )
        .optional()?)
}
