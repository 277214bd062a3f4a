//! Category audit trail

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::timestamp;
use crate::error::SettlementError;
use crate::lifecycle::{Actor, CategoryStatus};

/// Audit actions
pub mod audit_actions {
    pub const CATEGORY_CREATED: &str = "category_created";
    pub const CATEGORY_UPDATED: &str = "category_updated";
    pub const CYCLE_STARTED: &str = "cycle_started";
    pub const CYCLE_EXTENDED: &str = "cycle_extended";
    pub const CATEGORY_CLOSED: &str = "category_closed";
    pub const PAYOUT_COMPUTED: &str = "payout_computed";
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRow {
    pub id: i64,
    pub category_id: String,
    pub action: String,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub actor: Actor,
    pub reason: String,
    pub details: serde_json::Value,
    pub created_at: String,
}

impl AuditRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let actor_kind: String = row.get("actor_kind")?;
        let actor_id: Option<String> = row.get("actor_id")?;
        let details_json: String = row.get("details_json")?;
        Ok(Self {
            id: row.get("id")?,
            category_id: row.get("category_id")?,
            action: row.get("action")?,
            from_status: row.get("from_status")?,
            to_status: row.get("to_status")?,
            actor: Actor::from_parts(&actor_kind, actor_id).unwrap_or(Actor::System),
            reason: row.get("reason")?,
            details: serde_json::from_str(&details_json).unwrap_or(serde_json::Value::Null),
            created_at: row.get("created_at")?,
        })
    }
}

/// Append an audit record
#[allow(clippy::too_many_arguments)]
pub fn insert_audit(
    conn: &Connection,
    category_id: &str,
    action: &str,
    from: Option<CategoryStatus>,
    to: Option<CategoryStatus>,
    actor: &Actor,
    reason: &str,
    details: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<i64, SettlementError> {
    conn.execute(
        "INSERT INTO category_audit
            (category_id, action, from_status, to_status, actor_kind, actor_id, reason, details_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            category_id,
            action,
            from.map(|s| s.as_str()),
            to.map(|s| s.as_str()),
            actor.kind(),
            actor.id(),
            reason,
            serde_json::to_string(details)?,
            timestamp(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Newest first
pub fn list_audit(conn: &Connection, category_id: &str, limit: i64) -> Result<Vec<AuditRow>, SettlementError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM category_audit WHERE category_id = ? ORDER BY id DESC LIMIT ?",
    )?;
    let rows = stmt
        .query_map(params![category_id, limit], AuditRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{categories, SettlementDb};

    #[test]
    fn test_actor_round_trips_through_audit() {
        let db = SettlementDb::open_in_memory().unwrap();
        let now = Utc::now();
        let rows = db
            .with_conn(|conn| {
                categories::insert_category(conn, "c1", "drama", 30, 100, now)?;
                insert_audit(
                    conn,
                    "c1",
                    audit_actions::CATEGORY_CREATED,
                    None,
                    Some(CategoryStatus::Waiting),
                    &Actor::operator("op-1"),
                    "created",
                    &serde_json::json!({}),
                    now,
                )?;
                insert_audit(
                    conn,
                    "c1",
                    audit_actions::CYCLE_STARTED,
                    Some(CategoryStatus::Waiting),
                    Some(CategoryStatus::FirstCycle),
                    &Actor::System,
                    "threshold",
                    &serde_json::json!({ "items": 30 }),
                    now,
                )?;
                list_audit(conn, "c1", 10)
            })
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].actor, Actor::System);
        assert_eq!(rows[0].details["items"], 30);
        assert_eq!(rows[1].actor, Actor::operator("op-1"));
        assert_eq!(rows[1].from_status, None);
    }
}
