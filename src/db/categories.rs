//! Category persistence
//!
//! Every write bumps `version`. State changes are conditional updates on
//! `(id, status, version)` so two concurrent sweeps cannot both apply a
//! transition to the same row.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{is_constraint_violation, parse_timestamp, timestamp};
use crate::error::SettlementError;
use crate::lifecycle::{CategoryStatus, LifecycleState, Transition};

/// Category row from database
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRow {
    pub id: String,
    pub name: String,
    pub status: String,
    pub current_item_count: i64,
    pub max_item_count: i64,
    pub activation_threshold: i64,
    pub cycle_started_at: Option<String>,
    pub cycle_ends_at: Option<String>,
    pub current_cycle_number: i64,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl CategoryRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            status: row.get("status")?,
            current_item_count: row.get("current_item_count")?,
            max_item_count: row.get("max_item_count")?,
            activation_threshold: row.get("activation_threshold")?,
            cycle_started_at: row.get("cycle_started_at")?,
            cycle_ends_at: row.get("cycle_ends_at")?,
            current_cycle_number: row.get("current_cycle_number")?,
            version: row.get("version")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn status(&self) -> Result<CategoryStatus, SettlementError> {
        CategoryStatus::parse(&self.status).ok_or_else(|| {
            SettlementError::Internal(format!("Unknown category status '{}'", self.status))
        })
    }

    pub fn cycle_ends_at(&self) -> Result<Option<DateTime<Utc>>, SettlementError> {
        self.cycle_ends_at.as_deref().map(parse_timestamp).transpose()
    }

    /// Snapshot handed to the state machine
    pub fn lifecycle_state(&self) -> Result<LifecycleState, SettlementError> {
        Ok(LifecycleState {
            status: self.status()?,
            current_item_count: self.current_item_count,
            activation_threshold: self.activation_threshold,
            max_item_count: self.max_item_count,
            cycle_ends_at: self.cycle_ends_at()?,
        })
    }
}

/// Input for creating a category - camelCase for the operator surface
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCategoryInput {
    pub name: String,
    #[serde(default)]
    pub activation_threshold: Option<i64>,
    #[serde(default)]
    pub max_item_count: Option<i64>,
}

/// Partial update; absent fields keep their value
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCategoryInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub activation_threshold: Option<i64>,
    #[serde(default)]
    pub max_item_count: Option<i64>,
}

pub fn insert_category(
    conn: &Connection,
    id: &str,
    name: &str,
    activation_threshold: i64,
    max_item_count: i64,
    now: DateTime<Utc>,
) -> Result<CategoryRow, SettlementError> {
    let ts = timestamp(now);
    conn.execute(
        "INSERT INTO categories (id, name, status, max_item_count, activation_threshold, created_at, updated_at)
         VALUES (?1, ?2, 'waiting', ?3, ?4, ?5, ?5)",
        params![id, name, max_item_count, activation_threshold, ts],
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            SettlementError::Conflict(format!("Category '{}' already exists", name))
        } else {
            SettlementError::Database(e)
        }
    })?;

    get_category(conn, id)?
        .ok_or_else(|| SettlementError::Internal(format!("Category {} vanished after insert", id)))
}

pub fn get_category(conn: &Connection, id: &str) -> Result<Option<CategoryRow>, SettlementError> {
    Ok(conn
        .query_row("SELECT * FROM categories WHERE id = ?", params![id], CategoryRow::from_row)
        .optional()?)
}

/// All categories that can still transition, oldest first
pub fn list_open_categories(conn: &Connection) -> Result<Vec<CategoryRow>, SettlementError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM categories WHERE status != 'closed' ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt
        .query_map([], CategoryRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_categories(conn: &Connection) -> Result<Vec<CategoryRow>, SettlementError> {
    let mut stmt = conn.prepare("SELECT * FROM categories ORDER BY created_at ASC, id ASC")?;
    let rows = stmt
        .query_map([], CategoryRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Apply settings if the row is still at `expected_version` and not closed
pub fn update_settings(
    conn: &Connection,
    id: &str,
    expected_version: i64,
    name: &str,
    activation_threshold: i64,
    max_item_count: i64,
    now: DateTime<Utc>,
) -> Result<bool, SettlementError> {
    let changed = conn
        .execute(
            "UPDATE categories
             SET name = ?3, activation_threshold = ?4, max_item_count = ?5,
                 updated_at = ?6, version = version + 1
             WHERE id = ?1 AND version = ?2 AND status != 'closed'",
            params![id, expected_version, name, activation_threshold, max_item_count, timestamp(now)],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                SettlementError::Conflict(format!("Category '{}' already exists", name))
            } else {
                SettlementError::Database(e)
            }
        })?;
    Ok(changed > 0)
}

/// Add `delta` items to an open category. Returns `false` when closed or missing.
pub fn add_items(
    conn: &Connection,
    id: &str,
    delta: i64,
    now: DateTime<Utc>,
) -> Result<bool, SettlementError> {
    let changed = conn.execute(
        "UPDATE categories
         SET current_item_count = MAX(0, current_item_count + ?2),
             updated_at = ?3, version = version + 1
         WHERE id = ?1 AND status != 'closed'",
        params![id, delta, timestamp(now)],
    )?;
    Ok(changed > 0)
}

/// Conditionally apply a transition.
///
/// Returns `false` when the row no longer matches `(transition.from, expected_version)`,
/// meaning another writer got there first.
pub fn apply_transition(
    conn: &Connection,
    id: &str,
    expected_version: i64,
    transition: &Transition,
    now: DateTime<Utc>,
) -> Result<bool, SettlementError> {
    let changed = match &transition.cycle {
        Some(cycle) => conn.execute(
            "UPDATE categories
             SET status = ?4, cycle_started_at = ?5, cycle_ends_at = ?6,
                 current_cycle_number = ?7, updated_at = ?8, version = version + 1
             WHERE id = ?1 AND status = ?2 AND version = ?3",
            params![
                id,
                transition.from.as_str(),
                expected_version,
                transition.to.as_str(),
                timestamp(cycle.started_at),
                timestamp(cycle.ends_at),
                cycle.number,
                timestamp(now),
            ],
        )?,
        None => conn.execute(
            "UPDATE categories
             SET status = ?4, updated_at = ?5, version = version + 1
             WHERE id = ?1 AND status = ?2 AND version = ?3",
            params![
                id,
                transition.from.as_str(),
                expected_version,
                transition.to.as_str(),
                timestamp(now),
            ],
        )?,
    };
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SettlementDb;
    use crate::lifecycle::{evaluate, CycleWindow, TransitionReason};
    use chrono::Duration;

    #[test]
    fn test_insert_and_duplicate_name() {
        let db = SettlementDb::open_in_memory().unwrap();
        let now = Utc::now();
        let row = db
            .with_conn(|conn| insert_category(conn, "c1", "comedy", 30, 100, now))
            .unwrap();
        assert_eq!(row.status, "waiting");
        assert_eq!(row.version, 0);

        let dup = db.with_conn(|conn| insert_category(conn, "c2", "comedy", 30, 100, now));
        assert!(matches!(dup, Err(SettlementError::Conflict(_))));
    }

    #[test]
    fn test_stale_version_loses() {
        let db = SettlementDb::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_conn(|conn| {
            insert_category(conn, "c1", "music", 2, 10, now)?;
            add_items(conn, "c1", 3, now)?;
            let row = get_category(conn, "c1")?.unwrap();
            let transition = evaluate(&row.lifecycle_state()?, now, Duration::hours(168)).unwrap();

            assert!(apply_transition(conn, "c1", row.version, &transition, now)?);
            // a second writer holding the same snapshot is rejected
            assert!(!apply_transition(conn, "c1", row.version, &transition, now)?);

            let row = get_category(conn, "c1")?.unwrap();
            assert_eq!(row.status()?, CategoryStatus::FirstCycle);
            assert_eq!(row.current_cycle_number, 1);
            assert!(row.cycle_ends_at()?.is_some());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_closed_rows_are_frozen() {
        let db = SettlementDb::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_conn(|conn| {
            insert_category(conn, "c1", "sport", 1, 5, now)?;
            let close = Transition {
                from: CategoryStatus::Waiting,
                to: CategoryStatus::Closed,
                reason: TransitionReason::ManualClose("test".into()),
                cycle: None,
            };
            assert!(apply_transition(conn, "c1", 0, &close, now)?);
            assert!(!add_items(conn, "c1", 1, now)?);
            assert!(!update_settings(conn, "c1", 1, "sport", 1, 5, now)?);

            let reopen = Transition {
                from: CategoryStatus::Waiting,
                to: CategoryStatus::FirstCycle,
                reason: TransitionReason::ThresholdReached,
                cycle: Some(CycleWindow::open(1, now, Duration::hours(1))),
            };
            assert!(!apply_transition(conn, "c1", 1, &reopen, now)?);
            assert!(list_open_categories(conn)?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
