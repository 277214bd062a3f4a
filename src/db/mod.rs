//! SQLite persistence for the settlement engine
//!
//! Idempotency is carried by the schema, not by application locks: every
//! re-runnable write is an `INSERT OR IGNORE`, an upsert on a natural key, or a
//! conditional `UPDATE` guarded by the expected previous state.
//!
//! ## Tables
//!
//! - `monetary_events` - gateway callbacks, unique on the external event id
//! - `ledger_entries` - distribution lines, unique on `idempotency_key`
//! - `categories` / `category_audit` - lifecycle state and its audit trail
//! - `participants` / `sales` - daily ranking activity
//! - `daily_rankings` / `pot_distributions` - settled days
//! - `wagers` - monthly tickets
//! - `point_transactions` / `point_balances` / `point_streaks` - loyalty points

pub mod schema;
pub mod events;
pub mod ledger;
pub mod categories;
pub mod audit;
pub mod sales;
pub mod rankings;
pub mod wagers;
pub mod points;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode};
use tracing::{debug, info};

use crate::error::SettlementError;

/// SQLite database for settlement state
pub struct SettlementDb {
    conn: Mutex<Connection>,
}

impl SettlementDb {
    /// Open or create the settlement database in `storage_dir`
    pub fn open(storage_dir: &Path) -> Result<Self, SettlementError> {
        std::fs::create_dir_all(storage_dir)?;
        let db_path = storage_dir.join("settlement.db");
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, SettlementError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), SettlementError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read with the shared connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, SettlementError>
    where
        F: FnOnce(&Connection) -> Result<T, SettlementError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SettlementError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access (needed for transactions)
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, SettlementError>
    where
        F: FnOnce(&mut Connection) -> Result<T, SettlementError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| SettlementError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Run `f` inside a single transaction; nothing is committed if it fails
    pub fn transaction<F, T>(&self, f: F) -> Result<T, SettlementError>
    where
        F: FnOnce(&Connection) -> Result<T, SettlementError>,
    {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, SettlementError> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64, SettlementError> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                monetary_events: count("SELECT COUNT(*) FROM monetary_events")?,
                ledger_entries: count("SELECT COUNT(*) FROM ledger_entries")?,
                pending_entries: count(
                    "SELECT COUNT(*) FROM ledger_entries WHERE status = 'pending'",
                )?,
                categories: count("SELECT COUNT(*) FROM categories")?,
                open_categories: count(
                    "SELECT COUNT(*) FROM categories WHERE status != 'closed'",
                )?,
                settled_days: count("SELECT COUNT(*) FROM pot_distributions")?,
                active_wagers: count("SELECT COUNT(*) FROM wagers WHERE status = 'active'")?,
                point_transactions: count("SELECT COUNT(*) FROM point_transactions")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub monetary_events: u64,
    pub ledger_entries: u64,
    pub pending_entries: u64,
    pub categories: u64,
    pub open_categories: u64,
    pub settled_days: u64,
    pub active_wagers: u64,
    pub point_transactions: u64,
}

// ============================================================================
// Shared helpers
// ============================================================================

/// RFC 3339 with second precision and a `Z` suffix, so text order is time order
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, SettlementError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SettlementError::Internal(format!("Bad timestamp '{}': {}", value, e)))
}

/// `YYYY-MM-DD`
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// `YYYY-MM`
pub fn month_key(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

pub fn parse_date(value: &str) -> Result<NaiveDate, SettlementError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| SettlementError::InvalidInput(format!("Expected YYYY-MM-DD, got '{}'", value)))
}

/// True when a statement failed on a UNIQUE / CHECK constraint
pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

// Re-exports
pub use audit::AuditRow;
pub use categories::{CategoryRow, CreateCategoryInput, UpdateCategoryInput};
pub use events::MonetaryEventRow;
pub use ledger::{LedgerEntryRow, PersistResult};
pub use points::{NewPointTransaction, PointTransactionRow};
pub use rankings::{DailyRankingRow, PotDistributionRow};
pub use sales::{NewSale, ParticipantActivity};
pub use wagers::WagerRow;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_and_stats() {
        let db = SettlementDb::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.monetary_events, 0);
        assert_eq!(stats.open_categories, 0);
    }

    #[test]
    fn test_open_on_disk_twice() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = SettlementDb::open(dir.path()).unwrap();
            db.with_conn(|conn| {
                events::record_event(conn, "evt_1", "sale.completed", &serde_json::json!({}), Utc::now())
            })
            .unwrap();
        }
        let db = SettlementDb::open(dir.path()).unwrap();
        assert_eq!(db.stats().unwrap().monetary_events, 1);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = SettlementDb::open_in_memory().unwrap();
        let result: Result<(), SettlementError> = db.transaction(|conn| {
            events::record_event(conn, "evt_1", "x", &serde_json::json!({}), Utc::now())?;
            Err(SettlementError::Internal("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.stats().unwrap().monetary_events, 0);
    }

    #[test]
    fn test_key_formats() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert_eq!(date_key(date), "2025-03-09");
        assert_eq!(month_key(date), "2025-03");
        assert_eq!(parse_date("2025-03-09").unwrap(), date);
        assert!(parse_date("03/09/2025").is_err());
    }
}
