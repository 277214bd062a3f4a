//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::SettlementError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), SettlementError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, SettlementError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), SettlementError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<(), SettlementError> {
    conn.execute_batch(LEDGER_SCHEMA)
        .map_err(|e| SettlementError::Internal(format!("Failed to create ledger tables: {}", e)))?;
    conn.execute_batch(CATEGORY_SCHEMA)
        .map_err(|e| SettlementError::Internal(format!("Failed to create category tables: {}", e)))?;
    conn.execute_batch(RANKING_SCHEMA)
        .map_err(|e| SettlementError::Internal(format!("Failed to create ranking tables: {}", e)))?;
    conn.execute_batch(POINTS_SCHEMA)
        .map_err(|e| SettlementError::Internal(format!("Failed to create points tables: {}", e)))?;
    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| SettlementError::Internal(format!("Failed to create indexes: {}", e)))?;
    Ok(())
}

/// Gateway events and the money ledger
const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS monetary_events (
    id TEXT PRIMARY KEY NOT NULL,
    kind TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    processed_at TEXT
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id TEXT PRIMARY KEY NOT NULL,
    reference_event_id TEXT NOT NULL,
    reference_kind TEXT NOT NULL,
    -- NULL means the platform
    recipient_account_id TEXT,
    role TEXT NOT NULL,
    gross_amount INTEGER NOT NULL CHECK (gross_amount >= 0),
    net_amount INTEGER NOT NULL CHECK (net_amount >= 0),
    fee_amount INTEGER NOT NULL DEFAULT 0,
    idempotency_key TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'completed', 'failed')),
    external_transfer_id TEXT,
    failure_reason TEXT,
    payout_rule TEXT NOT NULL,
    note TEXT,
    created_at TEXT NOT NULL,
    processed_at TEXT
);
"#;

/// Category lifecycle and audit trail
const CATEGORY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS categories (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT 'waiting'
        CHECK (status IN ('waiting', 'first_cycle', 'second_cycle', 'closed')),
    current_item_count INTEGER NOT NULL DEFAULT 0,
    max_item_count INTEGER NOT NULL,
    activation_threshold INTEGER NOT NULL,
    cycle_started_at TEXT,
    cycle_ends_at TEXT,
    current_cycle_number INTEGER NOT NULL DEFAULT 0,
    -- bumped on every write; guards read-check-write transitions
    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS category_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category_id TEXT NOT NULL,
    action TEXT NOT NULL,
    from_status TEXT,
    to_status TEXT,
    actor_kind TEXT NOT NULL CHECK (actor_kind IN ('system', 'operator')),
    actor_id TEXT,
    reason TEXT NOT NULL,
    details_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    FOREIGN KEY (category_id) REFERENCES categories(id) ON DELETE CASCADE
);
"#;

/// Ranking activity, settled days and wagers
const RANKING_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS participants (
    id TEXT PRIMARY KEY NOT NULL,
    registered_at TEXT
);

CREATE TABLE IF NOT EXISTS sales (
    id TEXT PRIMARY KEY NOT NULL,
    participant_id TEXT NOT NULL,
    backer_id TEXT,
    amount INTEGER NOT NULL CHECK (amount >= 0),
    votes INTEGER NOT NULL DEFAULT 0,
    sale_date TEXT NOT NULL,
    source_event_id TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS daily_rankings (
    ranking_date TEXT NOT NULL,
    participant_id TEXT NOT NULL,
    rank INTEGER NOT NULL,
    activity_count INTEGER NOT NULL,
    revenue INTEGER NOT NULL,
    is_top_tier INTEGER NOT NULL DEFAULT 0,
    bonus_earned INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (ranking_date, participant_id)
);

CREATE TABLE IF NOT EXISTS pot_distributions (
    distribution_date TEXT PRIMARY KEY NOT NULL,
    lower_tier_revenue INTEGER NOT NULL,
    total_pot INTEGER NOT NULL,
    platform_share INTEGER NOT NULL,
    top_tier_share INTEGER NOT NULL,
    backer_share INTEGER NOT NULL,
    total_winning_weight INTEGER NOT NULL,
    total_winning_backers INTEGER NOT NULL,
    unallocated_amount INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS wagers (
    id TEXT PRIMARY KEY NOT NULL,
    holder_id TEXT NOT NULL,
    tier INTEGER NOT NULL,
    amount INTEGER NOT NULL,
    month_key TEXT NOT NULL,
    target_participant_id TEXT,
    final_rank INTEGER,
    refund_percentage INTEGER,
    refund_amount INTEGER,
    status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'completed')),
    created_at TEXT NOT NULL,
    settled_at TEXT,
    UNIQUE (holder_id, month_key)
);
"#;

/// Loyalty point ledger
const POINTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS point_transactions (
    id TEXT PRIMARY KEY NOT NULL,
    account_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    amount INTEGER NOT NULL,
    balance_before INTEGER NOT NULL,
    balance_after INTEGER NOT NULL CHECK (balance_after >= 0),
    related_entity_id TEXT,
    related_entity_type TEXT,
    idempotency_key TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS point_balances (
    account_id TEXT PRIMARY KEY NOT NULL,
    balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS point_streaks (
    account_id TEXT NOT NULL,
    streak_kind TEXT NOT NULL,
    last_period TEXT NOT NULL,
    length INTEGER NOT NULL,
    PRIMARY KEY (account_id, streak_kind)
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_ledger_event ON ledger_entries(reference_event_id);
CREATE INDEX IF NOT EXISTS idx_ledger_status ON ledger_entries(status, created_at);
CREATE INDEX IF NOT EXISTS idx_categories_status ON categories(status);
CREATE INDEX IF NOT EXISTS idx_audit_category ON category_audit(category_id, id);
CREATE INDEX IF NOT EXISTS idx_sales_date ON sales(sale_date, participant_id);
CREATE INDEX IF NOT EXISTS idx_rankings_participant ON daily_rankings(participant_id, ranking_date);
CREATE INDEX IF NOT EXISTS idx_wagers_month ON wagers(month_key, status);
CREATE INDEX IF NOT EXISTS idx_points_account ON point_transactions(account_id, created_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_ledger_key_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let insert = "INSERT INTO ledger_entries (id, reference_event_id, reference_kind, role, \
                      gross_amount, net_amount, idempotency_key, payout_rule, created_at) \
                      VALUES (?1, 'evt', 'sale', 'creator_sale', 100, 100, 'k1', 'r', 'now')";
        conn.execute(insert, ["a"]).unwrap();
        assert!(conn.execute(insert, ["b"]).is_err());
    }
}
