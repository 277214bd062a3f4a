//! Daily rankings and pot distributions
//!
//! Both tables are written with upserts on their natural keys so settling a
//! date again overwrites instead of duplicating.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::timestamp;
use crate::error::SettlementError;

/// Daily ranking row from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyRankingRow {
    pub ranking_date: String,
    pub participant_id: String,
    pub rank: i64,
    pub activity_count: i64,
    pub revenue: i64,
    pub is_top_tier: bool,
    pub bonus_earned: i64,
}

impl DailyRankingRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            ranking_date: row.get("ranking_date")?,
            participant_id: row.get("participant_id")?,
            rank: row.get("rank")?,
            activity_count: row.get("activity_count")?,
            revenue: row.get("revenue")?,
            is_top_tier: row.get::<_, i64>("is_top_tier")? != 0,
            bonus_earned: row.get("bonus_earned")?,
        })
    }
}

/// Pot distribution row from database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PotDistributionRow {
    pub distribution_date: String,
    /// Revenue of rank 11+ participants the pot was taken from
    pub lower_tier_revenue: i64,
    pub total_pot: i64,
    pub platform_share: i64,
    pub top_tier_share: i64,
    pub backer_share: i64,
    pub total_winning_weight: i64,
    pub total_winning_backers: i64,
    /// Pot amount computed but not credited to anyone
    pub unallocated_amount: i64,
}

impl PotDistributionRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            distribution_date: row.get("distribution_date")?,
            lower_tier_revenue: row.get("lower_tier_revenue")?,
            total_pot: row.get("total_pot")?,
            platform_share: row.get("platform_share")?,
            top_tier_share: row.get("top_tier_share")?,
            backer_share: row.get("backer_share")?,
            total_winning_weight: row.get("total_winning_weight")?,
            total_winning_backers: row.get("total_winning_backers")?,
            unallocated_amount: row.get("unallocated_amount")?,
        })
    }
}

pub fn upsert_ranking(conn: &Connection, row: &DailyRankingRow, now: DateTime<Utc>) -> Result<(), SettlementError> {
    conn.execute(
        "INSERT INTO daily_rankings
            (ranking_date, participant_id, rank, activity_count, revenue, is_top_tier, bonus_earned, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(ranking_date, participant_id) DO UPDATE SET
            rank = excluded.rank,
            activity_count = excluded.activity_count,
            revenue = excluded.revenue,
            is_top_tier = excluded.is_top_tier,
            bonus_earned = excluded.bonus_earned,
            updated_at = excluded.updated_at",
        params![
            row.ranking_date,
            row.participant_id,
            row.rank,
            row.activity_count,
            row.revenue,
            row.is_top_tier as i64,
            row.bonus_earned,
            timestamp(now),
        ],
    )?;
    Ok(())
}

pub fn rankings_for_date(conn: &Connection, date: &str) -> Result<Vec<DailyRankingRow>, SettlementError> {
    let mut stmt = conn.prepare("SELECT * FROM daily_rankings WHERE ranking_date = ? ORDER BY rank ASC")?;
    let rows = stmt
        .query_map(params![date], DailyRankingRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn latest_ranking_date(conn: &Connection) -> Result<Option<String>, SettlementError> {
    Ok(conn.query_row("SELECT MAX(ranking_date) FROM daily_rankings", [], |row| row.get(0))?)
}

/// A participant's series, newest date first
pub fn participant_history(
    conn: &Connection,
    participant_id: &str,
    limit: i64,
) -> Result<Vec<DailyRankingRow>, SettlementError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM daily_rankings WHERE participant_id = ? ORDER BY ranking_date DESC LIMIT ?",
    )?;
    let rows = stmt
        .query_map(params![participant_id, limit], DailyRankingRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn rank_on(conn: &Connection, date: &str, participant_id: &str) -> Result<Option<i64>, SettlementError> {
    Ok(conn
        .query_row(
            "SELECT rank FROM daily_rankings WHERE ranking_date = ?1 AND participant_id = ?2",
            params![date, participant_id],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn upsert_pot(conn: &Connection, pot: &PotDistributionRow, now: DateTime<Utc>) -> Result<(), SettlementError> {
    let ts = timestamp(now);
    conn.execute(
        "INSERT INTO pot_distributions
            (distribution_date, lower_tier_revenue, total_pot, platform_share, top_tier_share,
             backer_share, total_winning_weight, total_winning_backers, unallocated_amount,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
         ON CONFLICT(distribution_date) DO UPDATE SET
            lower_tier_revenue = excluded.lower_tier_revenue,
            total_pot = excluded.total_pot,
            platform_share = excluded.platform_share,
            top_tier_share = excluded.top_tier_share,
            backer_share = excluded.backer_share,
            total_winning_weight = excluded.total_winning_weight,
            total_winning_backers = excluded.total_winning_backers,
            unallocated_amount = excluded.unallocated_amount,
            updated_at = excluded.updated_at",
        params![
            pot.distribution_date,
            pot.lower_tier_revenue,
            pot.total_pot,
            pot.platform_share,
            pot.top_tier_share,
            pot.backer_share,
            pot.total_winning_weight,
            pot.total_winning_backers,
            pot.unallocated_amount,
            ts,
        ],
    )?;
    Ok(())
}

pub fn get_pot(conn: &Connection, date: &str) -> Result<Option<PotDistributionRow>, SettlementError> {
    Ok(conn
        .query_row(
            "SELECT * FROM pot_distributions WHERE distribution_date = ?",
            params![date],
            PotDistributionRow::from_row,
        )
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SettlementDb;

    fn ranking(participant: &str, rank: i64) -> DailyRankingRow {
        DailyRankingRow {
            ranking_date: "2025-03-01".into(),
            participant_id: participant.into(),
            rank,
            activity_count: 10 - rank,
            revenue: 1_000,
            is_top_tier: rank <= 10,
            bonus_earned: 0,
        }
    }

    #[test]
    fn test_upsert_overwrites_instead_of_duplicating() {
        let db = SettlementDb::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_conn(|conn| {
            upsert_ranking(conn, &ranking("p1", 1), now)?;
            upsert_ranking(conn, &ranking("p2", 2), now)?;
            upsert_ranking(conn, &ranking("p1", 2), now)?;
            upsert_ranking(conn, &ranking("p2", 1), now)?;

            let rows = rankings_for_date(conn, "2025-03-01")?;
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[0].participant_id, "p2");
            assert_eq!(rank_on(conn, "2025-03-01", "p1")?, Some(2));
            assert_eq!(rank_on(conn, "2025-03-01", "p9")?, None);
            assert_eq!(latest_ranking_date(conn)?, Some("2025-03-01".to_string()));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_pot_is_one_per_date() {
        let db = SettlementDb::open_in_memory().unwrap();
        let now = Utc::now();
        let mut pot = PotDistributionRow {
            distribution_date: "2025-03-01".into(),
            total_pot: 700,
            ..Default::default()
        };
        db.with_conn(|conn| {
            upsert_pot(conn, &pot, now)?;
            pot.total_pot = 1_400;
            upsert_pot(conn, &pot, now)?;
            assert_eq!(get_pot(conn, "2025-03-01")?.unwrap().total_pot, 1_400);
            assert!(get_pot(conn, "2025-03-02")?.is_none());
            Ok(())
        })
        .unwrap();
        assert_eq!(db.stats().unwrap().settled_days, 1);
    }

    #[test]
    fn test_empty_history() {
        let db = SettlementDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            assert_eq!(latest_ranking_date(conn)?, None);
            assert!(participant_history(conn, "p1", 30)?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}
