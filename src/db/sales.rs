//! Sale activity feeding the daily ranking

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::timestamp;
use crate::error::SettlementError;

/// A sale to record as ranking activity
#[derive(Debug, Clone)]
pub struct NewSale<'a> {
    /// Usually the gateway event id, so a sale is recorded once
    pub id: &'a str,
    pub participant_id: &'a str,
    pub backer_id: Option<&'a str>,
    pub amount: i64,
    pub votes: i64,
    /// `YYYY-MM-DD`
    pub sale_date: &'a str,
    pub source_event_id: Option<&'a str>,
}

/// Per-participant aggregate for one date
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantActivity {
    pub participant_id: String,
    pub activity_count: i64,
    pub revenue: i64,
    pub registered_at: Option<String>,
}

impl ParticipantActivity {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            participant_id: row.get("participant_id")?,
            activity_count: row.get("activity_count")?,
            revenue: row.get("revenue")?,
            registered_at: row.get("registered_at")?,
        })
    }
}

/// Register a participant; a known registration time is never overwritten
pub fn upsert_participant(
    conn: &Connection,
    id: &str,
    registered_at: Option<DateTime<Utc>>,
) -> Result<(), SettlementError> {
    conn.execute(
        "INSERT INTO participants (id, registered_at) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET registered_at = COALESCE(participants.registered_at, excluded.registered_at)",
        params![id, registered_at.map(timestamp)],
    )?;
    Ok(())
}

/// Insert-or-ignore on the sale id. Returns `true` when inserted.
pub fn record_sale(conn: &Connection, sale: &NewSale<'_>, now: DateTime<Utc>) -> Result<bool, SettlementError> {
    if sale.amount < 0 {
        return Err(SettlementError::InvalidInput(format!(
            "sale amount must not be negative (got {})",
            sale.amount
        )));
    }
    upsert_participant(conn, sale.participant_id, None)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO sales
            (id, participant_id, backer_id, amount, votes, sale_date, source_event_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            sale.id,
            sale.participant_id,
            sale.backer_id,
            sale.amount,
            sale.votes,
            sale.sale_date,
            sale.source_event_id,
            timestamp(now),
        ],
    )?;
    Ok(inserted > 0)
}

/// Sale count and revenue per participant for a date (unordered)
pub fn aggregate_activity(conn: &Connection, date: &str) -> Result<Vec<ParticipantActivity>, SettlementError> {
    let mut stmt = conn.prepare(
        "SELECT s.participant_id AS participant_id,
                COUNT(*) AS activity_count,
                COALESCE(SUM(s.amount), 0) AS revenue,
                p.registered_at AS registered_at
         FROM sales s
         LEFT JOIN participants p ON p.id = s.participant_id
         WHERE s.sale_date = ?
         GROUP BY s.participant_id",
    )?;
    let rows = stmt
        .query_map(params![date], ParticipantActivity::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Summed positive votes per backer who supported one of `participants` on `date`,
/// ordered by backer id.
pub fn winning_backer_votes(
    conn: &Connection,
    date: &str,
    participants: &[String],
) -> Result<Vec<(String, i64)>, SettlementError> {
    if participants.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; participants.len()].join(", ");
    let sql = format!(
        "SELECT backer_id, SUM(votes) AS votes
         FROM sales
         WHERE sale_date = ? AND backer_id IS NOT NULL AND votes > 0
           AND participant_id IN ({})
         GROUP BY backer_id
         ORDER BY backer_id ASC",
        placeholders
    );

    let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(participants.len() + 1);
    values.push(&date);
    for id in participants {
        values.push(id);
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(values.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SettlementDb;

    fn sale<'a>(id: &'a str, participant: &'a str, backer: Option<&'a str>, amount: i64) -> NewSale<'a> {
        NewSale {
            id,
            participant_id: participant,
            backer_id: backer,
            amount,
            votes: amount / 10,
            sale_date: "2025-03-01",
            source_event_id: Some(id),
        }
    }

    #[test]
    fn test_aggregate_and_votes() {
        let db = SettlementDb::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_conn(|conn| {
            assert!(record_sale(conn, &sale("s1", "p1", Some("b1"), 200), now)?);
            assert!(!record_sale(conn, &sale("s1", "p1", Some("b1"), 200), now)?);
            record_sale(conn, &sale("s2", "p1", Some("b2"), 100), now)?;
            record_sale(conn, &sale("s3", "p2", Some("b1"), 50), now)?;
            record_sale(conn, &sale("s4", "p3", None, 500), now)?;

            let mut activity = aggregate_activity(conn, "2025-03-01")?;
            activity.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
            assert_eq!(activity.len(), 3);
            assert_eq!(activity[0].activity_count, 2);
            assert_eq!(activity[0].revenue, 300);

            let votes = winning_backer_votes(conn, "2025-03-01", &["p1".into(), "p2".into()])?;
            assert_eq!(votes, vec![("b1".to_string(), 25), ("b2".to_string(), 10)]);

            assert!(aggregate_activity(conn, "2025-03-02")?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_registration_time_is_kept() {
        let db = SettlementDb::open_in_memory().unwrap();
        let early = Utc::now() - chrono::Duration::days(30);
        db.with_conn(|conn| {
            upsert_participant(conn, "p1", Some(early))?;
            upsert_participant(conn, "p1", Some(Utc::now()))?;
            record_sale(conn, &sale("s1", "p1", None, 10), Utc::now())?;
            let activity = aggregate_activity(conn, "2025-03-01")?;
            assert_eq!(activity[0].registered_at, Some(timestamp(early)));
            Ok(())
        })
        .unwrap();
    }
}
