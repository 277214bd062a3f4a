//! Ranking service - daily ranking, shared pot and monthly wager settlement
//!
//! Settling a date is a replayable batch. Every point credit is keyed by
//! `(date, recipient, tier)` and written in the same transaction as the pot
//! row. Once the pot row exists the date is final: a replay over unchanged
//! activity is a no-op, and a replay over changed activity is a conflict.
//!
//! ## Pot
//!
//! ```text
//! revenue of rank 11+ ──70/30──▶ pot ──┬─ top-tier share ─▶ equal split among top 10
//!                        │              └─ backer share ───▶ by winning votes
//!                        └─▶ platform
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RankingConfig;
use crate::db::points::point_kinds;
use crate::db::{
    self, points, rankings, sales, wagers, DailyRankingRow, ParticipantActivity, PotDistributionRow,
    SettlementDb, WagerRow,
};
use crate::error::SettlementError;
use crate::lifecycle::Actor;
use crate::points::{minor_to_points, wager_refund_percentage, wager_tier_amount};
use crate::split::{direct_sale_split, equal_pool_split};

use super::events::{EventBus, SettlementEvent};
use super::ledger_service::LedgerService;
use super::operators::{require_system_or_operator, OperatorDirectory};
use super::points_service::PointsService;

/// Result of settling one date
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySettlement {
    pub date: String,
    pub rankings: Vec<DailyRankingRow>,
    pub pot: PotDistributionRow,
    pub backer_bonuses: Vec<BackerBonus>,
    /// Point credits written by this run
    pub credits_applied: u64,
    /// Credits a previous run already wrote
    pub credits_already_applied: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackerBonus {
    pub backer_id: String,
    pub votes: i64,
    pub bonus: i64,
}

/// Latest settled date with its ranking and pot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingSnapshot {
    pub date: String,
    pub rankings: Vec<DailyRankingRow>,
    pub pot: Option<PotDistributionRow>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseWagerInput {
    pub holder_id: String,
    pub tier: i64,
    #[serde(default)]
    pub target_participant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WagerOutcome {
    pub wager_id: String,
    pub holder_id: String,
    pub final_rank: Option<i64>,
    pub refund_percentage: i64,
    pub refund_amount: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WagerSettlementReport {
    pub month_key: String,
    pub ranking_date: String,
    pub settled: Vec<WagerOutcome>,
    /// Wagers a concurrent run completed first
    pub skipped: u64,
    /// Wagers without a target; they stay active
    pub untargeted: u64,
}

/// Rank order: activity desc, revenue desc, earliest registration (unknown last), id
pub fn compare_activity(a: &ParticipantActivity, b: &ParticipantActivity) -> Ordering {
    b.activity_count
        .cmp(&a.activity_count)
        .then_with(|| b.revenue.cmp(&a.revenue))
        .then_with(|| match (&a.registered_at, &b.registered_at) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.participant_id.cmp(&b.participant_id))
}

/// Ranking and pot settlement
pub struct RankingService {
    db: Arc<SettlementDb>,
    events: Arc<EventBus>,
    ledger: Arc<LedgerService>,
    points: Arc<PointsService>,
    operators: Arc<dyn OperatorDirectory>,
    config: RankingConfig,
    points_per_unit: i64,
}

impl RankingService {
    pub fn new(
        db: Arc<SettlementDb>,
        events: Arc<EventBus>,
        ledger: Arc<LedgerService>,
        points: Arc<PointsService>,
        operators: Arc<dyn OperatorDirectory>,
        config: RankingConfig,
        points_per_unit: i64,
    ) -> Self {
        Self {
            db,
            events,
            ledger,
            points,
            operators,
            config,
            points_per_unit,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn rankings_for_date(&self, date: NaiveDate) -> Result<Vec<DailyRankingRow>, SettlementError> {
        let key = db::date_key(date);
        self.db.with_conn(|conn| rankings::rankings_for_date(conn, &key))
    }

    pub fn latest(&self) -> Result<Option<RankingSnapshot>, SettlementError> {
        self.db.with_conn(|conn| {
            let Some(date) = rankings::latest_ranking_date(conn)? else {
                return Ok(None);
            };
            Ok(Some(RankingSnapshot {
                rankings: rankings::rankings_for_date(conn, &date)?,
                pot: rankings::get_pot(conn, &date)?,
                date,
            }))
        })
    }

    pub fn participant_history(
        &self,
        participant_id: &str,
        limit: i64,
    ) -> Result<Vec<DailyRankingRow>, SettlementError> {
        self.db
            .with_conn(|conn| rankings::participant_history(conn, participant_id, limit))
    }

    pub fn pot_for_date(&self, date: NaiveDate) -> Result<Option<PotDistributionRow>, SettlementError> {
        let key = db::date_key(date);
        self.db.with_conn(|conn| rankings::get_pot(conn, &key))
    }

    pub fn list_wagers(&self, month: NaiveDate) -> Result<Vec<WagerRow>, SettlementError> {
        let key = db::month_key(month);
        self.db.with_conn(|conn| wagers::list_wagers(conn, &key))
    }

    // =========================================================================
    // Daily settlement
    // =========================================================================

    /// Rank `date`, compute its pot and credit top-tier participants and their backers.
    pub fn settle_day(
        &self,
        actor: &Actor,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<DaySettlement, SettlementError> {
        require_system_or_operator(self.operators.as_ref(), actor)?;

        let date_key = db::date_key(date);
        let unit = self.ledger.unit();
        let top_tier_size = self.config.top_tier_size.max(0) as usize;

        let result = self.db.transaction(|conn| {
            let mut activity = sales::aggregate_activity(conn, &date_key)?;
            activity.sort_by(compare_activity);

            let top_ids: Vec<String> = activity
                .iter()
                .take(top_tier_size)
                .map(|a| a.participant_id.clone())
                .collect();
            let lower_tier_revenue: i64 = activity.iter().skip(top_tier_size).map(|a| a.revenue).sum();

            // 70% of lower-tier revenue becomes the pot; the platform keeps the residual
            let pot_plan = direct_sale_split(lower_tier_revenue, "daily_pot", unit)?;
            self.ledger.verify_plan(&format!("pot:{}", date_key), &pot_plan)?;
            let total_pot = pot_plan.total() - pot_plan.platform_amount();
            let platform_share = pot_plan.platform_amount();

            let top_tier_share =
                ((total_pot as i128 * self.config.pot_top_tier_share_bps as i128) / 10_000) as i64;
            let backer_share = total_pot - top_tier_share;

            let top_shares = equal_pool_split(top_tier_share, &top_ids, unit)?;
            let top_allocated: i64 = top_shares.iter().map(|(_, amount)| amount).sum();

            let votes = sales::winning_backer_votes(conn, &date_key, &top_ids)?;
            let total_votes: i64 = votes.iter().map(|(_, v)| v).sum();
            let backer_bonuses: Vec<BackerBonus> = if total_votes > 0 {
                votes
                    .iter()
                    .map(|(backer_id, v)| BackerBonus {
                        backer_id: backer_id.clone(),
                        votes: *v,
                        bonus: ((backer_share as i128 * *v as i128) / total_votes as i128) as i64,
                    })
                    .collect()
            } else {
                if backer_share > 0 {
                    warn!(
                        date = %date_key,
                        backer_share,
                        "No winning votes; backer share left unallocated"
                    );
                }
                Vec::new()
            };
            let backer_allocated: i64 = backer_bonuses.iter().map(|b| b.bonus).sum();

            let pot = PotDistributionRow {
                distribution_date: date_key.clone(),
                lower_tier_revenue,
                total_pot,
                platform_share,
                top_tier_share,
                backer_share,
                total_winning_weight: total_votes,
                total_winning_backers: backer_bonuses.len() as i64,
                unallocated_amount: total_pot - top_allocated - backer_allocated,
            };
            if pot.unallocated_amount < 0 {
                let detail = format!("pot over-allocated by {}", -pot.unallocated_amount);
                error!(target: "settlement::invariant", date = %date_key, detail = %detail, "Day settlement aborted");
                self.events.emit(SettlementEvent::InvariantViolation {
                    context: format!("pot:{}", date_key),
                    detail: detail.clone(),
                });
                return Err(SettlementError::InvariantViolation(detail));
            }

            let ranking_rows: Vec<DailyRankingRow> = activity
                .iter()
                .enumerate()
                .map(|(i, a)| DailyRankingRow {
                    ranking_date: date_key.clone(),
                    participant_id: a.participant_id.clone(),
                    rank: i as i64 + 1,
                    activity_count: a.activity_count,
                    revenue: a.revenue,
                    is_top_tier: i < top_tier_size,
                    bonus_earned: top_shares
                        .iter()
                        .find(|(id, _)| *id == a.participant_id)
                        .map(|(_, amount)| *amount)
                        .unwrap_or(0),
                })
                .collect();

            let mut credits = Vec::new();
            for (account_id, amount, kind, tier) in top_shares
                .iter()
                .map(|(id, amount)| (id.as_str(), *amount, point_kinds::POT_TOP_TIER, "top"))
                .chain(
                    backer_bonuses
                        .iter()
                        .map(|b| (b.backer_id.as_str(), b.bonus, point_kinds::POT_BACKER, "backer")),
                )
            {
                let points_amount = minor_to_points(amount, unit, self.points_per_unit)?;
                if points_amount > 0 {
                    let key = format!("pot:{}:{}:{}", date_key, tier, account_id);
                    credits.push((account_id, points_amount, kind, key));
                }
            }

            // A settled date is final. Replaying it is only allowed while the
            // recomputed ranking and pot still match what was credited.
            if let Some(stored_pot) = rankings::get_pot(conn, &date_key)? {
                let stored_rows = rankings::rankings_for_date(conn, &date_key)?;
                if stored_pot != pot || stored_rows != ranking_rows {
                    warn!(
                        date = %date_key,
                        stored_pot = stored_pot.total_pot,
                        recomputed_pot = pot.total_pot,
                        "Activity changed after the date was settled"
                    );
                    return Err(SettlementError::Conflict(format!(
                        "{} was already settled with a pot of {}; activity has changed since",
                        date_key, stored_pot.total_pot
                    )));
                }
                let already = credits.len() as u64;
                return Ok((ranking_rows, pot, backer_bonuses, Vec::new(), already));
            }

            for row in &ranking_rows {
                rankings::upsert_ranking(conn, row, now)?;
            }
            rankings::upsert_pot(conn, &pot, now)?;

            let mut credited = Vec::new();
            let mut already = 0u64;
            for (account_id, amount, kind, key) in &credits {
                match points::apply_transaction(
                    conn,
                    &points::NewPointTransaction {
                        account_id,
                        kind,
                        amount: *amount,
                        related_entity_id: Some(&date_key),
                        related_entity_type: Some("pot_distribution"),
                        idempotency_key: key,
                    },
                    now,
                )? {
                    Some(row) => credited.push(row),
                    None => already += 1,
                }
            }

            Ok((ranking_rows, pot, backer_bonuses, credited, already))
        });

        let (ranking_rows, pot, backer_bonuses, credited, already) = result?;

        for row in &credited {
            self.points.emit_credit(row);
        }

        info!(
            date = %date_key,
            participants = ranking_rows.len(),
            total_pot = pot.total_pot,
            unallocated = pot.unallocated_amount,
            credits = credited.len(),
            "Day settled"
        );
        self.events.emit(SettlementEvent::DaySettled {
            date: date_key.clone(),
            participants: ranking_rows.len(),
            total_pot: pot.total_pot,
            unallocated: pot.unallocated_amount,
        });

        Ok(DaySettlement {
            date: date_key,
            rankings: ranking_rows,
            pot,
            backer_bonuses,
            credits_applied: credited.len() as u64,
            credits_already_applied: already,
        })
    }

    // =========================================================================
    // Wagers
    // =========================================================================

    /// Buy a wager for the month containing `on`. One per holder per month.
    pub fn purchase_wager(
        &self,
        input: &PurchaseWagerInput,
        on: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<WagerRow, SettlementError> {
        if input.holder_id.trim().is_empty() {
            return Err(SettlementError::InvalidInput("holderId is required".into()));
        }
        let amount = wager_tier_amount(input.tier)
            .ok_or_else(|| SettlementError::InvalidInput(format!("Unknown wager tier {}", input.tier)))?;
        let id = Uuid::new_v4().to_string();
        let month = db::month_key(on);

        let wager = self.db.with_conn(|conn| {
            wagers::insert_wager(
                conn,
                &id,
                &input.holder_id,
                input.tier,
                amount,
                &month,
                input.target_participant_id.as_deref(),
                now,
            )
        })?;
        debug!(wager_id = %wager.id, holder = %wager.holder_id, month = %month, "Wager purchased");
        Ok(wager)
    }

    /// Settle every active targeted wager of the month containing `date`
    /// against the final ranks of `date`. The date must already be settled.
    pub fn settle_wagers(
        &self,
        actor: &Actor,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<WagerSettlementReport, SettlementError> {
        require_system_or_operator(self.operators.as_ref(), actor)?;

        let date_key = db::date_key(date);
        let month = db::month_key(date);
        let unit = self.ledger.unit();

        if self.db.with_conn(|conn| rankings::get_pot(conn, &date_key))?.is_none() {
            return Err(SettlementError::InvalidInput(format!(
                "{} has not been settled; final ranks are unknown",
                date_key
            )));
        }

        let (targeted, untargeted): (Vec<WagerRow>, Vec<WagerRow>) = self
            .db
            .with_conn(|conn| wagers::active_wagers_for_month(conn, &month))?
            .into_iter()
            .partition(|w| w.target_participant_id.is_some());
        let mut report = WagerSettlementReport {
            month_key: month.clone(),
            ranking_date: date_key.clone(),
            settled: Vec::new(),
            skipped: 0,
            untargeted: untargeted.len() as u64,
        };

        for wager in targeted {
            let Some(target) = wager.target_participant_id.as_deref() else {
                continue;
            };
            let outcome = self.db.transaction(|conn| {
                let final_rank = rankings::rank_on(conn, &date_key, target)?;
                let refund_percentage = wager_refund_percentage(final_rank);
                let refund_amount = wager.amount * refund_percentage / 100;

                // status guard: only the run that flips active → completed credits
                if !wagers::complete_wager(conn, &wager.id, final_rank, refund_percentage, refund_amount, now)? {
                    return Ok(None);
                }

                let refund_points = minor_to_points(refund_amount, unit, self.points_per_unit)?;
                let credit = if refund_points > 0 {
                    let key = format!("wager:{}:refund", wager.id);
                    points::apply_transaction(
                        conn,
                        &points::NewPointTransaction {
                            account_id: &wager.holder_id,
                            kind: point_kinds::WAGER_REFUND,
                            amount: refund_points,
                            related_entity_id: Some(&wager.id),
                            related_entity_type: Some("wager"),
                            idempotency_key: &key,
                        },
                        now,
                    )?
                } else {
                    None
                };

                Ok(Some((
                    WagerOutcome {
                        wager_id: wager.id.clone(),
                        holder_id: wager.holder_id.clone(),
                        final_rank,
                        refund_percentage,
                        refund_amount,
                    },
                    credit,
                )))
            })?;

            match outcome {
                Some((outcome, credit)) => {
                    if let Some(row) = &credit {
                        self.points.emit_credit(row);
                    }
                    self.events.emit(SettlementEvent::WagerSettled {
                        wager_id: outcome.wager_id.clone(),
                        final_rank: outcome.final_rank,
                        refund_amount: outcome.refund_amount,
                    });
                    report.settled.push(outcome);
                }
                None => report.skipped += 1,
            }
        }

        info!(
            month = %month,
            date = %date_key,
            settled = report.settled.len(),
            skipped = report.skipped,
            untargeted = report.untargeted,
            "Wagers settled"
        );
        Ok(report)
    }
}
