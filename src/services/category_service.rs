//! Category service - lifecycle controller and operator administration
//!
//! The state machine itself lives in `lifecycle::evaluate`; this service loads
//! rows, applies the chosen transition with a version guard, and writes the
//! audit record in the same transaction.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CategoryConfig;
use crate::db::audit::{self, audit_actions};
use crate::db::{
    categories, AuditRow, CategoryRow, CreateCategoryInput, PersistResult, SettlementDb,
    UpdateCategoryInput,
};
use crate::error::SettlementError;
use crate::lifecycle::{evaluate, Actor, CategoryStatus, CycleWindow, Transition, TransitionReason};
use crate::split::{closure_pot_split, DistributionPlan};

use super::events::{EventBus, SettlementEvent};
use super::ledger_service::LedgerService;
use super::operators::{require_operator, require_system_or_operator, OperatorDirectory};

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepRequest {
    #[serde(default)]
    pub dry_run: bool,
    /// Restrict the sweep to these categories; all open categories otherwise
    #[serde(default)]
    pub category_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepAction {
    Transitioned,
    WouldTransition,
    NoAction,
    /// Another writer changed the row between read and write
    Conflict,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepOutcome {
    pub category_id: String,
    pub name: String,
    pub from: CategoryStatus,
    pub to: Option<CategoryStatus>,
    pub action: SweepAction,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub dry_run: bool,
    pub evaluated: usize,
    pub transitioned: usize,
    pub outcomes: Vec<SweepOutcome>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCycleInput {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseCategoryInput {
    pub reason: String,
    #[serde(default = "default_trigger_payout")]
    pub trigger_payout: bool,
}

fn default_trigger_payout() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStats {
    pub category_id: String,
    pub name: String,
    pub status: CategoryStatus,
    pub current_item_count: i64,
    pub activation_threshold: i64,
    pub max_item_count: i64,
    pub remaining_until_activation: i64,
    pub remaining_capacity: i64,
    pub current_cycle_number: i64,
    pub cycle_ends_at: Option<String>,
    /// Seconds left in the active cycle, floored at zero
    pub seconds_remaining: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosurePayoutInput {
    pub pot: i64,
    #[serde(default)]
    pub top_investors: Vec<String>,
    #[serde(default)]
    pub top_creators: Vec<String>,
    #[serde(default)]
    pub lower_investors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosurePayout {
    pub category_id: String,
    pub source_event_id: String,
    pub plan: DistributionPlan,
    pub persisted: PersistResult,
}

/// Ledger source id of a category's closure plan
pub fn closure_source_id(category_id: &str) -> String {
    format!("category:{}:closure", category_id)
}

fn validate_limits(activation_threshold: i64, max_item_count: i64) -> Result<(), SettlementError> {
    if activation_threshold <= 0 || max_item_count <= 0 {
        return Err(SettlementError::InvalidInput(
            "activationThreshold and maxItemCount must be positive".into(),
        ));
    }
    if activation_threshold > max_item_count {
        return Err(SettlementError::InvalidInput(format!(
            "activationThreshold ({}) must not exceed maxItemCount ({})",
            activation_threshold, max_item_count
        )));
    }
    Ok(())
}

fn audit_action_for(to: CategoryStatus) -> &'static str {
    match to {
        CategoryStatus::FirstCycle => audit_actions::CYCLE_STARTED,
        CategoryStatus::SecondCycle => audit_actions::CYCLE_EXTENDED,
        CategoryStatus::Closed => audit_actions::CATEGORY_CLOSED,
        CategoryStatus::Waiting => audit_actions::CATEGORY_UPDATED,
    }
}

// ============================================================================
// Service
// ============================================================================

/// Category lifecycle controller
pub struct CategoryService {
    db: Arc<SettlementDb>,
    events: Arc<EventBus>,
    operators: Arc<dyn OperatorDirectory>,
    ledger: Arc<LedgerService>,
    config: CategoryConfig,
}

impl CategoryService {
    pub fn new(
        db: Arc<SettlementDb>,
        events: Arc<EventBus>,
        operators: Arc<dyn OperatorDirectory>,
        ledger: Arc<LedgerService>,
        config: CategoryConfig,
    ) -> Self {
        Self {
            db,
            events,
            operators,
            ledger,
            config,
        }
    }

    fn cycle_duration(&self) -> Duration {
        Duration::hours(self.config.cycle_duration_hours)
    }

    fn load(&self, id: &str) -> Result<CategoryRow, SettlementError> {
        self.db
            .with_conn(|conn| categories::get_category(conn, id))?
            .ok_or_else(|| SettlementError::NotFound(format!("Category {} not found", id)))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, id: &str) -> Result<CategoryRow, SettlementError> {
        self.load(id)
    }

    pub fn list(&self) -> Result<Vec<CategoryRow>, SettlementError> {
        self.db.with_conn(categories::list_categories)
    }

    pub fn stats(&self, id: &str, now: DateTime<Utc>) -> Result<CategoryStats, SettlementError> {
        let row = self.load(id)?;
        let status = row.status()?;
        let seconds_remaining = if status.in_cycle() {
            row.cycle_ends_at()?
                .map(|end| (end - now).num_seconds().max(0))
        } else {
            None
        };

        Ok(CategoryStats {
            remaining_until_activation: if status == CategoryStatus::Waiting {
                (row.activation_threshold - row.current_item_count).max(0)
            } else {
                0
            },
            remaining_capacity: (row.max_item_count - row.current_item_count).max(0),
            category_id: row.id,
            name: row.name,
            status,
            current_item_count: row.current_item_count,
            activation_threshold: row.activation_threshold,
            max_item_count: row.max_item_count,
            current_cycle_number: row.current_cycle_number,
            cycle_ends_at: row.cycle_ends_at,
            seconds_remaining,
        })
    }

    /// Newest first
    pub fn audit_trail(&self, id: &str, limit: i64) -> Result<Vec<AuditRow>, SettlementError> {
        self.load(id)?;
        self.db.with_conn(|conn| audit::list_audit(conn, id, limit))
    }

    // =========================================================================
    // Administration
    // =========================================================================

    pub fn create(
        &self,
        actor: &Actor,
        input: &CreateCategoryInput,
        now: DateTime<Utc>,
    ) -> Result<CategoryRow, SettlementError> {
        require_operator(self.operators.as_ref(), actor)?;

        let name = input.name.trim();
        if name.is_empty() {
            return Err(SettlementError::InvalidInput("name is required".into()));
        }
        let threshold = input
            .activation_threshold
            .unwrap_or(self.config.default_activation_threshold);
        let max = input.max_item_count.unwrap_or(self.config.default_max_item_count);
        validate_limits(threshold, max)?;

        let id = Uuid::new_v4().to_string();
        let row = self.db.transaction(|conn| {
            let row = categories::insert_category(conn, &id, name, threshold, max, now)?;
            audit::insert_audit(
                conn,
                &row.id,
                audit_actions::CATEGORY_CREATED,
                None,
                Some(CategoryStatus::Waiting),
                actor,
                &format!("Category '{}' created", name),
                &json!({ "activationThreshold": threshold, "maxItemCount": max }),
                now,
            )?;
            Ok(row)
        })?;

        info!(category_id = %row.id, name = %row.name, actor = %actor, "Category created");
        self.events.emit(SettlementEvent::CategoryCreated {
            id: row.id.clone(),
            name: row.name.clone(),
        });
        Ok(row)
    }

    pub fn update(
        &self,
        actor: &Actor,
        id: &str,
        input: &UpdateCategoryInput,
        now: DateTime<Utc>,
    ) -> Result<CategoryRow, SettlementError> {
        require_operator(self.operators.as_ref(), actor)?;

        let row = self.load(id)?;
        if row.status()?.is_terminal() {
            return Err(SettlementError::InvalidTransition(format!(
                "Category {} is closed",
                id
            )));
        }

        let name = match &input.name {
            Some(name) if name.trim().is_empty() => {
                return Err(SettlementError::InvalidInput("name must not be empty".into()))
            }
            Some(name) => name.trim().to_string(),
            None => row.name.clone(),
        };
        let threshold = input.activation_threshold.unwrap_or(row.activation_threshold);
        let max = input.max_item_count.unwrap_or(row.max_item_count);
        validate_limits(threshold, max)?;

        self.db.transaction(|conn| {
            if !categories::update_settings(conn, id, row.version, &name, threshold, max, now)? {
                return Err(SettlementError::Conflict(format!(
                    "Category {} was modified concurrently",
                    id
                )));
            }
            audit::insert_audit(
                conn,
                id,
                audit_actions::CATEGORY_UPDATED,
                None,
                None,
                actor,
                "Settings updated",
                &json!({
                    "before": {
                        "name": row.name,
                        "activationThreshold": row.activation_threshold,
                        "maxItemCount": row.max_item_count,
                    },
                    "after": {
                        "name": name,
                        "activationThreshold": threshold,
                        "maxItemCount": max,
                    },
                }),
                now,
            )?;
            Ok(())
        })?;

        debug!(category_id = %id, actor = %actor, "Category updated");
        self.load(id)
    }

    /// Contribution feed: record new (or withdrawn, with a negative delta) items
    /// in an open category. The count never drops below zero.
    pub fn add_items(
        &self,
        actor: &Actor,
        id: &str,
        delta: i64,
        now: DateTime<Utc>,
    ) -> Result<CategoryRow, SettlementError> {
        require_system_or_operator(self.operators.as_ref(), actor)?;
        if delta == 0 {
            return Err(SettlementError::InvalidInput("delta must be non-zero".into()));
        }
        let changed = self.db.with_conn(|conn| categories::add_items(conn, id, delta, now))?;
        if !changed {
            let row = self.load(id)?;
            return Err(SettlementError::InvalidTransition(format!(
                "Category {} is {} and no longer accepts items",
                id, row.status
            )));
        }
        self.load(id)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Evaluate every selected category once and apply at most one transition each.
    pub fn sweep(
        &self,
        actor: &Actor,
        request: &SweepRequest,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, SettlementError> {
        require_system_or_operator(self.operators.as_ref(), actor)?;

        let rows = match &request.category_ids {
            Some(ids) => ids
                .iter()
                .map(|id| self.load(id))
                .collect::<Result<Vec<_>, _>>()?,
            None => self.db.with_conn(categories::list_open_categories)?,
        };

        let mut report = SweepReport {
            dry_run: request.dry_run,
            evaluated: rows.len(),
            transitioned: 0,
            outcomes: Vec::with_capacity(rows.len()),
        };

        for row in rows {
            let state = row.lifecycle_state()?;
            let transition = evaluate(&state, now, self.cycle_duration());

            let action = match &transition {
                None => SweepAction::NoAction,
                Some(_) if request.dry_run => SweepAction::WouldTransition,
                Some(t) => {
                    if self.commit(&row, t, actor, now)? {
                        report.transitioned += 1;
                        self.announce(&row.id, t, actor, true);
                        SweepAction::Transitioned
                    } else {
                        warn!(category_id = %row.id, "Sweep lost a race; category left for the next run");
                        SweepAction::Conflict
                    }
                }
            };

            report.outcomes.push(SweepOutcome {
                category_id: row.id,
                name: row.name,
                from: state.status,
                to: transition.as_ref().map(|t| t.to),
                action,
                reason: transition
                    .as_ref()
                    .map(|t| t.reason.message(state.current_item_count)),
            });
        }

        info!(
            dry_run = request.dry_run,
            evaluated = report.evaluated,
            transitioned = report.transitioned,
            actor = %actor,
            "Category sweep finished"
        );
        Ok(report)
    }

    /// Open the first cycle of a waiting category by hand. Without `force`
    /// the activation threshold must already be met.
    pub fn force_start_cycle(
        &self,
        actor: &Actor,
        id: &str,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<CategoryRow, SettlementError> {
        require_operator(self.operators.as_ref(), actor)?;

        let row = self.load(id)?;
        let status = row.status()?;
        if status != CategoryStatus::Waiting {
            return Err(SettlementError::InvalidTransition(format!(
                "Category {} is {}; only waiting categories can be started",
                id, status
            )));
        }
        if !force && row.current_item_count < row.activation_threshold {
            return Err(SettlementError::InvalidInput(format!(
                "Category {} has {} of {} items; pass force to start anyway",
                id, row.current_item_count, row.activation_threshold
            )));
        }

        let transition = Transition {
            from: status,
            to: CategoryStatus::FirstCycle,
            reason: TransitionReason::ManualStart { forced: force },
            cycle: Some(CycleWindow::open(1, now, self.cycle_duration())),
        };
        self.commit_or_conflict(&row, &transition, actor, now)?;
        self.announce(id, &transition, actor, false);
        self.load(id)
    }

    pub fn manual_close(
        &self,
        actor: &Actor,
        id: &str,
        input: &CloseCategoryInput,
        now: DateTime<Utc>,
    ) -> Result<CategoryRow, SettlementError> {
        require_operator(self.operators.as_ref(), actor)?;

        let reason = input.reason.trim();
        if reason.is_empty() {
            return Err(SettlementError::InvalidInput("reason is required".into()));
        }

        let row = self.load(id)?;
        let status = row.status()?;
        if !status.can_transition_to(CategoryStatus::Closed) {
            return Err(SettlementError::InvalidTransition(format!(
                "Category {} is already {}",
                id, status
            )));
        }

        let transition = Transition {
            from: status,
            to: CategoryStatus::Closed,
            reason: TransitionReason::ManualClose(reason.to_string()),
            cycle: None,
        };
        self.commit_or_conflict(&row, &transition, actor, now)?;
        self.announce(id, &transition, actor, input.trigger_payout);
        self.load(id)
    }

    /// Compute and persist the closure split for a closed category.
    /// Re-running with the same inputs writes nothing new.
    pub fn compute_closure_payout(
        &self,
        actor: &Actor,
        id: &str,
        input: &ClosurePayoutInput,
        now: DateTime<Utc>,
    ) -> Result<ClosurePayout, SettlementError> {
        require_system_or_operator(self.operators.as_ref(), actor)?;

        let row = self.load(id)?;
        if row.status()? != CategoryStatus::Closed {
            return Err(SettlementError::InvalidTransition(format!(
                "Category {} is {}; payouts are computed after closure",
                id, row.status
            )));
        }

        let plan = closure_pot_split(
            input.pot,
            &input.top_investors,
            &input.top_creators,
            &input.lower_investors,
            self.ledger.unit(),
        )?;
        let source_event_id = closure_source_id(id);
        let payload = json!({
            "categoryId": id,
            "pot": input.pot,
            "topInvestors": input.top_investors,
            "topCreators": input.top_creators,
            "lowerInvestors": input.lower_investors,
        });
        let persisted = self
            .ledger
            .persist_plan(&source_event_id, "category.closure", &plan, &payload, now)?;

        if persisted.inserted > 0 {
            self.db.with_conn(|conn| {
                audit::insert_audit(
                    conn,
                    id,
                    audit_actions::PAYOUT_COMPUTED,
                    None,
                    None,
                    actor,
                    &format!("Closure payout of {} computed", input.pot),
                    &json!({ "pot": input.pot, "lines": persisted.inserted }),
                    now,
                )
            })?;
        }

        info!(
            category_id = %id,
            pot = input.pot,
            inserted = persisted.inserted,
            already_present = persisted.already_present,
            "Closure payout computed"
        );
        Ok(ClosurePayout {
            category_id: id.to_string(),
            source_event_id,
            plan,
            persisted,
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Apply `transition` against the row snapshot and write its audit record.
    /// Returns `false` when the row changed since it was read.
    fn commit(
        &self,
        row: &CategoryRow,
        transition: &Transition,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<bool, SettlementError> {
        self.db
            .transaction(|conn| write_transition(conn, row, transition, actor, now))
    }

    fn commit_or_conflict(
        &self,
        row: &CategoryRow,
        transition: &Transition,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        if self.commit(row, transition, actor, now)? {
            Ok(())
        } else {
            Err(SettlementError::Conflict(format!(
                "Category {} was modified concurrently",
                row.id
            )))
        }
    }

    fn announce(&self, id: &str, transition: &Transition, actor: &Actor, request_payout: bool) {
        self.events.emit(SettlementEvent::CategoryTransitioned {
            id: id.to_string(),
            from: transition.from.to_string(),
            to: transition.to.to_string(),
            reason: transition.reason.code().to_string(),
            actor: actor.to_string(),
        });
        if transition.closes() && request_payout {
            self.events
                .emit(SettlementEvent::CategoryPayoutRequested { id: id.to_string() });
        }
    }
}

fn write_transition(
    conn: &Connection,
    row: &CategoryRow,
    transition: &Transition,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<bool, SettlementError> {
    if !transition.from.can_transition_to(transition.to) {
        return Err(SettlementError::InvalidTransition(format!(
            "{} -> {} is not allowed",
            transition.from, transition.to
        )));
    }
    if !categories::apply_transition(conn, &row.id, row.version, transition, now)? {
        return Ok(false);
    }

    let details = json!({
        "reasonCode": transition.reason.code(),
        "itemCount": row.current_item_count,
        "cycle": transition.cycle,
    });
    audit::insert_audit(
        conn,
        &row.id,
        audit_action_for(transition.to),
        Some(transition.from),
        Some(transition.to),
        actor,
        &transition.reason.message(row.current_item_count),
        &details,
        now,
    )?;
    Ok(true)
}
