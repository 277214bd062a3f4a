//! Ledger service - turns gateway callbacks into at-most-once distribution plans
//!
//! The event id is the idempotency anchor. Recording the event, writing the
//! plan lines and recording ranking activity happen in one transaction, so a
//! retried callback either finds everything or nothing.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::db::{self, events, ledger, sales, LedgerEntryRow, PersistResult, SettlementDb};
use crate::error::SettlementError;
use crate::points::votes_for_amount;
use crate::split::{closure_pot_split, direct_sale_split, DistributionPlan};

use super::events::{EventBus, SettlementEvent};

/// Gateway event types with a distribution rule
pub mod gateway_kinds {
    pub const SALE_COMPLETED: &str = "sale.completed";
    pub const POT_CLOSED: &str = "pot.closed";
}

/// Inbound payment-gateway callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// `sale.completed` payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalePayload {
    /// Creator receiving the 70% share; also the ranked participant
    pub creator_id: String,
    /// Buyer backing the creator
    #[serde(default)]
    pub buyer_id: Option<String>,
    pub amount: i64,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub creator_registered_at: Option<DateTime<Utc>>,
}

/// `pot.closed` payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PotClosedPayload {
    pub pot: i64,
    #[serde(default)]
    pub top_investors: Vec<String>,
    #[serde(default)]
    pub top_creators: Vec<String>,
    #[serde(default)]
    pub lower_investors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// First delivery; plan written
    Applied,
    /// Event id seen before; nothing written
    Duplicate,
    /// First delivery of a type without a distribution rule
    Recorded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayReceipt {
    pub event_id: String,
    pub status: ReceiptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<DistributionPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted: Option<PersistResult>,
}

// ============================================================================
// Payout execution
// ============================================================================

/// One pending ledger line handed to the payout system
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutInstruction {
    pub entry_id: String,
    /// Platform lines resolve to the configured platform account
    pub account_id: String,
    pub amount: i64,
    pub role: String,
    pub idempotency_key: String,
}

/// Moves money for one ledger line and returns the external transfer id
#[async_trait]
pub trait PayoutExecutor: Send + Sync {
    async fn execute(&self, instruction: &PayoutInstruction) -> Result<String, SettlementError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutSummary {
    pub attempted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Entries another worker finished first
    pub skipped: u64,
}

// ============================================================================
// Service
// ============================================================================

/// Ledger recorder
pub struct LedgerService {
    db: Arc<SettlementDb>,
    events: Arc<EventBus>,
    unit: i64,
    minor_units_per_vote: i64,
    platform_account: String,
}

impl LedgerService {
    pub fn new(
        db: Arc<SettlementDb>,
        events: Arc<EventBus>,
        unit: i64,
        minor_units_per_vote: i64,
        platform_account: impl Into<String>,
    ) -> Self {
        Self {
            db,
            events,
            unit,
            minor_units_per_vote,
            platform_account: platform_account.into(),
        }
    }

    pub fn unit(&self) -> i64 {
        self.unit
    }

    // =========================================================================
    // Recorder
    // =========================================================================

    pub fn is_event_processed(&self, event_id: &str) -> Result<bool, SettlementError> {
        self.db.with_conn(|conn| events::is_event_processed(conn, event_id))
    }

    /// Insert-or-ignore; a duplicate is a successful no-op
    pub fn record_event(
        &self,
        event_id: &str,
        kind: &str,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, SettlementError> {
        let inserted = self
            .db
            .with_conn(|conn| events::record_event(conn, event_id, kind, payload, now))?;
        if inserted {
            self.events.emit(SettlementEvent::MonetaryEventRecorded {
                event_id: event_id.to_string(),
                kind: kind.to_string(),
            });
        }
        Ok(inserted)
    }

    /// Verify `plan`, then record the source event and write every line in a
    /// single transaction. Re-submitting the same plan writes nothing new.
    pub fn persist_plan(
        &self,
        source_event_id: &str,
        kind: &str,
        plan: &DistributionPlan,
        raw_payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<PersistResult, SettlementError> {
        self.verify_plan(source_event_id, plan)?;

        let result = self.db.transaction(|conn| {
            events::record_event(conn, source_event_id, kind, raw_payload, now)?;
            let result = ledger::persist_plan(conn, source_event_id, kind, plan, now)?;
            events::mark_event_processed(conn, source_event_id, now)?;
            Ok(result)
        })?;

        self.emit_persisted(source_event_id, plan, &result);
        Ok(result)
    }

    /// Check a plan before anything is written; violations are logged as defects
    pub fn verify_plan(&self, context: &str, plan: &DistributionPlan) -> Result<(), SettlementError> {
        if let Err(e) = plan.verify(self.unit) {
            error!(
                target: "settlement::invariant",
                context = %context,
                rule = %plan.rule,
                gross = plan.gross,
                error = %e,
                "Distribution plan rejected"
            );
            self.events.emit(SettlementEvent::InvariantViolation {
                context: context.to_string(),
                detail: e.to_string(),
            });
            return Err(e);
        }
        Ok(())
    }

    fn emit_persisted(&self, source_event_id: &str, plan: &DistributionPlan, result: &PersistResult) {
        self.events.emit(SettlementEvent::PlanPersisted {
            source_event_id: source_event_id.to_string(),
            rule: plan.rule.clone(),
            gross: plan.gross,
            inserted: result.inserted,
        });
    }

    // =========================================================================
    // Gateway dispatch
    // =========================================================================

    /// Handle one gateway callback. Safe to call any number of times per event id.
    pub fn handle_gateway_event(
        &self,
        event: &GatewayEvent,
        now: DateTime<Utc>,
    ) -> Result<GatewayReceipt, SettlementError> {
        if event.id.trim().is_empty() {
            return Err(SettlementError::InvalidInput("event id is required".into()));
        }

        // Compute before touching the database so a bad payload changes nothing
        let sale = match event.kind.as_str() {
            gateway_kinds::SALE_COMPLETED => {
                Some(serde_json::from_value::<SalePayload>(event.payload.clone()).map_err(|e| {
                    SettlementError::InvalidInput(format!("bad {} payload: {}", event.kind, e))
                })?)
            }
            _ => None,
        };
        let plan = match (&sale, event.kind.as_str()) {
            (Some(sale), _) => Some(direct_sale_split(sale.amount, &sale.creator_id, self.unit)?),
            (None, gateway_kinds::POT_CLOSED) => {
                let pot: PotClosedPayload = serde_json::from_value(event.payload.clone()).map_err(|e| {
                    SettlementError::InvalidInput(format!("bad {} payload: {}", event.kind, e))
                })?;
                Some(closure_pot_split(
                    pot.pot,
                    &pot.top_investors,
                    &pot.top_creators,
                    &pot.lower_investors,
                    self.unit,
                )?)
            }
            _ => None,
        };

        if let Some(plan) = &plan {
            self.verify_plan(&event.id, plan)?;
        }

        let outcome = self.db.transaction(|conn| {
            if !events::record_event(conn, &event.id, &event.kind, &event.payload, now)? {
                return Ok(None);
            }
            let persisted = match &plan {
                Some(plan) => Some(ledger::persist_plan(conn, &event.id, &event.kind, plan, now)?),
                None => None,
            };
            if let Some(sale) = &sale {
                self.record_sale_activity(conn, &event.id, sale, now)?;
            }
            events::mark_event_processed(conn, &event.id, now)?;
            Ok(Some(persisted))
        })?;

        let Some(persisted) = outcome else {
            debug!(event_id = %event.id, "Gateway event already processed");
            self.events.emit(SettlementEvent::DuplicateEventIgnored {
                event_id: event.id.clone(),
            });
            return Ok(GatewayReceipt {
                event_id: event.id.clone(),
                status: ReceiptStatus::Duplicate,
                plan: None,
                persisted: None,
            });
        };

        self.events.emit(SettlementEvent::MonetaryEventRecorded {
            event_id: event.id.clone(),
            kind: event.kind.clone(),
        });

        let status = match (&plan, &persisted) {
            (Some(plan), Some(result)) => {
                self.emit_persisted(&event.id, plan, result);
                info!(event_id = %event.id, kind = %event.kind, lines = result.inserted, "Gateway event applied");
                ReceiptStatus::Applied
            }
            _ => {
                info!(event_id = %event.id, kind = %event.kind, "Gateway event recorded without a plan");
                ReceiptStatus::Recorded
            }
        };

        Ok(GatewayReceipt {
            event_id: event.id.clone(),
            status,
            plan,
            persisted,
        })
    }

    fn record_sale_activity(
        &self,
        conn: &Connection,
        event_id: &str,
        sale: &SalePayload,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        let sale_date = db::date_key(sale.occurred_at.unwrap_or(now).date_naive());
        if sale.creator_registered_at.is_some() {
            sales::upsert_participant(conn, &sale.creator_id, sale.creator_registered_at)?;
        }
        sales::record_sale(
            conn,
            &sales::NewSale {
                id: event_id,
                participant_id: &sale.creator_id,
                backer_id: sale.buyer_id.as_deref(),
                amount: sale.amount,
                votes: votes_for_amount(sale.amount, self.minor_units_per_vote),
                sale_date: &sale_date,
                source_event_id: Some(event_id),
            },
            now,
        )?;
        Ok(())
    }

    // =========================================================================
    // Entry status
    // =========================================================================

    pub fn get_pending_entries(&self, limit: i64) -> Result<Vec<LedgerEntryRow>, SettlementError> {
        self.db.with_conn(|conn| ledger::get_pending_entries(conn, limit))
    }

    pub fn entries_for_event(&self, event_id: &str) -> Result<Vec<LedgerEntryRow>, SettlementError> {
        self.db.with_conn(|conn| ledger::entries_for_event(conn, event_id))
    }

    pub fn mark_completed(
        &self,
        entry_id: &str,
        external_transfer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        let changed = self
            .db
            .with_conn(|conn| ledger::mark_completed(conn, entry_id, external_transfer_id, now))?;
        self.ensure_transitioned(entry_id, changed)?;
        self.events.emit(SettlementEvent::EntryCompleted {
            entry_id: entry_id.to_string(),
            external_transfer_id: external_transfer_id.to_string(),
        });
        Ok(())
    }

    pub fn mark_failed(&self, entry_id: &str, reason: &str, now: DateTime<Utc>) -> Result<(), SettlementError> {
        let changed = self
            .db
            .with_conn(|conn| ledger::mark_failed(conn, entry_id, reason, now))?;
        self.ensure_transitioned(entry_id, changed)?;
        self.events.emit(SettlementEvent::EntryFailed {
            entry_id: entry_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn ensure_transitioned(&self, entry_id: &str, changed: bool) -> Result<(), SettlementError> {
        if changed {
            return Ok(());
        }
        match self.db.with_conn(|conn| ledger::get_entry(conn, entry_id))? {
            None => Err(SettlementError::NotFound(format!("Ledger entry {}", entry_id))),
            Some(entry) => Err(SettlementError::InvalidTransition(format!(
                "Ledger entry {} is already {}",
                entry_id, entry.status
            ))),
        }
    }

    /// Execute up to `limit` pending entries. Each entry succeeds or fails on
    /// its own; a failed transfer never touches its siblings.
    pub async fn process_pending(
        &self,
        executor: &dyn PayoutExecutor,
        limit: i64,
    ) -> Result<PayoutSummary, SettlementError> {
        let pending = self.get_pending_entries(limit)?;
        let mut summary = PayoutSummary::default();

        for entry in pending {
            summary.attempted += 1;
            let instruction = PayoutInstruction {
                entry_id: entry.id.clone(),
                account_id: entry
                    .recipient_account_id
                    .clone()
                    .unwrap_or_else(|| self.platform_account.clone()),
                amount: entry.net_amount,
                role: entry.role.clone(),
                idempotency_key: entry.idempotency_key.clone(),
            };

            let outcome = match executor.execute(&instruction).await {
                Ok(transfer_id) => self.mark_completed(&entry.id, &transfer_id, Utc::now()).map(|_| true),
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "Payout failed");
                    self.mark_failed(&entry.id, &e.to_string(), Utc::now()).map(|_| false)
                }
            };

            match outcome {
                Ok(true) => summary.completed += 1,
                Ok(false) => summary.failed += 1,
                Err(SettlementError::InvalidTransition(_)) => summary.skipped += 1,
                Err(e) => return Err(e),
            }
        }

        if summary.attempted > 0 {
            info!(
                attempted = summary.attempted,
                completed = summary.completed,
                failed = summary.failed,
                "Processed pending ledger entries"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::{DistributionLine, Recipient, SplitRole, DEFAULT_UNIT};
    use serde_json::json;

    fn service() -> LedgerService {
        let db = Arc::new(SettlementDb::open_in_memory().unwrap());
        LedgerService::new(db, Arc::new(EventBus::new()), DEFAULT_UNIT, 10, "platform")
    }

    fn sale_event(id: &str, amount: i64) -> GatewayEvent {
        GatewayEvent {
            id: id.into(),
            kind: gateway_kinds::SALE_COMPLETED.into(),
            payload: json!({ "creatorId": "creator-1", "buyerId": "buyer-1", "amount": amount }),
        }
    }

    #[test]
    fn test_duplicate_delivery_writes_once() {
        let svc = service();
        let now = Utc::now();

        let first = svc.handle_gateway_event(&sale_event("evt_1", 999), now).unwrap();
        assert_eq!(first.status, ReceiptStatus::Applied);
        assert_eq!(first.persisted.as_ref().unwrap().inserted, 2);

        let second = svc.handle_gateway_event(&sale_event("evt_1", 999), now).unwrap();
        assert_eq!(second.status, ReceiptStatus::Duplicate);

        let entries = svc.entries_for_event("evt_1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.iter().map(|e| e.gross_amount).sum::<i64>(), 999);
        assert_eq!(svc.db.stats().unwrap().monetary_events, 1);
    }

    #[test]
    fn test_sale_is_recorded_as_activity() {
        let svc = service();
        let now = Utc::now();
        svc.handle_gateway_event(&sale_event("evt_1", 200), now).unwrap();
        svc.handle_gateway_event(&sale_event("evt_1", 200), now).unwrap();

        let activity = svc
            .db
            .with_conn(|conn| sales::aggregate_activity(conn, &db::date_key(now.date_naive())))
            .unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].activity_count, 1);
        assert_eq!(activity[0].revenue, 200);
    }

    #[test]
    fn test_bad_payload_changes_nothing() {
        let svc = service();
        let event = GatewayEvent {
            id: "evt_bad".into(),
            kind: gateway_kinds::SALE_COMPLETED.into(),
            payload: json!({ "amount": 100 }),
        };
        assert!(matches!(
            svc.handle_gateway_event(&event, Utc::now()),
            Err(SettlementError::InvalidInput(_))
        ));
        assert!(!svc.is_event_processed("evt_bad").unwrap());
    }

    #[test]
    fn test_unknown_kind_is_recorded_without_plan() {
        let svc = service();
        let event = GatewayEvent {
            id: "evt_refund".into(),
            kind: "charge.refunded".into(),
            payload: json!({}),
        };
        let receipt = svc.handle_gateway_event(&event, Utc::now()).unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Recorded);
        assert!(svc.is_event_processed("evt_refund").unwrap());
        assert!(svc.entries_for_event("evt_refund").unwrap().is_empty());
    }

    #[test]
    fn test_pot_closed_conserves_pot() {
        let svc = service();
        let ids = |p: &str, n: usize| (1..=n).map(|i| format!("{}{}", p, i)).collect::<Vec<_>>();
        let event = GatewayEvent {
            id: "pot_1".into(),
            kind: gateway_kinds::POT_CLOSED.into(),
            payload: json!({
                "pot": 1_000_000,
                "topInvestors": ids("inv", 10),
                "topCreators": ids("port", 10),
                "lowerInvestors": ids("lower", 90),
            }),
        };
        svc.handle_gateway_event(&event, Utc::now()).unwrap();
        let total = svc.db.with_conn(|conn| ledger::total_for_event(conn, "pot_1")).unwrap();
        assert_eq!(total, 1_000_000);
    }

    #[test]
    fn test_broken_plan_is_not_persisted() {
        let svc = service();
        let mut receiver = svc.events.subscribe();
        let plan = DistributionPlan {
            gross: 1_000,
            rule: "broken".into(),
            lines: vec![DistributionLine {
                recipient: Recipient::account("a"),
                role: SplitRole::CreatorSale,
                amount: 900,
                note: String::new(),
            }],
        };
        let result = svc.persist_plan("evt_x", "manual", &plan, &json!({}), Utc::now());
        assert!(matches!(result, Err(SettlementError::InvariantViolation(_))));
        assert!(!svc.is_event_processed("evt_x").unwrap());
        assert!(matches!(
            receiver.try_recv(),
            Ok(SettlementEvent::InvariantViolation { .. })
        ));
    }

    struct FlakyExecutor;

    #[async_trait]
    impl PayoutExecutor for FlakyExecutor {
        async fn execute(&self, instruction: &PayoutInstruction) -> Result<String, SettlementError> {
            if instruction.account_id == "platform" {
                Err(SettlementError::ExternalTransfer("platform account frozen".into()))
            } else {
                Ok(format!("tr_{}", instruction.entry_id))
            }
        }
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_entry() {
        let svc = service();
        svc.handle_gateway_event(&sale_event("evt_1", 999), Utc::now()).unwrap();

        let summary = svc.process_pending(&FlakyExecutor, 10).await.unwrap();
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);

        let entries = svc.entries_for_event("evt_1").unwrap();
        let creator = entries.iter().find(|e| e.role == "creator_sale").unwrap();
        let platform = entries.iter().find(|e| e.role == "platform_sale").unwrap();
        assert_eq!(creator.status, "completed");
        assert!(creator.external_transfer_id.is_some());
        assert_eq!(platform.status, "failed");

        // nothing pending is left, and terminal entries are not revisited
        assert_eq!(svc.process_pending(&FlakyExecutor, 10).await.unwrap().attempted, 0);
        assert!(matches!(
            svc.mark_completed(&platform.id, "tr_late", Utc::now()),
            Err(SettlementError::InvalidTransition(_))
        ));
    }
}
