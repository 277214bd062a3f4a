//! End-to-end settlement against an on-disk database

use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use serde_json::json;
use settlement_core::db::{ledger, CreateCategoryInput, SettlementDb};
use settlement_core::services::category_service::{CloseCategoryInput, ClosurePayoutInput, SweepRequest};
use settlement_core::services::ledger_service::ReceiptStatus;
use settlement_core::services::ranking_service::PurchaseWagerInput;
use settlement_core::{Actor, CategoryStatus, Config, Services};
use settlement_core::services::GatewayEvent;
use tempfile::TempDir;

fn setup() -> (TempDir, Config, Arc<SettlementDb>, Services) {
    let dir = TempDir::new().unwrap();
    let config = Config {
        storage_dir: dir.path().to_path_buf(),
        authorized_operators: vec!["op-1".into()],
        ..Config::default()
    };
    let db = Arc::new(SettlementDb::open(&config.storage_dir).unwrap());
    let services = Services::new(db.clone(), &config);
    (dir, config, db, services)
}

fn sale(id: &str, creator: &str, buyer: &str, amount: i64) -> GatewayEvent {
    GatewayEvent {
        id: id.to_string(),
        kind: "sale.completed".to_string(),
        payload: json!({
            "creatorId": creator,
            "buyerId": buyer,
            "amount": amount,
            "occurredAt": "2025-03-31T12:00:00Z",
        }),
    }
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 31).unwrap()
}

#[test]
fn test_sales_to_rankings_to_cashout() {
    let (_dir, _config, db, services) = setup();
    let now = Utc.with_ymd_and_hms(2025, 3, 31, 13, 0, 0).unwrap();

    // c01 has 12 sales, c12 has 1; the top ten are backed by fan-a
    let mut event_ids = Vec::new();
    for i in 1..=12 {
        let creator = format!("c{:02}", i);
        let buyer = if i <= 10 { "fan-a" } else { "fan-b" };
        for n in 0..(13 - i) {
            let id = format!("evt-{}-{}", creator, n);
            let event = sale(&id, &creator, buyer, 1_000);

            let receipt = services.ledger.handle_gateway_event(&event, now).unwrap();
            assert_eq!(receipt.status, ReceiptStatus::Applied);
            // redelivery is a no-op
            let again = services.ledger.handle_gateway_event(&event, now).unwrap();
            assert_eq!(again.status, ReceiptStatus::Duplicate);

            event_ids.push(id);
        }
    }

    db.with_conn(|conn| {
        for id in &event_ids {
            assert_eq!(ledger::total_for_event(conn, id)?, 1_000);
            assert_eq!(ledger::entries_for_event(conn, id)?.len(), 2);
        }
        Ok(())
    })
    .unwrap();

    services
        .rankings
        .purchase_wager(
            &PurchaseWagerInput {
                holder_id: "h1".into(),
                tier: 2,
                target_participant_id: Some("c11".into()),
            },
            day(),
            now,
        )
        .unwrap();

    let settlement = services.rankings.settle_day(&Actor::System, day(), now).unwrap();
    assert_eq!(settlement.rankings.len(), 12);
    assert_eq!(settlement.rankings[0].participant_id, "c01");
    assert_eq!(settlement.rankings[10].participant_id, "c11");
    assert!(!settlement.rankings[10].is_top_tier);

    // lower tier: c11 (2_000) + c12 (1_000)
    let pot = &settlement.pot;
    assert_eq!(pot.lower_tier_revenue, 3_000);
    assert_eq!(pot.total_pot, 2_100);
    assert_eq!(pot.platform_share, 900);
    assert_eq!(pot.top_tier_share, 1_050);
    assert_eq!(pot.backer_share, 1_050);
    assert_eq!(pot.unallocated_amount, 50);
    assert_eq!(services.points.balance("fan-a").unwrap(), 1_050);
    assert_eq!(services.points.balance("fan-b").unwrap(), 0);
    assert_eq!(services.points.balance("c01").unwrap(), 100);

    // replaying the day pays nobody twice
    services.rankings.settle_day(&Actor::System, day(), now).unwrap();
    assert_eq!(services.points.balance("fan-a").unwrap(), 1_050);

    let wagers = services.rankings.settle_wagers(&Actor::System, day(), now).unwrap();
    assert_eq!(wagers.settled.len(), 1);
    assert_eq!(wagers.settled[0].final_rank, Some(11));
    assert_eq!(wagers.settled[0].refund_amount, 7_500);
    assert_eq!(services.points.balance("h1").unwrap(), 7_500);

    let receipt = services.points.cashout("h1", now).unwrap();
    assert_eq!(receipt.points_debited, 7_500);
    assert_eq!(receipt.amount, 7_500);
    assert_eq!(receipt.remaining_points, 0);
    assert_eq!(receipt.ledger.inserted, 1);

    // fan-a is below the threshold
    assert!(services.points.cashout("fan-a", now).is_err());

    let history = services.rankings.participant_history("c11", 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].rank, 11);
}

#[test]
fn test_category_lifecycle_to_closure_payout() {
    let (_dir, _config, _db, services) = setup();
    let operator = Actor::operator("op-1");
    let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();

    let category = services
        .categories
        .create(
            &operator,
            &CreateCategoryInput {
                name: "comedy".into(),
                activation_threshold: Some(3),
                max_item_count: Some(5),
            },
            t0,
        )
        .unwrap();

    services.categories.add_items(&Actor::System, &category.id, 3, t0).unwrap();
    let report = services
        .categories
        .sweep(&Actor::System, &SweepRequest::default(), t0)
        .unwrap();
    assert_eq!(report.transitioned, 1);

    // reaching max mid-cycle closes on the next sweep
    services.categories.add_items(&Actor::System, &category.id, 2, t0).unwrap();
    services
        .categories
        .sweep(&Actor::System, &SweepRequest::default(), t0 + chrono::Duration::hours(2))
        .unwrap();
    let row = services.categories.get(&category.id).unwrap();
    assert_eq!(row.status().unwrap(), CategoryStatus::Closed);

    // closed is terminal
    assert!(services
        .categories
        .manual_close(
            &operator,
            &category.id,
            &CloseCategoryInput {
                reason: "again".into(),
                trigger_payout: false,
            },
            t0,
        )
        .is_err());

    let payout = services
        .categories
        .compute_closure_payout(
            &Actor::System,
            &category.id,
            &ClosurePayoutInput {
                pot: 250_000,
                top_investors: (1..=10).map(|i| format!("inv{}", i)).collect(),
                top_creators: (1..=10).map(|i| format!("cre{}", i)).collect(),
                lower_investors: (1..=40).map(|i| format!("low{}", i)).collect(),
            },
            t0,
        )
        .unwrap();
    assert_eq!(payout.plan.total(), 250_000);
    assert!(payout.plan.verify(100).is_ok());

    let entries = services.ledger.entries_for_event(&payout.source_event_id).unwrap();
    let persisted: i64 = entries.iter().map(|e| e.gross_amount).sum();
    assert_eq!(persisted, 250_000);

    let trail = services.categories.audit_trail(&category.id, 20).unwrap();
    assert_eq!(trail.len(), 4);
    assert!(trail.iter().skip(1).take(2).all(|a| a.actor == Actor::System));
}

#[test]
fn test_state_survives_reopen() {
    let (dir, config, db, services) = setup();
    let now = Utc.with_ymd_and_hms(2025, 3, 31, 13, 0, 0).unwrap();

    services
        .ledger
        .handle_gateway_event(&sale("evt-1", "c1", "fan", 5_000), now)
        .unwrap();
    services.rankings.settle_day(&Actor::System, day(), now).unwrap();
    drop(services);
    drop(db);

    let db = Arc::new(SettlementDb::open(dir.path()).unwrap());
    let services = Services::new(db.clone(), &config);

    let stats = db.stats().unwrap();
    assert_eq!(stats.monetary_events, 1);
    assert_eq!(stats.ledger_entries, 2);
    assert_eq!(stats.settled_days, 1);

    let latest = services.rankings.latest().unwrap().unwrap();
    assert_eq!(latest.date, "2025-03-31");
    assert_eq!(latest.rankings[0].participant_id, "c1");

    // the event id is remembered across restarts
    let receipt = services
        .ledger
        .handle_gateway_event(&sale("evt-1", "c1", "fan", 5_000), now)
        .unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Duplicate);
}
