//! Periodic trigger for the category sweep and daily settlement
//!
//! Each tick runs as the `System` actor:
//! 1. sweep every open category
//! 2. settle yesterday if its pot row does not exist yet
//! 3. settle the month's wagers when yesterday was the last day of a month
//!
//! Every step is replay-safe, so a tick that overlaps a manual run does no harm.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::db;
use crate::error::SettlementError;
use crate::lifecycle::Actor;
use crate::services::category_service::SweepRequest;
use crate::services::Services;

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub categories_transitioned: usize,
    pub settled_day: Option<String>,
    pub wagers_settled: usize,
}

pub fn is_last_day_of_month(date: NaiveDate) -> bool {
    (date + ChronoDuration::days(1)).month() != date.month()
}

/// Run one scheduler tick at `now`. Steps fail independently.
pub fn run_tick(services: &Services, now: DateTime<Utc>) -> TickReport {
    let mut report = TickReport::default();

    match services
        .categories
        .sweep(&Actor::System, &SweepRequest::default(), now)
    {
        Ok(sweep) => report.categories_transitioned = sweep.transitioned,
        Err(e) => error!(error = %e, "Scheduled sweep failed"),
    }

    let yesterday = now.date_naive() - ChronoDuration::days(1);
    match settle_if_missing(services, yesterday, now) {
        Ok(true) => report.settled_day = Some(db::date_key(yesterday)),
        Ok(false) => debug!(date = %yesterday, "Day already settled"),
        Err(e) => error!(date = %yesterday, error = %e, "Scheduled day settlement failed"),
    }

    if is_last_day_of_month(yesterday) {
        match services.rankings.settle_wagers(&Actor::System, yesterday, now) {
            Ok(wagers) => report.wagers_settled = wagers.settled.len(),
            Err(e) => error!(date = %yesterday, error = %e, "Scheduled wager settlement failed"),
        }
    }

    report
}

fn settle_if_missing(
    services: &Services,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<bool, SettlementError> {
    if services.rankings.pot_for_date(date)?.is_some() {
        return Ok(false);
    }
    services.rankings.settle_day(&Actor::System, date, now)?;
    Ok(true)
}

/// Spawn the scheduler loop. The first tick fires immediately.
pub fn spawn_scheduler(services: Arc<Services>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;

            let services = services.clone();
            // database work is synchronous; keep it off the reactor threads
            match tokio::task::spawn_blocking(move || run_tick(&services, Utc::now())).await {
                Ok(report) => info!(
                    transitioned = report.categories_transitioned,
                    settled_day = ?report.settled_day,
                    wagers_settled = report.wagers_settled,
                    "Scheduler tick finished"
                ),
                Err(e) => error!(error = %e, "Scheduler tick panicked"),
            }
        }
    })
}
