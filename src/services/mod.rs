//! Service layer for settlement-core
//!
//! Services hold the business rules between the HTTP/CLI surfaces and the
//! repositories in `db`. Each one owns its validation, its transaction
//! boundaries and the events it emits.
//!
//! ```text
//! HTTP handlers / scheduler / CLI
//!     ↓
//! Services (ledger, categories, rankings, points)
//!     ↓
//! Repositories (db/*.rs)
//!     ↓
//! SQLite
//! ```

pub mod response;
pub mod events;
pub mod operators;
pub mod ledger_service;
pub mod points_service;
pub mod category_service;
pub mod ranking_service;

// Re-exports
pub use response::*;
pub use events::{EventBus, EventListener, SettlementEvent};
pub use operators::{OperatorDirectory, StaticOperatorDirectory};
pub use ledger_service::{GatewayEvent, LedgerService, PayoutExecutor, PayoutInstruction};
pub use points_service::PointsService;
pub use category_service::CategoryService;
pub use ranking_service::RankingService;

use std::sync::Arc;

use crate::config::Config;
use crate::db::SettlementDb;

/// Service container shared by the HTTP server, scheduler and CLI
pub struct Services {
    pub ledger: Arc<LedgerService>,
    pub categories: Arc<CategoryService>,
    pub rankings: Arc<RankingService>,
    pub points: Arc<PointsService>,
    pub operators: Arc<dyn OperatorDirectory>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Wire every service onto one database, using the configured operator list
    pub fn new(db: Arc<SettlementDb>, config: &Config) -> Self {
        let operators: Arc<dyn OperatorDirectory> = Arc::new(StaticOperatorDirectory::new(
            config.authorized_operators.iter().cloned(),
        ));
        Self::with_operators(db, config, operators)
    }

    pub fn with_operators(
        db: Arc<SettlementDb>,
        config: &Config,
        operators: Arc<dyn OperatorDirectory>,
    ) -> Self {
        let events = Arc::new(EventBus::new());

        let ledger = Arc::new(LedgerService::new(
            db.clone(),
            events.clone(),
            config.split.unit,
            config.ranking.minor_units_per_vote,
            config.platform_account.clone(),
        ));
        let points = Arc::new(PointsService::new(
            db.clone(),
            events.clone(),
            ledger.clone(),
            config.points.points_per_unit,
            config.points.cashout_threshold,
        ));
        let categories = Arc::new(CategoryService::new(
            db.clone(),
            events.clone(),
            operators.clone(),
            ledger.clone(),
            config.category.clone(),
        ));
        let rankings = Arc::new(RankingService::new(
            db,
            events.clone(),
            ledger.clone(),
            points.clone(),
            operators.clone(),
            config.ranking.clone(),
            config.points.points_per_unit,
        ));

        Self {
            ledger,
            categories,
            rankings,
            points,
            operators,
            events,
        }
    }
}
