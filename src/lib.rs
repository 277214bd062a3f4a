//! Settlement Core - deterministic revenue splits, ledger and daily rankings
//!
//! Turns payment-gateway callbacks into at-most-once ledger lines, drives
//! category lifecycles, and settles daily rankings with a shared pot.
//!
//! ## Parts
//!
//! | Part | Module |
//! |------|--------|
//! | Split calculator (pure) | `split`, `points` |
//! | Idempotent ledger recorder | `services::ledger_service`, `db::ledger` |
//! | Category lifecycle controller | `lifecycle`, `services::category_service` |
//! | Daily ranking & pot settlement | `services::ranking_service`, `db::rankings` |
//! | Loyalty points | `services::points_service`, `db::points` |
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/settlement-core/
//! ├── settlement.db     # SQLite (WAL)
//! └── config.toml       # Configuration
//! ```
//!
//! All money is integer minor units. Participant payouts are floored to the
//! configured unit and the platform line absorbs every rounding residual.

pub mod config;
pub mod error;
pub mod split;
pub mod points;
pub mod lifecycle;
pub mod db;
pub mod services;
pub mod http;
pub mod scheduler;

// Re-exports
pub use config::Config;
pub use db::SettlementDb;
pub use error::SettlementError;
pub use http::HttpServer;
pub use lifecycle::{Actor, CategoryStatus};
pub use services::Services;
pub use split::{DistributionLine, DistributionPlan, Recipient, SplitRole};
