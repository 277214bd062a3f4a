//! Error types for settlement-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A computed plan does not conserve its gross amount. Never expected with
    /// valid inputs; the operation is aborted and nothing is written.
    #[error("Computation invariant violated: {0}")]
    InvariantViolation(String),

    #[error("External transfer failed: {0}")]
    ExternalTransfer(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SettlementError {
    /// Business rejections are returned to the caller; everything else is a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SettlementError::InvalidInput(_)
                | SettlementError::PermissionDenied(_)
                | SettlementError::NotFound(_)
                | SettlementError::Conflict(_)
                | SettlementError::InvalidTransition(_)
        )
    }
}
