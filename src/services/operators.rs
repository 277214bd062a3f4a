//! Operator authorization for privileged calls

use std::collections::HashSet;

use crate::error::SettlementError;
use crate::lifecycle::Actor;

/// Answers whether an operator id may run privileged operations
pub trait OperatorDirectory: Send + Sync {
    fn is_authorized(&self, operator_id: &str) -> bool;
}

/// Fixed set of operator ids, usually from `Config::authorized_operators`
#[derive(Debug, Clone, Default)]
pub struct StaticOperatorDirectory {
    operators: HashSet<String>,
}

impl StaticOperatorDirectory {
    pub fn new<I, S>(operators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operators: operators.into_iter().map(Into::into).collect(),
        }
    }
}

impl OperatorDirectory for StaticOperatorDirectory {
    fn is_authorized(&self, operator_id: &str) -> bool {
        self.operators.contains(operator_id)
    }
}

/// Require an authorized operator. `System` is rejected: manual paths need a person.
pub fn require_operator(directory: &dyn OperatorDirectory, actor: &Actor) -> Result<(), SettlementError> {
    match actor {
        Actor::Operator(id) if directory.is_authorized(id) => Ok(()),
        Actor::Operator(id) => Err(SettlementError::PermissionDenied(format!(
            "{} is not an authorized operator",
            id
        ))),
        Actor::System => Err(SettlementError::PermissionDenied(
            "this operation requires an operator identity".into(),
        )),
    }
}

/// Allow the scheduler or an authorized operator
pub fn require_system_or_operator(
    directory: &dyn OperatorDirectory,
    actor: &Actor,
) -> Result<(), SettlementError> {
    match actor {
        Actor::System => Ok(()),
        operator => require_operator(directory, operator),
    }
}
