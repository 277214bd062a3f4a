//! Category lifecycle state machine
//!
//! `waiting → first_cycle → second_cycle → closed`, with any non-closed state
//! allowed to jump straight to `closed`. `closed` is terminal.
//!
//! [`evaluate`] is pure: it takes the current state and an explicit `now` and
//! returns at most one transition. Persistence lives in the category service.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryStatus {
    Waiting,
    FirstCycle,
    SecondCycle,
    Closed,
}

impl CategoryStatus {
    pub const ALL: [CategoryStatus; 4] = [
        CategoryStatus::Waiting,
        CategoryStatus::FirstCycle,
        CategoryStatus::SecondCycle,
        CategoryStatus::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryStatus::Waiting => "waiting",
            CategoryStatus::FirstCycle => "first_cycle",
            CategoryStatus::SecondCycle => "second_cycle",
            CategoryStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == value)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CategoryStatus::Closed)
    }

    pub fn in_cycle(&self) -> bool {
        matches!(self, CategoryStatus::FirstCycle | CategoryStatus::SecondCycle)
    }

    pub fn can_transition_to(&self, next: CategoryStatus) -> bool {
        use CategoryStatus::*;
        matches!(
            (self, next),
            (Waiting, FirstCycle)
                | (FirstCycle, SecondCycle)
                | (Waiting, Closed)
                | (FirstCycle, Closed)
                | (SecondCycle, Closed)
        )
    }
}

impl std::fmt::Display for CategoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused a state change
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    System,
    Operator(String),
}

impl Actor {
    pub fn operator(id: impl Into<String>) -> Self {
        Actor::Operator(id.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Actor::System => "system",
            Actor::Operator(_) => "operator",
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Actor::System => None,
            Actor::Operator(id) => Some(id),
        }
    }

    pub fn from_parts(kind: &str, id: Option<String>) -> Option<Self> {
        match (kind, id) {
            ("system", _) => Some(Actor::System),
            ("operator", Some(id)) => Some(Actor::Operator(id)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::Operator(id) => write!(f, "operator:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum TransitionReason {
    ThresholdReached,
    CycleExtended,
    MaxReached,
    CyclesExhausted,
    ManualStart { forced: bool },
    ManualClose(String),
}

impl TransitionReason {
    pub fn code(&self) -> &'static str {
        match self {
            TransitionReason::ThresholdReached => "threshold_reached",
            TransitionReason::CycleExtended => "cycle_extended",
            TransitionReason::MaxReached => "max_reached",
            TransitionReason::CyclesExhausted => "cycles_exhausted",
            TransitionReason::ManualStart { .. } => "manual_start",
            TransitionReason::ManualClose(_) => "manual_close",
        }
    }

    /// Human-readable message for the audit trail
    pub fn message(&self, item_count: i64) -> String {
        match self {
            TransitionReason::ThresholdReached => {
                format!("First cycle started ({} items)", item_count)
            }
            TransitionReason::CycleExtended => {
                format!("Second cycle started ({} items)", item_count)
            }
            TransitionReason::MaxReached => {
                format!("Closed: maximum item count reached ({} items)", item_count)
            }
            TransitionReason::CyclesExhausted => {
                format!("Closed: both cycles ended ({} items)", item_count)
            }
            TransitionReason::ManualStart { forced } => format!(
                "Cycle started manually{} ({} items)",
                if *forced { " (forced)" } else { "" },
                item_count
            ),
            TransitionReason::ManualClose(reason) => {
                format!("Closed manually: {} ({} items)", reason, item_count)
            }
        }
    }
}

/// A cycle window opened by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleWindow {
    pub number: i64,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl CycleWindow {
    pub fn open(number: i64, now: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            number,
            started_at: now,
            ends_at: now + duration,
        }
    }
}

/// The fields of a category the state machine looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleState {
    pub status: CategoryStatus,
    pub current_item_count: i64,
    pub activation_threshold: i64,
    pub max_item_count: i64,
    pub cycle_ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: CategoryStatus,
    pub to: CategoryStatus,
    pub reason: TransitionReason,
    /// Set when the transition opens a new cycle
    pub cycle: Option<CycleWindow>,
}

impl Transition {
    pub fn closes(&self) -> bool {
        self.to == CategoryStatus::Closed
    }
}

fn cycle_over(state: &LifecycleState, now: DateTime<Utc>) -> bool {
    state.cycle_ends_at.map(|end| now >= end).unwrap_or(false)
}

/// Decide the single transition a sweep applies, in priority order:
/// activation, end of first cycle, end of second cycle, max reached mid-cycle.
pub fn evaluate(
    state: &LifecycleState,
    now: DateTime<Utc>,
    cycle_duration: Duration,
) -> Option<Transition> {
    use CategoryStatus::*;

    let count = state.current_item_count;

    if state.status == Waiting && count >= state.activation_threshold {
        return Some(Transition {
            from: Waiting,
            to: FirstCycle,
            reason: TransitionReason::ThresholdReached,
            cycle: Some(CycleWindow::open(1, now, cycle_duration)),
        });
    }

    if state.status == FirstCycle && cycle_over(state, now) {
        if count >= state.max_item_count {
            return Some(Transition {
                from: FirstCycle,
                to: Closed,
                reason: TransitionReason::MaxReached,
                cycle: None,
            });
        }
        return Some(Transition {
            from: FirstCycle,
            to: SecondCycle,
            reason: TransitionReason::CycleExtended,
            cycle: Some(CycleWindow::open(2, now, cycle_duration)),
        });
    }

    if state.status == SecondCycle && cycle_over(state, now) {
        return Some(Transition {
            from: SecondCycle,
            to: Closed,
            reason: TransitionReason::CyclesExhausted,
            cycle: None,
        });
    }

    if state.status.in_cycle() && count >= state.max_item_count {
        return Some(Transition {
            from: state.status,
            to: Closed,
            reason: TransitionReason::MaxReached,
            cycle: None,
        });
    }

    None
}
