//! Event bus for settlement operations
//!
//! Services emit an event after each durable change. Subscribers are
//! optional; the logging listener turns the stream into an audit log.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

/// Settlement events emitted by services
#[derive(Debug, Clone)]
pub enum SettlementEvent {
    // Ledger
    MonetaryEventRecorded {
        event_id: String,
        kind: String,
    },
    DuplicateEventIgnored {
        event_id: String,
    },
    PlanPersisted {
        source_event_id: String,
        rule: String,
        gross: i64,
        inserted: u64,
    },
    EntryCompleted {
        entry_id: String,
        external_transfer_id: String,
    },
    EntryFailed {
        entry_id: String,
        reason: String,
    },

    // Category lifecycle
    CategoryCreated {
        id: String,
        name: String,
    },
    CategoryTransitioned {
        id: String,
        from: String,
        to: String,
        reason: String,
        actor: String,
    },
    CategoryPayoutRequested {
        id: String,
    },

    // Ranking
    DaySettled {
        date: String,
        participants: usize,
        total_pot: i64,
        unallocated: i64,
    },
    WagerSettled {
        wager_id: String,
        final_rank: Option<i64>,
        refund_amount: i64,
    },

    // Points
    PointsCredited {
        account_id: String,
        kind: String,
        amount: i64,
    },

    /// A computed plan failed its conservation checks; nothing was written
    InvariantViolation {
        context: String,
        detail: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &SettlementEvent);
}

/// Event bus for broadcasting settlement events
pub struct EventBus {
    sender: broadcast::Sender<SettlementEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: SettlementEvent) {
        trace!(event = ?event, "Emitting settlement event");
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettlementEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &SettlementEvent) {
        match event {
            SettlementEvent::PlanPersisted { source_event_id, rule, gross, inserted } => {
                info!(event_id = %source_event_id, rule = %rule, gross, inserted, "Plan persisted");
            }
            SettlementEvent::EntryFailed { entry_id, reason } => {
                warn!(entry_id = %entry_id, reason = %reason, "Ledger entry failed");
            }
            SettlementEvent::CategoryTransitioned { id, from, to, reason, actor } => {
                info!(
                    category_id = %id,
                    from = %from,
                    to = %to,
                    actor = %actor,
                    reason = %reason,
                    "Category transitioned"
                );
            }
            SettlementEvent::DaySettled { date, participants, total_pot, unallocated } => {
                info!(date = %date, participants, total_pot, unallocated, "Day settled");
            }
            SettlementEvent::InvariantViolation { context, detail } => {
                error!(target: "settlement::invariant", context = %context, detail = %detail, "Invariant violation");
            }
            SettlementEvent::DuplicateEventIgnored { event_id } => {
                debug!(event_id = %event_id, "Duplicate event ignored");
            }
            _ => {
                trace!(event = ?event, "Settlement event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
