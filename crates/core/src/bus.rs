use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::AlarmHandle;

/// Domain-level event for collaborators. Carries the occurrence id, never
/// scheduling internals beyond the handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    /// The reminder fired.
    AlarmDelivered {
        occurrence_id: String,
        subject_label: String,
        handle: AlarmHandle,
    },
    /// The user interacted with the reminder.
    AlarmActed {
        occurrence_id: String,
        subject_label: String,
        handle: AlarmHandle,
        action_id: String,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::AlarmDelivered { .. } => "alarm_delivered",
            DomainEvent::AlarmActed { .. } => "alarm_acted",
        }
    }

    pub fn occurrence_id(&self) -> &str {
        match self {
            DomainEvent::AlarmDelivered { occurrence_id, .. }
            | DomainEvent::AlarmActed { occurrence_id, .. } => occurrence_id,
        }
    }
}

pub type EventReceiver = broadcast::Receiver<DomainEvent>;

/// Typed publish/subscribe channel for domain events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish to current subscribers. Returns how many received it.
    pub fn publish(&self, event: DomainEvent) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                tracing::debug!(event = event.name(), "no subscribers for domain event");
                0
            }
        }
    }
}
