//! # Notification Events
//!
//! Defines the notifications that flow through the bus and the filters
//! subscribers use to select them. A notification wraps the committed
//! [`EventRecord`] verbatim: the bus never sees uncommitted state, because
//! the engine publishes strictly after its local commit.

use serde::{Deserialize, Serialize};
use shared_types::events::{EventKind, EventRecord};
use shared_types::InvoiceId;

/// A committed audit record fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// The committed audit record, exactly as persisted.
    pub record: EventRecord,
}

impl Notification {
    pub fn new(record: EventRecord) -> Self {
        Self { record }
    }

    /// Topic for subscription filtering.
    #[must_use]
    pub fn topic(&self) -> EventTopic {
        match &self.record.kind {
            EventKind::InvoiceCreated { .. }
            | EventKind::ContractDeployed { .. }
            | EventKind::InvoiceCompleted
            | EventKind::InvoiceCancelled => EventTopic::InvoiceLifecycle,
            EventKind::MilestoneReleased { .. } => EventTopic::Milestones,
            EventKind::DisputeRaised { .. } | EventKind::DisputeResolved { .. } => {
                EventTopic::Disputes
            }
            EventKind::LedgerConfirmed { .. } | EventKind::LedgerFailed { .. } => {
                EventTopic::Reconciliation
            }
        }
    }

    /// The invoice this notification concerns.
    #[must_use]
    pub fn invoice_id(&self) -> InvoiceId {
        self.record.invoice_id
    }
}

/// Event topics for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    /// Invoice creation, deployment, completion, cancellation.
    InvoiceLifecycle,
    /// Milestone releases.
    Milestones,
    /// Dispute raise/resolve.
    Disputes,
    /// Reconciler outcomes (confirmations and failures).
    Reconciliation,
    /// All events (no filtering).
    All,
}

/// Filter for subscribing to specific notifications.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Topics to include. Empty means all topics.
    pub topics: Vec<EventTopic>,
    /// Invoices to include. Empty means all invoices.
    pub invoice_ids: Vec<InvoiceId>,
}

impl EventFilter {
    /// Match everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only the given topics.
    #[must_use]
    pub fn topics(topics: Vec<EventTopic>) -> Self {
        Self {
            topics,
            invoice_ids: vec![],
        }
    }

    /// Match only the given invoice.
    #[must_use]
    pub fn invoice(invoice_id: InvoiceId) -> Self {
        Self {
            topics: vec![],
            invoice_ids: vec![invoice_id],
        }
    }

    /// Check whether a notification passes this filter.
    #[must_use]
    pub fn matches(&self, notification: &Notification) -> bool {
        let topic_ok = self.topics.is_empty()
            || self.topics.contains(&EventTopic::All)
            || self.topics.contains(&notification.topic());
        let invoice_ok =
            self.invoice_ids.is_empty() || self.invoice_ids.contains(&notification.invoice_id());
        topic_ok && invoice_ok
    }
}
