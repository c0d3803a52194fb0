//! # Audit Events
//!
//! Immutable, append-only records of every committed transition.
//!
//! Events are the reconciliation loop's and the Notifier's only input.
//! Each record is appended inside the same unit of work as the transition
//! it describes, and the store assigns per-invoice sequence numbers, so
//! any reader observes a strictly increasing, gapless sequence.

use crate::entities::{Address, DisputeId, InvoiceId, MilestoneId, Timestamp, TxId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened, with a snapshot of the fields relevant at commit time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    InvoiceCreated {
        total_amount: u64,
        currency: String,
        milestone_count: u32,
    },
    ContractDeployed {
        contract_address: String,
    },
    MilestoneReleased {
        milestone_id: MilestoneId,
        sequence: u32,
        amount: u64,
    },
    DisputeRaised {
        dispute_id: DisputeId,
        reason: String,
    },
    DisputeResolved {
        dispute_id: DisputeId,
        in_favor_of_client: bool,
    },
    InvoiceCompleted,
    InvoiceCancelled,
    /// A polled ledger transaction reached a confirmed block.
    LedgerConfirmed {
        block_height: u64,
    },
    /// A polled ledger transaction was rejected, reverted, or timed out.
    /// The optimistic local status was rolled back to its prior value.
    LedgerFailed {
        reason: String,
    },
}

impl EventKind {
    /// Canonical audit name for logs and external consumers.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::InvoiceCreated { .. } => "INVOICE_CREATED",
            EventKind::ContractDeployed { .. } => "CONTRACT_DEPLOYED",
            EventKind::MilestoneReleased { .. } => "MILESTONE_RELEASED",
            EventKind::DisputeRaised { .. } => "DISPUTE_RAISED",
            EventKind::DisputeResolved { .. } => "DISPUTE_RESOLVED",
            EventKind::InvoiceCompleted => "INVOICE_COMPLETED",
            EventKind::InvoiceCancelled => "INVOICE_CANCELLED",
            EventKind::LedgerConfirmed { .. } => "LEDGER_CONFIRMED",
            EventKind::LedgerFailed { .. } => "LEDGER_FAILED",
        }
    }
}

/// A committed audit record. Never mutated or deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub invoice_id: InvoiceId,
    /// Per-invoice sequence, assigned by the store at append, gapless from 1.
    pub sequence: u64,
    pub kind: EventKind,
    /// Identity that triggered the transition; `None` for reconciler-applied
    /// transitions.
    pub actor: Option<Address>,
    /// Ledger transaction associated with the transition, when one exists.
    pub tx_id: Option<TxId>,
    pub recorded_at: Timestamp,
}

/// An event as built by the engine, before the store assigns identity and
/// sequence inside the commit.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEvent {
    pub kind: EventKind,
    pub actor: Option<Address>,
    pub tx_id: Option<TxId>,
}

impl NewEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            actor: None,
            tx_id: None,
        }
    }

    pub fn with_actor(mut self, actor: Address) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_tx(mut self, tx_id: TxId) -> Self {
        self.tx_id = Some(tx_id);
        self
    }
}
