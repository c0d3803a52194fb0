//! # Pending Transaction Queue Records
//!
//! The durable work queue bridging "a transaction id exists" and "the
//! ledger confirmed it". Every outstanding transaction is recorded inside
//! the same unit of work that made its optimistic local transition, so a
//! process restart resumes polling from persisted state instead of losing
//! in-flight confirmations.

use serde::{Deserialize, Serialize};
use shared_types::{DisputeId, InvoiceId, MilestoneId, MilestoneStatus, Timestamp, TxId};

/// Which local transition the transaction drives, with the prior statuses
/// needed to revert it if the ledger rejects the transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingTxKind {
    /// Settlement contract deployment. Rejection reverts the invoice to
    /// `Draft` and clears the deployment linkage.
    Deploy,
    /// Milestone release. Rejection reverts the milestone to its
    /// pre-attempt status and, when the release completed the invoice,
    /// the invoice back to `Active`.
    Release {
        milestone_id: MilestoneId,
        prior_status: MilestoneStatus,
        completed_invoice: bool,
    },
    /// Dispute arbitration. Rejection reopens the dispute and puts the
    /// invoice back to `Disputed`.
    Resolve { dispute_id: DisputeId },
}

/// One outstanding ledger transaction awaiting confirmation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTx {
    pub tx_id: TxId,
    pub invoice_id: InvoiceId,
    pub kind: PendingTxKind,
    /// When the transaction was recorded; the hard timeout counts from here.
    pub recorded_at: Timestamp,
    /// Completed poll attempts, drives the exponential backoff.
    pub attempts: u32,
    /// Earliest time the next poll is due.
    pub next_poll_at: Timestamp,
}

impl PendingTx {
    pub fn new(tx_id: TxId, invoice_id: InvoiceId, kind: PendingTxKind, now: Timestamp) -> Self {
        Self {
            tx_id,
            invoice_id,
            kind,
            recorded_at: now,
            attempts: 0,
            next_poll_at: now,
        }
    }

    /// Whether this record is due for polling.
    pub fn is_due(&self, now: Timestamp) -> bool {
        now >= self.next_poll_at
    }

    /// Age of the record in seconds.
    pub fn age(&self, now: Timestamp) -> u64 {
        now.saturating_sub(self.recorded_at)
    }

    /// Bounded exponential backoff: `base * 2^attempts`, capped.
    pub fn backoff_secs(&self, base_secs: u64, max_secs: u64) -> u64 {
        let exp = self.attempts.min(32);
        base_secs
            .saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX))
            .min(max_secs)
    }
}
