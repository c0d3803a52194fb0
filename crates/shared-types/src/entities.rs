//! # Domain Entities
//!
//! Core data structures for the escrow invoice lifecycle.
//!
//! ## Type Decisions
//!
//! - `total_amount: u64` in currency units, `ledger_amount: u128` in the
//!   ledger's smallest unit. The ledger amount is derived once from the
//!   currency's decimal places and never independently mutated.
//! - Party identities are 20-byte ledger addresses. Ledger-side handles
//!   (contract address, transaction id, content hash) are opaque strings:
//!   the engine polls them, it does not own or interpret them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Party identity on the settlement ledger.
pub type Address = [u8; 20];

/// Opaque ledger transaction id.
pub type TxId = String;
/// Opaque deployed settlement-contract address.
pub type ContractAddress = String;
/// Opaque content hash into the Document Store.
pub type ContentHash = String;

pub type InvoiceId = Uuid;
pub type MilestoneId = Uuid;
pub type DisputeId = Uuid;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

/// Currency unit of an invoice's amounts.
///
/// `decimals` is the exponent between the currency unit and the ledger's
/// smallest unit (e.g. 6 for USDC-style tokens).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    /// Currency code, e.g. "USDC".
    pub code: String,
    /// Decimal places between currency unit and ledger base unit.
    pub decimals: u32,
}

impl Currency {
    /// Convert an amount in currency units to ledger base units.
    pub fn to_ledger_units(&self, amount: u64) -> u128 {
        u128::from(amount) * 10u128.pow(self.decimals)
    }
}

/// Invoice lifecycle status.
///
/// ```text
/// DRAFT ──deploy──→ DEPLOYED ──confirm──→ ACTIVE ──last release──→ COMPLETED
///   │                  │                    │ ↑
///   └─cancel─→ CANCELLED                    ↓ │
///                                         DISPUTED
/// ```
///
/// `Deployed → Draft`, `Disputed → Draft`, and `Completed → Active` are
/// legal only as reconciler-applied reverts after the ledger rejected the
/// transaction that drove the forward transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Draft,
    Deployed,
    Active,
    Disputed,
    Completed,
    Cancelled,
}

impl InvoiceStatus {
    /// Check whether a transition to `next` is legal.
    pub fn can_transition_to(self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Draft, Deployed)
                | (Draft, Cancelled)
                | (Deployed, Active)
                | (Deployed, Disputed)
                | (Deployed, Completed)
                | (Deployed, Draft) // reconciler revert: deploy rejected
                | (Active, Disputed)
                | (Active, Completed)
                | (Disputed, Active)
                | (Disputed, Draft) // reconciler revert: deploy rejected under an open dispute
                | (Completed, Active) // reconciler revert: final release rejected
        )
    }

    /// Terminal statuses admit no further transitions except reverts.
    pub fn is_terminal(self) -> bool {
        matches!(self, InvoiceStatus::Completed | InvoiceStatus::Cancelled)
    }

    /// Statuses from which milestones may be released.
    pub fn is_releasable(self) -> bool {
        matches!(self, InvoiceStatus::Deployed | InvoiceStatus::Active)
    }
}

/// Milestone release status.
///
/// `Released → Pending/Approved` is legal only as a reconciler-applied
/// revert after the ledger rejected the release transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MilestoneStatus {
    Pending,
    Approved,
    Released,
}

impl MilestoneStatus {
    /// Check whether a transition to `next` is legal.
    pub fn can_transition_to(self, next: MilestoneStatus) -> bool {
        use MilestoneStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Released)
                | (Approved, Released)
                | (Released, Pending) // reconciler revert
                | (Released, Approved) // reconciler revert
        )
    }

    /// Statuses from which a release attempt is permitted.
    pub fn is_releasable(self) -> bool {
        matches!(self, MilestoneStatus::Pending | MilestoneStatus::Approved)
    }
}

/// Dispute status. `Resolved → Open` is the reconciler revert for a
/// ledger-rejected arbitration transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisputeStatus {
    Open,
    Resolved,
}

/// The escrow agreement between a client and a contractor.
///
/// Never deleted: cancellation is a terminal status, not a deletion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    /// Optional human-readable title.
    pub title: Option<String>,
    /// Caller-supplied opaque metadata, stored verbatim.
    pub metadata: Option<serde_json::Value>,
    /// Party funding the escrow; sole release authority.
    pub client: Address,
    /// Party receiving released tranches.
    pub contractor: Address,
    /// Dispute arbitrator. Defaults to the client when unspecified.
    pub arbitrator: Address,
    /// Total escrowed amount in currency units.
    pub total_amount: u64,
    pub currency: Currency,
    /// Total amount in the ledger's smallest unit. Derived, never mutated
    /// independently of `total_amount`.
    pub total_ledger_amount: u128,
    /// Deployed settlement contract, set when leaving `Draft`.
    pub contract_address: Option<ContractAddress>,
    /// Deployment transaction, set when leaving `Draft`.
    pub deploy_tx_id: Option<TxId>,
    /// Block height at which the deployment confirmed.
    pub confirmed_height: Option<u64>,
    pub status: InvoiceStatus,
    /// Content hash of the canonical agreement text. Absence never blocks
    /// settlement: document pinning is best-effort.
    pub document_hash: Option<ContentHash>,
    pub created_at: Timestamp,
}

/// A single releasable tranche of an invoice.
///
/// Owned by exactly one invoice; `sequence` is unique within it.
/// Once `Released`, amount and status are immutable (the reconciler's
/// rejection revert is the sole exception).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub invoice_id: InvoiceId,
    /// Position within the invoice, starting at 1.
    pub sequence: u32,
    /// Tranche amount in currency units.
    pub amount: u64,
    /// Tranche amount in ledger base units.
    pub ledger_amount: u128,
    /// Human-readable release condition.
    pub condition: String,
    /// Whether the contractor must attach proof before approval.
    pub requires_proof: bool,
    pub due_at: Option<Timestamp>,
    pub status: MilestoneStatus,
    /// Ledger transaction that released this tranche.
    pub release_tx_id: Option<TxId>,
    pub released_at: Option<Timestamp>,
    /// Block height at which the release confirmed.
    pub confirmed_height: Option<u64>,
}

/// A single approver's vote on a milestone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub milestone_id: MilestoneId,
    pub approver: Address,
    pub approved: bool,
    pub voted_at: Timestamp,
}

/// A dispute over an invoice. At most one may be `Open` per invoice.
///
/// While open, the local record is authoritative for blocking releases
/// regardless of whether the ledger acknowledged the dispute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub invoice_id: InvoiceId,
    pub raised_by: Address,
    pub reason: String,
    /// Optional content hash of supporting evidence.
    pub evidence_hash: Option<ContentHash>,
    pub status: DisputeStatus,
    pub resolution: Option<String>,
    pub resolved_by: Option<Address>,
    /// True = remaining balance to the client, false = to the contractor.
    pub in_favor_of_client: Option<bool>,
    /// Ledger transaction executing the arbitration.
    pub resolution_tx_id: Option<TxId>,
    pub raised_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
}
