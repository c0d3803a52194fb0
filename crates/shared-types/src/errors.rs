//! # Error Taxonomy
//!
//! Tagged error kinds carried as typed results so callers can branch on
//! retryability instead of string-matching a generic error.

use crate::entities::{InvoiceId, TxId};
use thiserror::Error;

/// Which external collaborator failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collaborator {
    Drafting,
    Ledger,
    DocumentStore,
}

impl std::fmt::Display for Collaborator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Collaborator::Drafting => "drafting service",
            Collaborator::Ledger => "ledger client",
            Collaborator::DocumentStore => "document store",
        };
        f.write_str(name)
    }
}

/// Engine-facing error taxonomy.
///
/// | Variant                   | Surfaced      | Retry                    |
/// |---------------------------|---------------|--------------------------|
/// | `ValidationFailed`        | synchronously | no                       |
/// | `Unauthorized`            | synchronously | no                       |
/// | `StateConflict`           | synchronously | yes, with fresh state    |
/// | `CollaboratorUnavailable` | synchronously | yes                      |
/// | `LedgerRejected`          | via Event     | operation-dependent      |
/// | `NotFound`                | synchronously | no                       |
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EngineError {
    /// Rejected before any persistence.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The requesting identity lacks the required capability.
    #[error("unauthorized: {identity} lacks capability {capability}")]
    Unauthorized { identity: String, capability: String },

    /// A precondition no longer holds; another transition won the race.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// An external collaborator was unreachable or errored.
    #[error("{collaborator} unavailable: {reason}")]
    CollaboratorUnavailable {
        collaborator: Collaborator,
        reason: String,
    },

    /// The ledger explicitly aborted or reverted a transaction.
    #[error("ledger rejected transaction {tx_id}: {reason}")]
    LedgerRejected { tx_id: TxId, reason: String },

    /// Unknown invoice, milestone, or dispute id.
    #[error("not found: {0}")]
    NotFound(String),

    /// A fault in the local store outside the conflict path.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the caller may retry the operation as-is (after re-reading
    /// state for `StateConflict`).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StateConflict(_) | EngineError::CollaboratorUnavailable { .. }
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::ValidationFailed(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        EngineError::StateConflict(msg.into())
    }
}

/// Errors from the transactional state store.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StoreError {
    /// The commit's expected version no longer matches; a concurrent
    /// transaction committed first.
    #[error("version conflict on invoice {invoice_id}: expected {expected}, found {found}")]
    VersionConflict {
        invoice_id: InvoiceId,
        expected: u64,
        found: u64,
    },

    #[error("invoice not found: {0}")]
    InvoiceNotFound(InvoiceId),

    #[error("milestone sequence {sequence} already exists on invoice {invoice_id}")]
    DuplicateSequence { invoice_id: InvoiceId, sequence: u32 },

    #[error("pending transaction already recorded: {0}")]
    DuplicatePendingTx(TxId),

    /// A release attempt already holds the claim for this milestone.
    #[error("milestone release already in flight: {0}")]
    ReleaseInFlight(crate::entities::MilestoneId),

    /// A status transition the entity state machine forbids.
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("store lock poisoned")]
    LockPoisoned,
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict { .. } => {
                EngineError::StateConflict("a concurrent transition committed first".to_string())
            }
            StoreError::InvoiceNotFound(id) => EngineError::NotFound(format!("invoice {id}")),
            StoreError::DuplicatePendingTx(tx) => {
                EngineError::StateConflict(format!("transaction {tx} already pending"))
            }
            StoreError::ReleaseInFlight(milestone_id) => EngineError::StateConflict(format!(
                "milestone {milestone_id} release already in flight"
            )),
            other => EngineError::Internal(other.to_string()),
        }
    }
}
