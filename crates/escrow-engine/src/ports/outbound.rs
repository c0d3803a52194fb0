//! # Outbound Ports
//!
//! Traits for everything the engine calls out to: the transactional state
//! store, the ledger client, the drafting service, the document store, and
//! a time source.
//!
//! The key asymmetry lives here: `StateStore` commits are atomic, short,
//! and synchronous; the collaborator traits are async, blocking I/O that
//! must never be awaited while a store transaction is conceptually open.

use crate::domain::pending::PendingTx;
use serde_json::Value;
use shared_types::{
    Address, Approval, ContentHash, ContractAddress, Currency, Dispute, DisputeId, EngineError,
    EventRecord, Invoice, InvoiceId, InvoiceStatus, Milestone, MilestoneId, MilestoneStatus,
    NewEvent, StoreError, Timestamp, TxId,
};

// =============================================================================
// State Store
// =============================================================================

/// A release attempt currently holding the per-milestone exclusivity
/// claim. The timestamp is what lets the reconciler tell a claim that is
/// seconds old (an invoke in flight right now) from one orphaned by a
/// crash between broadcast and outcome commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseClaim {
    pub milestone_id: MilestoneId,
    pub claimed_at: Timestamp,
}

/// A claim past the staleness horizon, surfaced with its owning invoice
/// for recovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaleClaim {
    pub invoice_id: InvoiceId,
    pub milestone_id: MilestoneId,
    pub claimed_at: Timestamp,
}

/// Full snapshot of an invoice aggregate, plus the optimistic version the
/// next commit must name.
#[derive(Clone, Debug)]
pub struct InvoiceRecord {
    pub invoice: Invoice,
    /// Ordered by sequence number.
    pub milestones: Vec<Milestone>,
    pub approvals: Vec<Approval>,
    pub disputes: Vec<Dispute>,
    /// Ordered by per-invoice event sequence, gapless from 1.
    pub events: Vec<EventRecord>,
    /// Milestones with a release attempt currently in flight.
    pub release_claims: Vec<ReleaseClaim>,
    /// Optimistic concurrency version; bumped by every commit.
    pub version: u64,
}

impl InvoiceRecord {
    /// Look up a milestone by id.
    pub fn milestone(&self, id: &MilestoneId) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.id == *id)
    }

    /// Approval votes recorded for one milestone.
    pub fn approvals_for(&self, id: &MilestoneId) -> Vec<Approval> {
        self.approvals
            .iter()
            .filter(|a| a.milestone_id == *id)
            .cloned()
            .collect()
    }

    /// The open dispute, if any. The store upholds at most one.
    pub fn open_dispute(&self) -> Option<&Dispute> {
        self.disputes
            .iter()
            .find(|d| d.status == shared_types::DisputeStatus::Open)
    }

    /// Dispute lookup by id.
    pub fn dispute(&self, id: &DisputeId) -> Option<&Dispute> {
        self.disputes.iter().find(|d| d.id == *id)
    }
}

/// One typed mutation inside an atomic unit of work.
///
/// The store validates status transitions against the entity state
/// machines and rejects the whole transaction on the first illegal op.
#[derive(Clone, Debug)]
pub enum StoreOp {
    InsertInvoice(Invoice),
    InsertMilestone(Milestone),
    SetInvoiceStatus(InvoiceStatus),
    /// Record contract address and deployment transaction.
    SetInvoiceDeployment {
        contract_address: ContractAddress,
        deploy_tx_id: TxId,
    },
    /// Revert path: forget a rejected deployment.
    ClearInvoiceDeployment,
    SetInvoiceConfirmedHeight(u64),
    SetDocumentHash(ContentHash),
    InsertApproval(Approval),
    SetMilestoneStatus {
        milestone_id: MilestoneId,
        status: MilestoneStatus,
    },
    /// Record the release transaction linkage on a milestone.
    SetMilestoneRelease {
        milestone_id: MilestoneId,
        tx_id: TxId,
        released_at: Timestamp,
    },
    /// Revert path: forget a rejected release.
    ClearMilestoneRelease {
        milestone_id: MilestoneId,
    },
    SetMilestoneConfirmedHeight {
        milestone_id: MilestoneId,
        height: u64,
    },
    /// Take the exclusive release claim for a milestone. Fails the
    /// transaction with `ReleaseInFlight` if already held, which is what
    /// guarantees at most one ledger call per milestone under races.
    ClaimMilestoneRelease {
        milestone_id: MilestoneId,
    },
    /// Drop the release claim (ledger call failed, or outcome committed).
    ClearReleaseClaim {
        milestone_id: MilestoneId,
    },
    InsertDispute(Dispute),
    ResolveDispute {
        dispute_id: DisputeId,
        resolution: String,
        resolved_by: Address,
        in_favor_of_client: bool,
        tx_id: TxId,
        resolved_at: Timestamp,
    },
    /// Revert path: reopen a dispute whose arbitration tx was rejected.
    ReopenDispute {
        dispute_id: DisputeId,
    },
    /// Append an audit record; the store assigns id, per-invoice sequence,
    /// and stamps it with the transaction's timestamp.
    AppendEvent(NewEvent),
    EnqueuePendingTx(PendingTx),
    /// Idempotent: removing an absent record is not an error.
    RemovePendingTx(TxId),
    /// Bump the poll attempt counter and reschedule.
    ReschedulePendingTx {
        tx_id: TxId,
        next_poll_at: Timestamp,
    },
}

/// An atomic unit of work against one invoice aggregate.
///
/// `expected_version == 0` means the invoice must not exist yet (creation).
/// Any version mismatch fails the whole transaction with `VersionConflict`
/// and no op is applied: this is the compare-and-set that serializes
/// concurrent transitions per invoice.
#[derive(Clone, Debug)]
pub struct StoreTransaction {
    pub invoice_id: InvoiceId,
    pub expected_version: u64,
    /// Timestamp for everything stamped inside this unit of work.
    pub now: Timestamp,
    pub ops: Vec<StoreOp>,
}

/// The durable, transactional repository of invoice state.
///
/// Synchronous by design: commits are short critical sections, and all
/// collaborator I/O happens outside them.
pub trait StateStore: Send + Sync {
    /// Load the full aggregate for an invoice.
    fn load_invoice(&self, id: &InvoiceId) -> Result<InvoiceRecord, StoreError>;

    /// Apply a unit of work atomically. Returns the audit records appended
    /// by the transaction, with their assigned sequences, so the caller
    /// can notify after commit.
    fn commit(&self, txn: StoreTransaction) -> Result<Vec<EventRecord>, StoreError>;

    /// All outstanding ledger transactions, oldest first.
    fn list_pending_txs(&self) -> Result<Vec<PendingTx>, StoreError>;

    /// Release claims taken at or before `cutoff`, oldest first, across
    /// all invoices. In the normal flow a claim lives for one ledger
    /// round-trip; anything old enough to show up here was orphaned by a
    /// crash or a failed outcome commit.
    fn list_stale_claims(&self, cutoff: Timestamp) -> Result<Vec<StaleClaim>, StoreError>;
}

// =============================================================================
// Time Source
// =============================================================================

/// Injectable time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock adapter.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

// =============================================================================
// Drafting Service
// =============================================================================

/// One tranche as drafted from free text.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlannedMilestone {
    pub amount: u64,
    pub condition: String,
    pub requires_proof: bool,
    pub due_at: Option<Timestamp>,
}

/// Structured milestone plan extracted from an invoice draft.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MilestonePlan {
    pub total_amount: u64,
    pub currency: Currency,
    pub milestones: Vec<PlannedMilestone>,
}

/// Deployable settlement-code unit. The engine treats both fields as
/// opaque; their format is owned by the drafting service and the ledger.
#[derive(Clone, Debug, PartialEq)]
pub struct SettlementArtifact {
    pub code: String,
    pub metadata: Value,
}

/// Free text in, structured plan and settlement code out.
///
/// Failures surface as `CollaboratorUnavailable { Drafting, .. }`; during
/// creation they are terminal and nothing has been persisted yet.
#[async_trait::async_trait]
pub trait DraftingService: Send + Sync {
    async fn parse(&self, text: &str) -> Result<MilestonePlan, EngineError>;

    async fn generate_artifact(&self, plan: &MilestonePlan)
        -> Result<SettlementArtifact, EngineError>;
}

// =============================================================================
// Ledger Client
// =============================================================================

/// Constructor parameters for the settlement contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployParams {
    pub client: Address,
    pub contractor: Address,
    pub arbitrator: Address,
    pub total_ledger_amount: u128,
    /// Per-milestone tranches in ledger base units, in sequence order.
    pub milestone_ledger_amounts: Vec<u128>,
}

/// Result of a broadcast deployment: the tx is in the pending pool, not
/// necessarily confirmed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployReceipt {
    pub tx_id: TxId,
    pub contract_address: ContractAddress,
}

/// Result of a broadcast contract invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvokeReceipt {
    pub tx_id: TxId,
}

/// Typed settlement-contract entry points the engine invokes.
#[derive(Clone, Debug, PartialEq)]
pub enum LedgerFunction {
    ReleaseMilestone { sequence: u32, amount: u128 },
    /// Best-effort mirror of a locally raised dispute.
    FlagDispute { dispute_id: DisputeId },
    ResolveDispute { in_favor_of_client: bool },
}

/// Status of a broadcast transaction as reported by the ledger.
///
/// `Failed` is a terminal ledger verdict; transport errors surface as
/// `CollaboratorUnavailable` instead. The reconciliation loop branches on
/// exactly that distinction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed { block_height: u64 },
    Failed { reason: String },
}

/// Builds, signs, and broadcasts settlement transactions.
///
/// Broadcasts are fire-and-forget from the caller's perspective: once a
/// receipt is returned the transaction cannot be cancelled, only observed.
#[async_trait::async_trait]
pub trait LedgerClient: Send + Sync {
    async fn deploy(
        &self,
        artifact: &SettlementArtifact,
        params: &DeployParams,
    ) -> Result<DeployReceipt, EngineError>;

    async fn invoke(
        &self,
        contract: &ContractAddress,
        function: LedgerFunction,
    ) -> Result<InvokeReceipt, EngineError>;

    async fn tx_status(&self, tx_id: &TxId) -> Result<TxStatus, EngineError>;

    /// Authoritative check whether a milestone tranche has already been
    /// paid out by the settlement contract, and by which transaction.
    /// The recovery path for orphaned release claims branches on this:
    /// the contract, not local state, knows whether money moved.
    async fn milestone_released(
        &self,
        contract: &ContractAddress,
        sequence: u32,
    ) -> Result<Option<TxId>, EngineError>;
}

// =============================================================================
// Document Store
// =============================================================================

/// Content-addressed blob storage. Failures are non-fatal to every caller
/// in the engine: a missing document hash never blocks settlement.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, blob: &Value) -> Result<ContentHash, EngineError>;

    async fn get(&self, hash: &ContentHash) -> Result<Value, EngineError>;
}
