//! # Inbound Port
//!
//! The engine's API surface. HTTP routing, request validation, and
//! authentication-header parsing live outside this crate; callers arrive
//! here with an already-established identity.

use crate::ports::outbound::InvoiceRecord;
use serde_json::Value;
use shared_types::{
    Address, ContractAddress, DisputeId, EngineError, InvoiceId, InvoiceStatus, MilestoneId,
    MilestoneStatus, PermissionSet, TxId,
};

/// Input to the Create protocol.
#[derive(Clone, Debug)]
pub struct CreateInvoiceRequest {
    /// Free-text agreement draft handed to the drafting service.
    pub draft_text: String,
    pub client: Address,
    pub contractor: Address,
    /// Defaults to the client when unspecified.
    pub arbitrator: Option<Address>,
    pub title: Option<String>,
    pub metadata: Option<Value>,
}

/// How the deployment step of the Create protocol ended.
///
/// `Failed` is a valid, inspectable terminal state of the protocol, not an
/// error masked as success: the invoice persists in `Draft` for retry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeploymentOutcome {
    Deployed {
        contract_address: ContractAddress,
        tx_id: TxId,
    },
    Failed {
        reason: String,
    },
}

/// Committed-state confirmation returned by `create_invoice`.
#[derive(Clone, Debug)]
pub struct CreateInvoiceResponse {
    pub invoice_id: InvoiceId,
    pub status: InvoiceStatus,
    pub deployment: DeploymentOutcome,
}

/// Committed-state confirmation returned by `release_milestone`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseReceipt {
    pub tx_id: TxId,
    /// True when this release completed the invoice in the same commit.
    pub invoice_completed: bool,
}

/// The Lifecycle Engine's operations.
///
/// Every method returns either a committed-state confirmation with
/// identifiers or a structured [`EngineError`] precise enough for the
/// caller to decide on retry.
#[async_trait::async_trait]
pub trait EscrowApi: Send + Sync {
    /// Create protocol: draft, validate, persist as `Draft`, pin the
    /// agreement document best-effort, deploy, and return without waiting
    /// for ledger confirmation.
    async fn create_invoice(
        &self,
        request: CreateInvoiceRequest,
    ) -> Result<CreateInvoiceResponse, EngineError>;

    /// Retry the deployment step for an invoice stuck in `Draft`.
    /// Client-only; no duplicate invoice is ever created.
    async fn redeploy_invoice(
        &self,
        invoice_id: InvoiceId,
        caller: Address,
    ) -> Result<DeploymentOutcome, EngineError>;

    /// Cancel a `Draft` invoice. Client-only, terminal, audited.
    async fn cancel_invoice(&self, invoice_id: InvoiceId, caller: Address)
        -> Result<(), EngineError>;

    /// Record an approval vote; flips the milestone to `Approved` in the
    /// same commit once the quorum rule is satisfied.
    async fn approve_milestone(
        &self,
        invoice_id: InvoiceId,
        milestone_id: MilestoneId,
        approver: Address,
        approved: bool,
    ) -> Result<MilestoneStatus, EngineError>;

    /// Release protocol: ledger invoke strictly before the local
    /// `Released` commit; completing the last milestone completes the
    /// invoice in the same commit.
    async fn release_milestone(
        &self,
        invoice_id: InvoiceId,
        milestone_id: MilestoneId,
        caller: Address,
    ) -> Result<ReleaseReceipt, EngineError>;

    /// Open a dispute; blocks all releases for the invoice until resolved.
    async fn raise_dispute(
        &self,
        invoice_id: InvoiceId,
        caller: Address,
        reason: String,
        evidence: Option<Value>,
    ) -> Result<DisputeId, EngineError>;

    /// Arbitrator-only resolution; ledger success strictly precedes the
    /// local `Resolved` commit, so resolution is retryable and never
    /// partially applied.
    async fn resolve_dispute(
        &self,
        invoice_id: InvoiceId,
        caller: Address,
        in_favor_of_client: bool,
        resolution: String,
    ) -> Result<TxId, EngineError>;

    /// Full aggregate snapshot.
    async fn get_invoice(&self, invoice_id: InvoiceId) -> Result<InvoiceRecord, EngineError>;

    /// Capability set for an identity against the current snapshot.
    async fn permissions_for(
        &self,
        invoice_id: InvoiceId,
        identity: Address,
    ) -> Result<PermissionSet, EngineError>;
}
