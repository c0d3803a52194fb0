//! # Lifecycle Engine Service
//!
//! The engine owning the invoice state machines and the four protocols:
//! Create ([`create`]), Release ([`release`]), Dispute/Resolve
//! ([`dispute`]), and the Confirmation Reconciliation loop
//! (`crate::reconciler`).
//!
//! ## Transaction discipline
//!
//! Local transitions are atomic and fast; ledger-confirmed state is slow
//! and irreversible. Every protocol follows from that asymmetry:
//!
//! 1. Preconditions are checked against a fresh aggregate read whose
//!    version the committing transaction must name (compare-and-set).
//! 2. Collaborator I/O happens outside any held store transaction.
//! 3. The terminal-status commit strictly follows receipt of a ledger
//!    transaction id, never precedes it.
//! 4. Notifications go out after the commit, never before.

mod create;
mod dispute;
mod release;

use crate::ports::inbound::{
    CreateInvoiceRequest, CreateInvoiceResponse, DeploymentOutcome, EscrowApi, ReleaseReceipt,
};
use crate::ports::outbound::{
    Clock, DocumentStore, DraftingService, InvoiceRecord, LedgerClient, StateStore, StoreOp,
    StoreTransaction,
};
use shared_bus::{EventPublisher, Notification};
use shared_types::{
    permissions_for, Address, DisputeId, EngineError, EventRecord, InvoiceId, MilestoneId,
    MilestoneStatus, PermissionSet, StoreError, Timestamp, TxId,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Bounded retries for commits that must land after an irreversible
/// ledger call (only version conflicts are retried; the ops are rebuilt
/// from fresh state each attempt).
const MAX_COMMIT_RETRIES: u32 = 5;

/// The Invoice Escrow Lifecycle Engine.
///
/// All collaborators are injected; tests substitute fakes with
/// controllable latency and failure modes.
pub struct LifecycleEngine<S, L, D, C>
where
    S: StateStore,
    L: LedgerClient,
    D: DraftingService,
    C: DocumentStore,
{
    store: Arc<S>,
    ledger: Arc<L>,
    drafting: Arc<D>,
    documents: Arc<C>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn EventPublisher>,
}

impl<S, L, D, C> LifecycleEngine<S, L, D, C>
where
    S: StateStore,
    L: LedgerClient,
    D: DraftingService,
    C: DocumentStore,
{
    /// Create a new engine with the given dependencies.
    pub fn new(
        store: Arc<S>,
        ledger: Arc<L>,
        drafting: Arc<D>,
        documents: Arc<C>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            ledger,
            drafting,
            documents,
            clock,
            notifier,
        }
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub(crate) fn load(&self, invoice_id: &InvoiceId) -> Result<InvoiceRecord, EngineError> {
        Ok(self.store.load_invoice(invoice_id)?)
    }

    pub(crate) fn ledger(&self) -> &L {
        &self.ledger
    }

    pub(crate) fn drafting(&self) -> &D {
        &self.drafting
    }

    pub(crate) fn documents(&self) -> &C {
        &self.documents
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn unauthorized(identity: &Address, capability: &str) -> EngineError {
        EngineError::Unauthorized {
            identity: format!("0x{}", hex::encode(identity)),
            capability: capability.to_string(),
        }
    }

    /// Fan committed audit records out to the Notifier. Fire-and-forget:
    /// delivery failures never affect the committed transition.
    pub(crate) async fn notify(&self, records: Vec<EventRecord>) {
        for record in records {
            let receivers = self.notifier.publish(Notification::new(record)).await;
            debug!(receivers, "notification published");
        }
    }

    /// Commit ops built from fresh state, retrying on version conflicts.
    ///
    /// Used for commits that record the outcome of an irreversible
    /// external call: the ledger side already happened, so a concurrent
    /// local transition must not lose the record. The builder re-derives
    /// its ops from the freshly loaded aggregate on every attempt and may
    /// itself refuse with a terminal error.
    pub(crate) async fn commit_fresh<F>(
        &self,
        invoice_id: InvoiceId,
        build: F,
    ) -> Result<Vec<EventRecord>, EngineError>
    where
        F: Fn(&InvoiceRecord) -> Result<Vec<StoreOp>, EngineError>,
    {
        let mut last_conflict = None;
        for _ in 0..MAX_COMMIT_RETRIES {
            let record = self.load(&invoice_id)?;
            let ops = build(&record)?;
            let txn = StoreTransaction {
                invoice_id,
                expected_version: record.version,
                now: self.now(),
                ops,
            };
            match self.store.commit(txn) {
                Ok(events) => return Ok(events),
                Err(StoreError::VersionConflict { .. }) => {
                    last_conflict = Some(());
                    continue;
                }
                Err(other) => return Err(other.into()),
            }
        }
        debug_assert!(last_conflict.is_some());
        error!(invoice_id = %invoice_id, "commit retries exhausted under contention");
        Err(EngineError::Internal(
            "commit retries exhausted under contention".to_string(),
        ))
    }
}

#[async_trait::async_trait]
impl<S, L, D, C> EscrowApi for LifecycleEngine<S, L, D, C>
where
    S: StateStore,
    L: LedgerClient,
    D: DraftingService,
    C: DocumentStore,
{
    async fn create_invoice(
        &self,
        request: CreateInvoiceRequest,
    ) -> Result<CreateInvoiceResponse, EngineError> {
        self.handle_create(request).await
    }

    async fn redeploy_invoice(
        &self,
        invoice_id: InvoiceId,
        caller: Address,
    ) -> Result<DeploymentOutcome, EngineError> {
        self.handle_redeploy(invoice_id, caller).await
    }

    async fn cancel_invoice(
        &self,
        invoice_id: InvoiceId,
        caller: Address,
    ) -> Result<(), EngineError> {
        self.handle_cancel(invoice_id, caller).await
    }

    async fn approve_milestone(
        &self,
        invoice_id: InvoiceId,
        milestone_id: MilestoneId,
        approver: Address,
        approved: bool,
    ) -> Result<MilestoneStatus, EngineError> {
        self.handle_approve(invoice_id, milestone_id, approver, approved)
            .await
    }

    async fn release_milestone(
        &self,
        invoice_id: InvoiceId,
        milestone_id: MilestoneId,
        caller: Address,
    ) -> Result<ReleaseReceipt, EngineError> {
        self.handle_release(invoice_id, milestone_id, caller).await
    }

    async fn raise_dispute(
        &self,
        invoice_id: InvoiceId,
        caller: Address,
        reason: String,
        evidence: Option<serde_json::Value>,
    ) -> Result<DisputeId, EngineError> {
        self.handle_raise_dispute(invoice_id, caller, reason, evidence)
            .await
    }

    async fn resolve_dispute(
        &self,
        invoice_id: InvoiceId,
        caller: Address,
        in_favor_of_client: bool,
        resolution: String,
    ) -> Result<TxId, EngineError> {
        self.handle_resolve_dispute(invoice_id, caller, in_favor_of_client, resolution)
            .await
    }

    async fn get_invoice(&self, invoice_id: InvoiceId) -> Result<InvoiceRecord, EngineError> {
        self.load(&invoice_id)
    }

    async fn permissions_for(
        &self,
        invoice_id: InvoiceId,
        identity: Address,
    ) -> Result<PermissionSet, EngineError> {
        let record = self.load(&invoice_id)?;
        Ok(permissions_for(&record.invoice, &identity))
    }
}
