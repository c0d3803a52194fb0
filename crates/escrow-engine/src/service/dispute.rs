//! # Dispute and Resolution Protocol
//!
//! Raising a dispute is a local-first transition: the committed record is
//! what blocks releases, and mirroring the dispute to the settlement
//! contract is best-effort. Resolution inverts that: the arbitration
//! transaction must be broadcast before the local `Resolved` commit, so a
//! ledger failure leaves the dispute open and the operation retryable.

use super::LifecycleEngine;
use crate::domain::pending::{PendingTx, PendingTxKind};
use crate::ports::outbound::{
    DocumentStore, DraftingService, InvoiceRecord, LedgerClient, LedgerFunction, StateStore,
    StoreOp, StoreTransaction,
};
use shared_types::{
    Address, Dispute, DisputeId, DisputeStatus, EngineError, EventKind, InvoiceId, InvoiceStatus,
    NewEvent, TxId,
};
use tracing::{info, warn};
use uuid::Uuid;

impl<S, L, D, C> LifecycleEngine<S, L, D, C>
where
    S: StateStore,
    L: LedgerClient,
    D: DraftingService,
    C: DocumentStore,
{
    pub(super) async fn handle_raise_dispute(
        &self,
        invoice_id: InvoiceId,
        caller: Address,
        reason: String,
        evidence: Option<serde_json::Value>,
    ) -> Result<DisputeId, EngineError> {
        let record = self.load(&invoice_id)?;
        if caller != record.invoice.client && caller != record.invoice.contractor {
            return Err(Self::unauthorized(&caller, "dispute"));
        }
        if !record.invoice.status.is_releasable() {
            return Err(EngineError::conflict(format!(
                "invoice is {:?}, disputes require Deployed or Active",
                record.invoice.status
            )));
        }
        if let Some(open) = record.open_dispute() {
            return Err(EngineError::conflict(format!(
                "dispute {} is already open",
                open.id
            )));
        }
        if reason.trim().is_empty() {
            return Err(EngineError::validation("dispute reason is empty"));
        }

        // Evidence pinning is best-effort, same as the agreement document.
        let evidence_hash = match evidence {
            Some(blob) => match self.documents().put(&blob).await {
                Ok(hash) => Some(hash),
                Err(err) => {
                    warn!(
                        invoice_id = %invoice_id,
                        error = %err,
                        "evidence pin failed, recording dispute without hash"
                    );
                    None
                }
            },
            None => None,
        };

        let now = self.now();
        let dispute_id = Uuid::new_v4();
        let dispute = Dispute {
            id: dispute_id,
            invoice_id,
            raised_by: caller,
            reason: reason.clone(),
            evidence_hash,
            status: DisputeStatus::Open,
            resolution: None,
            resolved_by: None,
            in_favor_of_client: None,
            resolution_tx_id: None,
            raised_at: now,
            resolved_at: None,
        };

        let events = self.store().commit(StoreTransaction {
            invoice_id,
            expected_version: record.version,
            now,
            ops: vec![
                StoreOp::InsertDispute(dispute),
                StoreOp::SetInvoiceStatus(InvoiceStatus::Disputed),
                StoreOp::AppendEvent(
                    NewEvent::new(EventKind::DisputeRaised { dispute_id, reason })
                        .with_actor(caller),
                ),
            ],
        })?;
        info!(invoice_id = %invoice_id, dispute_id = %dispute_id, "dispute raised");
        self.notify(events).await;

        // Mirror to the settlement contract after the commit. The local
        // record is authoritative for blocking releases either way.
        if let Some(contract) = record.invoice.contract_address.as_ref() {
            if let Err(err) = self
                .ledger()
                .invoke(contract, LedgerFunction::FlagDispute { dispute_id })
                .await
            {
                warn!(
                    invoice_id = %invoice_id,
                    dispute_id = %dispute_id,
                    error = %err,
                    "on-ledger dispute flag failed"
                );
            }
        }

        Ok(dispute_id)
    }

    pub(super) async fn handle_resolve_dispute(
        &self,
        invoice_id: InvoiceId,
        caller: Address,
        in_favor_of_client: bool,
        resolution: String,
    ) -> Result<TxId, EngineError> {
        let record = self.load(&invoice_id)?;
        if caller != record.invoice.arbitrator {
            return Err(Self::unauthorized(&caller, "resolve"));
        }
        if record.invoice.status != InvoiceStatus::Disputed {
            return Err(EngineError::conflict(format!(
                "invoice is {:?}, nothing to resolve",
                record.invoice.status
            )));
        }
        let dispute_id = record
            .open_dispute()
            .ok_or_else(|| EngineError::conflict("no open dispute on invoice"))?
            .id;
        let contract = record
            .invoice
            .contract_address
            .clone()
            .ok_or_else(|| EngineError::conflict("invoice has no deployed contract"))?;

        // Ledger first. On failure nothing local changed: the dispute is
        // still open and the arbitrator simply retries.
        let receipt = self
            .ledger()
            .invoke(&contract, LedgerFunction::ResolveDispute { in_favor_of_client })
            .await?;

        let now = self.now();
        let tx_id = receipt.tx_id.clone();
        let build = |fresh: &InvoiceRecord| -> Result<Vec<StoreOp>, EngineError> {
            let still_open = fresh
                .open_dispute()
                .map(|d| d.id == dispute_id)
                .unwrap_or(false);
            if !still_open || fresh.invoice.status != InvoiceStatus::Disputed {
                return Err(EngineError::conflict(
                    "dispute was resolved by a concurrent transition",
                ));
            }
            Ok(vec![
                StoreOp::ResolveDispute {
                    dispute_id,
                    resolution: resolution.clone(),
                    resolved_by: caller,
                    in_favor_of_client,
                    tx_id: tx_id.clone(),
                    resolved_at: now,
                },
                StoreOp::SetInvoiceStatus(InvoiceStatus::Active),
                StoreOp::AppendEvent(
                    NewEvent::new(EventKind::DisputeResolved {
                        dispute_id,
                        in_favor_of_client,
                    })
                    .with_actor(caller)
                    .with_tx(tx_id.clone()),
                ),
                StoreOp::EnqueuePendingTx(PendingTx::new(
                    tx_id.clone(),
                    invoice_id,
                    PendingTxKind::Resolve { dispute_id },
                    now,
                )),
            ])
        };

        let events = self.commit_fresh(invoice_id, build).await?;
        info!(
            invoice_id = %invoice_id,
            dispute_id = %dispute_id,
            in_favor_of_client,
            tx_id = %tx_id,
            "dispute resolved"
        );
        self.notify(events).await;
        Ok(tx_id)
    }
}
