//! # Release Protocol
//!
//! Approval votes and milestone release. The release path is the one place
//! money irrevocably moves, so it carries the strictest ordering: the
//! exclusive claim commit serializes concurrent attempts per milestone,
//! the ledger invoke happens exactly once between claim and outcome, and
//! the local `Released` commit strictly follows the broadcast receipt.

use super::LifecycleEngine;
use crate::domain::pending::{PendingTx, PendingTxKind};
use crate::domain::validation;
use crate::ports::inbound::ReleaseReceipt;
use crate::ports::outbound::{
    DocumentStore, DraftingService, InvoiceRecord, LedgerClient, LedgerFunction, StateStore,
    StoreOp, StoreTransaction,
};
use shared_types::{
    Address, Approval, EngineError, EventKind, InvoiceId, InvoiceStatus, MilestoneId,
    MilestoneStatus, NewEvent,
};
use tracing::{error, info, warn};

impl<S, L, D, C> LifecycleEngine<S, L, D, C>
where
    S: StateStore,
    L: LedgerClient,
    D: DraftingService,
    C: DocumentStore,
{
    pub(super) async fn handle_approve(
        &self,
        invoice_id: InvoiceId,
        milestone_id: MilestoneId,
        approver: Address,
        approved: bool,
    ) -> Result<MilestoneStatus, EngineError> {
        let record = self.load(&invoice_id)?;
        if approver != record.invoice.client && approver != record.invoice.arbitrator {
            return Err(Self::unauthorized(&approver, "approve"));
        }
        if !record.invoice.status.is_releasable() {
            return Err(EngineError::conflict(format!(
                "invoice is {:?}, approvals are only recorded while releasable",
                record.invoice.status
            )));
        }
        let milestone = record
            .milestone(&milestone_id)
            .ok_or_else(|| EngineError::NotFound(format!("milestone {milestone_id}")))?;
        if milestone.status == MilestoneStatus::Released {
            return Err(EngineError::conflict("milestone is already released"));
        }

        let mut votes = record.approvals_for(&milestone_id);
        if votes.iter().any(|a| a.approver == approver) {
            return Err(EngineError::conflict("approver has already voted"));
        }
        let vote = Approval {
            milestone_id,
            approver,
            approved,
            voted_at: self.now(),
        };
        votes.push(vote.clone());

        // Quorum check includes the vote being recorded; the flip to
        // Approved lands in the same commit as the vote itself.
        let quorum_met = validation::release_permitted(&votes);
        let mut status = milestone.status;
        let mut ops = vec![StoreOp::InsertApproval(vote)];
        if quorum_met && status == MilestoneStatus::Pending {
            status = MilestoneStatus::Approved;
            ops.push(StoreOp::SetMilestoneStatus {
                milestone_id,
                status,
            });
        }

        let events = self.store().commit(StoreTransaction {
            invoice_id,
            expected_version: record.version,
            now: self.now(),
            ops,
        })?;
        info!(
            invoice_id = %invoice_id,
            milestone_id = %milestone_id,
            approved,
            quorum_met,
            "approval vote recorded"
        );
        self.notify(events).await;
        Ok(status)
    }

    pub(super) async fn handle_release(
        &self,
        invoice_id: InvoiceId,
        milestone_id: MilestoneId,
        caller: Address,
    ) -> Result<ReleaseReceipt, EngineError> {
        // Preconditions against a fresh read whose version the claim
        // commit names.
        let record = self.load(&invoice_id)?;
        if caller != record.invoice.client {
            return Err(Self::unauthorized(&caller, "release"));
        }
        if !record.invoice.status.is_releasable() {
            return Err(EngineError::conflict(format!(
                "invoice is {:?}, releases require Deployed or Active",
                record.invoice.status
            )));
        }
        if let Some(dispute) = record.open_dispute() {
            return Err(EngineError::conflict(format!(
                "dispute {} is open, releases are blocked",
                dispute.id
            )));
        }
        let milestone = record
            .milestone(&milestone_id)
            .ok_or_else(|| EngineError::NotFound(format!("milestone {milestone_id}")))?
            .clone();
        if !milestone.status.is_releasable() {
            return Err(EngineError::conflict("milestone is already released"));
        }
        if !validation::release_permitted(&record.approvals_for(&milestone_id)) {
            return Err(EngineError::conflict(
                "approval quorum not met for milestone",
            ));
        }
        let contract = record
            .invoice
            .contract_address
            .clone()
            .ok_or_else(|| EngineError::conflict("invoice has no deployed contract"))?;

        // Take the exclusive claim at the precondition read's version.
        // Exactly one of any set of concurrent attempts gets past this
        // commit; every loser surfaces a StateConflict before the ledger
        // is touched.
        self.store().commit(StoreTransaction {
            invoice_id,
            expected_version: record.version,
            now: self.now(),
            ops: vec![StoreOp::ClaimMilestoneRelease { milestone_id }],
        })?;

        let receipt = match self
            .ledger()
            .invoke(
                &contract,
                LedgerFunction::ReleaseMilestone {
                    sequence: milestone.sequence,
                    amount: milestone.ledger_amount,
                },
            )
            .await
        {
            Ok(receipt) => receipt,
            Err(err) => {
                // Nothing moved on the ledger; free the milestone for the
                // next attempt before surfacing the failure.
                warn!(
                    invoice_id = %invoice_id,
                    milestone_id = %milestone_id,
                    error = %err,
                    "release invoke failed, clearing claim"
                );
                let cleared = self
                    .commit_fresh(invoice_id, |_| {
                        Ok(vec![StoreOp::ClearReleaseClaim { milestone_id }])
                    })
                    .await;
                if let Err(clear_err) = cleared {
                    error!(
                        invoice_id = %invoice_id,
                        milestone_id = %milestone_id,
                        error = %clear_err,
                        "failed to clear release claim"
                    );
                }
                return Err(err);
            }
        };

        // The broadcast is irreversible from here on; the outcome commit
        // must land even if unrelated transitions race it.
        let now = self.now();
        let tx_id = receipt.tx_id.clone();
        let prior_status = milestone.status;
        let build = |fresh: &InvoiceRecord| -> Result<Vec<StoreOp>, EngineError> {
            let others_released = fresh
                .milestones
                .iter()
                .filter(|m| m.id != milestone_id)
                .all(|m| m.status == MilestoneStatus::Released);
            let completes_invoice = others_released && fresh.invoice.status.is_releasable();

            let mut ops = vec![
                StoreOp::ClearReleaseClaim { milestone_id },
                StoreOp::SetMilestoneStatus {
                    milestone_id,
                    status: MilestoneStatus::Released,
                },
                StoreOp::SetMilestoneRelease {
                    milestone_id,
                    tx_id: tx_id.clone(),
                    released_at: now,
                },
                StoreOp::AppendEvent(
                    NewEvent::new(EventKind::MilestoneReleased {
                        milestone_id,
                        sequence: milestone.sequence,
                        amount: milestone.amount,
                    })
                    .with_actor(caller)
                    .with_tx(tx_id.clone()),
                ),
                StoreOp::EnqueuePendingTx(PendingTx::new(
                    tx_id.clone(),
                    invoice_id,
                    PendingTxKind::Release {
                        milestone_id,
                        prior_status,
                        completed_invoice: completes_invoice,
                    },
                    now,
                )),
            ];
            if completes_invoice {
                // Last tranche: the invoice completes in the same unit of
                // work, never via a separate follow-up commit.
                ops.push(StoreOp::SetInvoiceStatus(InvoiceStatus::Completed));
                ops.push(StoreOp::AppendEvent(
                    NewEvent::new(EventKind::InvoiceCompleted).with_actor(caller),
                ));
            }
            Ok(ops)
        };

        let events = match self.commit_fresh(invoice_id, build).await {
            Ok(events) => events,
            Err(err) => {
                // The claim stays held on purpose: the broadcast may have
                // paid the tranche, and only the settlement contract knows.
                // The reconciler's stale-claim pass resolves it against the
                // ledger; clearing it here would reopen the double-pay
                // window.
                error!(
                    invoice_id = %invoice_id,
                    milestone_id = %milestone_id,
                    tx_id = %tx_id,
                    error = %err,
                    "release broadcast but outcome commit failed"
                );
                return Err(err);
            }
        };
        let invoice_completed = events
            .iter()
            .any(|e| matches!(e.kind, EventKind::InvoiceCompleted));
        info!(
            invoice_id = %invoice_id,
            milestone_id = %milestone_id,
            tx_id = %tx_id,
            invoice_completed,
            "milestone released"
        );
        self.notify(events).await;

        Ok(ReleaseReceipt {
            tx_id,
            invoice_completed,
        })
    }
}
