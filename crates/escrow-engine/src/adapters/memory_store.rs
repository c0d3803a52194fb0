//! # In-Memory State Store
//!
//! Serializable transactional store over a single lock. Commits validate
//! every op against a cloned working copy and swap it in only when the
//! whole unit of work is legal, so a failed transaction leaves no partial
//! effects. The expected-version check is the compare-and-set that makes
//! concurrent transitions on one invoice race safely.

use crate::domain::pending::PendingTx;
use crate::ports::outbound::{
    InvoiceRecord, ReleaseClaim, StaleClaim, StateStore, StoreOp, StoreTransaction,
};
use shared_types::{
    Approval, Dispute, DisputeStatus, EventRecord, Invoice, InvoiceId, Milestone, MilestoneId,
    StoreError, Timestamp, TxId,
};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Aggregate {
    invoice: Invoice,
    milestones: Vec<Milestone>,
    approvals: Vec<Approval>,
    disputes: Vec<Dispute>,
    events: Vec<EventRecord>,
    /// Milestone id to claim timestamp.
    release_claims: HashMap<MilestoneId, Timestamp>,
    version: u64,
}

#[derive(Default)]
struct Inner {
    invoices: HashMap<InvoiceId, Aggregate>,
    pending: HashMap<TxId, PendingTx>,
}

/// In-memory implementation of [`StateStore`].
pub struct MemoryStateStore {
    inner: RwLock<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn require<'a>(working: &'a mut Option<Aggregate>) -> Result<&'a mut Aggregate, StoreError> {
    working
        .as_mut()
        .ok_or_else(|| StoreError::IllegalTransition("no invoice in transaction".to_string()))
}

fn find_milestone<'a>(
    agg: &'a mut Aggregate,
    id: &MilestoneId,
) -> Result<&'a mut Milestone, StoreError> {
    agg.milestones
        .iter_mut()
        .find(|m| m.id == *id)
        .ok_or_else(|| StoreError::IllegalTransition(format!("unknown milestone {id}")))
}

/// Apply one op to the working copies. Any error aborts the whole commit.
fn apply_op(
    working: &mut Option<Aggregate>,
    pending: &mut HashMap<TxId, PendingTx>,
    invoice_id: InvoiceId,
    now: Timestamp,
    appended: &mut Vec<EventRecord>,
    op: StoreOp,
) -> Result<(), StoreError> {
    match op {
        StoreOp::InsertInvoice(invoice) => {
            if working.is_some() {
                return Err(StoreError::IllegalTransition(
                    "invoice already inserted in this transaction".to_string(),
                ));
            }
            *working = Some(Aggregate {
                invoice,
                milestones: vec![],
                approvals: vec![],
                disputes: vec![],
                events: vec![],
                release_claims: HashMap::new(),
                version: 0,
            });
        }
        StoreOp::InsertMilestone(milestone) => {
            let agg = require(working)?;
            if agg
                .milestones
                .iter()
                .any(|m| m.sequence == milestone.sequence)
            {
                return Err(StoreError::DuplicateSequence {
                    invoice_id,
                    sequence: milestone.sequence,
                });
            }
            agg.milestones.push(milestone);
            agg.milestones.sort_by_key(|m| m.sequence);
        }
        StoreOp::SetInvoiceStatus(next) => {
            let agg = require(working)?;
            let current = agg.invoice.status;
            if !current.can_transition_to(next) {
                return Err(StoreError::IllegalTransition(format!(
                    "invoice {current:?} -> {next:?}"
                )));
            }
            agg.invoice.status = next;
        }
        StoreOp::SetInvoiceDeployment {
            contract_address,
            deploy_tx_id,
        } => {
            let agg = require(working)?;
            agg.invoice.contract_address = Some(contract_address);
            agg.invoice.deploy_tx_id = Some(deploy_tx_id);
        }
        StoreOp::ClearInvoiceDeployment => {
            let agg = require(working)?;
            agg.invoice.contract_address = None;
            agg.invoice.deploy_tx_id = None;
            agg.invoice.confirmed_height = None;
        }
        StoreOp::SetInvoiceConfirmedHeight(height) => {
            require(working)?.invoice.confirmed_height = Some(height);
        }
        StoreOp::SetDocumentHash(hash) => {
            require(working)?.invoice.document_hash = Some(hash);
        }
        StoreOp::InsertApproval(approval) => {
            require(working)?.approvals.push(approval);
        }
        StoreOp::SetMilestoneStatus {
            milestone_id,
            status,
        } => {
            let milestone = find_milestone(require(working)?, &milestone_id)?;
            let current = milestone.status;
            if !current.can_transition_to(status) {
                return Err(StoreError::IllegalTransition(format!(
                    "milestone {current:?} -> {status:?}"
                )));
            }
            milestone.status = status;
        }
        StoreOp::SetMilestoneRelease {
            milestone_id,
            tx_id,
            released_at,
        } => {
            let milestone = find_milestone(require(working)?, &milestone_id)?;
            milestone.release_tx_id = Some(tx_id);
            milestone.released_at = Some(released_at);
        }
        StoreOp::ClearMilestoneRelease { milestone_id } => {
            let milestone = find_milestone(require(working)?, &milestone_id)?;
            milestone.release_tx_id = None;
            milestone.released_at = None;
            milestone.confirmed_height = None;
        }
        StoreOp::SetMilestoneConfirmedHeight {
            milestone_id,
            height,
        } => {
            find_milestone(require(working)?, &milestone_id)?.confirmed_height = Some(height);
        }
        StoreOp::ClaimMilestoneRelease { milestone_id } => {
            let agg = require(working)?;
            find_milestone(agg, &milestone_id)?;
            if agg.release_claims.contains_key(&milestone_id) {
                return Err(StoreError::ReleaseInFlight(milestone_id));
            }
            agg.release_claims.insert(milestone_id, now);
        }
        StoreOp::ClearReleaseClaim { milestone_id } => {
            require(working)?.release_claims.remove(&milestone_id);
        }
        StoreOp::InsertDispute(dispute) => {
            let agg = require(working)?;
            if agg.disputes.iter().any(|d| d.status == DisputeStatus::Open) {
                return Err(StoreError::IllegalTransition(
                    "a dispute is already open".to_string(),
                ));
            }
            agg.disputes.push(dispute);
        }
        StoreOp::ResolveDispute {
            dispute_id,
            resolution,
            resolved_by,
            in_favor_of_client,
            tx_id,
            resolved_at,
        } => {
            let agg = require(working)?;
            let dispute = agg
                .disputes
                .iter_mut()
                .find(|d| d.id == dispute_id)
                .ok_or_else(|| {
                    StoreError::IllegalTransition(format!("unknown dispute {dispute_id}"))
                })?;
            if dispute.status != DisputeStatus::Open {
                return Err(StoreError::IllegalTransition(
                    "dispute is not open".to_string(),
                ));
            }
            dispute.status = DisputeStatus::Resolved;
            dispute.resolution = Some(resolution);
            dispute.resolved_by = Some(resolved_by);
            dispute.in_favor_of_client = Some(in_favor_of_client);
            dispute.resolution_tx_id = Some(tx_id);
            dispute.resolved_at = Some(resolved_at);
        }
        StoreOp::ReopenDispute { dispute_id } => {
            let agg = require(working)?;
            let dispute = agg
                .disputes
                .iter_mut()
                .find(|d| d.id == dispute_id)
                .ok_or_else(|| {
                    StoreError::IllegalTransition(format!("unknown dispute {dispute_id}"))
                })?;
            if dispute.status != DisputeStatus::Resolved {
                return Err(StoreError::IllegalTransition(
                    "dispute is not resolved".to_string(),
                ));
            }
            dispute.status = DisputeStatus::Open;
            dispute.resolution = None;
            dispute.resolved_by = None;
            dispute.in_favor_of_client = None;
            dispute.resolution_tx_id = None;
            dispute.resolved_at = None;
        }
        StoreOp::AppendEvent(new_event) => {
            let agg = require(working)?;
            let record = EventRecord {
                id: Uuid::new_v4(),
                invoice_id,
                sequence: agg.events.len() as u64 + 1,
                kind: new_event.kind,
                actor: new_event.actor,
                tx_id: new_event.tx_id,
                recorded_at: now,
            };
            agg.events.push(record.clone());
            appended.push(record);
        }
        StoreOp::EnqueuePendingTx(tx) => {
            if pending.contains_key(&tx.tx_id) {
                return Err(StoreError::DuplicatePendingTx(tx.tx_id));
            }
            pending.insert(tx.tx_id.clone(), tx);
        }
        StoreOp::RemovePendingTx(tx_id) => {
            pending.remove(&tx_id);
        }
        StoreOp::ReschedulePendingTx {
            tx_id,
            next_poll_at,
        } => {
            // No-op when absent: the record was resolved by another sweep.
            if let Some(tx) = pending.get_mut(&tx_id) {
                tx.attempts += 1;
                tx.next_poll_at = next_poll_at;
            }
        }
    }
    Ok(())
}

impl StateStore for MemoryStateStore {
    fn load_invoice(&self, id: &InvoiceId) -> Result<InvoiceRecord, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        let agg = inner
            .invoices
            .get(id)
            .ok_or(StoreError::InvoiceNotFound(*id))?;
        let mut claims: Vec<ReleaseClaim> = agg
            .release_claims
            .iter()
            .map(|(&milestone_id, &claimed_at)| ReleaseClaim {
                milestone_id,
                claimed_at,
            })
            .collect();
        claims.sort_by_key(|c| (c.claimed_at, c.milestone_id));
        Ok(InvoiceRecord {
            invoice: agg.invoice.clone(),
            milestones: agg.milestones.clone(),
            approvals: agg.approvals.clone(),
            disputes: agg.disputes.clone(),
            events: agg.events.clone(),
            release_claims: claims,
            version: agg.version,
        })
    }

    fn commit(&self, txn: StoreTransaction) -> Result<Vec<EventRecord>, StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::LockPoisoned)?;

        let mut working: Option<Aggregate> = if txn.expected_version == 0 {
            if inner.invoices.contains_key(&txn.invoice_id) {
                let found = inner.invoices[&txn.invoice_id].version;
                return Err(StoreError::VersionConflict {
                    invoice_id: txn.invoice_id,
                    expected: 0,
                    found,
                });
            }
            None
        } else {
            let agg = inner
                .invoices
                .get(&txn.invoice_id)
                .ok_or(StoreError::InvoiceNotFound(txn.invoice_id))?;
            if agg.version != txn.expected_version {
                return Err(StoreError::VersionConflict {
                    invoice_id: txn.invoice_id,
                    expected: txn.expected_version,
                    found: agg.version,
                });
            }
            Some(agg.clone())
        };

        let mut pending = inner.pending.clone();
        let mut appended = Vec::new();

        for op in txn.ops {
            apply_op(
                &mut working,
                &mut pending,
                txn.invoice_id,
                txn.now,
                &mut appended,
                op,
            )?;
        }

        if let Some(mut agg) = working {
            agg.version = txn.expected_version + 1;
            inner.invoices.insert(txn.invoice_id, agg);
        }
        inner.pending = pending;

        Ok(appended)
    }

    fn list_pending_txs(&self) -> Result<Vec<PendingTx>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut txs: Vec<PendingTx> = inner.pending.values().cloned().collect();
        txs.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then_with(|| a.tx_id.cmp(&b.tx_id))
        });
        Ok(txs)
    }

    fn list_stale_claims(&self, cutoff: Timestamp) -> Result<Vec<StaleClaim>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut stale: Vec<StaleClaim> = inner
            .invoices
            .iter()
            .flat_map(|(&invoice_id, agg)| {
                agg.release_claims
                    .iter()
                    .filter(move |(_, &claimed_at)| claimed_at <= cutoff)
                    .map(move |(&milestone_id, &claimed_at)| StaleClaim {
                        invoice_id,
                        milestone_id,
                        claimed_at,
                    })
            })
            .collect();
        stale.sort_by_key(|c| (c.claimed_at, c.milestone_id));
        Ok(stale)
    }
}
