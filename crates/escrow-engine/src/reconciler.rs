//! # Confirmation Reconciliation
//!
//! The background loop that closes the gap between "a transaction id
//! exists" and "the ledger confirmed it". It sweeps the durable pending
//! queue, polls the ledger for each due record, and applies exactly one of
//! three outcomes per transaction: confirm, revert on rejection, or revert
//! on hard timeout. Transport errors leave the record queued untouched.
//!
//! Each sweep also recovers orphaned release claims: a crash between a
//! release broadcast and its outcome commit leaves a durable claim with no
//! queue record, and the settlement contract is the only party that knows
//! whether the tranche actually moved. Claims past the hard timeout are
//! resolved against the contract and either recorded as released or
//! cleared for retry.
//!
//! All applies are idempotent: a record observed twice (restart mid-apply)
//! converges to the same state.

use crate::domain::pending::{PendingTx, PendingTxKind};
use crate::ports::outbound::{Clock, InvoiceRecord, LedgerClient, StaleClaim, StateStore, StoreOp,
    StoreTransaction, TxStatus};
use shared_bus::{EventPublisher, Notification};
use shared_types::{
    DisputeStatus, EngineError, EventKind, EventRecord, InvoiceId, InvoiceStatus, MilestoneStatus,
    NewEvent, StoreError, Timestamp,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bounded retries for outcome commits under version conflicts.
const MAX_COMMIT_RETRIES: u32 = 5;

/// Tuning knobs for the reconciliation loop.
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Interval between sweeps of the pending queue.
    pub poll_interval: Duration,
    /// Base of the per-record exponential backoff, in seconds.
    pub backoff_base_secs: u64,
    /// Cap on the per-record backoff, in seconds.
    pub backoff_max_secs: u64,
    /// Hard timeout: a transaction still unconfirmed after this long is
    /// treated as failed and reverted. Doubles as the staleness horizon
    /// for orphaned release claims.
    pub tx_timeout_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            backoff_base_secs: 2,
            backoff_max_secs: 60,
            tx_timeout_secs: 3_600,
        }
    }
}

/// Sweeps the pending-transaction queue and applies ledger verdicts.
pub struct ConfirmationReconciler<S, L>
where
    S: StateStore,
    L: LedgerClient,
{
    store: Arc<S>,
    ledger: Arc<L>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn EventPublisher>,
    config: ReconcilerConfig,
}

impl<S, L> ConfirmationReconciler<S, L>
where
    S: StateStore + 'static,
    L: LedgerClient + 'static,
{
    pub fn new(
        store: Arc<S>,
        ledger: Arc<L>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn EventPublisher>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            notifier,
            config,
        }
    }

    /// Run sweeps on `poll_interval` until the shutdown signal flips.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("confirmation reconciler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep().await {
                            error!(error = %err, "reconciler sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("confirmation reconciler stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// One pass over the queue plus the orphaned-claim recovery. Returns
    /// the number of records settled (confirmed, reverted, timed out, or
    /// recovered). Public so tests can drive the loop deterministically.
    pub async fn sweep(&self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let pending = self.store.list_pending_txs()?;
        let mut settled = 0;

        for record in pending {
            if !record.is_due(now) {
                continue;
            }
            let status = match self.ledger.tx_status(&record.tx_id).await {
                Ok(status) => status,
                Err(err) => {
                    // Transport failure, not a verdict. The record stays
                    // queued and the next sweep retries.
                    warn!(tx_id = %record.tx_id, error = %err, "tx status poll failed");
                    continue;
                }
            };

            match status {
                TxStatus::Confirmed { block_height } => {
                    self.apply_confirmation(&record, block_height).await?;
                    settled += 1;
                }
                TxStatus::Failed { reason } => {
                    self.apply_rejection(&record, &reason).await?;
                    settled += 1;
                }
                TxStatus::Pending => {
                    if record.age(now) >= self.config.tx_timeout_secs {
                        let reason = format!(
                            "unconfirmed after {} seconds",
                            self.config.tx_timeout_secs
                        );
                        warn!(tx_id = %record.tx_id, "transaction timed out, reverting");
                        self.apply_rejection(&record, &reason).await?;
                        settled += 1;
                    } else {
                        self.reschedule(&record, now).await?;
                    }
                }
            }
        }
        settled += self.recover_stale_claims(now).await;
        Ok(settled)
    }

    async fn reschedule(&self, record: &PendingTx, now: u64) -> Result<(), EngineError> {
        let next_poll_at = now
            + record.backoff_secs(self.config.backoff_base_secs, self.config.backoff_max_secs);
        debug!(tx_id = %record.tx_id, next_poll_at, "transaction still pending");
        let tx_id = record.tx_id.clone();
        self.commit_fresh(record.invoice_id, move |_| {
            Ok(vec![StoreOp::ReschedulePendingTx {
                tx_id: tx_id.clone(),
                next_poll_at,
            }])
        })
        .await?;
        Ok(())
    }

    /// Resolve release claims past the staleness horizon. In the normal
    /// flow a claim is cleared by the invoke-failure path or the outcome
    /// commit within one ledger round-trip; a claim this old means the
    /// process died (or the outcome commit was refused) after broadcast.
    async fn recover_stale_claims(&self, now: Timestamp) -> usize {
        let cutoff = now.saturating_sub(self.config.tx_timeout_secs);
        let stale = match self.store.list_stale_claims(cutoff) {
            Ok(stale) => stale,
            Err(err) => {
                warn!(error = %err, "stale claim listing failed");
                return 0;
            }
        };
        let mut recovered = 0;
        for claim in stale {
            match self.recover_claim(&claim, now).await {
                Ok(()) => recovered += 1,
                Err(err) => {
                    // Left in place; the next sweep retries.
                    warn!(
                        invoice_id = %claim.invoice_id,
                        milestone_id = %claim.milestone_id,
                        error = %err,
                        "stale claim recovery failed"
                    );
                }
            }
        }
        recovered
    }

    /// Ask the settlement contract whether the claimed tranche was paid
    /// out. If it was, record the release the dead process could not; if
    /// it was not, clear the claim so the milestone is releasable again.
    async fn recover_claim(&self, claim: &StaleClaim, now: Timestamp) -> Result<(), EngineError> {
        let record = self.store.load_invoice(&claim.invoice_id)?;
        let milestone_id = claim.milestone_id;
        let milestone = record.milestone(&milestone_id).cloned();

        let paid_out = match (&record.invoice.contract_address, &milestone) {
            (Some(contract), Some(m)) => {
                self.ledger.milestone_released(contract, m.sequence).await?
            }
            // No contract (or no such milestone): nothing can have moved.
            _ => None,
        };

        let events = match (paid_out, milestone) {
            (Some(tx_id), Some(milestone)) => {
                warn!(
                    invoice_id = %claim.invoice_id,
                    milestone_id = %milestone_id,
                    tx_id = %tx_id,
                    "orphaned release claim: tranche paid out on ledger, recording"
                );
                let invoice_id = claim.invoice_id;
                self.commit_fresh(invoice_id, move |fresh| {
                    let Some(m) = fresh.milestone(&milestone_id) else {
                        return Ok(vec![StoreOp::ClearReleaseClaim { milestone_id }]);
                    };
                    if m.status == MilestoneStatus::Released {
                        return Ok(vec![StoreOp::ClearReleaseClaim { milestone_id }]);
                    }
                    let prior_status = m.status;
                    let others_released = fresh
                        .milestones
                        .iter()
                        .filter(|other| other.id != milestone_id)
                        .all(|other| other.status == MilestoneStatus::Released);
                    let completes_invoice =
                        others_released && fresh.invoice.status.is_releasable();
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
                            .with_actor(fresh.invoice.client)
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
                        ops.push(StoreOp::SetInvoiceStatus(InvoiceStatus::Completed));
                        ops.push(StoreOp::AppendEvent(
                            NewEvent::new(EventKind::InvoiceCompleted)
                                .with_actor(fresh.invoice.client),
                        ));
                    }
                    Ok(ops)
                })
                .await?
            }
            _ => {
                info!(
                    invoice_id = %claim.invoice_id,
                    milestone_id = %milestone_id,
                    "orphaned release claim: no payout on ledger, clearing"
                );
                self.commit_fresh(claim.invoice_id, move |_| {
                    Ok(vec![
                        StoreOp::ClearReleaseClaim { milestone_id },
                        StoreOp::AppendEvent(NewEvent::new(EventKind::LedgerFailed {
                            reason: "release attempt abandoned before broadcast".to_string(),
                        })),
                    ])
                })
                .await?
            }
        };
        self.notify(events).await;
        Ok(())
    }

    /// Apply a confirmed verdict: advance status where the optimistic
    /// transition left room, record block heights, append the audit event,
    /// and drop the queue record.
    async fn apply_confirmation(
        &self,
        record: &PendingTx,
        block_height: u64,
    ) -> Result<(), EngineError> {
        info!(
            tx_id = %record.tx_id,
            invoice_id = %record.invoice_id,
            block_height,
            "transaction confirmed"
        );
        let kind = record.kind.clone();
        let tx_id = record.tx_id.clone();
        let events = self
            .commit_fresh(record.invoice_id, move |fresh| {
                let mut ops = Vec::new();
                match &kind {
                    PendingTxKind::Deploy => {
                        if fresh.invoice.status == InvoiceStatus::Deployed {
                            ops.push(StoreOp::SetInvoiceStatus(InvoiceStatus::Active));
                        }
                        if fresh.invoice.confirmed_height.is_none() {
                            ops.push(StoreOp::SetInvoiceConfirmedHeight(block_height));
                        }
                    }
                    PendingTxKind::Release { milestone_id, .. } => {
                        let unrecorded = fresh
                            .milestone(milestone_id)
                            .is_some_and(|m| m.confirmed_height.is_none());
                        if unrecorded {
                            ops.push(StoreOp::SetMilestoneConfirmedHeight {
                                milestone_id: *milestone_id,
                                height: block_height,
                            });
                        }
                    }
                    PendingTxKind::Resolve { .. } => {}
                }
                ops.push(StoreOp::AppendEvent(
                    NewEvent::new(EventKind::LedgerConfirmed { block_height })
                        .with_tx(tx_id.clone()),
                ));
                ops.push(StoreOp::RemovePendingTx(tx_id.clone()));
                Ok(ops)
            })
            .await?;
        self.notify(events).await;
        Ok(())
    }

    /// Apply a rejection or timeout: undo the optimistic transition the
    /// transaction drove, append the audit event, and drop the record.
    async fn apply_rejection(&self, record: &PendingTx, reason: &str) -> Result<(), EngineError> {
        warn!(
            tx_id = %record.tx_id,
            invoice_id = %record.invoice_id,
            reason,
            "transaction rejected, reverting local state"
        );
        let kind = record.kind.clone();
        let tx_id = record.tx_id.clone();
        let reason = reason.to_string();
        let events = self
            .commit_fresh(record.invoice_id, move |fresh| {
                let mut ops = Vec::new();
                match &kind {
                    PendingTxKind::Deploy => {
                        // A dispute raised while the deploy sat unconfirmed
                        // rides the revert back to Draft; the dispute record
                        // itself stays open.
                        if matches!(
                            fresh.invoice.status,
                            InvoiceStatus::Deployed | InvoiceStatus::Disputed
                        ) {
                            ops.push(StoreOp::SetInvoiceStatus(InvoiceStatus::Draft));
                            ops.push(StoreOp::ClearInvoiceDeployment);
                        }
                    }
                    PendingTxKind::Release {
                        milestone_id,
                        prior_status,
                        completed_invoice,
                    } => {
                        if *completed_invoice
                            && fresh.invoice.status == InvoiceStatus::Completed
                        {
                            ops.push(StoreOp::SetInvoiceStatus(InvoiceStatus::Active));
                        }
                        let still_released = fresh
                            .milestone(milestone_id)
                            .is_some_and(|m| m.release_tx_id.as_deref() == Some(&tx_id));
                        if still_released {
                            ops.push(StoreOp::SetMilestoneStatus {
                                milestone_id: *milestone_id,
                                status: *prior_status,
                            });
                            ops.push(StoreOp::ClearMilestoneRelease {
                                milestone_id: *milestone_id,
                            });
                        }
                    }
                    PendingTxKind::Resolve { dispute_id } => {
                        let resolved = fresh
                            .dispute(dispute_id)
                            .is_some_and(|d| d.status == DisputeStatus::Resolved);
                        if resolved {
                            ops.push(StoreOp::ReopenDispute {
                                dispute_id: *dispute_id,
                            });
                        }
                        if fresh.invoice.status == InvoiceStatus::Active {
                            ops.push(StoreOp::SetInvoiceStatus(InvoiceStatus::Disputed));
                        }
                    }
                }
                ops.push(StoreOp::AppendEvent(
                    NewEvent::new(EventKind::LedgerFailed {
                        reason: reason.clone(),
                    })
                    .with_tx(tx_id.clone()),
                ));
                ops.push(StoreOp::RemovePendingTx(tx_id.clone()));
                Ok(ops)
            })
            .await?;
        self.notify(events).await;
        Ok(())
    }

    /// Commit ops rebuilt from fresh state, retrying version conflicts.
    /// Verdict applies race user-facing transitions constantly; the ledger
    /// outcome must not be lost to them.
    async fn commit_fresh<F>(
        &self,
        invoice_id: InvoiceId,
        build: F,
    ) -> Result<Vec<EventRecord>, EngineError>
    where
        F: Fn(&InvoiceRecord) -> Result<Vec<StoreOp>, EngineError>,
    {
        for _ in 0..MAX_COMMIT_RETRIES {
            let fresh = self.store.load_invoice(&invoice_id)?;
            let ops = build(&fresh)?;
            let txn = StoreTransaction {
                invoice_id,
                expected_version: fresh.version,
                now: self.clock.now(),
                ops,
            };
            match self.store.commit(txn) {
                Ok(events) => return Ok(events),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(other) => return Err(other.into()),
            }
        }
        error!(invoice_id = %invoice_id, "reconciler commit retries exhausted");
        Err(EngineError::Internal(
            "commit retries exhausted under contention".to_string(),
        ))
    }

    async fn notify(&self, records: Vec<EventRecord>) {
        for record in records {
            let receivers = self.notifier.publish(Notification::new(record)).await;
            debug!(receivers, "notification published");
        }
    }
}
