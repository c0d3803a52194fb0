//! # Create Protocol
//!
//! Draft text in, a deployed (or deployable) invoice out.
//!
//! The durability boundary sits at step 3: once the `Draft` commit lands,
//! the invoice exists even if every subsequent step fails. Deployment
//! failure leaves an inspectable `Draft` invoice for retry, never an
//! error masked as success.

use super::LifecycleEngine;
use crate::domain::pending::{PendingTx, PendingTxKind};
use crate::domain::validation;
use crate::ports::inbound::{CreateInvoiceRequest, CreateInvoiceResponse, DeploymentOutcome};
use crate::ports::outbound::{
    DeployParams, DocumentStore, DraftingService, InvoiceRecord, LedgerClient, MilestonePlan,
    PlannedMilestone, SettlementArtifact, StateStore, StoreOp, StoreTransaction,
};
use shared_types::{
    Address, EngineError, EventKind, Invoice, InvoiceId, InvoiceStatus, Milestone,
    MilestoneStatus, NewEvent,
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
    pub(super) async fn handle_create(
        &self,
        request: CreateInvoiceRequest,
    ) -> Result<CreateInvoiceResponse, EngineError> {
        // Steps 1-2: draft and validate. Nothing is persisted yet, so a
        // failure here is terminal and needs no compensation.
        let plan = self.drafting().parse(&request.draft_text).await?;
        let artifact = self.drafting().generate_artifact(&plan).await?;
        validation::validate_plan(&plan)?;

        let now = self.now();
        let invoice_id = Uuid::new_v4();
        let arbitrator = request.arbitrator.unwrap_or(request.client);
        let invoice = Invoice {
            id: invoice_id,
            title: request.title.clone(),
            metadata: request.metadata.clone(),
            client: request.client,
            contractor: request.contractor,
            arbitrator,
            total_amount: plan.total_amount,
            currency: plan.currency.clone(),
            total_ledger_amount: plan.currency.to_ledger_units(plan.total_amount),
            contract_address: None,
            deploy_tx_id: None,
            confirmed_height: None,
            status: InvoiceStatus::Draft,
            document_hash: None,
            created_at: now,
        };

        let mut ops = vec![StoreOp::InsertInvoice(invoice)];
        for (index, planned) in plan.milestones.iter().enumerate() {
            ops.push(StoreOp::InsertMilestone(Milestone {
                id: Uuid::new_v4(),
                invoice_id,
                sequence: index as u32 + 1,
                amount: planned.amount,
                ledger_amount: plan.currency.to_ledger_units(planned.amount),
                condition: planned.condition.clone(),
                requires_proof: planned.requires_proof,
                due_at: planned.due_at,
                status: MilestoneStatus::Pending,
                release_tx_id: None,
                released_at: None,
                confirmed_height: None,
            }));
        }
        ops.push(StoreOp::AppendEvent(
            NewEvent::new(EventKind::InvoiceCreated {
                total_amount: plan.total_amount,
                currency: plan.currency.code.clone(),
                milestone_count: plan.milestones.len() as u32,
            })
            .with_actor(request.client),
        ));

        // Step 3: the durability boundary.
        let events = self.store().commit(StoreTransaction {
            invoice_id,
            expected_version: 0,
            now,
            ops,
        })?;
        info!(
            invoice_id = %invoice_id,
            milestones = plan.milestones.len(),
            "invoice created"
        );
        self.notify(events).await;

        // Step 4: best-effort document pin.
        self.pin_agreement(invoice_id, &request, &plan).await;

        // Steps 5-6: deploy, record, hand off to the reconciler. The
        // caller is not blocked on ledger confirmation.
        let deployment = self
            .deploy_settlement(invoice_id, &artifact, request.client)
            .await;
        let status = match deployment {
            DeploymentOutcome::Deployed { .. } => InvoiceStatus::Deployed,
            DeploymentOutcome::Failed { .. } => InvoiceStatus::Draft,
        };

        Ok(CreateInvoiceResponse {
            invoice_id,
            status,
            deployment,
        })
    }

    pub(super) async fn handle_redeploy(
        &self,
        invoice_id: InvoiceId,
        caller: Address,
    ) -> Result<DeploymentOutcome, EngineError> {
        let record = self.load(&invoice_id)?;
        if caller != record.invoice.client {
            return Err(Self::unauthorized(&caller, "redeploy"));
        }
        if record.invoice.status != InvoiceStatus::Draft {
            return Err(EngineError::conflict(format!(
                "invoice is {:?}, only Draft invoices are deployable",
                record.invoice.status
            )));
        }
        if record.milestones.is_empty() {
            return Err(EngineError::validation("invoice has no milestones"));
        }
        validation::invoice_balances(&record.invoice, &record.milestones)?;

        // Rebuild the plan from persisted state; no duplicate invoice is
        // ever created on retry.
        let plan = MilestonePlan {
            total_amount: record.invoice.total_amount,
            currency: record.invoice.currency.clone(),
            milestones: record
                .milestones
                .iter()
                .map(|m| PlannedMilestone {
                    amount: m.amount,
                    condition: m.condition.clone(),
                    requires_proof: m.requires_proof,
                    due_at: m.due_at,
                })
                .collect(),
        };
        let artifact = self.drafting().generate_artifact(&plan).await?;

        Ok(self.deploy_settlement(invoice_id, &artifact, caller).await)
    }

    pub(super) async fn handle_cancel(
        &self,
        invoice_id: InvoiceId,
        caller: Address,
    ) -> Result<(), EngineError> {
        let record = self.load(&invoice_id)?;
        if caller != record.invoice.client {
            return Err(Self::unauthorized(&caller, "cancel"));
        }
        if record.invoice.status != InvoiceStatus::Draft {
            return Err(EngineError::conflict(format!(
                "invoice is {:?}, only Draft invoices can be cancelled",
                record.invoice.status
            )));
        }

        let events = self.store().commit(StoreTransaction {
            invoice_id,
            expected_version: record.version,
            now: self.now(),
            ops: vec![
                StoreOp::SetInvoiceStatus(InvoiceStatus::Cancelled),
                StoreOp::AppendEvent(NewEvent::new(EventKind::InvoiceCancelled).with_actor(caller)),
            ],
        })?;
        info!(invoice_id = %invoice_id, "invoice cancelled");
        self.notify(events).await;
        Ok(())
    }

    /// Deploy the settlement artifact and record the outcome.
    ///
    /// Any failure, ledger or local, leaves the invoice in `Draft`. The
    /// pending-tx record lands in the same commit as the `Deployed`
    /// transition, so the reconciler resumes from durable state.
    async fn deploy_settlement(
        &self,
        invoice_id: InvoiceId,
        artifact: &SettlementArtifact,
        actor: Address,
    ) -> DeploymentOutcome {
        let record = match self.load(&invoice_id) {
            Ok(record) => record,
            Err(err) => {
                return DeploymentOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        };
        let params = DeployParams {
            client: record.invoice.client,
            contractor: record.invoice.contractor,
            arbitrator: record.invoice.arbitrator,
            total_ledger_amount: record.invoice.total_ledger_amount,
            milestone_ledger_amounts: record.milestones.iter().map(|m| m.ledger_amount).collect(),
        };

        let receipt = match self.ledger().deploy(artifact, &params).await {
            Ok(receipt) => receipt,
            Err(err) => {
                warn!(
                    invoice_id = %invoice_id,
                    error = %err,
                    "deployment failed, invoice remains in Draft"
                );
                return DeploymentOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };

        let now = self.now();
        let tx_id = receipt.tx_id.clone();
        let contract_address = receipt.contract_address.clone();
        let build = |fresh: &InvoiceRecord| -> Result<Vec<StoreOp>, EngineError> {
            if fresh.invoice.status != InvoiceStatus::Draft {
                return Err(EngineError::conflict(format!(
                    "invoice is {:?}, expected Draft",
                    fresh.invoice.status
                )));
            }
            let mut ops = vec![
                StoreOp::SetInvoiceStatus(InvoiceStatus::Deployed),
                StoreOp::SetInvoiceDeployment {
                    contract_address: contract_address.clone(),
                    deploy_tx_id: tx_id.clone(),
                },
                StoreOp::AppendEvent(
                    NewEvent::new(EventKind::ContractDeployed {
                        contract_address: contract_address.clone(),
                    })
                    .with_actor(actor)
                    .with_tx(tx_id.clone()),
                ),
                StoreOp::EnqueuePendingTx(PendingTx::new(
                    tx_id.clone(),
                    invoice_id,
                    PendingTxKind::Deploy,
                    now,
                )),
            ];
            // A dispute that survived a rejected deployment re-attaches to
            // the fresh contract.
            if fresh.open_dispute().is_some() {
                ops.push(StoreOp::SetInvoiceStatus(InvoiceStatus::Disputed));
            }
            Ok(ops)
        };

        match self.commit_fresh(invoice_id, build).await {
            Ok(events) => {
                info!(
                    invoice_id = %invoice_id,
                    contract = %receipt.contract_address,
                    tx_id = %receipt.tx_id,
                    "settlement contract deployed"
                );
                self.notify(events).await;
                DeploymentOutcome::Deployed {
                    contract_address: receipt.contract_address,
                    tx_id: receipt.tx_id,
                }
            }
            Err(err) => {
                warn!(
                    invoice_id = %invoice_id,
                    error = %err,
                    "deployment commit refused, invoice remains in Draft"
                );
                DeploymentOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Push the agreement document to the Document Store. Failures are
    /// logged and swallowed: invoice creation never fails because
    /// auxiliary storage is down.
    async fn pin_agreement(
        &self,
        invoice_id: InvoiceId,
        request: &CreateInvoiceRequest,
        plan: &MilestonePlan,
    ) {
        let blob = serde_json::json!({
            "invoice_id": invoice_id,
            "title": request.title,
            "draft_text": request.draft_text,
            "plan": plan,
        });
        let hash = match self.documents().put(&blob).await {
            Ok(hash) => hash,
            Err(err) => {
                warn!(
                    invoice_id = %invoice_id,
                    error = %err,
                    "document pin failed, proceeding without agreement hash"
                );
                return;
            }
        };

        let result = self
            .commit_fresh(invoice_id, |_| {
                Ok(vec![StoreOp::SetDocumentHash(hash.clone())])
            })
            .await;
        if let Err(err) = result {
            warn!(
                invoice_id = %invoice_id,
                error = %err,
                "recording document hash failed"
            );
        }
    }
}
