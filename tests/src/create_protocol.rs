//! Create protocol: drafting, validation, the `Draft` durability boundary,
//! deployment failure and retry, cancellation.

#[cfg(test)]
mod tests {
    use crate::harness::TestEnv;
    use escrow_engine::ports::inbound::{DeploymentOutcome, EscrowApi};
    use escrow_engine::test_utils::{make_plan, CLIENT, CONTRACTOR};
    use escrow_engine::StateStore;
    use shared_types::{EngineError, EventKind, InvoiceStatus, MilestoneStatus};

    #[tokio::test]
    async fn test_create_deploys_and_records_full_aggregate() {
        let env = TestEnv::new(&[40, 60]);
        let response = env.engine.create_invoice(env.request()).await.unwrap();

        assert_eq!(response.status, InvoiceStatus::Deployed);
        assert!(matches!(
            response.deployment,
            DeploymentOutcome::Deployed { .. }
        ));

        let record = env.record(&response.invoice_id);
        assert_eq!(record.invoice.status, InvoiceStatus::Deployed);
        assert_eq!(record.invoice.total_amount, 100);
        assert_eq!(record.invoice.total_ledger_amount, 100_000_000);
        assert_eq!(record.invoice.contract_address.as_deref(), Some("contract-1"));
        assert_eq!(record.invoice.deploy_tx_id.as_deref(), Some("tx-1"));

        assert_eq!(record.milestones.len(), 2);
        assert_eq!(record.milestones[0].sequence, 1);
        assert_eq!(record.milestones[0].ledger_amount, 40_000_000);
        assert_eq!(record.milestones[1].sequence, 2);
        assert_eq!(record.milestones[1].status, MilestoneStatus::Pending);

        // Gapless audit trail: created, then deployed.
        let kinds: Vec<_> = record.events.iter().map(|e| e.kind.name()).collect();
        assert_eq!(kinds, vec!["INVOICE_CREATED", "CONTRACT_DEPLOYED"]);
        let sequences: Vec<_> = record.events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);

        // Agreement pinned, confirmation queued.
        assert!(record.invoice.document_hash.is_some());
        assert_eq!(env.documents.len(), 1);
        assert_eq!(env.store.list_pending_txs().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_drafting_failure_persists_nothing() {
        let env = TestEnv::new(&[100]);
        env.drafting.fail_parse(true);

        let err = env.engine.create_invoice(env.request()).await.unwrap_err();
        assert!(matches!(err, EngineError::CollaboratorUnavailable { .. }));
        assert_eq!(env.ledger.deploy_count(), 0);
        assert!(env.documents.is_empty());
    }

    #[tokio::test]
    async fn test_unbalanced_plan_rejected_before_persistence() {
        let env = TestEnv::new(&[100]);
        let mut plan = make_plan(&[40, 50]);
        plan.total_amount = 100;
        env.drafting.set_plan(plan);

        let err = env.engine.create_invoice(env.request()).await.unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailed(_)));
        assert_eq!(env.ledger.deploy_count(), 0);
    }

    #[tokio::test]
    async fn test_deploy_failure_leaves_draft_then_redeploy_succeeds() {
        let env = TestEnv::new(&[40, 60]);
        env.ledger.fail_deploy(true);

        let response = env.engine.create_invoice(env.request()).await.unwrap();
        assert_eq!(response.status, InvoiceStatus::Draft);
        assert!(matches!(
            response.deployment,
            DeploymentOutcome::Failed { .. }
        ));
        let record = env.record(&response.invoice_id);
        assert_eq!(record.invoice.status, InvoiceStatus::Draft);
        assert!(record.invoice.contract_address.is_none());

        // Retry deploys the same invoice; no duplicate is created.
        env.ledger.fail_deploy(false);
        let outcome = env
            .engine
            .redeploy_invoice(response.invoice_id, CLIENT)
            .await
            .unwrap();
        assert!(matches!(outcome, DeploymentOutcome::Deployed { .. }));

        let record = env.record(&response.invoice_id);
        assert_eq!(record.invoice.status, InvoiceStatus::Deployed);
        assert_eq!(record.milestones.len(), 2);
        let created = record
            .events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::InvoiceCreated { .. }))
            .count();
        assert_eq!(created, 1);
        assert_eq!(env.ledger.deploy_count(), 1);
    }

    #[tokio::test]
    async fn test_redeploy_requires_client() {
        let env = TestEnv::new(&[100]);
        env.ledger.fail_deploy(true);
        let response = env.engine.create_invoice(env.request()).await.unwrap();

        let err = env
            .engine
            .redeploy_invoice(response.invoice_id, CONTRACTOR)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_redeploy_of_deployed_invoice_conflicts() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;

        let err = env
            .engine
            .redeploy_invoice(invoice_id, CLIENT)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
        assert_eq!(env.ledger.deploy_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_draft_is_terminal_and_audited() {
        let env = TestEnv::new(&[100]);
        env.ledger.fail_deploy(true);
        let response = env.engine.create_invoice(env.request()).await.unwrap();

        env.engine
            .cancel_invoice(response.invoice_id, CLIENT)
            .await
            .unwrap();
        let record = env.record(&response.invoice_id);
        assert_eq!(record.invoice.status, InvoiceStatus::Cancelled);
        assert!(record
            .events
            .iter()
            .any(|e| matches!(e.kind, EventKind::InvoiceCancelled)));

        // Terminal: no second cancel, no deploy.
        let err = env
            .engine
            .cancel_invoice(response.invoice_id, CLIENT)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
        let err = env
            .engine
            .redeploy_invoice(response.invoice_id, CLIENT)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_requires_client() {
        let env = TestEnv::new(&[100]);
        env.ledger.fail_deploy(true);
        let response = env.engine.create_invoice(env.request()).await.unwrap();

        let err = env
            .engine
            .cancel_invoice(response.invoice_id, CONTRACTOR)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_permissions_track_snapshot_and_identity() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;

        let client = env.engine.permissions_for(invoice_id, CLIENT).await.unwrap();
        assert!(client.can_release && client.can_approve && client.can_dispute);
        assert!(!client.can_cancel);

        let contractor = env
            .engine
            .permissions_for(invoice_id, CONTRACTOR)
            .await
            .unwrap();
        assert!(!contractor.can_release);
        assert!(contractor.can_dispute);

        // Capabilities follow the status machine: a dispute closes them.
        env.engine
            .raise_dispute(invoice_id, CONTRACTOR, "quality".to_string(), None)
            .await
            .unwrap();
        let client = env.engine.permissions_for(invoice_id, CLIENT).await.unwrap();
        assert!(!client.can_release && !client.can_dispute);
    }

    #[tokio::test]
    async fn test_document_pin_failure_never_blocks_creation() {
        let env = TestEnv::new(&[100]);
        env.documents.fail(true);

        let response = env.engine.create_invoice(env.request()).await.unwrap();
        assert_eq!(response.status, InvoiceStatus::Deployed);
        assert!(env.record(&response.invoice_id).invoice.document_hash.is_none());
    }
}
