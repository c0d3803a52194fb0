//! Confirmation reconciliation: confirm, revert-on-rejection, backoff, and
//! the hard timeout, all driven by explicit sweeps over scripted statuses.

#[cfg(test)]
mod tests {
    use crate::harness::TestEnv;
    use escrow_engine::ports::inbound::{DeploymentOutcome, EscrowApi};
    use escrow_engine::ports::outbound::{StoreOp, StoreTransaction};
    use escrow_engine::test_utils::{ARBITRATOR, CLIENT, CONTRACTOR};
    use escrow_engine::{Clock, StateStore, TxStatus};
    use shared_types::{DisputeStatus, EngineError, InvoiceStatus, MilestoneStatus};

    #[tokio::test]
    async fn test_deploy_confirmation_activates_invoice() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        env.ledger
            .set_status("tx-1", TxStatus::Confirmed { block_height: 5 });

        let settled = env.reconciler().sweep().await.unwrap();
        assert_eq!(settled, 1);

        let record = env.record(&invoice_id);
        assert_eq!(record.invoice.status, InvoiceStatus::Active);
        assert_eq!(record.invoice.confirmed_height, Some(5));
        assert!(env.store.list_pending_txs().unwrap().is_empty());
        assert!(record
            .events
            .iter()
            .any(|e| e.kind.name() == "LEDGER_CONFIRMED"));
    }

    #[tokio::test]
    async fn test_deploy_rejection_reverts_to_draft_for_retry() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        env.ledger.set_status(
            "tx-1",
            TxStatus::Failed {
                reason: "out of gas".to_string(),
            },
        );

        env.reconciler().sweep().await.unwrap();

        let record = env.record(&invoice_id);
        assert_eq!(record.invoice.status, InvoiceStatus::Draft);
        assert!(record.invoice.contract_address.is_none());
        assert!(record.invoice.deploy_tx_id.is_none());
        assert!(record
            .events
            .iter()
            .any(|e| e.kind.name() == "LEDGER_FAILED"));

        // The revert reopens the redeploy path.
        let outcome = env
            .engine
            .redeploy_invoice(invoice_id, CLIENT)
            .await
            .unwrap();
        assert!(matches!(outcome, DeploymentOutcome::Deployed { .. }));
    }

    #[tokio::test]
    async fn test_release_confirmation_records_block_height() {
        let env = TestEnv::new(&[40, 60]);
        let invoice_id = env.create_deployed().await;
        env.ledger
            .set_status("tx-1", TxStatus::Confirmed { block_height: 5 });
        env.reconciler().sweep().await.unwrap();

        let milestone_id = env.milestone_id(&invoice_id, 1);
        let receipt = env
            .engine
            .release_milestone(invoice_id, milestone_id, CLIENT)
            .await
            .unwrap();
        env.ledger
            .set_status(&receipt.tx_id, TxStatus::Confirmed { block_height: 9 });

        let settled = env.reconciler().sweep().await.unwrap();
        assert_eq!(settled, 1);
        let record = env.record(&invoice_id);
        assert_eq!(
            record.milestone(&milestone_id).unwrap().confirmed_height,
            Some(9)
        );
        assert!(env.store.list_pending_txs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_rejection_reverts_milestone() {
        let env = TestEnv::new(&[40, 60]);
        let invoice_id = env.create_deployed().await;
        env.ledger
            .set_status("tx-1", TxStatus::Confirmed { block_height: 5 });
        env.reconciler().sweep().await.unwrap();

        let milestone_id = env.milestone_id(&invoice_id, 1);
        let receipt = env
            .engine
            .release_milestone(invoice_id, milestone_id, CLIENT)
            .await
            .unwrap();
        env.ledger.set_status(
            &receipt.tx_id,
            TxStatus::Failed {
                reason: "contract reverted".to_string(),
            },
        );
        env.reconciler().sweep().await.unwrap();

        let record = env.record(&invoice_id);
        let milestone = record.milestone(&milestone_id).unwrap();
        assert_eq!(milestone.status, MilestoneStatus::Pending);
        assert!(milestone.release_tx_id.is_none());
        assert_eq!(record.invoice.status, InvoiceStatus::Active);
    }

    #[tokio::test]
    async fn test_final_release_rejection_reopens_completed_invoice() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        env.ledger
            .set_status("tx-1", TxStatus::Confirmed { block_height: 5 });
        env.reconciler().sweep().await.unwrap();

        let milestone_id = env.milestone_id(&invoice_id, 1);
        let receipt = env
            .engine
            .release_milestone(invoice_id, milestone_id, CLIENT)
            .await
            .unwrap();
        assert!(receipt.invoice_completed);
        assert_eq!(env.record(&invoice_id).invoice.status, InvoiceStatus::Completed);

        env.ledger.set_status(
            &receipt.tx_id,
            TxStatus::Failed {
                reason: "insufficient escrow balance".to_string(),
            },
        );
        env.reconciler().sweep().await.unwrap();

        let record = env.record(&invoice_id);
        assert_eq!(record.invoice.status, InvoiceStatus::Active);
        assert_eq!(
            record.milestone(&milestone_id).unwrap().status,
            MilestoneStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_resolution_rejection_reopens_dispute() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        env.ledger
            .set_status("tx-1", TxStatus::Confirmed { block_height: 5 });
        env.reconciler().sweep().await.unwrap();

        let dispute_id = env
            .engine
            .raise_dispute(invoice_id, CONTRACTOR, "scope".to_string(), None)
            .await
            .unwrap();
        let tx_id = env
            .engine
            .resolve_dispute(invoice_id, ARBITRATOR, true, "refund client".to_string())
            .await
            .unwrap();
        env.ledger.set_status(
            &tx_id,
            TxStatus::Failed {
                reason: "arbitration tx reverted".to_string(),
            },
        );
        env.reconciler().sweep().await.unwrap();

        let record = env.record(&invoice_id);
        assert_eq!(record.invoice.status, InvoiceStatus::Disputed);
        assert_eq!(
            record.dispute(&dispute_id).unwrap().status,
            DisputeStatus::Open
        );
    }

    #[tokio::test]
    async fn test_pending_transaction_backs_off_then_times_out() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        let reconciler = env.reconciler();

        // Still pending: rescheduled, not settled.
        assert_eq!(reconciler.sweep().await.unwrap(), 0);
        let queued = &env.store.list_pending_txs().unwrap()[0];
        assert_eq!(queued.attempts, 1);
        assert_eq!(queued.next_poll_at, env.clock.now() + 1);

        // Not yet due: skipped entirely.
        assert_eq!(reconciler.sweep().await.unwrap(), 0);
        assert_eq!(env.store.list_pending_txs().unwrap()[0].attempts, 1);

        // Past the hard timeout the transaction is treated as failed.
        env.clock.advance(601);
        assert_eq!(reconciler.sweep().await.unwrap(), 1);
        let record = env.record(&invoice_id);
        assert_eq!(record.invoice.status, InvoiceStatus::Draft);
        assert!(record
            .events
            .iter()
            .any(|e| e.kind.name() == "LEDGER_FAILED"));
        assert!(env.store.list_pending_txs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_poll_failure_leaves_record_queued() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        let reconciler = env.reconciler();

        env.ledger.fail_status(true);
        assert_eq!(reconciler.sweep().await.unwrap(), 0);
        let queued = env.store.list_pending_txs().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempts, 0);

        env.ledger.fail_status(false);
        env.ledger
            .set_status("tx-1", TxStatus::Confirmed { block_height: 7 });
        assert_eq!(reconciler.sweep().await.unwrap(), 1);
        assert_eq!(env.record(&invoice_id).invoice.status, InvoiceStatus::Active);
    }

    #[tokio::test]
    async fn test_orphaned_claim_without_payout_cleared_after_timeout() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        env.ledger
            .set_status("tx-1", TxStatus::Confirmed { block_height: 5 });
        let reconciler = env.reconciler();
        reconciler.sweep().await.unwrap();

        // A claim with no queue record, as left by a process that died
        // between taking the claim and broadcasting the release.
        let milestone_id = env.milestone_id(&invoice_id, 1);
        let record = env.record(&invoice_id);
        env.store
            .commit(StoreTransaction {
                invoice_id,
                expected_version: record.version,
                now: env.clock.now(),
                ops: vec![StoreOp::ClaimMilestoneRelease { milestone_id }],
            })
            .unwrap();

        // The milestone is locked out while the claim is held.
        let err = env
            .engine
            .release_milestone(invoice_id, milestone_id, CLIENT)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));

        // Not yet stale: untouched.
        assert_eq!(reconciler.sweep().await.unwrap(), 0);
        assert_eq!(env.record(&invoice_id).release_claims.len(), 1);

        // Past the staleness horizon the ledger reports no payout, so the
        // claim is cleared and the milestone is releasable again.
        env.clock.advance(601);
        assert_eq!(reconciler.sweep().await.unwrap(), 1);
        let record = env.record(&invoice_id);
        assert!(record.release_claims.is_empty());
        assert!(record
            .events
            .iter()
            .any(|e| e.kind.name() == "LEDGER_FAILED"));

        let receipt = env
            .engine
            .release_milestone(invoice_id, milestone_id, CLIENT)
            .await
            .unwrap();
        assert!(receipt.invoice_completed);
    }

    #[tokio::test]
    async fn test_orphaned_claim_with_payout_recorded_from_ledger() {
        let env = TestEnv::new(&[40, 60]);
        let invoice_id = env.create_deployed().await;
        env.ledger
            .set_status("tx-1", TxStatus::Confirmed { block_height: 5 });
        let reconciler = env.reconciler();
        reconciler.sweep().await.unwrap();

        let milestone_id = env.milestone_id(&invoice_id, 1);
        let record = env.record(&invoice_id);
        env.store
            .commit(StoreTransaction {
                invoice_id,
                expected_version: record.version,
                now: env.clock.now(),
                ops: vec![StoreOp::ClaimMilestoneRelease { milestone_id }],
            })
            .unwrap();
        // The dead process did broadcast: the contract paid the tranche.
        env.ledger.set_released("contract-1", 1, "tx-77");

        env.clock.advance(601);
        assert_eq!(reconciler.sweep().await.unwrap(), 1);

        let record = env.record(&invoice_id);
        let milestone = record.milestone(&milestone_id).unwrap();
        assert_eq!(milestone.status, MilestoneStatus::Released);
        assert_eq!(milestone.release_tx_id.as_deref(), Some("tx-77"));
        assert!(record.release_claims.is_empty());
        assert!(record
            .events
            .iter()
            .any(|e| e.kind.name() == "MILESTONE_RELEASED"));
        let queued = env.store.list_pending_txs().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].tx_id, "tx-77");

        // The recovered transaction confirms like any other.
        env.ledger
            .set_status("tx-77", TxStatus::Confirmed { block_height: 12 });
        assert_eq!(reconciler.sweep().await.unwrap(), 1);
        let record = env.record(&invoice_id);
        assert_eq!(
            record.milestone(&milestone_id).unwrap().confirmed_height,
            Some(12)
        );
    }

    #[tokio::test]
    async fn test_dispute_survives_deploy_rejection() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        let dispute_id = env
            .engine
            .raise_dispute(invoice_id, CONTRACTOR, "wrong terms".to_string(), None)
            .await
            .unwrap();

        env.ledger.set_status(
            "tx-1",
            TxStatus::Failed {
                reason: "out of gas".to_string(),
            },
        );
        env.reconciler().sweep().await.unwrap();

        // The rejected deployment is forgotten; the dispute is not.
        let record = env.record(&invoice_id);
        assert_eq!(record.invoice.status, InvoiceStatus::Draft);
        assert!(record.invoice.contract_address.is_none());
        assert_eq!(
            record.dispute(&dispute_id).unwrap().status,
            DisputeStatus::Open
        );

        // Redeploy re-attaches the open dispute to the fresh contract.
        let outcome = env
            .engine
            .redeploy_invoice(invoice_id, CLIENT)
            .await
            .unwrap();
        assert!(matches!(outcome, DeploymentOutcome::Deployed { .. }));
        let record = env.record(&invoice_id);
        assert_eq!(record.invoice.status, InvoiceStatus::Disputed);
        assert_eq!(record.invoice.contract_address.as_deref(), Some("contract-3"));

        let tx_id = env
            .engine
            .resolve_dispute(invoice_id, ARBITRATOR, true, "refund client".to_string())
            .await
            .unwrap();
        assert!(!tx_id.is_empty());
        assert_eq!(env.record(&invoice_id).invoice.status, InvoiceStatus::Active);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent_after_settlement() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        env.ledger
            .set_status("tx-1", TxStatus::Confirmed { block_height: 5 });
        let reconciler = env.reconciler();

        assert_eq!(reconciler.sweep().await.unwrap(), 1);
        let before = env.record(&invoice_id);
        assert_eq!(reconciler.sweep().await.unwrap(), 0);
        let after = env.record(&invoice_id);
        assert_eq!(before.events.len(), after.events.len());
        assert_eq!(before.version, after.version);
    }
}
