//! Release protocol: approval quorum, authorization, invoke ordering, and
//! same-commit invoice completion on the final tranche.

#[cfg(test)]
mod tests {
    use crate::harness::TestEnv;
    use escrow_engine::ports::inbound::EscrowApi;
    use escrow_engine::ports::outbound::LedgerFunction;
    use escrow_engine::test_utils::{LedgerCall, ARBITRATOR, CLIENT, CONTRACTOR, STRANGER};
    use shared_types::{EngineError, EventKind, InvoiceStatus, MilestoneStatus};

    fn release_calls(env: &TestEnv) -> usize {
        env.ledger
            .calls()
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    LedgerCall::Invoke {
                        function: LedgerFunction::ReleaseMilestone { .. },
                        ..
                    }
                )
            })
            .count()
    }

    #[tokio::test]
    async fn test_release_first_milestone_leaves_invoice_open() {
        let env = TestEnv::new(&[40, 60]);
        let invoice_id = env.create_deployed().await;
        let milestone_id = env.milestone_id(&invoice_id, 1);

        let receipt = env
            .engine
            .release_milestone(invoice_id, milestone_id, CLIENT)
            .await
            .unwrap();
        assert!(!receipt.invoice_completed);

        let record = env.record(&invoice_id);
        let milestone = record.milestone(&milestone_id).unwrap();
        assert_eq!(milestone.status, MilestoneStatus::Released);
        assert_eq!(milestone.release_tx_id.as_ref(), Some(&receipt.tx_id));
        assert!(milestone.released_at.is_some());
        // Other milestone and invoice untouched.
        assert_eq!(record.invoice.status, InvoiceStatus::Deployed);
        assert_eq!(record.milestones[1].status, MilestoneStatus::Pending);
        // Claim released in the outcome commit.
        assert!(record.release_claims.is_empty());

        // Exact amount in ledger base units.
        assert!(env.ledger.calls().contains(&LedgerCall::Invoke {
            contract: "contract-1".to_string(),
            function: LedgerFunction::ReleaseMilestone {
                sequence: 1,
                amount: 40_000_000,
            },
        }));
    }

    #[tokio::test]
    async fn test_final_release_completes_invoice_in_same_commit() {
        let env = TestEnv::new(&[40, 60]);
        let invoice_id = env.create_deployed().await;

        let first = env.milestone_id(&invoice_id, 1);
        let second = env.milestone_id(&invoice_id, 2);
        env.engine
            .release_milestone(invoice_id, first, CLIENT)
            .await
            .unwrap();
        let receipt = env
            .engine
            .release_milestone(invoice_id, second, CLIENT)
            .await
            .unwrap();
        assert!(receipt.invoice_completed);

        let record = env.record(&invoice_id);
        assert_eq!(record.invoice.status, InvoiceStatus::Completed);
        // The completion event rides the same commit as the release,
        // adjacent in the gapless sequence.
        let names: Vec<_> = record.events.iter().map(|e| e.kind.name()).collect();
        let released_at = names
            .iter()
            .rposition(|n| *n == "MILESTONE_RELEASED")
            .unwrap();
        assert_eq!(names[released_at + 1], "INVOICE_COMPLETED");
        let sequences: Vec<_> = record.events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=sequences.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_release_requires_client_and_touches_no_ledger() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        let milestone_id = env.milestone_id(&invoice_id, 1);

        for caller in [CONTRACTOR, ARBITRATOR, STRANGER] {
            let err = env
                .engine
                .release_milestone(invoice_id, milestone_id, caller)
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Unauthorized { .. }));
        }
        assert_eq!(release_calls(&env), 0);
        assert_eq!(
            env.record(&invoice_id).milestone(&milestone_id).unwrap().status,
            MilestoneStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_released_milestone_cannot_release_again() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        let milestone_id = env.milestone_id(&invoice_id, 1);

        env.engine
            .release_milestone(invoice_id, milestone_id, CLIENT)
            .await
            .unwrap();
        let err = env
            .engine
            .release_milestone(invoice_id, milestone_id, CLIENT)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
        assert_eq!(release_calls(&env), 1);
    }

    #[tokio::test]
    async fn test_invoke_failure_frees_claim_for_retry() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        let milestone_id = env.milestone_id(&invoice_id, 1);

        env.ledger.fail_invoke(true);
        let err = env
            .engine
            .release_milestone(invoice_id, milestone_id, CLIENT)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CollaboratorUnavailable { .. }));

        let record = env.record(&invoice_id);
        assert_eq!(
            record.milestone(&milestone_id).unwrap().status,
            MilestoneStatus::Pending
        );
        assert!(record.release_claims.is_empty());

        env.ledger.fail_invoke(false);
        let receipt = env
            .engine
            .release_milestone(invoice_id, milestone_id, CLIENT)
            .await
            .unwrap();
        assert!(receipt.invoice_completed);
    }

    #[tokio::test]
    async fn test_single_approval_meets_quorum() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        let milestone_id = env.milestone_id(&invoice_id, 1);

        let status = env
            .engine
            .approve_milestone(invoice_id, milestone_id, CLIENT, true)
            .await
            .unwrap();
        assert_eq!(status, MilestoneStatus::Approved);
        assert!(env
            .record(&invoice_id)
            .events
            .iter()
            .all(|e| !matches!(e.kind, EventKind::MilestoneReleased { .. })));
    }

    #[tokio::test]
    async fn test_disapproval_blocks_until_quorum_recovers() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        let milestone_id = env.milestone_id(&invoice_id, 1);

        // One recorded vote, zero approvals: below the ceil(1/2) quorum.
        let status = env
            .engine
            .approve_milestone(invoice_id, milestone_id, ARBITRATOR, false)
            .await
            .unwrap();
        assert_eq!(status, MilestoneStatus::Pending);

        let err = env
            .engine
            .release_milestone(invoice_id, milestone_id, CLIENT)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
        assert_eq!(release_calls(&env), 0);

        // Second vote approves: 1 of 2 meets the ceil(2/2) = 1 bar.
        let status = env
            .engine
            .approve_milestone(invoice_id, milestone_id, CLIENT, true)
            .await
            .unwrap();
        assert_eq!(status, MilestoneStatus::Approved);
        env.engine
            .release_milestone(invoice_id, milestone_id, CLIENT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_approval_restricted_to_client_and_arbitrator() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        let milestone_id = env.milestone_id(&invoice_id, 1);

        for caller in [CONTRACTOR, STRANGER] {
            let err = env
                .engine
                .approve_milestone(invoice_id, milestone_id, caller, true)
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Unauthorized { .. }));
        }
    }

    #[tokio::test]
    async fn test_duplicate_vote_rejected() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;
        let milestone_id = env.milestone_id(&invoice_id, 1);

        env.engine
            .approve_milestone(invoice_id, milestone_id, CLIENT, true)
            .await
            .unwrap();
        let err = env
            .engine
            .approve_milestone(invoice_id, milestone_id, CLIENT, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
    }

    #[tokio::test]
    async fn test_unknown_milestone_not_found() {
        let env = TestEnv::new(&[100]);
        let invoice_id = env.create_deployed().await;

        let err = env
            .engine
            .release_milestone(invoice_id, uuid::Uuid::new_v4(), CLIENT)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
