//! Controllable fakes for the three collaborators plus a manual clock.
//! Always compiled so the unified test crate can drive them: failure
//! injection, scripted plans, programmable transaction statuses, and
//! full call recording.

use crate::ports::outbound::{
    Clock, DeployParams, DeployReceipt, DocumentStore, DraftingService, InvokeReceipt,
    LedgerClient, LedgerFunction, MilestonePlan, PlannedMilestone, SettlementArtifact, TxStatus,
};
use serde_json::Value;
use shared_types::{
    Address, Collaborator, ContentHash, ContractAddress, Currency, EngineError, Timestamp, TxId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

pub const CLIENT: Address = [0x11; 20];
pub const CONTRACTOR: Address = [0x22; 20];
pub const ARBITRATOR: Address = [0x33; 20];
pub const STRANGER: Address = [0x44; 20];

/// Plan with the given milestone amounts, totalling their sum, USDC-style
/// 6-decimal currency.
pub fn make_plan(amounts: &[u64]) -> MilestonePlan {
    MilestonePlan {
        total_amount: amounts.iter().sum(),
        currency: Currency {
            code: "USDC".to_string(),
            decimals: 6,
        },
        milestones: amounts
            .iter()
            .enumerate()
            .map(|(i, &amount)| PlannedMilestone {
                amount,
                condition: format!("deliverable {}", i + 1),
                requires_proof: false,
                due_at: None,
            })
            .collect(),
    }
}

fn unavailable(collaborator: Collaborator, reason: &str) -> EngineError {
    EngineError::CollaboratorUnavailable {
        collaborator,
        reason: reason.to_string(),
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Manually advanced clock for deterministic timeout/backoff tests.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Drafting Service
// =============================================================================

/// Fake drafting service returning a scripted plan.
pub struct MockDraftingService {
    plan: Mutex<MilestonePlan>,
    fail_parse: AtomicBool,
    fail_artifact: AtomicBool,
}

impl MockDraftingService {
    pub fn with_plan(plan: MilestonePlan) -> Self {
        Self {
            plan: Mutex::new(plan),
            fail_parse: AtomicBool::new(false),
            fail_artifact: AtomicBool::new(false),
        }
    }

    pub fn set_plan(&self, plan: MilestonePlan) {
        *self.plan.lock().unwrap() = plan;
    }

    pub fn fail_parse(&self, fail: bool) {
        self.fail_parse.store(fail, Ordering::SeqCst);
    }

    pub fn fail_artifact(&self, fail: bool) {
        self.fail_artifact.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl DraftingService for MockDraftingService {
    async fn parse(&self, _text: &str) -> Result<MilestonePlan, EngineError> {
        if self.fail_parse.load(Ordering::SeqCst) {
            return Err(unavailable(Collaborator::Drafting, "parse failed"));
        }
        Ok(self.plan.lock().unwrap().clone())
    }

    async fn generate_artifact(
        &self,
        plan: &MilestonePlan,
    ) -> Result<SettlementArtifact, EngineError> {
        if self.fail_artifact.load(Ordering::SeqCst) {
            return Err(unavailable(
                Collaborator::Drafting,
                "artifact generation failed",
            ));
        }
        Ok(SettlementArtifact {
            code: format!("escrow({} milestones)", plan.milestones.len()),
            metadata: serde_json::json!({ "currency": plan.currency.code }),
        })
    }
}

// =============================================================================
// Ledger Client
// =============================================================================

/// A recorded ledger call, for asserting exactly what the engine sent.
#[derive(Clone, Debug, PartialEq)]
pub enum LedgerCall {
    Deploy {
        params: DeployParams,
    },
    Invoke {
        contract: ContractAddress,
        function: LedgerFunction,
    },
}

/// Fake ledger client with programmable statuses and failure injection.
///
/// Deploys and invokes hand out deterministic ids (`tx-1`, `tx-2`, ...);
/// `tx_status` answers from the scripted map, defaulting to `Pending`.
pub struct MockLedgerClient {
    calls: Mutex<Vec<LedgerCall>>,
    statuses: Mutex<HashMap<TxId, TxStatus>>,
    /// Tranches paid out on-contract, keyed by (contract, sequence).
    released: Mutex<HashMap<(ContractAddress, u32), TxId>>,
    counter: AtomicU64,
    fail_deploy: AtomicBool,
    fail_invoke: AtomicBool,
    fail_status: AtomicBool,
}

impl MockLedgerClient {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(vec![]),
            statuses: Mutex::new(HashMap::new()),
            released: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            fail_deploy: AtomicBool::new(false),
            fail_invoke: AtomicBool::new(false),
            fail_status: AtomicBool::new(false),
        }
    }

    pub fn fail_deploy(&self, fail: bool) {
        self.fail_deploy.store(fail, Ordering::SeqCst);
    }

    pub fn fail_invoke(&self, fail: bool) {
        self.fail_invoke.store(fail, Ordering::SeqCst);
    }

    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    /// Script the status the ledger reports for a transaction.
    pub fn set_status(&self, tx_id: &str, status: TxStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(tx_id.to_string(), status);
    }

    /// Script a tranche as already paid out on-contract, as if a prior
    /// process broadcast the release but died before recording it.
    pub fn set_released(&self, contract: &str, sequence: u32, tx_id: &str) {
        self.released
            .lock()
            .unwrap()
            .insert((contract.to_string(), sequence), tx_id.to_string());
    }

    pub fn calls(&self) -> Vec<LedgerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn deploy_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, LedgerCall::Deploy { .. }))
            .count()
    }

    pub fn invoke_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, LedgerCall::Invoke { .. }))
            .count()
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for MockLedgerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LedgerClient for MockLedgerClient {
    async fn deploy(
        &self,
        _artifact: &SettlementArtifact,
        params: &DeployParams,
    ) -> Result<DeployReceipt, EngineError> {
        if self.fail_deploy.load(Ordering::SeqCst) {
            return Err(unavailable(Collaborator::Ledger, "broadcast failed"));
        }
        self.calls.lock().unwrap().push(LedgerCall::Deploy {
            params: params.clone(),
        });
        let n = self.next_id();
        Ok(DeployReceipt {
            tx_id: format!("tx-{n}"),
            contract_address: format!("contract-{n}"),
        })
    }

    async fn invoke(
        &self,
        contract: &ContractAddress,
        function: LedgerFunction,
    ) -> Result<InvokeReceipt, EngineError> {
        if self.fail_invoke.load(Ordering::SeqCst) {
            return Err(unavailable(Collaborator::Ledger, "broadcast failed"));
        }
        let tx_id = format!("tx-{}", self.next_id());
        if let LedgerFunction::ReleaseMilestone { sequence, .. } = function {
            self.released
                .lock()
                .unwrap()
                .insert((contract.clone(), sequence), tx_id.clone());
        }
        self.calls.lock().unwrap().push(LedgerCall::Invoke {
            contract: contract.clone(),
            function,
        });
        Ok(InvokeReceipt { tx_id })
    }

    async fn tx_status(&self, tx_id: &TxId) -> Result<TxStatus, EngineError> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(unavailable(Collaborator::Ledger, "rpc timeout"));
        }
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(tx_id)
            .cloned()
            .unwrap_or(TxStatus::Pending))
    }

    async fn milestone_released(
        &self,
        contract: &ContractAddress,
        sequence: u32,
    ) -> Result<Option<TxId>, EngineError> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(unavailable(Collaborator::Ledger, "rpc timeout"));
        }
        Ok(self
            .released
            .lock()
            .unwrap()
            .get(&(contract.clone(), sequence))
            .cloned())
    }
}

// =============================================================================
// Document Store
// =============================================================================

/// Fake content-addressed store hashing blobs with SHA-256.
pub struct MockDocumentStore {
    blobs: Mutex<HashMap<ContentHash, Value>>,
    fail: AtomicBool,
}

impl MockDocumentStore {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MockDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn content_hash(blob: &Value) -> ContentHash {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(blob.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait::async_trait]
impl DocumentStore for MockDocumentStore {
    async fn put(&self, blob: &Value) -> Result<ContentHash, EngineError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable(Collaborator::DocumentStore, "storage down"));
        }
        let hash = content_hash(blob);
        self.blobs.lock().unwrap().insert(hash.clone(), blob.clone());
        Ok(hash)
    }

    async fn get(&self, hash: &ContentHash) -> Result<Value, EngineError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable(Collaborator::DocumentStore, "storage down"));
        }
        self.blobs
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("document {hash}")))
    }
}
