//! Shared wiring: one engine instance over the in-memory store with every
//! collaborator replaced by a controllable fake.

use escrow_engine::ports::inbound::{CreateInvoiceRequest, EscrowApi};
use escrow_engine::ports::outbound::{InvoiceRecord, StateStore};
use escrow_engine::test_utils::{
    make_plan, ManualClock, MockDocumentStore, MockDraftingService, MockLedgerClient, ARBITRATOR,
    CLIENT, CONTRACTOR,
};
use escrow_engine::{ConfirmationReconciler, LifecycleEngine, MemoryStateStore, ReconcilerConfig};
use shared_bus::InMemoryEventBus;
use shared_types::{InvoiceId, MilestoneId};
use std::sync::Arc;
use std::time::Duration;

/// Install a logging subscriber for the test run; repeat calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub type TestEngine =
    LifecycleEngine<MemoryStateStore, MockLedgerClient, MockDraftingService, MockDocumentStore>;

pub struct TestEnv {
    pub store: Arc<MemoryStateStore>,
    pub ledger: Arc<MockLedgerClient>,
    pub drafting: Arc<MockDraftingService>,
    pub documents: Arc<MockDocumentStore>,
    pub clock: Arc<ManualClock>,
    pub bus: Arc<InMemoryEventBus>,
    pub engine: Arc<TestEngine>,
}

impl TestEnv {
    /// Engine wired to fakes, drafting scripted to return a plan with the
    /// given milestone amounts.
    pub fn new(amounts: &[u64]) -> Self {
        init_tracing();
        let store = Arc::new(MemoryStateStore::new());
        let ledger = Arc::new(MockLedgerClient::new());
        let drafting = Arc::new(MockDraftingService::with_plan(make_plan(amounts)));
        let documents = Arc::new(MockDocumentStore::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let bus = Arc::new(InMemoryEventBus::new());
        let engine = Arc::new(LifecycleEngine::new(
            store.clone(),
            ledger.clone(),
            drafting.clone(),
            documents.clone(),
            clock.clone(),
            bus.clone(),
        ));
        Self {
            store,
            ledger,
            drafting,
            documents,
            clock,
            bus,
            engine,
        }
    }

    /// Reconciler over the same store and ledger, tuned for tests: tight
    /// backoff, ten-minute hard timeout. Driven by explicit `sweep()`.
    pub fn reconciler(&self) -> ConfirmationReconciler<MemoryStateStore, MockLedgerClient> {
        ConfirmationReconciler::new(
            self.store.clone(),
            self.ledger.clone(),
            self.clock.clone(),
            self.bus.clone(),
            ReconcilerConfig {
                poll_interval: Duration::from_millis(10),
                backoff_base_secs: 1,
                backoff_max_secs: 4,
                tx_timeout_secs: 600,
            },
        )
    }

    /// Standard create request: CLIENT pays CONTRACTOR, ARBITRATOR set.
    pub fn request(&self) -> CreateInvoiceRequest {
        CreateInvoiceRequest {
            draft_text: "Website build, two tranches on delivery".to_string(),
            client: CLIENT,
            contractor: CONTRACTOR,
            arbitrator: Some(ARBITRATOR),
            title: Some("Website build".to_string()),
            metadata: None,
        }
    }

    /// Create an invoice through the full protocol; the fake ledger
    /// accepts the deployment, so the invoice lands in `Deployed`.
    pub async fn create_deployed(&self) -> InvoiceId {
        let response = self.engine.create_invoice(self.request()).await.unwrap();
        response.invoice_id
    }

    pub fn record(&self, invoice_id: &InvoiceId) -> InvoiceRecord {
        self.store.load_invoice(invoice_id).unwrap()
    }

    /// Id of the milestone with the given 1-based sequence.
    pub fn milestone_id(&self, invoice_id: &InvoiceId, sequence: u32) -> MilestoneId {
        self.record(invoice_id)
            .milestones
            .iter()
            .find(|m| m.sequence == sequence)
            .map(|m| m.id)
            .unwrap()
    }
}
