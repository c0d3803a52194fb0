//! # Ports
//!
//! Hexagonal boundaries of the engine: the inbound API surface and the
//! outbound traits for the state store and the three external
//! collaborators. All collaborators are explicit injected dependencies so
//! tests can substitute fakes with controllable latency and failure modes.

pub mod inbound;
pub mod outbound;

pub use inbound::{
    CreateInvoiceRequest, CreateInvoiceResponse, DeploymentOutcome, EscrowApi, ReleaseReceipt,
};
pub use outbound::{
    Clock, DeployParams, DeployReceipt, DocumentStore, DraftingService, InvoiceRecord,
    InvokeReceipt, LedgerClient, LedgerFunction, MilestonePlan, PlannedMilestone, ReleaseClaim,
    SettlementArtifact, StaleClaim, StateStore, StoreOp, StoreTransaction, SystemClock, TxStatus,
};
