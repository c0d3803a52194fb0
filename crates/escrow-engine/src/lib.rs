//! # Invoice Escrow Lifecycle Engine
//!
//! Coordinates milestone-based escrow invoices that settle on an external
//! ledger. The engine owns the authoritative local state machines and the
//! four protocols that drive them:
//!
//! 1. **Create**: draft text → validated plan → persisted `Draft` →
//!    deployed settlement contract.
//! 2. **Release**: client-authorized milestone payout, ledger invoke
//!    strictly before the local `Released` commit.
//! 3. **Dispute/Resolve**: local-first dispute blocking all releases,
//!    arbitrator-only on-ledger resolution.
//! 4. **Confirmation Reconciliation**: background sweep converging
//!    optimistic local state with ledger verdicts.
//!
//! ## Architecture
//!
//! Hexagonal: [`ports::inbound::EscrowApi`] is the API surface,
//! [`ports::outbound`] holds the traits for the state store, ledger
//! client, drafting service, document store, and clock. [`service`] is
//! the engine proper, [`reconciler`] the confirmation loop, and
//! [`adapters`] the in-process implementations.
//!
//! ```text
//!             ┌────────────────────────────┐
//!  EscrowApi →│      LifecycleEngine       │→ LedgerClient
//!             │  (state machines, commits) │→ DraftingService
//!             │                            │→ DocumentStore
//!             └──────────┬─────────────────┘
//!                        │ StateStore (atomic, versioned)
//!             ┌──────────┴─────────────────┐
//!             │  ConfirmationReconciler    │→ LedgerClient (tx_status)
//!             └────────────────────────────┘
//! ```

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod reconciler;
pub mod service;

/// Mock collaborators and fixtures shared with the workspace test suite.
pub mod test_utils;

pub use adapters::MemoryStateStore;
pub use ports::inbound::{
    CreateInvoiceRequest, CreateInvoiceResponse, DeploymentOutcome, EscrowApi, ReleaseReceipt,
};
pub use ports::outbound::{
    Clock, DocumentStore, DraftingService, LedgerClient, StateStore, SystemClock, TxStatus,
};
pub use reconciler::{ConfirmationReconciler, ReconcilerConfig};
pub use service::LifecycleEngine;
