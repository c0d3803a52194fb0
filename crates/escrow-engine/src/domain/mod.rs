//! # Domain Logic
//!
//! Pure validation and bookkeeping rules for the escrow lifecycle.
//! Everything here is side-effect free and synchronous; the service layer
//! owns I/O and commits.

pub mod pending;
pub mod validation;

pub use pending::{PendingTx, PendingTxKind};
pub use validation::{
    invoice_balances, quorum_threshold, release_permitted, validate_plan, MAX_CURRENCY_DECIMALS,
};
