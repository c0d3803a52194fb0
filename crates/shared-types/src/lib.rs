//! # shared-types
//!
//! Domain entities and shared type definitions for the Escrow-Chain
//! workspace. Single Source of Truth for:
//!
//! - Invoice / Milestone / Approval / Dispute entities and their status
//!   machines
//! - The append-only audit [`EventRecord`]
//! - The tagged error taxonomy ([`EngineError`], [`StoreError`])
//! - The pure permission calculation ([`permissions_for`])

pub mod entities;
pub mod errors;
pub mod events;
pub mod permissions;

pub use entities::{
    Address, Approval, ContentHash, ContractAddress, Currency, Dispute, DisputeId, DisputeStatus,
    Invoice, InvoiceId, InvoiceStatus, Milestone, MilestoneId, MilestoneStatus, Timestamp, TxId,
};
pub use errors::{Collaborator, EngineError, StoreError};
pub use events::{EventKind, EventRecord, NewEvent};
pub use permissions::{permissions_for, PermissionSet, Role};
