//! # Permission Calculation
//!
//! A pure function of (invoice snapshot, requesting identity) to a
//! capability set. No side effects, never cached or stored: any caller
//! re-derives the identical set from the same snapshot.

use crate::entities::{Address, Invoice, InvoiceStatus};
use serde::{Deserialize, Serialize};

/// Role derived solely from identity equality against the invoice parties.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Client,
    Contractor,
    Arbitrator,
    /// Identity matches no party on the invoice.
    Observer,
}

/// The capability set for one identity on one invoice snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub role: Role,
    pub can_release: bool,
    pub can_approve: bool,
    pub can_dispute: bool,
    pub can_cancel: bool,
}

/// Compute the capability set for `identity` against an invoice snapshot.
///
/// - Release authority is a closed capability of the client alone.
/// - Approval votes come from the oversight roles: client and arbitrator.
/// - Either contracting party may raise a dispute.
/// - Cancellation is client-only and `Draft`-only.
///
/// When the arbitrator defaults to the client, the identity reports the
/// `Client` role and carries both capability sets.
pub fn permissions_for(invoice: &Invoice, identity: &Address) -> PermissionSet {
    let is_client = *identity == invoice.client;
    let is_contractor = *identity == invoice.contractor;
    let is_arbitrator = *identity == invoice.arbitrator;

    let role = if is_client {
        Role::Client
    } else if is_contractor {
        Role::Contractor
    } else if is_arbitrator {
        Role::Arbitrator
    } else {
        Role::Observer
    };

    let releasable = invoice.status.is_releasable();

    PermissionSet {
        role,
        can_release: is_client && releasable,
        can_approve: (is_client || is_arbitrator) && releasable,
        can_dispute: (is_client || is_contractor) && releasable,
        can_cancel: is_client && invoice.status == InvoiceStatus::Draft,
    }
}
