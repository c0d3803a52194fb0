//! # Plan and Invariant Validation
//!
//! Pure checks enforced before state leaves `Draft` and before any release
//! commits. Amount comparisons are exact integer matches in ledger base
//! units, zero tolerance.

use crate::ports::outbound::MilestonePlan;
use shared_types::{Approval, EngineError, Invoice, Milestone};

/// Upper bound on currency decimal places. 18 covers wei-style bases;
/// anything larger is a drafting defect, not a real currency.
pub const MAX_CURRENCY_DECIMALS: u32 = 18;

/// Validate a drafted milestone plan before anything is persisted.
///
/// Rejects with `ValidationFailed`:
/// - an empty milestone list
/// - a zero-amount milestone
/// - unreasonable currency decimals
/// - a milestone sum that overflows u128 in ledger units
/// - milestone amounts that do not sum exactly to the total in ledger units
pub fn validate_plan(plan: &MilestonePlan) -> Result<(), EngineError> {
    if plan.milestones.is_empty() {
        return Err(EngineError::validation("plan has no milestones"));
    }
    if plan.currency.decimals > MAX_CURRENCY_DECIMALS {
        return Err(EngineError::validation(format!(
            "currency decimals {} exceed maximum {}",
            plan.currency.decimals, MAX_CURRENCY_DECIMALS
        )));
    }
    if let Some(pos) = plan.milestones.iter().position(|m| m.amount == 0) {
        return Err(EngineError::validation(format!(
            "milestone {} has zero amount",
            pos + 1
        )));
    }

    let total_ledger = plan.currency.to_ledger_units(plan.total_amount);
    let sum_ledger = plan
        .milestones
        .iter()
        .try_fold(0u128, |sum, m| {
            sum.checked_add(plan.currency.to_ledger_units(m.amount))
        })
        .ok_or_else(|| EngineError::validation("milestone amounts overflow ledger units"))?;

    if sum_ledger != total_ledger {
        return Err(EngineError::validation(format!(
            "milestone amounts sum to {sum_ledger} ledger units, expected {total_ledger}"
        )));
    }

    Ok(())
}

/// Re-check the balance invariant on a persisted invoice:
/// `sum(milestone.ledger_amount) == invoice.total_ledger_amount`.
///
/// Holds from the moment the invoice leaves `Draft` onward; checked again
/// before redeployment.
pub fn invoice_balances(invoice: &Invoice, milestones: &[Milestone]) -> Result<(), EngineError> {
    let sum = milestones
        .iter()
        .try_fold(0u128, |sum, m| sum.checked_add(m.ledger_amount))
        .ok_or_else(|| EngineError::validation("milestone ledger amounts overflow"))?;
    if sum != invoice.total_ledger_amount {
        return Err(EngineError::validation(format!(
            "invoice {} milestones sum to {sum} ledger units, expected {}",
            invoice.id, invoice.total_ledger_amount
        )));
    }
    Ok(())
}

/// Majority quorum for N recorded approval votes: `ceil(N/2)`.
///
/// With an even N an exact split passes (2 of 4 meets a threshold of 2).
/// That edge is a deliberate carry-over of the observed rule; tightening
/// it to a strict majority is a product decision, not an engine one.
pub fn quorum_threshold(votes: usize) -> usize {
    votes.div_ceil(2)
}

/// Whether the recorded votes for a milestone permit release.
///
/// A milestone with no approval records has no approval gate and may be
/// released directly.
pub fn release_permitted(approvals: &[Approval]) -> bool {
    if approvals.is_empty() {
        return true;
    }
    let approved = approvals.iter().filter(|a| a.approved).count();
    approved >= quorum_threshold(approvals.len())
}
