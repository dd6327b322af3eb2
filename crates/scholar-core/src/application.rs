//! Payment application and the waiver transition.
//!
//! These are the only places an [`ObligationStatus`] is produced for a stored
//! obligation. Both are pure: callers persist the result.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{LedgerError, LedgerResult},
    models::{Obligation, Payment},
    status::ObligationStatus,
};

/// Fractional digits allowed on any monetary amount.
pub const MONEY_SCALE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedTender {
    pub paid_amount: Decimal,
    pub status: ObligationStatus,
    pub outstanding: Decimal,
    /// The tender moved the obligation into `Paid`.
    pub newly_resolved: bool,
}

/// Rejects zero, negative, and sub-cent amounts.
pub fn validate_money(amount: Decimal, field: &str) -> LedgerResult<Decimal> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount(format!(
            "{field} must be positive, got {amount}"
        )));
    }
    if amount.normalize().scale() > MONEY_SCALE {
        return Err(LedgerError::InvalidAmount(format!(
            "{field} must have at most {MONEY_SCALE} decimal places, got {amount}"
        )));
    }

    Ok(amount.round_dp(MONEY_SCALE))
}

/// Computes the state of an obligation after accepting `tendered`.
///
/// Tenders larger than the outstanding balance are refused, so
/// `paid_amount <= principal_amount` holds for every accepted payment.
pub fn apply_tender(
    obligation_id: Uuid,
    principal_amount: Decimal,
    paid_amount: Decimal,
    status: ObligationStatus,
    tendered: Decimal,
) -> LedgerResult<AppliedTender> {
    let tendered = validate_money(tendered, "tendered_amount")?;

    if status.is_terminal() {
        return Err(LedgerError::ObligationClosed {
            id: obligation_id,
            status,
        });
    }

    let outstanding = (principal_amount - paid_amount).max(Decimal::ZERO);
    if tendered > outstanding {
        return Err(LedgerError::Overpayment {
            tendered,
            outstanding,
        });
    }

    let new_paid = paid_amount + tendered;
    let new_status = ObligationStatus::derive(principal_amount, new_paid);

    Ok(AppliedTender {
        paid_amount: new_paid,
        status: new_status,
        outstanding: principal_amount - new_paid,
        newly_resolved: new_status == ObligationStatus::Paid,
    })
}

/// Applies `payment` to `obligation` in place and bumps its version.
///
/// Stores call this while holding the obligation row, so the tender is
/// checked against every payment committed before it. On error the
/// obligation is left untouched.
pub fn settle_payment(
    obligation: &mut Obligation,
    payment: &Payment,
) -> LedgerResult<AppliedTender> {
    if payment.obligation_id != obligation.id
        || payment.tenant_id != obligation.tenant_id
        || payment.party_id != obligation.party_id
    {
        return Err(LedgerError::InvalidRequest(
            "payment does not belong to the posted obligation".to_string(),
        ));
    }
    if payment.currency != obligation.currency {
        return Err(LedgerError::InvalidRequest(format!(
            "payment currency {} does not match obligation currency {}",
            payment.currency, obligation.currency
        )));
    }

    let applied = apply_tender(
        obligation.id,
        obligation.principal_amount,
        obligation.paid_amount,
        obligation.status,
        payment.amount,
    )?;

    obligation.paid_amount = applied.paid_amount;
    obligation.status = applied.status;
    if applied.newly_resolved {
        obligation.resolved_at = Some(payment.recorded_at);
    }
    obligation.updated_at = payment.recorded_at;
    obligation.version += 1;
    Ok(applied)
}

/// Administrative waiver: `Pending | Partial -> Waived`.
pub fn waive(obligation_id: Uuid, status: ObligationStatus) -> LedgerResult<ObligationStatus> {
    if status.is_terminal() {
        return Err(LedgerError::ObligationClosed {
            id: obligation_id,
            status,
        });
    }

    Ok(ObligationStatus::Waived)
}
