//! Recomputes cached aggregates from the payment ledger.
//!
//! Payments are the source of truth. An obligation's `paid_amount` and a
//! party's `total_paid` are caches; these passes detect drift (rows written
//! by older code, manual edits, restored backups) and rewrite the caches with
//! the same version checks the payment path uses.

use chrono::Utc;
use rust_decimal::Decimal;
use scholar_core::{
    LedgerResult, LedgerStore, ObligationFilter, ObligationStatus, ObligationUpdate,
    PartySummaryUpdate,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::service::TenantLedger;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObligationReconciliation {
    pub obligation_id: Uuid,
    pub party_id: Uuid,
    pub stored_paid: Decimal,
    pub ledger_paid: Decimal,
    pub stored_status: ObligationStatus,
    pub status: ObligationStatus,
    pub corrected: bool,
    /// Ledger total above principal; only legacy rows can get here.
    pub overpaid: bool,
    /// Stored as `paid` but the ledger total falls short of the principal.
    /// The status is kept; the shortfall needs a manual follow-up.
    pub short_paid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyReconciliation {
    pub party_id: Uuid,
    pub stored_total: Decimal,
    pub ledger_total: Decimal,
    pub corrected: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantReconciliation {
    pub obligations_checked: usize,
    pub obligations_corrected: usize,
    pub parties_checked: usize,
    pub parties_corrected: usize,
    pub overpaid_obligations: Vec<Uuid>,
    pub short_paid_obligations: Vec<Uuid>,
}

impl<S: LedgerStore> TenantLedger<'_, S> {
    pub async fn reconcile_obligation(
        &self,
        obligation_id: Uuid,
    ) -> LedgerResult<ObligationReconciliation> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let obligation = self
                .store()
                .get_obligation(self.tenant, obligation_id)
                .await?;
            let ledger_paid: Decimal = self
                .store()
                .list_payments(self.tenant, obligation_id)
                .await?
                .iter()
                .map(|payment| payment.amount)
                .sum();

            // Terminal states are final; only the cached amount is rewritten.
            let status = if obligation.status.is_terminal() {
                obligation.status
            } else {
                ObligationStatus::derive(obligation.principal_amount, ledger_paid)
            };

            let mut report = ObligationReconciliation {
                obligation_id,
                party_id: obligation.party_id,
                stored_paid: obligation.paid_amount,
                ledger_paid,
                stored_status: obligation.status,
                status,
                corrected: false,
                overpaid: ledger_paid > obligation.principal_amount,
                short_paid: obligation.status == ObligationStatus::Paid
                    && ledger_paid < obligation.principal_amount,
            };

            if report.short_paid {
                warn!(
                    tenant = %self.tenant,
                    obligation_id = %obligation_id,
                    ledger_paid = %ledger_paid,
                    principal = %obligation.principal_amount,
                    "paid obligation is short of its principal in the payment ledger"
                );
            }

            if ledger_paid == obligation.paid_amount && status == obligation.status {
                return Ok(report);
            }

            let now = Utc::now();
            let mut update = ObligationUpdate::from_current(&obligation, now);
            update.paid_amount = ledger_paid;
            update.status = status;
            update.resolved_at = if status.is_terminal() {
                obligation.resolved_at.or(Some(now))
            } else {
                None
            };

            match self.store().update_obligation(self.tenant, update).await {
                Ok(_) => {
                    warn!(
                        tenant = %self.tenant,
                        obligation_id = %obligation_id,
                        stored_paid = %report.stored_paid,
                        ledger_paid = %ledger_paid,
                        stored_status = %report.stored_status,
                        status = %status,
                        "obligation drifted from payment ledger, corrected"
                    );
                    report.corrected = true;
                    return Ok(report);
                }
                Err(err) if self.retry().should_retry(&err, attempt) => {}
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn reconcile_party(&self, party_id: Uuid) -> LedgerResult<PartyReconciliation> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            // The summary is read before the ledger total: any payment posted
            // in between bumps the version and the write below conflicts.
            let summary = self
                .store()
                .get_party_summary(self.tenant, party_id)
                .await?;
            let ledger_total = self
                .store()
                .party_payment_total(self.tenant, party_id)
                .await?;

            let mut report = PartyReconciliation {
                party_id,
                stored_total: summary.total_paid,
                ledger_total,
                corrected: false,
            };
            if summary.total_paid == ledger_total {
                return Ok(report);
            }

            let update = PartySummaryUpdate {
                party_id,
                expected_version: summary.version,
                total_paid: ledger_total,
                updated_at: Utc::now(),
            };
            match self.store().update_party_summary(self.tenant, update).await {
                Ok(_) => {
                    warn!(
                        tenant = %self.tenant,
                        party_id = %party_id,
                        stored_total = %report.stored_total,
                        ledger_total = %ledger_total,
                        "party total drifted from payment ledger, corrected"
                    );
                    report.corrected = true;
                    return Ok(report);
                }
                Err(err) if self.retry().should_retry(&err, attempt) => {}
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn reconcile_tenant(&self) -> LedgerResult<TenantReconciliation> {
        let mut summary = TenantReconciliation::default();

        let obligations = self
            .store()
            .list_obligations(self.tenant, &ObligationFilter::default())
            .await?;
        for obligation in obligations {
            let report = self.reconcile_obligation(obligation.id).await?;
            summary.obligations_checked += 1;
            if report.corrected {
                summary.obligations_corrected += 1;
            }
            if report.overpaid {
                summary.overpaid_obligations.push(report.obligation_id);
            }
            if report.short_paid {
                summary.short_paid_obligations.push(report.obligation_id);
            }
        }

        for party in self.store().list_parties(self.tenant).await? {
            let report = self.reconcile_party(party.party_id).await?;
            summary.parties_checked += 1;
            if report.corrected {
                summary.parties_corrected += 1;
            }
        }

        info!(
            tenant = %self.tenant,
            obligations_checked = summary.obligations_checked,
            obligations_corrected = summary.obligations_corrected,
            parties_checked = summary.parties_checked,
            parties_corrected = summary.parties_corrected,
            "tenant reconciliation finished"
        );
        Ok(summary)
    }
}
