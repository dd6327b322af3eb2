use chrono::Utc;
use rust_decimal::Decimal;
use scholar_core::{
    LedgerError, LedgerResult, LedgerStore, Obligation, ObligationFilter, ObligationKind,
    ObligationStatus, ObligationUpdate, PartySummary, Payment, PaymentMethod, TenantId,
    apply_tender, validate_money, waive,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 5;

/// How many times a conflicting waiver or reconciliation write is recomputed
/// before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub(crate) fn should_retry(&self, err: &LedgerError, attempt: u32) -> bool {
        err.is_conflict() && attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CONFLICT_ATTEMPTS)
    }
}

#[derive(Debug, Clone)]
pub struct NewParty {
    pub party_id: Option<Uuid>,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct NewObligation {
    pub party_id: Uuid,
    pub kind: ObligationKind,
    pub description: String,
    pub currency: String,
    pub principal_amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct Tender {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub collected_by: String,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub obligation: Obligation,
    pub party: PartySummary,
}

pub struct LedgerService<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: LedgerStore> LedgerService<S> {
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Every ledger operation goes through a tenant handle.
    pub fn for_tenant(&self, tenant: TenantId) -> TenantLedger<'_, S> {
        TenantLedger {
            service: self,
            tenant,
        }
    }
}

pub struct TenantLedger<'a, S> {
    pub(crate) service: &'a LedgerService<S>,
    pub(crate) tenant: TenantId,
}

impl<S: LedgerStore> TenantLedger<'_, S> {
    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub(crate) fn store(&self) -> &S {
        &self.service.store
    }

    pub(crate) fn retry(&self) -> RetryPolicy {
        self.service.retry
    }

    pub async fn register_party(&self, request: NewParty) -> LedgerResult<PartySummary> {
        let display_name = required_text(&request.display_name, "display_name")?;
        let now = Utc::now();

        let party = self
            .store()
            .insert_party(PartySummary {
                party_id: request.party_id.unwrap_or_else(Uuid::new_v4),
                tenant_id: self.tenant,
                display_name,
                total_paid: Decimal::ZERO,
                version: 0,
                created_at: now,
                updated_at: now,
            })
            .await?;

        info!(tenant = %self.tenant, party_id = %party.party_id, "party registered");
        Ok(party)
    }

    pub async fn party_summary(&self, party_id: Uuid) -> LedgerResult<PartySummary> {
        self.store().get_party_summary(self.tenant, party_id).await
    }

    pub async fn create_obligation(&self, request: NewObligation) -> LedgerResult<Obligation> {
        let principal_amount = validate_money(request.principal_amount, "principal_amount")?;
        let description = required_text(&request.description, "description")?;
        let currency = normalize_currency(&request.currency)?;

        // Confirms the party exists in this tenant.
        self.store()
            .get_party_summary(self.tenant, request.party_id)
            .await?;

        let now = Utc::now();
        let obligation = self
            .store()
            .insert_obligation(Obligation {
                id: Uuid::new_v4(),
                tenant_id: self.tenant,
                party_id: request.party_id,
                kind: request.kind,
                description,
                currency,
                principal_amount,
                paid_amount: Decimal::ZERO,
                status: ObligationStatus::Pending,
                version: 0,
                created_at: now,
                updated_at: now,
                resolved_at: None,
                waived_by: None,
                waiver_reason: None,
            })
            .await?;

        info!(
            tenant = %self.tenant,
            obligation_id = %obligation.id,
            party_id = %obligation.party_id,
            kind = obligation.kind.as_str(),
            principal = %obligation.principal_amount,
            "obligation created"
        );
        Ok(obligation)
    }

    pub async fn obligation(&self, obligation_id: Uuid) -> LedgerResult<Obligation> {
        self.store().get_obligation(self.tenant, obligation_id).await
    }

    pub async fn obligations(&self, filter: &ObligationFilter) -> LedgerResult<Vec<Obligation>> {
        self.store().list_obligations(self.tenant, filter).await
    }

    pub async fn payments(&self, obligation_id: Uuid) -> LedgerResult<Vec<Payment>> {
        self.store().list_payments(self.tenant, obligation_id).await
    }

    /// Records one tender against an obligation.
    ///
    /// Validation failures return before anything is written. The tender is
    /// checked here against the row as read, then applied by the store under
    /// the obligation's row lock, so overlapping tenders queue rather than
    /// fail.
    pub async fn apply_payment(
        &self,
        obligation_id: Uuid,
        tender: Tender,
    ) -> LedgerResult<PaymentReceipt> {
        let collected_by = required_text(&tender.collected_by, "collected_by")?;
        let remarks = optional_text(tender.remarks.as_deref());
        let amount = validate_money(tender.amount, "tendered_amount")?;

        let obligation = self
            .store()
            .get_obligation(self.tenant, obligation_id)
            .await?;
        apply_tender(
            obligation.id,
            obligation.principal_amount,
            obligation.paid_amount,
            obligation.status,
            amount,
        )?;

        let payment = Payment {
            id: Uuid::new_v4(),
            obligation_id: obligation.id,
            tenant_id: self.tenant,
            party_id: obligation.party_id,
            amount,
            currency: obligation.currency,
            method: tender.method,
            collected_by,
            recorded_at: Utc::now(),
            remarks,
        };
        let posted = self.store().post_payment(self.tenant, payment).await?;

        info!(
            tenant = %self.tenant,
            obligation_id = %posted.obligation.id,
            payment_id = %posted.payment.id,
            amount = %posted.payment.amount,
            method = posted.payment.method.as_str(),
            status = %posted.obligation.status,
            "payment recorded"
        );

        Ok(PaymentReceipt {
            payment: posted.payment,
            obligation: posted.obligation,
            party: posted.party,
        })
    }

    /// Closes an open obligation without payment. The party total is left
    /// untouched and no payment row is written.
    pub async fn waive_obligation(
        &self,
        obligation_id: Uuid,
        waived_by: &str,
        reason: Option<&str>,
    ) -> LedgerResult<Obligation> {
        let waived_by = required_text(waived_by, "waived_by")?;
        let reason = optional_text(reason);

        let mut attempt = 0;
        let obligation = loop {
            attempt += 1;

            let obligation = self
                .store()
                .get_obligation(self.tenant, obligation_id)
                .await?;
            let status = waive(obligation.id, obligation.status)?;

            let now = Utc::now();
            let mut update = ObligationUpdate::from_current(&obligation, now);
            update.status = status;
            update.resolved_at = Some(now);
            update.waived_by = Some(waived_by.clone());
            update.waiver_reason = reason.clone();

            match self.store().update_obligation(self.tenant, update).await {
                Ok(obligation) => break obligation,
                Err(err) if self.retry().should_retry(&err, attempt) => {
                    warn!(
                        tenant = %self.tenant,
                        obligation_id = %obligation_id,
                        attempt,
                        "waiver conflicted, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        };

        info!(
            tenant = %self.tenant,
            obligation_id = %obligation.id,
            waived_by = %waived_by,
            outstanding = %obligation.outstanding(),
            "obligation waived"
        );
        Ok(obligation)
    }
}

fn required_text(value: &str, field: &str) -> LedgerResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::InvalidRequest(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

fn optional_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn normalize_currency(value: &str) -> LedgerResult<String> {
    let normalized = value.trim().to_ascii_uppercase();
    if normalized.len() != 3 || !normalized.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(LedgerError::InvalidRequest(
            "currency must be a 3-letter code".to_string(),
        ));
    }
    Ok(normalized)
}
