use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::{
    error::LedgerResult,
    models::{Obligation, ObligationFilter, PartySummary, Payment, TenantId},
    status::ObligationStatus,
};

/// New values for an obligation, applied only if the stored row is still at
/// `expected_version`.
#[derive(Debug, Clone, PartialEq)]
pub struct ObligationUpdate {
    pub obligation_id: Uuid,
    pub expected_version: i64,
    pub paid_amount: Decimal,
    pub status: ObligationStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub waived_by: Option<String>,
    pub waiver_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ObligationUpdate {
    /// Starts from the current row, so unchanged fields carry over.
    pub fn from_current(obligation: &Obligation, updated_at: DateTime<Utc>) -> Self {
        Self {
            obligation_id: obligation.id,
            expected_version: obligation.version,
            paid_amount: obligation.paid_amount,
            status: obligation.status,
            resolved_at: obligation.resolved_at,
            waived_by: obligation.waived_by.clone(),
            waiver_reason: obligation.waiver_reason.clone(),
            updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostedPayment {
    pub payment: Payment,
    pub obligation: Obligation,
    pub party: PartySummary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartySummaryUpdate {
    pub party_id: Uuid,
    pub expected_version: i64,
    pub total_paid: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Tenant-scoped persistence for obligations, payments and party summaries.
///
/// Rows belonging to another tenant behave exactly like missing rows.
/// Conditional updates fail with `StoreConflict` when the version moved.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_party(&self, party: PartySummary) -> LedgerResult<PartySummary>;
    async fn get_party_summary(&self, tenant: TenantId, party_id: Uuid)
    -> LedgerResult<PartySummary>;
    async fn list_parties(&self, tenant: TenantId) -> LedgerResult<Vec<PartySummary>>;
    async fn update_party_summary(
        &self,
        tenant: TenantId,
        update: PartySummaryUpdate,
    ) -> LedgerResult<PartySummary>;

    async fn insert_obligation(&self, obligation: Obligation) -> LedgerResult<Obligation>;
    async fn get_obligation(&self, tenant: TenantId, id: Uuid) -> LedgerResult<Obligation>;
    async fn list_obligations(
        &self,
        tenant: TenantId,
        filter: &ObligationFilter,
    ) -> LedgerResult<Vec<Obligation>>;
    async fn update_obligation(
        &self,
        tenant: TenantId,
        update: ObligationUpdate,
    ) -> LedgerResult<Obligation>;

    /// Applies `payment` to its obligation as the row stands at write time,
    /// inserts the payment and adds the amount to the party total, as one
    /// unit. The obligation row stays locked for the whole unit, so
    /// concurrent postings queue instead of conflicting. A rejected tender
    /// writes nothing.
    async fn post_payment(&self, tenant: TenantId, payment: Payment)
    -> LedgerResult<PostedPayment>;
    async fn list_payments(&self, tenant: TenantId, obligation_id: Uuid)
    -> LedgerResult<Vec<Payment>>;
    async fn party_payment_total(&self, tenant: TenantId, party_id: Uuid) -> LedgerResult<Decimal>;

    async fn list_tenants(&self) -> LedgerResult<Vec<TenantId>>;
}
