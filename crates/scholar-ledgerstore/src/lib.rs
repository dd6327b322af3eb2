use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use rust_decimal::Decimal;
use scholar_core::{
    LedgerError, LedgerResult, LedgerStore, Obligation, ObligationFilter, ObligationUpdate,
    PartySummary, PartySummaryUpdate, Payment, PostedPayment, TenantId, settle_payment,
};
use tokio::sync::RwLock;
use uuid::Uuid;

type RowKey = (TenantId, Uuid);

#[derive(Default)]
struct LedgerTables {
    parties: HashMap<RowKey, PartySummary>,
    obligations: HashMap<RowKey, Obligation>,
    payments: Vec<Payment>,
}

impl LedgerTables {
    fn obligation_mut(&mut self, tenant: TenantId, id: Uuid) -> LedgerResult<&mut Obligation> {
        self.obligations
            .get_mut(&(tenant, id))
            .ok_or_else(|| LedgerError::obligation_not_found(id))
    }

    fn check_version(obligation: &Obligation, expected_version: i64) -> LedgerResult<()> {
        if obligation.version != expected_version {
            return Err(LedgerError::StoreConflict {
                entity: "obligation",
                id: obligation.id,
            });
        }
        Ok(())
    }
}

fn apply_update(obligation: &mut Obligation, update: ObligationUpdate) {
    obligation.paid_amount = update.paid_amount;
    obligation.status = update.status;
    obligation.resolved_at = update.resolved_at;
    obligation.waived_by = update.waived_by;
    obligation.waiver_reason = update.waiver_reason;
    obligation.updated_at = update.updated_at;
    obligation.version += 1;
}

/// Process-local ledger store. One lock covers every table, so a posting is
/// atomic with respect to all other operations.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    tables: RwLock<LedgerTables>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert_party(&self, party: PartySummary) -> LedgerResult<PartySummary> {
        let mut tables = self.tables.write().await;
        let key = (party.tenant_id, party.party_id);
        if tables.parties.contains_key(&key) {
            return Err(LedgerError::InvalidRequest(format!(
                "party {} already exists",
                party.party_id
            )));
        }
        tables.parties.insert(key, party.clone());
        Ok(party)
    }

    async fn get_party_summary(
        &self,
        tenant: TenantId,
        party_id: Uuid,
    ) -> LedgerResult<PartySummary> {
        let tables = self.tables.read().await;
        tables
            .parties
            .get(&(tenant, party_id))
            .cloned()
            .ok_or_else(|| LedgerError::party_not_found(party_id))
    }

    async fn list_parties(&self, tenant: TenantId) -> LedgerResult<Vec<PartySummary>> {
        let tables = self.tables.read().await;
        let mut parties: Vec<PartySummary> = tables
            .parties
            .values()
            .filter(|party| party.tenant_id == tenant)
            .cloned()
            .collect();
        parties.sort_by_key(|party| party.created_at);
        Ok(parties)
    }

    async fn update_party_summary(
        &self,
        tenant: TenantId,
        update: PartySummaryUpdate,
    ) -> LedgerResult<PartySummary> {
        let mut tables = self.tables.write().await;
        let party = tables
            .parties
            .get_mut(&(tenant, update.party_id))
            .ok_or_else(|| LedgerError::party_not_found(update.party_id))?;
        if party.version != update.expected_version {
            return Err(LedgerError::StoreConflict {
                entity: "party",
                id: update.party_id,
            });
        }
        party.total_paid = update.total_paid;
        party.version += 1;
        party.updated_at = update.updated_at;
        Ok(party.clone())
    }

    async fn insert_obligation(&self, obligation: Obligation) -> LedgerResult<Obligation> {
        let mut tables = self.tables.write().await;
        let key = (obligation.tenant_id, obligation.id);
        if tables.obligations.contains_key(&key) {
            return Err(LedgerError::InvalidRequest(format!(
                "obligation {} already exists",
                obligation.id
            )));
        }
        tables.obligations.insert(key, obligation.clone());
        Ok(obligation)
    }

    async fn get_obligation(&self, tenant: TenantId, id: Uuid) -> LedgerResult<Obligation> {
        let tables = self.tables.read().await;
        tables
            .obligations
            .get(&(tenant, id))
            .cloned()
            .ok_or_else(|| LedgerError::obligation_not_found(id))
    }

    async fn list_obligations(
        &self,
        tenant: TenantId,
        filter: &ObligationFilter,
    ) -> LedgerResult<Vec<Obligation>> {
        let tables = self.tables.read().await;
        let mut obligations: Vec<Obligation> = tables
            .obligations
            .values()
            .filter(|obligation| obligation.tenant_id == tenant && filter.matches(obligation))
            .cloned()
            .collect();
        obligations.sort_by_key(|obligation| (obligation.created_at, obligation.id));
        if let Some(limit) = filter.limit {
            obligations.truncate(limit);
        }
        Ok(obligations)
    }

    async fn update_obligation(
        &self,
        tenant: TenantId,
        update: ObligationUpdate,
    ) -> LedgerResult<Obligation> {
        let mut tables = self.tables.write().await;
        let obligation = tables.obligation_mut(tenant, update.obligation_id)?;
        LedgerTables::check_version(obligation, update.expected_version)?;
        apply_update(obligation, update);
        Ok(obligation.clone())
    }

    async fn post_payment(
        &self,
        tenant: TenantId,
        payment: Payment,
    ) -> LedgerResult<PostedPayment> {
        if payment.tenant_id != tenant {
            return Err(LedgerError::InvalidRequest(
                "payment does not belong to the posted obligation".to_string(),
            ));
        }

        let mut tables = self.tables.write().await;
        let party_key = (tenant, payment.party_id);
        if !tables.parties.contains_key(&party_key) {
            return Err(LedgerError::party_not_found(payment.party_id));
        }

        let obligation = tables.obligation_mut(tenant, payment.obligation_id)?;
        settle_payment(obligation, &payment)?;
        let obligation = obligation.clone();

        let party = tables
            .parties
            .get_mut(&party_key)
            .ok_or_else(|| LedgerError::party_not_found(payment.party_id))?;
        party.total_paid += payment.amount;
        party.version += 1;
        party.updated_at = payment.recorded_at;
        let party = party.clone();

        tables.payments.push(payment.clone());

        Ok(PostedPayment {
            payment,
            obligation,
            party,
        })
    }

    async fn list_payments(
        &self,
        tenant: TenantId,
        obligation_id: Uuid,
    ) -> LedgerResult<Vec<Payment>> {
        let tables = self.tables.read().await;
        if !tables.obligations.contains_key(&(tenant, obligation_id)) {
            return Err(LedgerError::obligation_not_found(obligation_id));
        }
        Ok(tables
            .payments
            .iter()
            .filter(|payment| payment.tenant_id == tenant && payment.obligation_id == obligation_id)
            .cloned()
            .collect())
    }

    async fn party_payment_total(&self, tenant: TenantId, party_id: Uuid) -> LedgerResult<Decimal> {
        let tables = self.tables.read().await;
        if !tables.parties.contains_key(&(tenant, party_id)) {
            return Err(LedgerError::party_not_found(party_id));
        }
        Ok(tables
            .payments
            .iter()
            .filter(|payment| payment.tenant_id == tenant && payment.party_id == party_id)
            .map(|payment| payment.amount)
            .sum())
    }

    async fn list_tenants(&self) -> LedgerResult<Vec<TenantId>> {
        let tables = self.tables.read().await;
        let tenants: BTreeSet<TenantId> = tables
            .parties
            .keys()
            .chain(tables.obligations.keys())
            .map(|(tenant, _)| *tenant)
            .collect();
        Ok(tenants.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use scholar_core::{ObligationKind, ObligationStatus, PaymentMethod};

    use super::*;

    fn party(tenant: TenantId) -> PartySummary {
        let now = Utc::now();
        PartySummary {
            party_id: Uuid::new_v4(),
            tenant_id: tenant,
            display_name: "Asha Verma".to_string(),
            total_paid: Decimal::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn obligation(tenant: TenantId, party_id: Uuid) -> Obligation {
        let now = Utc::now();
        Obligation {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            party_id,
            kind: ObligationKind::LibraryFine,
            description: "Overdue: Wings of Fire".to_string(),
            currency: "INR".to_string(),
            principal_amount: Decimal::new(120, 0),
            paid_amount: Decimal::ZERO,
            status: ObligationStatus::Pending,
            version: 0,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            waived_by: None,
            waiver_reason: None,
        }
    }

    fn payment(obligation: &Obligation, amount: i64) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            obligation_id: obligation.id,
            tenant_id: obligation.tenant_id,
            party_id: obligation.party_id,
            amount: Decimal::new(amount, 0),
            currency: obligation.currency.clone(),
            method: PaymentMethod::Cash,
            collected_by: "librarian".to_string(),
            recorded_at: Utc::now(),
            remarks: None,
        }
    }

    #[tokio::test]
    async fn other_tenants_see_nothing() {
        let store = InMemoryLedgerStore::new();
        let school_a = TenantId(Uuid::new_v4());
        let school_b = TenantId(Uuid::new_v4());
        let member = store.insert_party(party(school_a)).await.unwrap();
        let fine = store
            .insert_obligation(obligation(school_a, member.party_id))
            .await
            .unwrap();

        assert_eq!(
            store.get_obligation(school_b, fine.id).await.unwrap_err(),
            LedgerError::obligation_not_found(fine.id)
        );
        assert_eq!(
            store
                .get_party_summary(school_b, member.party_id)
                .await
                .unwrap_err(),
            LedgerError::party_not_found(member.party_id)
        );
        assert!(
            store
                .list_obligations(school_b, &ObligationFilter::default())
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            store
                .post_payment(school_b, payment(&fine, 10))
                .await
                .is_err()
        );
        assert!(store.list_payments(school_a, fine.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn postings_apply_to_the_current_row() {
        let store = InMemoryLedgerStore::new();
        let tenant = TenantId(Uuid::new_v4());
        let member = store.insert_party(party(tenant)).await.unwrap();
        let fine = store
            .insert_obligation(obligation(tenant, member.party_id))
            .await
            .unwrap();

        // Both drafted against version 0; the second sees the first.
        let first = payment(&fine, 50);
        let second = payment(&fine, 70);

        let posted = store.post_payment(tenant, first).await.unwrap();
        assert_eq!(posted.obligation.version, 1);
        assert_eq!(posted.obligation.paid_amount, Decimal::new(50, 0));
        assert_eq!(posted.obligation.status, ObligationStatus::Partial);
        assert_eq!(posted.party.total_paid, Decimal::new(50, 0));

        let posted = store.post_payment(tenant, second).await.unwrap();
        assert_eq!(posted.obligation.version, 2);
        assert_eq!(posted.obligation.paid_amount, Decimal::new(120, 0));
        assert_eq!(posted.obligation.status, ObligationStatus::Paid);
        assert_eq!(posted.obligation.resolved_at, Some(posted.payment.recorded_at));
        assert_eq!(posted.party.total_paid, Decimal::new(120, 0));
    }

    #[tokio::test]
    async fn rejected_posting_writes_nothing() {
        let store = InMemoryLedgerStore::new();
        let tenant = TenantId(Uuid::new_v4());
        let member = store.insert_party(party(tenant)).await.unwrap();
        let fine = store
            .insert_obligation(obligation(tenant, member.party_id))
            .await
            .unwrap();

        store.post_payment(tenant, payment(&fine, 100)).await.unwrap();
        let err = store
            .post_payment(tenant, payment(&fine, 30))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::Overpayment {
                tendered: Decimal::new(30, 0),
                outstanding: Decimal::new(20, 0),
            }
        );

        let payments = store.list_payments(tenant, fine.id).await.unwrap();
        assert_eq!(payments.len(), 1);
        let stored = store.get_obligation(tenant, fine.id).await.unwrap();
        assert_eq!(stored.paid_amount, Decimal::new(100, 0));
        assert_eq!(stored.version, 1);
        assert_eq!(
            store
                .get_party_summary(tenant, member.party_id)
                .await
                .unwrap()
                .total_paid,
            Decimal::new(100, 0)
        );
    }

    #[tokio::test]
    async fn party_summary_update_checks_version() {
        let store = InMemoryLedgerStore::new();
        let tenant = TenantId(Uuid::new_v4());
        let member = store.insert_party(party(tenant)).await.unwrap();

        let update = PartySummaryUpdate {
            party_id: member.party_id,
            expected_version: 0,
            total_paid: Decimal::new(500, 0),
            updated_at: Utc::now(),
        };
        let summary = store
            .update_party_summary(tenant, update.clone())
            .await
            .unwrap();
        assert_eq!(summary.total_paid, Decimal::new(500, 0));
        assert_eq!(summary.version, 1);

        let err = store.update_party_summary(tenant, update).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.list_tenants().await.unwrap(), vec![tenant]);
    }
}
