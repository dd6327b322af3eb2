use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use scholar_core::{
    LedgerError, LedgerResult, LedgerStore, Obligation, ObligationFilter, ObligationKind,
    ObligationStatus, ObligationUpdate, PartySummary, PartySummaryUpdate, Payment,
    PaymentMethod, PostedPayment, TenantId,
};
use scholar_ledger::{LedgerService, NewObligation, NewParty, RetryPolicy, Tender};
use scholar_ledgerstore::InMemoryLedgerStore;
use uuid::Uuid;

fn dec(value: i64) -> Decimal {
    Decimal::new(value, 0)
}

fn service() -> LedgerService<InMemoryLedgerStore> {
    LedgerService::new(InMemoryLedgerStore::new(), RetryPolicy::default())
}

fn tender(amount: i64) -> Tender {
    Tender {
        amount: dec(amount),
        method: PaymentMethod::Cash,
        collected_by: "front-office".to_string(),
        remarks: None,
    }
}

fn fine(party_id: Uuid, principal: i64) -> NewObligation {
    NewObligation {
        party_id,
        kind: ObligationKind::LibraryFine,
        description: "Overdue return".to_string(),
        currency: "inr".to_string(),
        principal_amount: dec(principal),
    }
}

async fn member(service: &LedgerService<InMemoryLedgerStore>, tenant: TenantId) -> Uuid {
    service
        .for_tenant(tenant)
        .register_party(NewParty {
            party_id: None,
            display_name: "Rohan Iyer".to_string(),
        })
        .await
        .unwrap()
        .party_id
}

#[tokio::test]
async fn partial_then_full_payment() {
    let service = service();
    let tenant = TenantId(Uuid::new_v4());
    let party_id = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    let obligation = ledger.create_obligation(fine(party_id, 120)).await.unwrap();
    assert_eq!(obligation.status, ObligationStatus::Pending);
    assert_eq!(obligation.currency, "INR");

    let first = ledger.apply_payment(obligation.id, tender(50)).await.unwrap();
    assert_eq!(first.obligation.paid_amount, dec(50));
    assert_eq!(first.obligation.status, ObligationStatus::Partial);
    assert!(first.obligation.resolved_at.is_none());
    assert_eq!(first.payment.amount, dec(50));
    assert_eq!(first.party.total_paid, dec(50));

    let second = ledger.apply_payment(obligation.id, tender(70)).await.unwrap();
    assert_eq!(second.obligation.paid_amount, dec(120));
    assert_eq!(second.obligation.status, ObligationStatus::Paid);
    assert!(second.obligation.resolved_at.is_some());
    assert_eq!(second.party.total_paid, dec(120));

    let payments = ledger.payments(obligation.id).await.unwrap();
    assert_eq!(payments.len(), 2);
    assert_eq!(
        payments.iter().map(|payment| payment.amount).sum::<Decimal>(),
        dec(120)
    );
}

#[tokio::test]
async fn negative_tender_changes_nothing() {
    let service = service();
    let tenant = TenantId(Uuid::new_v4());
    let party_id = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    let obligation = ledger.create_obligation(fine(party_id, 60)).await.unwrap();
    ledger.apply_payment(obligation.id, tender(30)).await.unwrap();
    let before = ledger.obligation(obligation.id).await.unwrap();

    let err = ledger
        .apply_payment(obligation.id, tender(-5))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidAmount(_)));

    assert_eq!(ledger.obligation(obligation.id).await.unwrap(), before);
    assert_eq!(ledger.payments(obligation.id).await.unwrap().len(), 1);
    assert_eq!(ledger.party_summary(party_id).await.unwrap().total_paid, dec(30));
}

#[tokio::test]
async fn paid_obligation_rejects_further_payment() {
    let service = service();
    let tenant = TenantId(Uuid::new_v4());
    let party_id = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    let obligation = ledger.create_obligation(fine(party_id, 100)).await.unwrap();
    ledger.apply_payment(obligation.id, tender(100)).await.unwrap();

    let err = ledger
        .apply_payment(obligation.id, tender(10))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LedgerError::ObligationClosed {
            id: obligation.id,
            status: ObligationStatus::Paid
        }
    );
    assert_eq!(ledger.payments(obligation.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn waiver_is_terminal_and_leaves_party_total() {
    let service = service();
    let tenant = TenantId(Uuid::new_v4());
    let party_id = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    let obligation = ledger.create_obligation(fine(party_id, 45)).await.unwrap();
    let waived = ledger
        .waive_obligation(obligation.id, "principal", Some("first offence"))
        .await
        .unwrap();

    assert_eq!(waived.status, ObligationStatus::Waived);
    assert!(waived.resolved_at.is_some());
    assert_eq!(waived.waived_by.as_deref(), Some("principal"));
    assert_eq!(waived.waiver_reason.as_deref(), Some("first offence"));
    assert_eq!(waived.paid_amount, Decimal::ZERO);
    assert!(ledger.payments(obligation.id).await.unwrap().is_empty());
    assert_eq!(
        ledger.party_summary(party_id).await.unwrap().total_paid,
        Decimal::ZERO
    );

    let err = ledger
        .apply_payment(obligation.id, tender(5))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::ObligationClosed {
            status: ObligationStatus::Waived,
            ..
        }
    ));
    assert!(matches!(
        ledger.waive_obligation(obligation.id, "principal", None).await,
        Err(LedgerError::ObligationClosed { .. })
    ));
    assert!(ledger.payments(obligation.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn partially_paid_obligation_can_be_waived() {
    let service = service();
    let tenant = TenantId(Uuid::new_v4());
    let party_id = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    let obligation = ledger.create_obligation(fine(party_id, 80)).await.unwrap();
    ledger.apply_payment(obligation.id, tender(20)).await.unwrap();

    let waived = ledger
        .waive_obligation(obligation.id, "accounts", None)
        .await
        .unwrap();
    assert_eq!(waived.status, ObligationStatus::Waived);
    assert_eq!(waived.paid_amount, dec(20));
    assert_eq!(ledger.party_summary(party_id).await.unwrap().total_paid, dec(20));
}

#[tokio::test]
async fn exact_balance_resolves_and_one_less_does_not() {
    let service = service();
    let tenant = TenantId(Uuid::new_v4());
    let party_id = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    let short = ledger.create_obligation(fine(party_id, 60)).await.unwrap();
    let receipt = ledger.apply_payment(short.id, tender(59)).await.unwrap();
    assert_eq!(receipt.obligation.status, ObligationStatus::Partial);
    assert_eq!(receipt.obligation.outstanding(), dec(1));

    let exact = ledger.create_obligation(fine(party_id, 60)).await.unwrap();
    let receipt = ledger.apply_payment(exact.id, tender(60)).await.unwrap();
    assert_eq!(receipt.obligation.status, ObligationStatus::Paid);
}

#[tokio::test]
async fn overpayment_is_rejected_without_a_payment_row() {
    let service = service();
    let tenant = TenantId(Uuid::new_v4());
    let party_id = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    let obligation = ledger.create_obligation(fine(party_id, 120)).await.unwrap();
    ledger.apply_payment(obligation.id, tender(100)).await.unwrap();

    let err = ledger
        .apply_payment(obligation.id, tender(25))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LedgerError::Overpayment {
            tendered: dec(25),
            outstanding: dec(20)
        }
    );
    assert_eq!(ledger.payments(obligation.id).await.unwrap().len(), 1);
    assert_eq!(
        ledger.obligation(obligation.id).await.unwrap().paid_amount,
        dec(100)
    );
}

#[tokio::test]
async fn every_accepted_payment_leaves_one_row() {
    let service = service();
    let tenant = TenantId(Uuid::new_v4());
    let party_id = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    let obligation = ledger.create_obligation(fine(party_id, 100)).await.unwrap();
    let tenders = [10, 15, 5, 30, 40];
    let mut last_paid = Decimal::ZERO;
    for amount in tenders {
        let receipt = ledger.apply_payment(obligation.id, tender(amount)).await.unwrap();
        assert!(receipt.obligation.paid_amount >= last_paid);
        assert!(receipt.obligation.paid_amount <= receipt.obligation.principal_amount);
        assert_eq!(
            receipt.obligation.status,
            ObligationStatus::derive(
                receipt.obligation.principal_amount,
                receipt.obligation.paid_amount
            )
        );
        last_paid = receipt.obligation.paid_amount;
    }

    let stored = ledger.obligation(obligation.id).await.unwrap();
    assert_eq!(stored.status, ObligationStatus::Paid);
    assert_eq!(ledger.payments(obligation.id).await.unwrap().len(), tenders.len());
}

#[tokio::test]
async fn validation_failures_name_the_field() {
    let service = service();
    let tenant = TenantId(Uuid::new_v4());
    let party_id = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    assert!(matches!(
        ledger.create_obligation(fine(party_id, 0)).await,
        Err(LedgerError::InvalidAmount(_))
    ));
    assert!(matches!(
        ledger.create_obligation(fine(Uuid::new_v4(), 10)).await,
        Err(LedgerError::NotFound { entity: "party", .. })
    ));

    let obligation = ledger.create_obligation(fine(party_id, 10)).await.unwrap();
    let mut anonymous = tender(5);
    anonymous.collected_by = "  ".to_string();
    let err = ledger
        .apply_payment(obligation.id, anonymous)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LedgerError::InvalidRequest("collected_by is required".to_string())
    );
}

#[tokio::test]
async fn tenants_cannot_reach_each_other() {
    let service = service();
    let school_a = TenantId(Uuid::new_v4());
    let school_b = TenantId(Uuid::new_v4());
    let party_id = member(&service, school_a).await;

    let obligation = service
        .for_tenant(school_a)
        .create_obligation(fine(party_id, 40))
        .await
        .unwrap();

    let other = service.for_tenant(school_b);
    assert_eq!(
        other.obligation(obligation.id).await.unwrap_err(),
        LedgerError::obligation_not_found(obligation.id)
    );
    assert_eq!(
        other.apply_payment(obligation.id, tender(10)).await.unwrap_err(),
        LedgerError::obligation_not_found(obligation.id)
    );
    assert!(matches!(
        other.waive_obligation(obligation.id, "principal", None).await,
        Err(LedgerError::NotFound { .. })
    ));
    assert!(matches!(
        other.create_obligation(fine(party_id, 10)).await,
        Err(LedgerError::NotFound { .. })
    ));
    assert!(
        other
            .obligations(&ObligationFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
    assert!(service.for_tenant(school_a).payments(obligation.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn obligations_filter_by_party_and_status() {
    let service = service();
    let tenant = TenantId(Uuid::new_v4());
    let first = member(&service, tenant).await;
    let second = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    let paid = ledger.create_obligation(fine(first, 10)).await.unwrap();
    ledger.apply_payment(paid.id, tender(10)).await.unwrap();
    ledger.create_obligation(fine(first, 20)).await.unwrap();
    ledger.create_obligation(fine(second, 30)).await.unwrap();

    assert_eq!(
        ledger
            .obligations(&ObligationFilter::for_party(first))
            .await
            .unwrap()
            .len(),
        2
    );
    let open = ledger
        .obligations(&ObligationFilter {
            status: Some(ObligationStatus::Pending),
            ..ObligationFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(open.len(), 2);
    assert!(open.iter().all(|obligation| obligation.id != paid.id));
}

/// In-memory store whose obligation reads take as long as a database round
/// trip, so concurrent tenders read the same row before any of them posts.
struct SlowReads {
    inner: InMemoryLedgerStore,
    delay: Duration,
}

#[async_trait]
impl LedgerStore for SlowReads {
    async fn insert_party(&self, party: PartySummary) -> LedgerResult<PartySummary> {
        self.inner.insert_party(party).await
    }

    async fn get_party_summary(
        &self,
        tenant: TenantId,
        party_id: Uuid,
    ) -> LedgerResult<PartySummary> {
        self.inner.get_party_summary(tenant, party_id).await
    }

    async fn list_parties(&self, tenant: TenantId) -> LedgerResult<Vec<PartySummary>> {
        self.inner.list_parties(tenant).await
    }

    async fn update_party_summary(
        &self,
        tenant: TenantId,
        update: PartySummaryUpdate,
    ) -> LedgerResult<PartySummary> {
        self.inner.update_party_summary(tenant, update).await
    }

    async fn insert_obligation(&self, obligation: Obligation) -> LedgerResult<Obligation> {
        self.inner.insert_obligation(obligation).await
    }

    async fn get_obligation(&self, tenant: TenantId, id: Uuid) -> LedgerResult<Obligation> {
        let obligation = self.inner.get_obligation(tenant, id).await;
        tokio::time::sleep(self.delay).await;
        obligation
    }

    async fn list_obligations(
        &self,
        tenant: TenantId,
        filter: &ObligationFilter,
    ) -> LedgerResult<Vec<Obligation>> {
        self.inner.list_obligations(tenant, filter).await
    }

    async fn update_obligation(
        &self,
        tenant: TenantId,
        update: ObligationUpdate,
    ) -> LedgerResult<Obligation> {
        self.inner.update_obligation(tenant, update).await
    }

    async fn post_payment(
        &self,
        tenant: TenantId,
        payment: Payment,
    ) -> LedgerResult<PostedPayment> {
        self.inner.post_payment(tenant, payment).await
    }

    async fn list_payments(
        &self,
        tenant: TenantId,
        obligation_id: Uuid,
    ) -> LedgerResult<Vec<Payment>> {
        self.inner.list_payments(tenant, obligation_id).await
    }

    async fn party_payment_total(&self, tenant: TenantId, party_id: Uuid) -> LedgerResult<Decimal> {
        self.inner.party_payment_total(tenant, party_id).await
    }

    async fn list_tenants(&self) -> LedgerResult<Vec<TenantId>> {
        self.inner.list_tenants().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tenders_are_all_counted() {
    const TENDERS: i64 = 12;
    const AMOUNT: i64 = 15;

    // More tenders than the default retry budget, all reading the same row.
    let service = Arc::new(LedgerService::new(
        SlowReads {
            inner: InMemoryLedgerStore::new(),
            delay: Duration::from_millis(5),
        },
        RetryPolicy::default(),
    ));
    let tenant = TenantId(Uuid::new_v4());
    let ledger = service.for_tenant(tenant);
    let party_id = ledger
        .register_party(NewParty {
            party_id: None,
            display_name: "Meera Nair".to_string(),
        })
        .await
        .unwrap()
        .party_id;
    let obligation = ledger
        .create_obligation(fine(party_id, TENDERS * AMOUNT))
        .await
        .unwrap();

    let obligation_id = obligation.id;
    let handles: Vec<_> = (0..TENDERS)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .for_tenant(tenant)
                    .apply_payment(obligation_id, tender(AMOUNT))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = ledger.obligation(obligation.id).await.unwrap();
    assert_eq!(stored.paid_amount, dec(TENDERS * AMOUNT));
    assert_eq!(stored.status, ObligationStatus::Paid);
    assert_eq!(stored.version, TENDERS);
    assert_eq!(
        ledger.payments(obligation.id).await.unwrap().len(),
        TENDERS as usize
    );
    assert_eq!(
        ledger.party_summary(party_id).await.unwrap().total_paid,
        dec(TENDERS * AMOUNT)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_tenders_cannot_overpay() {
    // Three tenders of 40 against 100: each passes the pre-check on the row
    // it read, but the store only accepts what still fits.
    let service = Arc::new(LedgerService::new(
        SlowReads {
            inner: InMemoryLedgerStore::new(),
            delay: Duration::from_millis(5),
        },
        RetryPolicy::default(),
    ));
    let tenant = TenantId(Uuid::new_v4());
    let ledger = service.for_tenant(tenant);
    let party_id = ledger
        .register_party(NewParty {
            party_id: None,
            display_name: "Kabir Sethi".to_string(),
        })
        .await
        .unwrap()
        .party_id;
    let obligation = ledger.create_obligation(fine(party_id, 100)).await.unwrap();

    let obligation_id = obligation.id;
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .for_tenant(tenant)
                    .apply_payment(obligation_id, tender(40))
                    .await
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(err) => assert_eq!(
                err,
                LedgerError::Overpayment {
                    tendered: dec(40),
                    outstanding: dec(20),
                }
            ),
        }
    }

    assert_eq!(accepted, 2);
    let stored = ledger.obligation(obligation.id).await.unwrap();
    assert_eq!(stored.paid_amount, dec(80));
    assert_eq!(stored.status, ObligationStatus::Partial);
    assert_eq!(ledger.payments(obligation.id).await.unwrap().len(), 2);
    assert_eq!(ledger.party_summary(party_id).await.unwrap().total_paid, dec(80));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_payments_for_one_party_keep_the_total() {
    let service = Arc::new(service());
    let tenant = TenantId(Uuid::new_v4());
    let party_id = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    let settled = ledger.create_obligation(fine(party_id, 500)).await.unwrap();
    ledger.apply_payment(settled.id, tender(500)).await.unwrap();
    assert_eq!(ledger.party_summary(party_id).await.unwrap().total_paid, dec(500));

    let tuition = ledger.create_obligation(fine(party_id, 30)).await.unwrap();
    let bus_fee = ledger.create_obligation(fine(party_id, 20)).await.unwrap();

    let first = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .for_tenant(tenant)
                .apply_payment(tuition.id, tender(30))
                .await
        })
    };
    let second = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .for_tenant(tenant)
                .apply_payment(bus_fee.id, tender(20))
                .await
        })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(ledger.party_summary(party_id).await.unwrap().total_paid, dec(550));
}

#[tokio::test]
async fn reconciliation_repairs_drifted_caches() {
    let service = service();
    let tenant = TenantId(Uuid::new_v4());
    let party_id = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    let obligation = ledger.create_obligation(fine(party_id, 120)).await.unwrap();
    ledger.apply_payment(obligation.id, tender(50)).await.unwrap();

    // Simulate a lost update from an older writer.
    let current = ledger.obligation(obligation.id).await.unwrap();
    let mut drift = ObligationUpdate::from_current(&current, Utc::now());
    drift.paid_amount = Decimal::ZERO;
    drift.status = ObligationStatus::Pending;
    service.store().update_obligation(tenant, drift).await.unwrap();

    let summary = ledger.party_summary(party_id).await.unwrap();
    service
        .store()
        .update_party_summary(
            tenant,
            PartySummaryUpdate {
                party_id,
                expected_version: summary.version,
                total_paid: dec(999),
                updated_at: Utc::now(),
            },
        )
        .await
        .unwrap();

    let report = ledger.reconcile_obligation(obligation.id).await.unwrap();
    assert!(report.corrected);
    assert_eq!(report.stored_paid, Decimal::ZERO);
    assert_eq!(report.ledger_paid, dec(50));
    assert_eq!(report.status, ObligationStatus::Partial);
    assert!(!report.overpaid);

    let repaired = ledger.obligation(obligation.id).await.unwrap();
    assert_eq!(repaired.paid_amount, dec(50));
    assert_eq!(repaired.status, ObligationStatus::Partial);

    let party = ledger.reconcile_party(party_id).await.unwrap();
    assert!(party.corrected);
    assert_eq!(party.stored_total, dec(999));
    assert_eq!(ledger.party_summary(party_id).await.unwrap().total_paid, dec(50));

    // A clean ledger is left alone.
    let sweep = ledger.reconcile_tenant().await.unwrap();
    assert_eq!(sweep.obligations_checked, 1);
    assert_eq!(sweep.obligations_corrected, 0);
    assert_eq!(sweep.parties_checked, 1);
    assert_eq!(sweep.parties_corrected, 0);
    assert!(sweep.overpaid_obligations.is_empty());
    assert!(sweep.short_paid_obligations.is_empty());
}

#[tokio::test]
async fn reconciliation_keeps_waived_status() {
    let service = service();
    let tenant = TenantId(Uuid::new_v4());
    let party_id = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    let obligation = ledger.create_obligation(fine(party_id, 90)).await.unwrap();
    ledger.apply_payment(obligation.id, tender(40)).await.unwrap();
    ledger
        .waive_obligation(obligation.id, "principal", None)
        .await
        .unwrap();

    let report = ledger.reconcile_obligation(obligation.id).await.unwrap();
    assert!(!report.corrected);
    assert_eq!(report.status, ObligationStatus::Waived);
    assert_eq!(
        ledger.obligation(obligation.id).await.unwrap().status,
        ObligationStatus::Waived
    );
}

#[tokio::test]
async fn reconciliation_keeps_paid_status_and_flags_shortfall() {
    let service = service();
    let tenant = TenantId(Uuid::new_v4());
    let party_id = member(&service, tenant).await;
    let ledger = service.for_tenant(tenant);

    let obligation = ledger.create_obligation(fine(party_id, 90)).await.unwrap();
    ledger.apply_payment(obligation.id, tender(40)).await.unwrap();

    // An older writer marked the obligation paid without the payment rows.
    let resolved_at = Utc::now();
    let current = ledger.obligation(obligation.id).await.unwrap();
    let mut drift = ObligationUpdate::from_current(&current, resolved_at);
    drift.paid_amount = dec(90);
    drift.status = ObligationStatus::Paid;
    drift.resolved_at = Some(resolved_at);
    service.store().update_obligation(tenant, drift).await.unwrap();

    let report = ledger.reconcile_obligation(obligation.id).await.unwrap();
    assert!(report.corrected);
    assert!(report.short_paid);
    assert_eq!(report.ledger_paid, dec(40));
    assert_eq!(report.status, ObligationStatus::Paid);

    let stored = ledger.obligation(obligation.id).await.unwrap();
    assert_eq!(stored.status, ObligationStatus::Paid);
    assert_eq!(stored.paid_amount, dec(40));
    assert_eq!(stored.resolved_at, Some(resolved_at));

    let sweep = ledger.reconcile_tenant().await.unwrap();
    assert_eq!(sweep.obligations_corrected, 0);
    assert_eq!(sweep.short_paid_obligations, vec![obligation.id]);
}
