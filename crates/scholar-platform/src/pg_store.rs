use async_trait::async_trait;
use rust_decimal::Decimal;
use scholar_core::{
    LedgerError, LedgerResult, LedgerStore, Obligation, ObligationFilter, ObligationUpdate,
    PartySummary, PartySummaryUpdate, Payment, PostedPayment, TenantId, settle_payment,
};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL ledger store.
///
/// Every statement filters on `tenant_id`. Version checks are folded into the
/// `UPDATE ... WHERE version = $n` so no row lock outlives a statement, except
/// inside `post_payment`, which holds the obligation `FOR UPDATE` for its
/// whole transaction.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Distinguishes a stale version from a missing row after a conditional
    /// update matched nothing.
    async fn obligation_conflict(&self, tenant: TenantId, id: Uuid) -> LedgerError {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM ledger_obligations WHERE tenant_id = $1 AND id = $2)",
        )
        .bind(tenant.as_uuid())
        .bind(id)
        .fetch_one(&self.pool)
        .await;

        match exists {
            Ok(true) => LedgerError::StoreConflict {
                entity: "obligation",
                id,
            },
            Ok(false) => LedgerError::obligation_not_found(id),
            Err(err) => store_error(err),
        }
    }

    async fn ensure_obligation(&self, tenant: TenantId, id: Uuid) -> LedgerResult<()> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM ledger_obligations WHERE tenant_id = $1 AND id = $2)",
        )
        .bind(tenant.as_uuid())
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        if !exists {
            return Err(LedgerError::obligation_not_found(id));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert_party(&self, party: PartySummary) -> LedgerResult<PartySummary> {
        sqlx::query(
            r#"
            INSERT INTO ledger_parties (
                tenant_id, party_id, display_name, total_paid, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(party.tenant_id.as_uuid())
        .bind(party.party_id)
        .bind(&party.display_name)
        .bind(party.total_paid)
        .bind(party.version)
        .bind(party.created_at)
        .bind(party.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                LedgerError::InvalidRequest(format!("party {} already exists", party.party_id))
            } else {
                store_error(err)
            }
        })?;

        Ok(party)
    }

    async fn get_party_summary(
        &self,
        tenant: TenantId,
        party_id: Uuid,
    ) -> LedgerResult<PartySummary> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, party_id, display_name, total_paid, version, created_at, updated_at
            FROM ledger_parties
            WHERE tenant_id = $1 AND party_id = $2
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(party_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        let Some(row) = row else {
            return Err(LedgerError::party_not_found(party_id));
        };
        party_from_row(&row)
    }

    async fn list_parties(&self, tenant: TenantId) -> LedgerResult<Vec<PartySummary>> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, party_id, display_name, total_paid, version, created_at, updated_at
            FROM ledger_parties
            WHERE tenant_id = $1
            ORDER BY created_at, party_id
            "#,
        )
        .bind(tenant.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(party_from_row).collect()
    }

    async fn update_party_summary(
        &self,
        tenant: TenantId,
        update: PartySummaryUpdate,
    ) -> LedgerResult<PartySummary> {
        let row = sqlx::query(
            r#"
            UPDATE ledger_parties
            SET total_paid = $4,
                updated_at = $5,
                version = version + 1
            WHERE tenant_id = $1 AND party_id = $2 AND version = $3
            RETURNING tenant_id, party_id, display_name, total_paid, version, created_at, updated_at
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(update.party_id)
        .bind(update.expected_version)
        .bind(update.total_paid)
        .bind(update.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match row {
            Some(row) => party_from_row(&row),
            None => {
                // Missing row or stale version.
                self.get_party_summary(tenant, update.party_id).await?;
                Err(LedgerError::StoreConflict {
                    entity: "party",
                    id: update.party_id,
                })
            }
        }
    }

    async fn insert_obligation(&self, obligation: Obligation) -> LedgerResult<Obligation> {
        sqlx::query(
            r#"
            INSERT INTO ledger_obligations (
                tenant_id, id, party_id, kind, description, currency, principal_amount,
                paid_amount, status, version, created_at, updated_at, resolved_at,
                waived_by, waiver_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(obligation.tenant_id.as_uuid())
        .bind(obligation.id)
        .bind(obligation.party_id)
        .bind(obligation.kind.as_str())
        .bind(&obligation.description)
        .bind(&obligation.currency)
        .bind(obligation.principal_amount)
        .bind(obligation.paid_amount)
        .bind(obligation.status.as_str())
        .bind(obligation.version)
        .bind(obligation.created_at)
        .bind(obligation.updated_at)
        .bind(obligation.resolved_at)
        .bind(&obligation.waived_by)
        .bind(&obligation.waiver_reason)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                LedgerError::InvalidRequest(format!("obligation {} already exists", obligation.id))
            } else {
                store_error(err)
            }
        })?;

        Ok(obligation)
    }

    async fn get_obligation(&self, tenant: TenantId, id: Uuid) -> LedgerResult<Obligation> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, id, party_id, kind, description, currency, principal_amount,
                   paid_amount, status, version, created_at, updated_at, resolved_at,
                   waived_by, waiver_reason
            FROM ledger_obligations
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        let Some(row) = row else {
            return Err(LedgerError::obligation_not_found(id));
        };
        obligation_from_row(&row)
    }

    async fn list_obligations(
        &self,
        tenant: TenantId,
        filter: &ObligationFilter,
    ) -> LedgerResult<Vec<Obligation>> {
        let limit = filter
            .limit
            .and_then(|limit| i64::try_from(limit).ok())
            .unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            SELECT tenant_id, id, party_id, kind, description, currency, principal_amount,
                   paid_amount, status, version, created_at, updated_at, resolved_at,
                   waived_by, waiver_reason
            FROM ledger_obligations
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR party_id = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at, id
            LIMIT $4
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(filter.party_id)
        .bind(filter.status.map(|status| status.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(obligation_from_row).collect()
    }

    async fn update_obligation(
        &self,
        tenant: TenantId,
        update: ObligationUpdate,
    ) -> LedgerResult<Obligation> {
        let obligation_id = update.obligation_id;
        let row = update_obligation_query(tenant, &update)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;

        match row {
            Some(row) => obligation_from_row(&row),
            None => Err(self.obligation_conflict(tenant, obligation_id).await),
        }
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

        // Returning early drops `tx`, which rolls it back.
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let row = sqlx::query(
            r#"
            SELECT tenant_id, id, party_id, kind, description, currency, principal_amount,
                   paid_amount, status, version, created_at, updated_at, resolved_at,
                   waived_by, waiver_reason
            FROM ledger_obligations
            WHERE tenant_id = $1 AND id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(payment.obligation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;
        let Some(row) = row else {
            return Err(LedgerError::obligation_not_found(payment.obligation_id));
        };

        let mut obligation = obligation_from_row(&row)?;
        let expected_version = obligation.version;
        settle_payment(&mut obligation, &payment)?;

        let mut update = ObligationUpdate::from_current(&obligation, payment.recorded_at);
        update.expected_version = expected_version;
        let row = update_obligation_query(tenant, &update)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_error)?;
        let Some(row) = row else {
            return Err(LedgerError::StoreConflict {
                entity: "obligation",
                id: payment.obligation_id,
            });
        };
        let obligation = obligation_from_row(&row)?;

        sqlx::query(
            r#"
            INSERT INTO ledger_payments (
                tenant_id, id, obligation_id, party_id, amount, currency, method,
                collected_by, recorded_at, remarks
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(payment.id)
        .bind(payment.obligation_id)
        .bind(payment.party_id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.method.as_str())
        .bind(&payment.collected_by)
        .bind(payment.recorded_at)
        .bind(&payment.remarks)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        let party_row = sqlx::query(
            r#"
            UPDATE ledger_parties
            SET total_paid = total_paid + $3,
                updated_at = $4,
                version = version + 1
            WHERE tenant_id = $1 AND party_id = $2
            RETURNING tenant_id, party_id, display_name, total_paid, version, created_at, updated_at
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(payment.party_id)
        .bind(payment.amount)
        .bind(payment.recorded_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;
        let Some(party_row) = party_row else {
            return Err(LedgerError::party_not_found(payment.party_id));
        };
        let party = party_from_row(&party_row)?;

        tx.commit().await.map_err(store_error)?;

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
        self.ensure_obligation(tenant, obligation_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT tenant_id, id, obligation_id, party_id, amount, currency, method,
                   collected_by, recorded_at, remarks
            FROM ledger_payments
            WHERE tenant_id = $1 AND obligation_id = $2
            ORDER BY recorded_at, id
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(obligation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(payment_from_row).collect()
    }

    async fn party_payment_total(&self, tenant: TenantId, party_id: Uuid) -> LedgerResult<Decimal> {
        self.get_party_summary(tenant, party_id).await?;

        let total = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM ledger_payments
            WHERE tenant_id = $1 AND party_id = $2
            "#,
        )
        .bind(tenant.as_uuid())
        .bind(party_id)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(total)
    }

    async fn list_tenants(&self) -> LedgerResult<Vec<TenantId>> {
        let tenants = sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT tenant_id FROM ledger_parties ORDER BY tenant_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(tenants.into_iter().map(TenantId).collect())
    }
}

fn update_obligation_query(
    tenant: TenantId,
    update: &ObligationUpdate,
) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        UPDATE ledger_obligations
        SET paid_amount = $4,
            status = $5,
            resolved_at = $6,
            waived_by = $7,
            waiver_reason = $8,
            updated_at = $9,
            version = version + 1
        WHERE tenant_id = $1 AND id = $2 AND version = $3
        RETURNING tenant_id, id, party_id, kind, description, currency, principal_amount,
                  paid_amount, status, version, created_at, updated_at, resolved_at,
                  waived_by, waiver_reason
        "#,
    )
    .bind(tenant.as_uuid())
    .bind(update.obligation_id)
    .bind(update.expected_version)
    .bind(update.paid_amount)
    .bind(update.status.as_str())
    .bind(update.resolved_at)
    .bind(&update.waived_by)
    .bind(&update.waiver_reason)
    .bind(update.updated_at)
}

fn party_from_row(row: &PgRow) -> LedgerResult<PartySummary> {
    Ok(PartySummary {
        tenant_id: TenantId(row.try_get("tenant_id").map_err(store_error)?),
        party_id: row.try_get("party_id").map_err(store_error)?,
        display_name: row.try_get("display_name").map_err(store_error)?,
        total_paid: row.try_get("total_paid").map_err(store_error)?,
        version: row.try_get("version").map_err(store_error)?,
        created_at: row.try_get("created_at").map_err(store_error)?,
        updated_at: row.try_get("updated_at").map_err(store_error)?,
    })
}

fn obligation_from_row(row: &PgRow) -> LedgerResult<Obligation> {
    let kind: String = row.try_get("kind").map_err(store_error)?;
    let status: String = row.try_get("status").map_err(store_error)?;

    Ok(Obligation {
        id: row.try_get("id").map_err(store_error)?,
        tenant_id: TenantId(row.try_get("tenant_id").map_err(store_error)?),
        party_id: row.try_get("party_id").map_err(store_error)?,
        kind: kind.parse().map_err(corrupt_row)?,
        description: row.try_get("description").map_err(store_error)?,
        currency: row.try_get("currency").map_err(store_error)?,
        principal_amount: row.try_get("principal_amount").map_err(store_error)?,
        paid_amount: row.try_get("paid_amount").map_err(store_error)?,
        status: status.parse().map_err(corrupt_row)?,
        version: row.try_get("version").map_err(store_error)?,
        created_at: row.try_get("created_at").map_err(store_error)?,
        updated_at: row.try_get("updated_at").map_err(store_error)?,
        resolved_at: row.try_get("resolved_at").map_err(store_error)?,
        waived_by: row.try_get("waived_by").map_err(store_error)?,
        waiver_reason: row.try_get("waiver_reason").map_err(store_error)?,
    })
}

fn payment_from_row(row: &PgRow) -> LedgerResult<Payment> {
    let method: String = row.try_get("method").map_err(store_error)?;

    Ok(Payment {
        id: row.try_get("id").map_err(store_error)?,
        obligation_id: row.try_get("obligation_id").map_err(store_error)?,
        tenant_id: TenantId(row.try_get("tenant_id").map_err(store_error)?),
        party_id: row.try_get("party_id").map_err(store_error)?,
        amount: row.try_get("amount").map_err(store_error)?,
        currency: row.try_get("currency").map_err(store_error)?,
        method: method.parse().map_err(corrupt_row)?,
        collected_by: row.try_get("collected_by").map_err(store_error)?,
        recorded_at: row.try_get("recorded_at").map_err(store_error)?,
        remarks: row.try_get("remarks").map_err(store_error)?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

fn store_error(err: sqlx::Error) -> LedgerError {
    LedgerError::StoreUnavailable(err.to_string())
}

fn corrupt_row(err: String) -> LedgerError {
    LedgerError::StoreUnavailable(format!("unreadable ledger row: {err}"))
}
