use std::{net::SocketAddr, sync::Arc};

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use scholar_core::{
    LedgerError, LedgerEvent, LedgerEventKind, Obligation, ObligationFilter, ObligationKind,
    ObligationStatus, PartySummary, PaymentMethod, TenantId,
};
use scholar_ledger::{
    LedgerService, NewObligation, NewParty, ObligationReconciliation, RetryPolicy, Tender,
    TenantReconciliation,
};
use scholar_platform::{
    ApplyPaymentRequest, ApplyPaymentResponse, CreateObligationRequest, ListObligationsQuery,
    ObligationListResponse, PaymentListResponse, PgLedgerStore, RedisBus, RegisterPartyRequest,
    ServiceConfig, WaiveObligationRequest, connect_database, ensure_schema,
};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

const TENANT_HEADER: &str = "x-tenant-id";
const MAX_LIST_LIMIT: usize = 500;

#[derive(Clone)]
struct AppState {
    ledger: Arc<LedgerService<PgLedgerStore>>,
    redis: RedisBus,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "scholar_gateway=info,scholar_ledger=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    let pool = connect_database(&config.database_url, config.database_max_connections).await?;
    ensure_schema(&pool).await?;
    let redis = RedisBus::connect(&config.redis_url)?;

    let ledger = LedgerService::new(
        PgLedgerStore::new(pool),
        RetryPolicy::new(config.conflict_retries),
    );
    let state = AppState {
        ledger: Arc::new(ledger),
        redis,
    };

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/parties", post(register_party))
        .route("/parties/{party_id}/summary", get(party_summary))
        .route(
            "/obligations",
            get(list_obligations).post(create_obligation),
        )
        .route("/obligations/{obligation_id}", get(get_obligation))
        .route(
            "/obligations/{obligation_id}/payments",
            get(list_payments).post(apply_payment),
        )
        .route("/obligations/{obligation_id}/waive", post(waive_obligation))
        .route(
            "/obligations/{obligation_id}/reconcile",
            post(reconcile_obligation),
        )
        .route("/reconcile", post(reconcile_tenant))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn register_party(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RegisterPartyRequest>,
) -> Result<(StatusCode, Json<PartySummary>), (StatusCode, String)> {
    let tenant = tenant_from_headers(&headers)?;

    let party = state
        .ledger
        .for_tenant(tenant)
        .register_party(NewParty {
            party_id: payload.party_id,
            display_name: payload.display_name,
        })
        .await
        .map_err(ledger_error)?;

    Ok((StatusCode::CREATED, Json(party)))
}

async fn party_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(party_id): Path<Uuid>,
) -> Result<Json<PartySummary>, (StatusCode, String)> {
    let tenant = tenant_from_headers(&headers)?;

    let party = state
        .ledger
        .for_tenant(tenant)
        .party_summary(party_id)
        .await
        .map_err(ledger_error)?;

    Ok(Json(party))
}

async fn create_obligation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateObligationRequest>,
) -> Result<(StatusCode, Json<Obligation>), (StatusCode, String)> {
    let tenant = tenant_from_headers(&headers)?;
    let kind: ObligationKind = payload
        .kind
        .parse()
        .map_err(|err: String| (StatusCode::BAD_REQUEST, err))?;

    let obligation = state
        .ledger
        .for_tenant(tenant)
        .create_obligation(NewObligation {
            party_id: payload.party_id,
            kind,
            description: payload.description,
            currency: payload.currency,
            principal_amount: payload.principal_amount,
        })
        .await
        .map_err(ledger_error)?;

    dispatch_event(
        &state,
        LedgerEvent::new(
            tenant,
            obligation.id,
            obligation.party_id,
            LedgerEventKind::ObligationCreated,
            json!({
                "kind": obligation.kind,
                "principal_amount": obligation.principal_amount,
                "currency": obligation.currency,
            }),
        ),
    )
    .await;

    Ok((StatusCode::CREATED, Json(obligation)))
}

async fn list_obligations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListObligationsQuery>,
) -> Result<Json<ObligationListResponse>, (StatusCode, String)> {
    let tenant = tenant_from_headers(&headers)?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ObligationStatus>)
        .transpose()
        .map_err(|err| (StatusCode::BAD_REQUEST, err))?;

    let filter = ObligationFilter {
        party_id: query.party_id,
        status,
        limit: Some(query.limit.unwrap_or(100).clamp(1, MAX_LIST_LIMIT)),
    };
    let items = state
        .ledger
        .for_tenant(tenant)
        .obligations(&filter)
        .await
        .map_err(ledger_error)?;

    Ok(Json(ObligationListResponse { items }))
}

async fn get_obligation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(obligation_id): Path<Uuid>,
) -> Result<Json<Obligation>, (StatusCode, String)> {
    let tenant = tenant_from_headers(&headers)?;

    let obligation = state
        .ledger
        .for_tenant(tenant)
        .obligation(obligation_id)
        .await
        .map_err(ledger_error)?;

    Ok(Json(obligation))
}

async fn apply_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(obligation_id): Path<Uuid>,
    Json(payload): Json<ApplyPaymentRequest>,
) -> Result<(StatusCode, Json<ApplyPaymentResponse>), (StatusCode, String)> {
    let tenant = tenant_from_headers(&headers)?;
    let method: PaymentMethod = payload
        .method
        .parse()
        .map_err(|err: String| (StatusCode::BAD_REQUEST, err))?;

    let receipt = state
        .ledger
        .for_tenant(tenant)
        .apply_payment(
            obligation_id,
            Tender {
                amount: payload.tendered_amount,
                method,
                collected_by: payload.collected_by,
                remarks: payload.remarks,
            },
        )
        .await
        .map_err(ledger_error)?;

    dispatch_event(
        &state,
        LedgerEvent::new(
            tenant,
            receipt.obligation.id,
            receipt.obligation.party_id,
            LedgerEventKind::PaymentRecorded,
            json!({
                "payment_id": receipt.payment.id,
                "amount": receipt.payment.amount,
                "status": receipt.obligation.status,
            }),
        ),
    )
    .await;

    Ok((
        StatusCode::CREATED,
        Json(ApplyPaymentResponse {
            payment: receipt.payment,
            obligation: receipt.obligation,
            party_total_paid: receipt.party.total_paid,
        }),
    ))
}

async fn list_payments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(obligation_id): Path<Uuid>,
) -> Result<Json<PaymentListResponse>, (StatusCode, String)> {
    let tenant = tenant_from_headers(&headers)?;

    let items = state
        .ledger
        .for_tenant(tenant)
        .payments(obligation_id)
        .await
        .map_err(ledger_error)?;

    Ok(Json(PaymentListResponse { items }))
}

async fn waive_obligation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(obligation_id): Path<Uuid>,
    Json(payload): Json<WaiveObligationRequest>,
) -> Result<Json<Obligation>, (StatusCode, String)> {
    let tenant = tenant_from_headers(&headers)?;

    let obligation = state
        .ledger
        .for_tenant(tenant)
        .waive_obligation(obligation_id, &payload.waived_by, payload.reason.as_deref())
        .await
        .map_err(ledger_error)?;

    dispatch_event(
        &state,
        LedgerEvent::new(
            tenant,
            obligation.id,
            obligation.party_id,
            LedgerEventKind::ObligationWaived,
            json!({
                "waived_by": obligation.waived_by,
                "outstanding": obligation.outstanding(),
            }),
        ),
    )
    .await;

    Ok(Json(obligation))
}

async fn reconcile_obligation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(obligation_id): Path<Uuid>,
) -> Result<Json<ObligationReconciliation>, (StatusCode, String)> {
    let tenant = tenant_from_headers(&headers)?;

    let report = state
        .ledger
        .for_tenant(tenant)
        .reconcile_obligation(obligation_id)
        .await
        .map_err(ledger_error)?;

    if report.corrected {
        dispatch_event(
            &state,
            LedgerEvent::new(
                tenant,
                report.obligation_id,
                report.party_id,
                LedgerEventKind::ObligationReconciled,
                json!({
                    "stored_paid": report.stored_paid,
                    "ledger_paid": report.ledger_paid,
                }),
            ),
        )
        .await;
    }

    Ok(Json(report))
}

async fn reconcile_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TenantReconciliation>, (StatusCode, String)> {
    let tenant = tenant_from_headers(&headers)?;

    let report = state
        .ledger
        .for_tenant(tenant)
        .reconcile_tenant()
        .await
        .map_err(ledger_error)?;

    Ok(Json(report))
}

/// The payment is already durable when this runs, so a bus failure is only
/// logged.
async fn dispatch_event(state: &AppState, event: LedgerEvent) {
    if let Err(err) = state.redis.publish_event(&event).await {
        error!(
            tenant = %event.tenant_id,
            aggregate_id = %event.aggregate_id,
            "failed to publish ledger event: {err:#}"
        );
    }
}

fn tenant_from_headers(headers: &HeaderMap) -> Result<TenantId, (StatusCode, String)> {
    let raw = headers
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("{TENANT_HEADER} header is required"),
            )
        })?;

    Uuid::parse_str(raw).map(TenantId).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            format!("{TENANT_HEADER} must be a UUID"),
        )
    })
}

fn ledger_error(err: LedgerError) -> (StatusCode, String) {
    let status = match &err {
        LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
        LedgerError::InvalidAmount(_)
        | LedgerError::Overpayment { .. }
        | LedgerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        LedgerError::ObligationClosed { .. } => StatusCode::CONFLICT,
        LedgerError::StoreConflict { .. } => StatusCode::SERVICE_UNAVAILABLE,
        LedgerError::StoreUnavailable(_) => {
            error!("ledger store failure: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    (status, err.to_string())
}
