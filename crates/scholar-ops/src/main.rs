use anyhow::{Context, Result};
use futures_util::StreamExt;
use redis::Msg;
use scholar_core::{LEDGER_EVENTS_CHANNEL, LedgerEvent, LedgerEventKind, LedgerStore};
use scholar_ledger::{LedgerService, RetryPolicy};
use scholar_platform::{PgLedgerStore, RedisBus, ServiceConfig, connect_database, ensure_schema};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "scholar_ops=info,scholar_ledger=info".to_string()),
        )
        .init();

    let config = ServiceConfig::worker_from_env()?;
    let pool = connect_database(&config.database_url, config.database_max_connections).await?;
    ensure_schema(&pool).await?;
    let redis = RedisBus::connect(&config.redis_url)?;

    let ledger = LedgerService::new(
        PgLedgerStore::new(pool),
        RetryPolicy::new(config.conflict_retries),
    );

    let mut pubsub = redis.client().get_async_pubsub().await?;
    pubsub.subscribe(LEDGER_EVENTS_CHANNEL).await?;
    let mut messages = pubsub.on_message();
    let mut sweep = tokio::time::interval(config.reconcile_interval);

    info!(
        interval_secs = config.reconcile_interval.as_secs(),
        "reconciliation worker subscribed to {LEDGER_EVENTS_CHANNEL}"
    );

    loop {
        tokio::select! {
            msg = messages.next() => {
                let msg = msg.context("ledger.events stream ended unexpectedly")?;
                if let Err(err) = handle_message(&ledger, msg).await {
                    error!("failed to process ledger event: {err:#}");
                }
            }
            _ = sweep.tick() => {
                if let Err(err) = sweep_tenants(&ledger).await {
                    error!("reconciliation sweep failed: {err:#}");
                }
            }
        }
    }
}

async fn handle_message<S: LedgerStore>(ledger: &LedgerService<S>, msg: Msg) -> Result<()> {
    let payload: String = msg.get_payload()?;
    let event: LedgerEvent = serde_json::from_str(&payload)?;

    match event.kind {
        LedgerEventKind::PaymentRecorded => {
            let tenant = ledger.for_tenant(event.tenant_id);
            let obligation = tenant.reconcile_obligation(event.aggregate_id).await?;
            let party = tenant.reconcile_party(event.party_id).await?;
            if obligation.corrected || party.corrected {
                warn!(
                    tenant = %event.tenant_id,
                    obligation_id = %event.aggregate_id,
                    "payment left cached totals out of step with the ledger"
                );
            }
            Ok(())
        }
        kind => {
            debug!(?kind, "ignoring ledger event");
            Ok(())
        }
    }
}

/// One tenant's failure does not stop the others.
async fn sweep_tenants<S: LedgerStore>(ledger: &LedgerService<S>) -> Result<()> {
    let tenants = ledger.store().list_tenants().await?;
    let mut failed = 0usize;

    for tenant in &tenants {
        match ledger.for_tenant(*tenant).reconcile_tenant().await {
            Ok(report) if report.obligations_corrected + report.parties_corrected > 0 => {
                warn!(
                    %tenant,
                    obligations_corrected = report.obligations_corrected,
                    parties_corrected = report.parties_corrected,
                    overpaid = report.overpaid_obligations.len(),
                    short_paid = report.short_paid_obligations.len(),
                    "sweep corrected ledger drift"
                );
            }
            Ok(_) => {}
            Err(err) => {
                failed += 1;
                error!(%tenant, "tenant reconciliation failed: {err}");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} tenants failed reconciliation", tenants.len());
    }
    info!(tenants = tenants.len(), "reconciliation sweep finished");
    Ok(())
}
