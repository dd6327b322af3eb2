use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

const LEDGER_SCHEMA: &str = include_str!("../migrations/0001_ledger.sql");

pub async fn connect_database(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Creates the ledger tables if they are missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(LEDGER_SCHEMA)
        .execute(pool)
        .await
        .context("failed to apply ledger schema")?;
    info!("ledger schema ready");
    Ok(())
}
