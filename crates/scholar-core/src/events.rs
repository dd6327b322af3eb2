use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::TenantId;

pub const LEDGER_EVENTS_CHANNEL: &str = "ledger.events";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventKind {
    ObligationCreated,
    PaymentRecorded,
    ObligationWaived,
    ObligationReconciled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: Uuid,
    pub tenant_id: TenantId,
    /// Obligation the event concerns.
    pub aggregate_id: Uuid,
    pub party_id: Uuid,
    pub kind: LedgerEventKind,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl LedgerEvent {
    pub fn new(
        tenant_id: TenantId,
        aggregate_id: Uuid,
        party_id: Uuid,
        kind: LedgerEventKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            aggregate_id,
            party_id,
            kind,
            occurred_at: Utc::now(),
            payload,
        }
    }
}
