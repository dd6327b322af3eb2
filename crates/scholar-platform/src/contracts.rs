use rust_decimal::Decimal;
use scholar_core::{Obligation, Payment};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPartyRequest {
    pub party_id: Option<Uuid>,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateObligationRequest {
    pub party_id: Uuid,
    pub kind: String,
    pub description: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub principal_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListObligationsQuery {
    pub party_id: Option<Uuid>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObligationListResponse {
    pub items: Vec<Obligation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyPaymentRequest {
    pub tendered_amount: Decimal,
    #[serde(default = "default_payment_method")]
    pub method: String,
    pub collected_by: String,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyPaymentResponse {
    pub payment: Payment,
    pub obligation: Obligation,
    pub party_total_paid: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentListResponse {
    pub items: Vec<Payment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaiveObligationRequest {
    pub waived_by: String,
    pub reason: Option<String>,
}

fn default_currency() -> String {
    "INR".to_string()
}

fn default_payment_method() -> String {
    "cash".to_string()
}
