use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::ObligationStatus;

/// Owning school. Every stored row carries one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for TenantId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObligationKind {
    LibraryFine,
    FeeInvoice,
    Payroll,
}

impl ObligationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LibraryFine => "library_fine",
            Self::FeeInvoice => "fee_invoice",
            Self::Payroll => "payroll",
        }
    }
}

impl FromStr for ObligationKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "library_fine" => Ok(Self::LibraryFine),
            "fee_invoice" => Ok(Self::FeeInvoice),
            "payroll" => Ok(Self::Payroll),
            _ => Err("kind must be library_fine, fee_invoice, or payroll".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    BankTransfer,
    MobileWallet,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Card => "card",
            Self::BankTransfer => "bank_transfer",
            Self::MobileWallet => "mobile_wallet",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cash" => Ok(Self::Cash),
            "card" => Ok(Self::Card),
            "bank_transfer" => Ok(Self::BankTransfer),
            "mobile_wallet" => Ok(Self::MobileWallet),
            _ => Err("method must be cash, card, bank_transfer, or mobile_wallet".to_string()),
        }
    }
}

/// Money owed by a party to the school.
///
/// `status` and `paid_amount` only change through
/// [`apply_tender`](crate::application::apply_tender) and
/// [`waive`](crate::application::waive); `version` guards every write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Obligation {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub party_id: Uuid,
    pub kind: ObligationKind,
    pub description: String,
    pub currency: String,
    pub principal_amount: Decimal,
    pub paid_amount: Decimal,
    pub status: ObligationStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub waived_by: Option<String>,
    pub waiver_reason: Option<String>,
}

impl Obligation {
    pub fn outstanding(&self) -> Decimal {
        (self.principal_amount - self.paid_amount).max(Decimal::ZERO)
    }
}

/// One tender against one obligation. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub obligation_id: Uuid,
    pub tenant_id: TenantId,
    pub party_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub collected_by: String,
    pub recorded_at: DateTime<Utc>,
    pub remarks: Option<String>,
}

/// Cached total of every payment made by one party.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartySummary {
    pub party_id: Uuid,
    pub tenant_id: TenantId,
    pub display_name: String,
    pub total_paid: Decimal,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObligationFilter {
    pub party_id: Option<Uuid>,
    pub status: Option<ObligationStatus>,
    pub limit: Option<usize>,
}

impl ObligationFilter {
    pub fn for_party(party_id: Uuid) -> Self {
        Self {
            party_id: Some(party_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, obligation: &Obligation) -> bool {
        self.party_id.is_none_or(|party_id| obligation.party_id == party_id)
            && self.status.is_none_or(|status| obligation.status == status)
    }
}
