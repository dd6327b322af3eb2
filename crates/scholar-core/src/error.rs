use rust_decimal::Decimal;
use uuid::Uuid;

use crate::status::ObligationStatus;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("tendered amount {tendered} exceeds outstanding balance {outstanding}")]
    Overpayment {
        tendered: Decimal,
        outstanding: Decimal,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("obligation {id} is already {status}")]
    ObligationClosed { id: Uuid, status: ObligationStatus },
    #[error("concurrent update on {entity} {id}, retry the request")]
    StoreConflict { entity: &'static str, id: Uuid },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl LedgerError {
    pub fn obligation_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "obligation",
            id,
        }
    }

    pub fn party_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "party",
            id,
        }
    }

    /// True for failures a client may safely resubmit.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreConflict { .. } | Self::StoreUnavailable(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StoreConflict { .. })
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
