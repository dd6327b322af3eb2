use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle of an obligation.
///
/// `Pending -> Partial -> Paid` is driven by accepted payments; `Pending` or
/// `Partial` may move to `Waived` by administrative action. `Paid` and
/// `Waived` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObligationStatus {
    Pending,
    Partial,
    Paid,
    Waived,
}

impl ObligationStatus {
    /// Status implied by the amounts alone. `Waived` is never derived.
    pub fn derive(principal_amount: Decimal, paid_amount: Decimal) -> Self {
        if paid_amount >= principal_amount {
            Self::Paid
        } else if paid_amount > Decimal::ZERO {
            Self::Partial
        } else {
            Self::Pending
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Waived)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Paid => "paid",
            Self::Waived => "waived",
        }
    }
}

impl fmt::Display for ObligationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObligationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "partial" => Ok(Self::Partial),
            "paid" => Ok(Self::Paid),
            "waived" => Ok(Self::Waived),
            other => Err(format!(
                "unknown obligation status {other}, expected pending, partial, paid, or waived"
            )),
        }
    }
}
