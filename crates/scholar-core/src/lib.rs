pub mod application;
pub mod error;
pub mod events;
pub mod models;
pub mod status;
pub mod storage;

pub use application::{
    AppliedTender, MONEY_SCALE, apply_tender, settle_payment, validate_money, waive,
};
pub use error::{LedgerError, LedgerResult};
pub use events::{LEDGER_EVENTS_CHANNEL, LedgerEvent, LedgerEventKind};
pub use models::{
    Obligation, ObligationFilter, ObligationKind, PartySummary, Payment, PaymentMethod, TenantId,
};
pub use status::ObligationStatus;
pub use storage::{LedgerStore, ObligationUpdate, PartySummaryUpdate, PostedPayment};
