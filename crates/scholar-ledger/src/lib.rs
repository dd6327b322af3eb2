pub mod reconcile;
pub mod service;

pub use reconcile::{ObligationReconciliation, PartyReconciliation, TenantReconciliation};
pub use service::{
    DEFAULT_CONFLICT_ATTEMPTS, LedgerService, NewObligation, NewParty, PaymentReceipt,
    RetryPolicy, Tender, TenantLedger,
};
