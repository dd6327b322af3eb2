pub mod config;
pub mod contracts;
pub mod db;
pub mod pg_store;
pub mod redis_bus;

pub use config::ServiceConfig;
pub use contracts::{
    ApplyPaymentRequest, ApplyPaymentResponse, CreateObligationRequest, ListObligationsQuery,
    ObligationListResponse, PaymentListResponse, RegisterPartyRequest, WaiveObligationRequest,
};
pub use db::{connect_database, ensure_schema};
pub use pg_store::PgLedgerStore;
pub use redis_bus::RedisBus;
