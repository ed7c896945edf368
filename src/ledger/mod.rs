pub mod consumer;
pub mod engine;
pub mod models;
pub mod postgres;
pub mod reconciliation;
pub mod store;

pub use consumer::{refunded_share, BonusCreditConsumer, RefundReversalConsumer};
pub use engine::{CreditEngine, GrantReversal};
pub use models::{AccountBalance, CreditTransaction, CreditType, TransactionKind};
pub use postgres::PgLedgerStore;
pub use reconciliation::{reconcile, DiscrepancyKind, LedgerDiscrepancy, LedgerReport};
pub use store::{InMemoryLedgerStore, LedgerStore};
