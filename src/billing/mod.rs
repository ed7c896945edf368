pub mod adapters;
pub mod models;
pub mod payments;
pub mod postgres;
pub mod reconciliation;
pub mod scheduler;
pub mod store;
pub mod subscriptions;

pub use adapters::{ChargeReceipt, GatewayError, PaymentGateway, RefundReceipt, SandboxGateway};
pub use models::{
    CardDetails, Payment, PaymentRequest, PaymentStatus, Subscription, SubscriptionPlan,
    SubscriptionStatus,
};
pub use payments::{PaymentService, PaymentSettings};
pub use postgres::{PgPaymentRepository, PgSubscriptionRepository};
pub use reconciliation::{
    run_job as run_reconciliation_job, start_reconciliation_worker, ReconciliationHandle,
    ReconciliationJob, ReconciliationOutcome,
};
pub use scheduler::{process_tick as run_billing_tick, spawn as spawn_billing_scheduler, TickReport};
pub use store::{
    InMemoryPaymentRepository, InMemoryPlanCatalog, InMemorySubscriptionRepository, PaymentRepository,
    PlanCatalog, SubscriptionRepository,
};
pub use subscriptions::{Checkout, SubscriptionService};
