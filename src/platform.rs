use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::aggregate::AggregateLocks;
use crate::billing::adapters::PaymentGateway;
use crate::billing::models::SubscriptionPlan;
use crate::billing::payments::PaymentService;
use crate::billing::postgres::{PgPaymentRepository, PgSubscriptionRepository};
use crate::billing::store::{
    InMemoryPaymentRepository, InMemoryPlanCatalog, InMemorySubscriptionRepository,
    PaymentRepository, PlanCatalog, SubscriptionRepository,
};
use crate::billing::subscriptions::SubscriptionService;
use crate::clock::Clock;
use crate::config::BillingConfig;
use crate::error::BillingResult;
use crate::events::{
    EventBus, EventHandler, EventLogSink, IdempotentHandler, InMemoryEventBus,
    InMemoryOutboxStore, InMemoryProcessedEventStore, Outbox, OutboxStore, PgOutboxStore,
    PgProcessedEventStore, ProcessedEventStore, Topic,
};
use crate::ledger::{
    BonusCreditConsumer, CreditEngine, InMemoryLedgerStore, LedgerStore, PgLedgerStore,
    RefundReversalConsumer,
};

/// Storage backends behind one platform.
struct Stores {
    ledger: Arc<dyn LedgerStore>,
    payments: Arc<dyn PaymentRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    outbox: Arc<dyn OutboxStore>,
    processed: Arc<dyn ProcessedEventStore>,
}

/// key: billing-platform -> explicit wiring of stores, state machines and consumers
///
/// Every collaborator is constructed here and handed to its dependents; consumers are
/// subscribed through [`BillingPlatform::subscribe`] so each one is idempotent on event id.
pub struct BillingPlatform {
    pub config: BillingConfig,
    pub clock: Arc<dyn Clock>,
    pub bus: Arc<dyn EventBus>,
    pub outbox: Arc<Outbox>,
    pub ledger: Arc<dyn LedgerStore>,
    pub credits: Arc<CreditEngine>,
    pub plans: Arc<dyn PlanCatalog>,
    pub payments: Arc<PaymentService>,
    pub subscriptions: Arc<SubscriptionService>,
    processed: Arc<dyn ProcessedEventStore>,
}

impl BillingPlatform {
    /// Wires the in-process stores around the given gateway, catalog and clock.
    pub fn in_memory(
        config: BillingConfig,
        gateway: Arc<dyn PaymentGateway>,
        plans: Vec<SubscriptionPlan>,
        clock: Arc<dyn Clock>,
    ) -> BillingResult<Self> {
        let stores = Stores {
            ledger: Arc::new(InMemoryLedgerStore::new()),
            payments: Arc::new(InMemoryPaymentRepository::new()),
            subscriptions: Arc::new(InMemorySubscriptionRepository::new()),
            outbox: Arc::new(InMemoryOutboxStore::new()),
            processed: Arc::new(InMemoryProcessedEventStore::new()),
        };
        Self::wire(config, stores, gateway, plans, clock)
    }

    /// Wires the Postgres stores. Migrations must already have run against `pool`;
    /// plans still come from configuration.
    pub fn postgres(
        config: BillingConfig,
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        plans: Vec<SubscriptionPlan>,
        clock: Arc<dyn Clock>,
    ) -> BillingResult<Self> {
        let stores = Stores {
            ledger: Arc::new(PgLedgerStore::new(pool.clone())),
            payments: Arc::new(PgPaymentRepository::new(pool.clone())),
            subscriptions: Arc::new(PgSubscriptionRepository::new(pool.clone())),
            outbox: Arc::new(PgOutboxStore::new(pool.clone())),
            processed: Arc::new(PgProcessedEventStore::new(pool)),
        };
        Self::wire(config, stores, gateway, plans, clock)
    }

    fn wire(
        config: BillingConfig,
        stores: Stores,
        gateway: Arc<dyn PaymentGateway>,
        plans: Vec<SubscriptionPlan>,
        clock: Arc<dyn Clock>,
    ) -> BillingResult<Self> {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let outbox = Arc::new(Outbox::new(
            bus.clone(),
            stores.outbox,
            config.outbox_max_attempts,
        ));
        let locks = Arc::new(AggregateLocks::new());
        let plans: Arc<dyn PlanCatalog> = Arc::new(InMemoryPlanCatalog::with_plans(plans)?);

        let credits = Arc::new(
            CreditEngine::new(
                stores.ledger.clone(),
                outbox.clone(),
                clock.clone(),
                config.ledger_retry(),
                config.initial_credit_amount,
            )
            .with_initial_advanced_credit(config.initial_advanced_credit_amount),
        );
        let payments = Arc::new(PaymentService::new(
            stores.payments,
            gateway,
            outbox.clone(),
            locks.clone(),
            clock.clone(),
            config.payment_settings(),
        ));
        let subscriptions = Arc::new(SubscriptionService::new(
            stores.subscriptions,
            plans.clone(),
            payments.clone(),
            outbox.clone(),
            locks,
            clock.clone(),
            config.suspension_grace,
        ));

        let platform = Self {
            config,
            clock,
            bus,
            outbox,
            ledger: stores.ledger,
            credits: credits.clone(),
            plans: plans.clone(),
            payments,
            subscriptions: subscriptions.clone(),
            processed: stores.processed,
        };

        platform.subscribe(Topic::PaymentEvents, subscriptions);
        platform.subscribe(
            Topic::PaymentEvents,
            Arc::new(RefundReversalConsumer::new(credits.clone())),
        );
        platform.subscribe(
            Topic::SubscriptionEvents,
            Arc::new(BonusCreditConsumer::new(credits, plans)),
        );
        let sink: Arc<dyn EventHandler> = Arc::new(EventLogSink);
        for topic in Topic::ALL {
            platform.subscribe(topic, sink.clone());
        }
        Ok(platform)
    }

    /// Subscribes `handler` behind the idempotency guard shared by all consumers.
    pub fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) {
        self.bus.subscribe(
            topic,
            Arc::new(IdempotentHandler::new(handler, self.processed.clone())),
        );
    }

    /// Drops idempotency marks of events older than `cutoff`.
    pub async fn prune_processed_events(&self, cutoff: DateTime<Utc>) -> BillingResult<usize> {
        self.processed.purge_before(cutoff).await
    }
}
