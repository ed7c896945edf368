use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use super::{DomainEvent, EventHandler, Topic};
use crate::error::{BillingError, BillingResult};

/// key: billing-event-bus -> publish/subscribe capability
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Succeeds only once every subscriber of `topic` accepted the event.
    async fn publish(&self, topic: Topic, event: &DomainEvent) -> BillingResult<()>;

    fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>);
}

/// In-process bus that delivers synchronously to each subscriber in subscription order.
#[derive(Default)]
pub struct InMemoryEventBus {
    subscribers: DashMap<Topic, Vec<Arc<dyn EventHandler>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers
            .get(&topic)
            .map(|handlers| handlers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: Topic, event: &DomainEvent) -> BillingResult<()> {
        // cloned out so no shard lock is held while handlers run
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .subscribers
            .get(&topic)
            .map(|handlers| handlers.clone())
            .unwrap_or_default();

        let mut failures = Vec::new();
        for handler in handlers {
            if let Err(err) = handler.handle(event).await {
                warn!(
                    ?err,
                    consumer = handler.name(),
                    %topic,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    "event handler failed"
                );
                failures.push(format!("{}: {err}", handler.name()));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BillingError::Delivery(failures.join("; ")))
        }
    }

    fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) {
        self.subscribers.entry(topic).or_default().push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingResult;
    use crate::ledger::models::{CreditTransaction, CreditType, TransactionKind};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct Handler {
        name: &'static str,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Handler {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, _event: &DomainEvent) -> BillingResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BillingError::Delivery("down".into()));
            }
            Ok(())
        }
    }

    fn handler(name: &'static str, fail: bool) -> Arc<Handler> {
        Arc::new(Handler {
            name,
            fail,
            calls: AtomicUsize::new(0),
        })
    }

    fn event() -> DomainEvent {
        let tx = CreditTransaction {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            amount: Decimal::ONE,
            kind: TransactionKind::Grant,
            credit_type: CreditType::Standard,
            idempotency_key: "k1".into(),
            timestamp: Utc::now(),
            related_payment_id: None,
            reverses: None,
            description: None,
            deleted: false,
        };
        DomainEvent::credit(crate::events::EventType::CreditGranted, &tx, 1, Utc::now())
    }

    #[tokio::test]
    async fn publish_reaches_only_topic_subscribers() {
        let bus = InMemoryEventBus::new();
        let credits = handler("credits", false);
        let payments = handler("payments", false);
        bus.subscribe(Topic::CreditEvents, credits.clone());
        bus.subscribe(Topic::PaymentEvents, payments.clone());
        assert_eq!(bus.subscriber_count(Topic::CreditEvents), 1);
        assert_eq!(bus.subscriber_count(Topic::SubscriptionEvents), 0);

        bus.publish(Topic::CreditEvents, &event()).await.unwrap();
        assert_eq!(credits.calls.load(Ordering::SeqCst), 1);
        assert_eq!(payments.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn one_failing_subscriber_fails_the_publish_but_others_still_run() {
        let bus = InMemoryEventBus::new();
        let broken = handler("broken", true);
        let healthy = handler("healthy", false);
        bus.subscribe(Topic::CreditEvents, broken.clone());
        bus.subscribe(Topic::CreditEvents, healthy.clone());

        let err = bus.publish(Topic::CreditEvents, &event()).await.unwrap_err();
        assert!(err.to_string().contains("broken"), "{err}");
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    }
}
