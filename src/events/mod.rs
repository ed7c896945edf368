pub mod bus;
pub mod outbox;
pub mod postgres;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::billing::models::{Payment, PaymentStatus, Subscription, SubscriptionStatus};
use crate::error::BillingResult;
use crate::ledger::models::CreditTransaction;

pub use bus::{EventBus, InMemoryEventBus};
pub use outbox::{
    FlushReport, InMemoryOutboxStore, Outbox, OutboxEntry, OutboxStatus, OutboxStore,
};
pub use postgres::{PgOutboxStore, PgProcessedEventStore};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    PaymentEvents,
    SubscriptionEvents,
    CreditEvents,
}

impl Topic {
    pub const ALL: [Topic; 3] = [
        Topic::PaymentEvents,
        Topic::SubscriptionEvents,
        Topic::CreditEvents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::PaymentEvents => "payment-events",
            Topic::SubscriptionEvents => "subscription-events",
            Topic::CreditEvents => "credit-events",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    PaymentCreated,
    PaymentSucceeded,
    PaymentFailed,
    PaymentRefunded,
    PaymentRefundFailed,
    PaymentCancelled,
    SubscriptionCreated,
    SubscriptionActivated,
    SubscriptionRenewed,
    SubscriptionSuspended,
    SubscriptionExpired,
    SubscriptionCancelled,
    CreditGranted,
    CreditDebited,
    CreditReversed,
}

const ALL_EVENT_TYPES: [EventType; 15] = [
    EventType::PaymentCreated,
    EventType::PaymentSucceeded,
    EventType::PaymentFailed,
    EventType::PaymentRefunded,
    EventType::PaymentRefundFailed,
    EventType::PaymentCancelled,
    EventType::SubscriptionCreated,
    EventType::SubscriptionActivated,
    EventType::SubscriptionRenewed,
    EventType::SubscriptionSuspended,
    EventType::SubscriptionExpired,
    EventType::SubscriptionCancelled,
    EventType::CreditGranted,
    EventType::CreditDebited,
    EventType::CreditReversed,
];

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PaymentCreated => "PaymentCreated",
            EventType::PaymentSucceeded => "PaymentSucceeded",
            EventType::PaymentFailed => "PaymentFailed",
            EventType::PaymentRefunded => "PaymentRefunded",
            EventType::PaymentRefundFailed => "PaymentRefundFailed",
            EventType::PaymentCancelled => "PaymentCancelled",
            EventType::SubscriptionCreated => "SubscriptionCreated",
            EventType::SubscriptionActivated => "SubscriptionActivated",
            EventType::SubscriptionRenewed => "SubscriptionRenewed",
            EventType::SubscriptionSuspended => "SubscriptionSuspended",
            EventType::SubscriptionExpired => "SubscriptionExpired",
            EventType::SubscriptionCancelled => "SubscriptionCancelled",
            EventType::CreditGranted => "CreditGranted",
            EventType::CreditDebited => "CreditDebited",
            EventType::CreditReversed => "CreditReversed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        ALL_EVENT_TYPES
            .iter()
            .copied()
            .find(|event_type| event_type.as_str() == value)
    }

    pub fn topic(&self) -> Topic {
        match self {
            EventType::PaymentCreated
            | EventType::PaymentSucceeded
            | EventType::PaymentFailed
            | EventType::PaymentRefunded
            | EventType::PaymentRefundFailed
            | EventType::PaymentCancelled => Topic::PaymentEvents,
            EventType::SubscriptionCreated
            | EventType::SubscriptionActivated
            | EventType::SubscriptionRenewed
            | EventType::SubscriptionSuspended
            | EventType::SubscriptionExpired
            | EventType::SubscriptionCancelled => Topic::SubscriptionEvents,
            EventType::CreditGranted | EventType::CreditDebited | EventType::CreditReversed => {
                Topic::CreditEvents
            }
        }
    }

    /// Event announcing a payment's current status; used when re-deriving lost events.
    pub fn for_payment_status(status: PaymentStatus) -> Self {
        match status {
            PaymentStatus::Pending => EventType::PaymentCreated,
            PaymentStatus::Success => EventType::PaymentSucceeded,
            PaymentStatus::Failed => EventType::PaymentFailed,
            PaymentStatus::Refunded => EventType::PaymentRefunded,
            PaymentStatus::RefundFailed => EventType::PaymentRefundFailed,
            PaymentStatus::Cancelled => EventType::PaymentCancelled,
        }
    }

    pub fn for_subscription_status(status: SubscriptionStatus) -> Self {
        match status {
            SubscriptionStatus::Pending => EventType::SubscriptionCreated,
            SubscriptionStatus::Active => EventType::SubscriptionActivated,
            SubscriptionStatus::Suspended => EventType::SubscriptionSuspended,
            SubscriptionStatus::Expired => EventType::SubscriptionExpired,
            SubscriptionStatus::Cancelled => EventType::SubscriptionCancelled,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "snapshot", rename_all = "snake_case")]
pub enum EventPayload {
    Payment(Payment),
    Subscription(Subscription),
    Credit(CreditTransaction),
}

/// key: billing-domain-event -> at-least-once notification of an aggregate change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub aggregate_id: String,
    pub user_id: String,
    /// Version of the aggregate after the change that produced this event.
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl DomainEvent {
    pub fn payment(event_type: EventType, payment: &Payment, now: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            aggregate_id: payment.id.to_string(),
            user_id: payment.user_id.clone(),
            sequence: payment.version,
            timestamp: now,
            payload: EventPayload::Payment(payment.clone()),
        }
    }

    pub fn subscription(
        event_type: EventType,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            aggregate_id: subscription.id.to_string(),
            user_id: subscription.user_id.clone(),
            sequence: subscription.version,
            timestamp: now,
            payload: EventPayload::Subscription(subscription.clone()),
        }
    }

    /// Credit events are sequenced by the account version the append produced.
    pub fn credit(
        event_type: EventType,
        tx: &CreditTransaction,
        account_version: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            aggregate_id: format!("account:{}", tx.user_id),
            user_id: tx.user_id.clone(),
            sequence: account_version,
            timestamp: now,
            payload: EventPayload::Credit(tx.clone()),
        }
    }

    pub fn topic(&self) -> Topic {
        self.event_type.topic()
    }

    pub fn as_payment(&self) -> Option<&Payment> {
        match &self.payload {
            EventPayload::Payment(payment) => Some(payment),
            _ => None,
        }
    }

    pub fn as_subscription(&self) -> Option<&Subscription> {
        match &self.payload {
            EventPayload::Subscription(subscription) => Some(subscription),
            _ => None,
        }
    }
}

/// key: billing-event-handler -> topic subscriber
///
/// Delivery is at-least-once, so a handler may see the same `event_id` more than once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &DomainEvent) -> BillingResult<()>;
}

/// Records which `(consumer, event_id)` pairs have been handled to completion.
///
/// Marks are stamped with the event's own timestamp and purged once older than the
/// outbox retention window; events that old can no longer be redelivered.
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    async fn is_processed(&self, consumer: &str, event_id: Uuid) -> BillingResult<bool>;

    async fn mark_processed(
        &self,
        consumer: &str,
        event_id: Uuid,
        at: DateTime<Utc>,
    ) -> BillingResult<()>;

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> BillingResult<usize>;
}

#[derive(Debug, Default)]
pub struct InMemoryProcessedEventStore {
    processed: DashMap<(String, Uuid), DateTime<Utc>>,
}

impl InMemoryProcessedEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryProcessedEventStore {
    async fn is_processed(&self, consumer: &str, event_id: Uuid) -> BillingResult<bool> {
        Ok(self
            .processed
            .contains_key(&(consumer.to_string(), event_id)))
    }

    async fn mark_processed(
        &self,
        consumer: &str,
        event_id: Uuid,
        at: DateTime<Utc>,
    ) -> BillingResult<()> {
        self.processed.insert((consumer.to_string(), event_id), at);
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> BillingResult<usize> {
        let before = self.processed.len();
        self.processed.retain(|_, at| *at >= cutoff);
        Ok(before.saturating_sub(self.processed.len()))
    }
}

/// Wraps a handler so redelivered events are acknowledged without running it again.
/// An event is only marked once the inner handler succeeds.
pub struct IdempotentHandler {
    inner: Arc<dyn EventHandler>,
    processed: Arc<dyn ProcessedEventStore>,
}

impl IdempotentHandler {
    pub fn new(inner: Arc<dyn EventHandler>, processed: Arc<dyn ProcessedEventStore>) -> Self {
        Self { inner, processed }
    }
}

#[async_trait]
impl EventHandler for IdempotentHandler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn handle(&self, event: &DomainEvent) -> BillingResult<()> {
        let consumer = self.inner.name();
        if self.processed.is_processed(consumer, event.event_id).await? {
            debug!(
                consumer,
                event_id = %event.event_id,
                event_type = %event.event_type,
                "skipping already processed event"
            );
            return Ok(());
        }
        self.inner.handle(event).await?;
        self.processed
            .mark_processed(consumer, event.event_id, event.timestamp)
            .await
    }
}

/// key: billing-event-log-sink -> notification/analytics relay
pub struct EventLogSink;

#[async_trait]
impl EventHandler for EventLogSink {
    fn name(&self) -> &str {
        "event-log-sink"
    }

    async fn handle(&self, event: &DomainEvent) -> BillingResult<()> {
        info!(
            target: "billing.events",
            topic = %event.topic(),
            event_id = %event.event_id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            user_id = %event.user_id,
            sequence = event.sequence,
            "domain event"
        );
        Ok(())
    }
}
