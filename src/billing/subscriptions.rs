use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::models::{
    CardDetails, Payment, PaymentRequest, PaymentStatus, Subscription, SubscriptionStatus,
};
use super::payments::PaymentService;
use super::store::{PlanCatalog, SubscriptionRepository};
use crate::aggregate::AggregateLocks;
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::events::{DomainEvent, EventHandler, EventType, Outbox};

/// Result of a purchase or renewal: the subscription as it stands after the payment
/// outcome was applied, and the payment itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkout {
    pub subscription: Subscription,
    pub payment: Payment,
}

fn lock_key(subscription_id: Uuid) -> String {
    format!("subscription:{subscription_id}")
}

fn extend_period(subscription: &mut Subscription, now: DateTime<Utc>, period: Duration) {
    let from = subscription
        .end_date
        .map(|end| end.max(now))
        .unwrap_or(now);
    subscription.end_date = Some(from + period);
}

/// key: billing-subscription-state-machine -> plan lifecycle driven by payment outcomes
pub struct SubscriptionService {
    subscriptions: Arc<dyn SubscriptionRepository>,
    plans: Arc<dyn PlanCatalog>,
    payments: Arc<PaymentService>,
    outbox: Arc<Outbox>,
    locks: Arc<AggregateLocks>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl SubscriptionService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepository>,
        plans: Arc<dyn PlanCatalog>,
        payments: Arc<PaymentService>,
        outbox: Arc<Outbox>,
        locks: Arc<AggregateLocks>,
        clock: Arc<dyn Clock>,
        grace: Duration,
    ) -> Self {
        Self {
            subscriptions,
            plans,
            payments,
            outbox,
            locks,
            clock,
            grace,
        }
    }

    /// Persists a PENDING subscription for the plan and charges its price. The
    /// subscription is ACTIVE on return when the charge succeeded.
    pub async fn create(
        &self,
        user_id: &str,
        plan_id: Uuid,
        card: CardDetails,
    ) -> BillingResult<Checkout> {
        if user_id.trim().is_empty() {
            return Err(BillingError::InvalidRequest("user id is required".into()));
        }
        let plan = self.plans.get(plan_id).await?;
        if !plan.active {
            return Err(BillingError::InvalidRequest(format!(
                "plan {} is not available for purchase",
                plan.code
            )));
        }
        let now = self.clock.now();
        card.validate(now)?;

        let payment_id = Uuid::new_v4();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            plan_id: plan.id,
            status: SubscriptionStatus::Pending,
            start_date: None,
            end_date: None,
            suspended_at: None,
            last_payment_id: None,
            pending_payment_id: Some(payment_id),
            cancel_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let guard = self.locks.acquire(&lock_key(subscription.id)).await;
        let subscription = self.subscriptions.insert(subscription).await?;
        self.outbox
            .enqueue(DomainEvent::subscription(
                EventType::SubscriptionCreated,
                &subscription,
                now,
            ))
            .await?;
        drop(guard);

        info!(
            subscription_id = %subscription.id,
            %user_id,
            plan = %plan.code,
            "subscription created"
        );
        self.outbox.flush().await;

        self.charge(&subscription, payment_id, plan.price, &plan.currency, card)
            .await
    }

    /// Extends an ACTIVE or SUSPENDED subscription by one plan period. A declined
    /// renewal suspends an ACTIVE subscription.
    pub async fn renew(&self, subscription_id: Uuid, card: CardDetails) -> BillingResult<Checkout> {
        self.start_payment(
            subscription_id,
            card,
            &[SubscriptionStatus::Active, SubscriptionStatus::Suspended],
        )
        .await
    }

    /// Charges again for a subscription whose initial payment failed.
    pub async fn retry_payment(
        &self,
        subscription_id: Uuid,
        card: CardDetails,
    ) -> BillingResult<Checkout> {
        self.start_payment(subscription_id, card, &[SubscriptionStatus::Pending])
            .await
    }

    async fn start_payment(
        &self,
        subscription_id: Uuid,
        card: CardDetails,
        allowed: &[SubscriptionStatus],
    ) -> BillingResult<Checkout> {
        let now = self.clock.now();
        card.validate(now)?;

        let guard = self.locks.acquire(&lock_key(subscription_id)).await;
        let mut subscription = self.load(subscription_id).await?;
        if !allowed.contains(&subscription.status) {
            return Err(BillingError::invalid_transition(
                "subscription",
                subscription.id,
                subscription.status,
                SubscriptionStatus::Active,
            ));
        }
        let plan = self.plans.get(subscription.plan_id).await?;
        let payment_id = Uuid::new_v4();
        subscription.pending_payment_id = Some(payment_id);
        subscription.updated_at = now;
        let subscription = self.subscriptions.save(subscription).await?;
        drop(guard);

        self.charge(&subscription, payment_id, plan.price, &plan.currency, card)
            .await
    }

    async fn charge(
        &self,
        subscription: &Subscription,
        payment_id: Uuid,
        amount: rust_decimal::Decimal,
        currency: &str,
        card: CardDetails,
    ) -> BillingResult<Checkout> {
        let payment = self
            .payments
            .create_payment_with_id(
                payment_id,
                PaymentRequest {
                    user_id: subscription.user_id.clone(),
                    subscription_id: subscription.id,
                    amount,
                    currency: currency.to_string(),
                    card,
                },
            )
            .await?;
        let payment = self.payments.capture(payment.id, None).await?;
        let subscription = self.load(subscription.id).await?;
        Ok(Checkout {
            subscription,
            payment,
        })
    }

    /// Applies a payment outcome to the subscription it pays for. Outcomes for payments
    /// the subscription is no longer waiting on are ignored, which makes redelivery and
    /// out-of-date events harmless.
    pub async fn on_payment_event(&self, event: &DomainEvent) -> BillingResult<()> {
        let Some(payment) = event.as_payment() else {
            return Ok(());
        };
        if !matches!(
            event.event_type,
            EventType::PaymentSucceeded | EventType::PaymentFailed | EventType::PaymentRefunded
        ) {
            return Ok(());
        }

        let guard = self.locks.acquire(&lock_key(payment.subscription_id)).await;
        let Some(mut subscription) = self.subscriptions.get(payment.subscription_id).await? else {
            warn!(
                payment_id = %payment.id,
                subscription_id = %payment.subscription_id,
                event_type = %event.event_type,
                "payment event for unknown subscription"
            );
            return Ok(());
        };

        let now = self.clock.now();
        let event_type = match event.event_type {
            EventType::PaymentSucceeded => {
                self.apply_success(&mut subscription, payment, now).await?
            }
            EventType::PaymentFailed => self.apply_failure(&mut subscription, payment, now)?,
            _ => self.apply_refund(&mut subscription, payment, now)?,
        };
        let Some(event_type) = event_type else {
            return Ok(());
        };

        let subscription = self.subscriptions.save(subscription).await?;
        self.outbox
            .enqueue(DomainEvent::subscription(
                event_type,
                &subscription,
                now,
            ))
            .await?;
        drop(guard);

        info!(
            subscription_id = %subscription.id,
            payment_id = %payment.id,
            status = %subscription.status,
            end_date = ?subscription.end_date,
            "subscription updated from payment outcome"
        );
        self.outbox.flush().await;
        Ok(())
    }

    async fn apply_success(
        &self,
        subscription: &mut Subscription,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<EventType>> {
        if subscription.last_payment_id == Some(payment.id) {
            debug!(
                subscription_id = %subscription.id,
                payment_id = %payment.id,
                "payment success already applied"
            );
            return Ok(None);
        }
        if subscription.pending_payment_id != Some(payment.id) {
            warn!(
                subscription_id = %subscription.id,
                payment_id = %payment.id,
                "ignoring success of a payment the subscription is not waiting on"
            );
            return Ok(None);
        }
        if subscription.status.is_terminal() {
            error!(
                subscription_id = %subscription.id,
                payment_id = %payment.id,
                status = %subscription.status,
                "payment succeeded for a closed subscription; refund required"
            );
            return Ok(None);
        }

        let plan = self.plans.get(subscription.plan_id).await?;
        subscription.pending_payment_id = None;
        subscription.last_payment_id = Some(payment.id);

        let event_type = match subscription.status {
            SubscriptionStatus::Pending => {
                subscription.transition(SubscriptionStatus::Active, now)?;
                subscription.start_date = Some(now);
                subscription.end_date = Some(now + plan.period());
                EventType::SubscriptionActivated
            }
            SubscriptionStatus::Suspended
                if subscription
                    .expires_after(self.grace)
                    .is_some_and(|expiry| now > expiry) =>
            {
                warn!(
                    subscription_id = %subscription.id,
                    payment_id = %payment.id,
                    "renewal payment arrived after the grace window"
                );
                subscription.transition(SubscriptionStatus::Expired, now)?;
                EventType::SubscriptionExpired
            }
            _ => {
                subscription.transition(SubscriptionStatus::Active, now)?;
                subscription.suspended_at = None;
                extend_period(subscription, now, plan.period());
                EventType::SubscriptionRenewed
            }
        };
        Ok(Some(event_type))
    }

    fn apply_failure(
        &self,
        subscription: &mut Subscription,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<EventType>> {
        if subscription.pending_payment_id != Some(payment.id) {
            return Ok(None);
        }
        match subscription.status {
            SubscriptionStatus::Active => {
                subscription.transition(SubscriptionStatus::Suspended, now)?;
                subscription.suspended_at = Some(now);
                subscription.pending_payment_id = None;
                Ok(Some(EventType::SubscriptionSuspended))
            }
            status => {
                info!(
                    subscription_id = %subscription.id,
                    payment_id = %payment.id,
                    %status,
                    "payment failed; subscription left awaiting a retry"
                );
                Ok(None)
            }
        }
    }

    fn apply_refund(
        &self,
        subscription: &mut Subscription,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<EventType>> {
        if subscription.status.is_terminal() {
            return Ok(None);
        }
        subscription.transition(SubscriptionStatus::Cancelled, now)?;
        subscription.pending_payment_id = None;
        subscription.cancel_reason = Some(format!("payment {} refunded", payment.id));
        Ok(Some(EventType::SubscriptionCancelled))
    }

    /// Retires ACTIVE subscriptions past their end date and SUSPENDED ones past
    /// `max(end_date, suspended_at + grace)`.
    pub async fn check_expirations(&self) -> BillingResult<Vec<Subscription>> {
        let now = self.clock.now();
        let mut candidates = self
            .subscriptions
            .find_by_status(SubscriptionStatus::Active)
            .await?;
        candidates.extend(
            self.subscriptions
                .find_by_status(SubscriptionStatus::Suspended)
                .await?,
        );

        let mut expired = Vec::new();
        for candidate in candidates {
            if !candidate
                .expires_after(self.grace)
                .is_some_and(|expiry| now > expiry)
            {
                continue;
            }
            let guard = self.locks.acquire(&lock_key(candidate.id)).await;
            let Some(mut subscription) = self.subscriptions.get(candidate.id).await? else {
                continue;
            };
            if !subscription
                .expires_after(self.grace)
                .is_some_and(|expiry| now > expiry)
            {
                continue;
            }
            subscription.transition(SubscriptionStatus::Expired, now)?;
            let subscription = self.subscriptions.save(subscription).await?;
            self.outbox
                .enqueue(DomainEvent::subscription(
                    EventType::SubscriptionExpired,
                    &subscription,
                    now,
                ))
                .await?;
            drop(guard);

            info!(
                subscription_id = %subscription.id,
                user_id = %subscription.user_id,
                end_date = ?subscription.end_date,
                "subscription expired"
            );
            expired.push(subscription);
        }

        if !expired.is_empty() {
            self.outbox.flush().await;
        }
        Ok(expired)
    }

    /// Cancels a non-terminal subscription. When the plan refunds on cancel, the payment
    /// that paid for the current period is refunded; an in-flight payment is cancelled.
    pub async fn cancel(&self, subscription_id: Uuid, reason: &str) -> BillingResult<Subscription> {
        let guard = self.locks.acquire(&lock_key(subscription_id)).await;
        let mut subscription = self.load(subscription_id).await?;
        let now = self.clock.now();
        subscription.transition(SubscriptionStatus::Cancelled, now)?;
        subscription.cancel_reason = Some(reason.to_string());
        let in_flight_payment = subscription.pending_payment_id.take();
        let subscription = self.subscriptions.save(subscription).await?;
        self.outbox
            .enqueue(DomainEvent::subscription(
                EventType::SubscriptionCancelled,
                &subscription,
                now,
            ))
            .await?;
        drop(guard);

        info!(
            subscription_id = %subscription.id,
            user_id = %subscription.user_id,
            %reason,
            "subscription cancelled"
        );
        self.outbox.flush().await;

        if let Some(payment_id) = in_flight_payment {
            self.cancel_in_flight_payment(payment_id).await;
        }
        if let Some(payment_id) = subscription.last_payment_id {
            self.refund_per_plan_policy(&subscription, payment_id, reason)
                .await;
        }
        self.load(subscription.id).await
    }

    async fn cancel_in_flight_payment(&self, payment_id: Uuid) {
        match self.payments.get(payment_id).await {
            Ok(payment)
                if matches!(payment.status, PaymentStatus::Pending | PaymentStatus::Failed) =>
            {
                if let Err(err) = self.payments.cancel(payment_id).await {
                    warn!(?err, %payment_id, "failed to cancel in-flight payment");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(?err, %payment_id, "in-flight payment could not be loaded"),
        }
    }

    async fn refund_per_plan_policy(
        &self,
        subscription: &Subscription,
        payment_id: Uuid,
        reason: &str,
    ) {
        let plan = match self.plans.get(subscription.plan_id).await {
            Ok(plan) => plan,
            Err(err) => {
                error!(
                    ?err,
                    subscription_id = %subscription.id,
                    "plan lookup failed; cancellation refund skipped"
                );
                return;
            }
        };
        if !plan.refund_on_cancel {
            return;
        }
        let payment = match self.payments.get(payment_id).await {
            Ok(payment) if payment.status == PaymentStatus::Success => payment,
            Ok(_) => return,
            Err(err) => {
                error!(?err, %payment_id, "payment lookup failed; cancellation refund skipped");
                return;
            }
        };
        if let Err(err) = self
            .payments
            .refund(payment.id, payment.amount, reason)
            .await
        {
            error!(
                ?err,
                subscription_id = %subscription.id,
                payment_id = %payment.id,
                "cancellation refund failed"
            );
        }
    }

    pub async fn get(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.load(subscription_id).await
    }

    pub async fn for_user(&self, user_id: &str) -> BillingResult<Vec<Subscription>> {
        self.subscriptions.find_by_user_id(user_id).await
    }

    /// The user's ACTIVE subscription with the latest end date, if any.
    pub async fn active_for_user(&self, user_id: &str) -> BillingResult<Option<Subscription>> {
        Ok(self
            .for_user(user_id)
            .await?
            .into_iter()
            .filter(|subscription| subscription.status == SubscriptionStatus::Active)
            .max_by_key(|subscription| subscription.end_date))
    }

    /// ACTIVE subscriptions whose period ends within `window` from now.
    pub async fn expiring_within(&self, window: Duration) -> BillingResult<Vec<Subscription>> {
        let now = self.clock.now();
        let horizon = now + window;
        let mut expiring: Vec<Subscription> = self
            .subscriptions
            .find_by_status(SubscriptionStatus::Active)
            .await?
            .into_iter()
            .filter(|subscription| {
                subscription
                    .end_date
                    .is_some_and(|end| end >= now && end <= horizon)
            })
            .collect();
        expiring.sort_by_key(|subscription| subscription.end_date);
        Ok(expiring)
    }

    /// Re-enqueues the status event of subscriptions changed since `since` whose latest
    /// status change never reached the outbox.
    pub async fn rederive_events(&self, since: DateTime<Utc>) -> BillingResult<usize> {
        let mut rederived = 0;
        for subscription in self.subscriptions.find_updated_since(since).await? {
            let aggregate_id = subscription.id.to_string();
            let event_type = EventType::for_subscription_status(subscription.status);
            let announced = match self.outbox.latest_recorded(&aggregate_id).await? {
                Some((sequence, _)) if sequence >= subscription.version => true,
                Some((_, recorded)) => {
                    recorded == event_type
                        || (recorded == EventType::SubscriptionRenewed
                            && subscription.status == SubscriptionStatus::Active)
                }
                None => false,
            };
            if announced {
                continue;
            }
            warn!(
                subscription_id = %subscription.id,
                status = %subscription.status,
                version = subscription.version,
                "re-deriving missing subscription event"
            );
            self.outbox
                .enqueue(DomainEvent::subscription(
                    event_type,
                    &subscription,
                    self.clock.now(),
                ))
                .await?;
            rederived += 1;
        }
        Ok(rederived)
    }

    async fn load(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.subscriptions
            .get(subscription_id)
            .await?
            .ok_or_else(|| BillingError::not_found("subscription", subscription_id))
    }
}

#[async_trait]
impl EventHandler for SubscriptionService {
    fn name(&self) -> &str {
        "subscription-state-machine"
    }

    async fn handle(&self, event: &DomainEvent) -> BillingResult<()> {
        self.on_payment_event(event).await
    }
}
