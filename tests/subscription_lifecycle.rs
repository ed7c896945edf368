mod common;

use billing_core::billing::{PaymentStatus, SubscriptionStatus};
use billing_core::events::{EventBus, EventType, Topic};
use billing_core::{BillingError, ErrorKind};
use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use common::{basic_plan, card, declined, harness, pro_plan, retired_plan, start_time};

// key: subscription-lifecycle-tests -> purchase, renewal, suspension, expiry, cancellation

#[tokio::test]
async fn purchase_activates_then_expires_after_one_period() {
    let h = harness();
    let subscriptions = &h.platform.subscriptions;

    let checkout = subscriptions
        .create("u1", pro_plan().id, card())
        .await
        .unwrap();
    let subscription = checkout.subscription;
    assert_eq!(checkout.payment.status, PaymentStatus::Success);
    assert_eq!(checkout.payment.amount, dec!(50));
    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.start_date, Some(start_time()));
    assert_eq!(subscription.end_date, Some(start_time() + Duration::days(30)));
    assert_eq!(subscription.last_payment_id, Some(checkout.payment.id));
    assert!(subscription.pending_payment_id.is_none());
    assert_eq!(h.platform.credits.balance("u1").await.unwrap(), dec!(100));

    h.clock.advance(Duration::days(30));
    assert!(subscriptions.check_expirations().await.unwrap().is_empty());

    h.clock.advance(Duration::seconds(1));
    let expired = subscriptions.check_expirations().await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, subscription.id);
    assert_eq!(
        subscriptions.get(subscription.id).await.unwrap().status,
        SubscriptionStatus::Expired
    );
    assert!(subscriptions.check_expirations().await.unwrap().is_empty());
}

#[tokio::test]
async fn declined_purchase_waits_for_a_retry() {
    let h = harness();
    h.gateway.script_charges([Err(declined())]);
    let subscriptions = &h.platform.subscriptions;

    let checkout = subscriptions
        .create("u1", pro_plan().id, card())
        .await
        .unwrap();
    assert_eq!(checkout.payment.status, PaymentStatus::Failed);
    assert_eq!(checkout.subscription.status, SubscriptionStatus::Pending);
    assert_eq!(h.platform.credits.balance("u1").await.unwrap(), Decimal::ZERO);

    let retried = subscriptions
        .retry_payment(checkout.subscription.id, card())
        .await
        .unwrap();
    assert_eq!(retried.payment.status, PaymentStatus::Success);
    assert_eq!(retried.subscription.status, SubscriptionStatus::Active);
    assert_eq!(retried.subscription.last_payment_id, Some(retried.payment.id));
    assert_eq!(h.platform.credits.balance("u1").await.unwrap(), dec!(100));
    assert_eq!(
        h.platform
            .payments
            .for_subscription(checkout.subscription.id)
            .await
            .unwrap()
            .len(),
        2
    );

    let err = subscriptions
        .retry_payment(checkout.subscription.id, card())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
}

#[tokio::test]
async fn renewal_extends_from_the_current_end_date() {
    let h = harness();
    let subscriptions = &h.platform.subscriptions;
    let created = subscriptions
        .create("u1", pro_plan().id, card())
        .await
        .unwrap()
        .subscription;

    h.clock.advance(Duration::days(10));
    let renewed = subscriptions.renew(created.id, card()).await.unwrap();

    assert_eq!(renewed.subscription.status, SubscriptionStatus::Active);
    assert_eq!(renewed.subscription.start_date, Some(start_time()));
    assert_eq!(
        renewed.subscription.end_date,
        Some(start_time() + Duration::days(60))
    );
    assert_eq!(renewed.subscription.last_payment_id, Some(renewed.payment.id));
    assert_eq!(h.platform.credits.balance("u1").await.unwrap(), dec!(200));

    let kinds: Vec<EventType> = h
        .platform
        .outbox
        .entries_for(&created.id.to_string())
        .await
        .unwrap()
        .iter()
        .map(|entry| entry.event.event_type)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventType::SubscriptionCreated,
            EventType::SubscriptionActivated,
            EventType::SubscriptionRenewed,
        ]
    );
}

#[tokio::test]
async fn declined_renewal_suspends_until_paid_within_grace() {
    let h = harness();
    let subscriptions = &h.platform.subscriptions;
    let created = subscriptions
        .create("u1", pro_plan().id, card())
        .await
        .unwrap()
        .subscription;

    h.clock.advance(Duration::days(29));
    h.gateway.script_charges([Err(declined())]);
    let attempt = subscriptions.renew(created.id, card()).await.unwrap();
    assert_eq!(attempt.payment.status, PaymentStatus::Failed);
    assert_eq!(attempt.subscription.status, SubscriptionStatus::Suspended);
    assert_eq!(attempt.subscription.suspended_at, Some(start_time() + Duration::days(29)));
    assert_eq!(attempt.subscription.last_payment_id, created.last_payment_id);

    h.clock.advance(Duration::days(2));
    assert!(subscriptions.check_expirations().await.unwrap().is_empty());

    let recovered = subscriptions.renew(created.id, card()).await.unwrap();
    assert_eq!(recovered.subscription.status, SubscriptionStatus::Active);
    assert!(recovered.subscription.suspended_at.is_none());
    assert_eq!(
        recovered.subscription.end_date,
        Some(start_time() + Duration::days(61))
    );
    assert_eq!(h.platform.credits.balance("u1").await.unwrap(), dec!(200));
}

#[tokio::test]
async fn suspension_past_grace_expires() {
    let h = harness();
    let subscriptions = &h.platform.subscriptions;
    let created = subscriptions
        .create("u1", basic_plan().id, card())
        .await
        .unwrap()
        .subscription;

    h.clock.advance(Duration::days(29));
    h.gateway.script_charges([Err(declined())]);
    subscriptions.renew(created.id, card()).await.unwrap();

    // grace ends three days after the suspension, past the period end
    h.clock.advance(Duration::days(2));
    assert!(subscriptions.check_expirations().await.unwrap().is_empty());
    h.clock.advance(Duration::days(1) + Duration::seconds(1));
    let expired = subscriptions.check_expirations().await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].status, SubscriptionStatus::Expired);

    let err = subscriptions.renew(created.id, card()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    let err = subscriptions.cancel(created.id, "too late").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
}

#[tokio::test]
async fn payment_landing_after_grace_expires_instead_of_renewing() {
    let h = harness();
    let subscriptions = &h.platform.subscriptions;
    let created = subscriptions
        .create("u1", basic_plan().id, card())
        .await
        .unwrap()
        .subscription;

    h.clock.advance(Duration::days(29));
    h.gateway.script_charges([Err(declined())]);
    subscriptions.renew(created.id, card()).await.unwrap();

    h.clock.advance(Duration::days(5));
    let late = subscriptions.renew(created.id, card()).await.unwrap();
    assert_eq!(late.payment.status, PaymentStatus::Success);
    assert_eq!(late.subscription.status, SubscriptionStatus::Expired);
}

#[tokio::test]
async fn cancel_refunds_the_current_period_when_plan_allows() {
    let h = harness();
    let subscriptions = &h.platform.subscriptions;
    let checkout = subscriptions
        .create("u1", pro_plan().id, card())
        .await
        .unwrap();
    assert_eq!(h.platform.credits.balance("u1").await.unwrap(), dec!(100));

    let cancelled = subscriptions
        .cancel(checkout.subscription.id, "changed my mind")
        .await
        .unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("changed my mind"));

    let payment = h.platform.payments.get(checkout.payment.id).await.unwrap();
    assert_eq!(payment.status, PaymentStatus::Refunded);
    assert_eq!(payment.refunded_amount, Some(dec!(50)));
    assert_eq!(h.gateway.refunds(), 1);
    assert_eq!(h.platform.credits.balance("u1").await.unwrap(), Decimal::ZERO);
}

#[tokio::test]
async fn cancel_keeps_payment_when_plan_does_not_refund() {
    let h = harness();
    let subscriptions = &h.platform.subscriptions;
    let checkout = subscriptions
        .create("u1", basic_plan().id, card())
        .await
        .unwrap();

    let cancelled = subscriptions
        .cancel(checkout.subscription.id, "leaving")
        .await
        .unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert_eq!(
        h.platform.payments.get(checkout.payment.id).await.unwrap().status,
        PaymentStatus::Success
    );
    assert_eq!(h.gateway.refunds(), 0);
}

#[tokio::test]
async fn cancelling_a_pending_subscription_cancels_its_payment() {
    let h = harness();
    h.gateway.script_charges([Err(declined())]);
    let subscriptions = &h.platform.subscriptions;
    let checkout = subscriptions
        .create("u1", pro_plan().id, card())
        .await
        .unwrap();

    let cancelled = subscriptions
        .cancel(checkout.subscription.id, "gave up")
        .await
        .unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    assert!(cancelled.pending_payment_id.is_none());
    assert_eq!(
        h.platform.payments.get(checkout.payment.id).await.unwrap().status,
        PaymentStatus::Cancelled
    );
    assert_eq!(h.gateway.refunds(), 0);
}

#[tokio::test]
async fn refunding_the_paying_payment_cancels_the_subscription() {
    let h = harness();
    let checkout = h
        .platform
        .subscriptions
        .create("u1", pro_plan().id, card())
        .await
        .unwrap();

    h.platform
        .payments
        .refund(checkout.payment.id, dec!(50), "chargeback")
        .await
        .unwrap();

    let subscription = h
        .platform
        .subscriptions
        .get(checkout.subscription.id)
        .await
        .unwrap();
    assert_eq!(subscription.status, SubscriptionStatus::Cancelled);
    assert_eq!(
        subscription.cancel_reason,
        Some(format!("payment {} refunded", checkout.payment.id))
    );
    assert_eq!(h.platform.credits.balance("u1").await.unwrap(), Decimal::ZERO);
}

#[tokio::test]
async fn unavailable_plans_are_refused() {
    let h = harness();
    let subscriptions = &h.platform.subscriptions;

    let err = subscriptions
        .create("u1", Uuid::new_v4(), card())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = subscriptions
        .create("u1", retired_plan().id, card())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidRequest(_)), "{err:?}");

    assert!(subscriptions.for_user("u1").await.unwrap().is_empty());
    assert_eq!(h.gateway.charges(), 0);
}

#[tokio::test]
async fn bonus_is_granted_once_per_paid_period() {
    let h = harness();
    let checkout = h
        .platform
        .subscriptions
        .create("u1", pro_plan().id, card())
        .await
        .unwrap();

    let activated = h
        .platform
        .outbox
        .entries_for(&checkout.subscription.id.to_string())
        .await
        .unwrap()
        .into_iter()
        .find(|entry| entry.event.event_type == EventType::SubscriptionActivated)
        .unwrap()
        .event;

    // same event redelivered, then the same change under a fresh event id
    h.platform
        .bus
        .publish(Topic::SubscriptionEvents, &activated)
        .await
        .unwrap();
    let mut duplicate = activated.clone();
    duplicate.event_id = Uuid::new_v4();
    h.platform
        .bus
        .publish(Topic::SubscriptionEvents, &duplicate)
        .await
        .unwrap();

    assert_eq!(h.platform.credits.balance("u1").await.unwrap(), dec!(100));
    let grants = h.platform.credits.transactions("u1").await.unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].related_payment_id, Some(checkout.payment.id));
}

#[tokio::test]
async fn lookups_reflect_current_periods() {
    let h = harness();
    let subscriptions = &h.platform.subscriptions;
    let first = subscriptions
        .create("u1", basic_plan().id, card())
        .await
        .unwrap()
        .subscription;
    h.clock.advance(Duration::days(10));
    let second = subscriptions
        .create("u1", pro_plan().id, card())
        .await
        .unwrap()
        .subscription;

    let active = subscriptions.active_for_user("u1").await.unwrap().unwrap();
    assert_eq!(active.id, second.id);
    assert_eq!(subscriptions.for_user("u1").await.unwrap().len(), 2);
    assert!(subscriptions.active_for_user("u2").await.unwrap().is_none());

    h.clock.advance(Duration::days(17));
    let expiring = subscriptions.expiring_within(Duration::days(5)).await.unwrap();
    assert_eq!(expiring.len(), 1);
    assert_eq!(expiring[0].id, first.id);
}
