use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::adapters::{GatewayError, PaymentGateway};
use super::models::{validate_currency, CardDetails, Payment, PaymentRequest, PaymentStatus};
use super::store::PaymentRepository;
use crate::aggregate::AggregateLocks;
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::events::{DomainEvent, EventType, Outbox};
use crate::retry::RetryPolicy;

/// Card data parked between `create_payment` and the end of capture. Nothing else in the
/// crate sees full card numbers.
#[derive(Default)]
struct CardVault {
    cards: DashMap<Uuid, CardDetails>,
}

impl CardVault {
    fn store(&self, payment_id: Uuid, card: CardDetails) {
        self.cards.insert(payment_id, card);
    }

    fn get(&self, payment_id: Uuid) -> Option<CardDetails> {
        self.cards.get(&payment_id).map(|card| card.value().clone())
    }

    fn discard(&self, payment_id: Uuid) {
        self.cards.remove(&payment_id);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaymentSettings {
    pub gateway_retry: RetryPolicy,
    pub gateway_timeout: StdDuration,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            gateway_retry: RetryPolicy::default(),
            gateway_timeout: StdDuration::from_secs(10),
        }
    }
}

fn lock_key(payment_id: Uuid) -> String {
    format!("payment:{payment_id}")
}

/// key: billing-payment-state-machine -> create, capture, refund, cancel
///
/// Every command runs under the payment's aggregate lock, persists the new status and
/// enqueues its event before the lock is released; the outbox is flushed afterwards.
pub struct PaymentService {
    payments: Arc<dyn PaymentRepository>,
    gateway: Arc<dyn PaymentGateway>,
    outbox: Arc<Outbox>,
    locks: Arc<AggregateLocks>,
    clock: Arc<dyn Clock>,
    settings: PaymentSettings,
    vault: CardVault,
}

impl PaymentService {
    pub fn new(
        payments: Arc<dyn PaymentRepository>,
        gateway: Arc<dyn PaymentGateway>,
            outbox: Arc<Outbox>,
        locks: Arc<AggregateLocks>,
        clock: Arc<dyn Clock>,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            payments,
            gateway,
            outbox,
            locks,
            clock,
            settings,
            vault: CardVault::default(),
        }
    }

    pub async fn create_payment(&self, request: PaymentRequest) -> BillingResult<Payment> {
        self.create_payment_with_id(Uuid::new_v4(), request).await
    }

    /// Lets a caller that must reference the payment before it exists choose its id.
    pub async fn create_payment_with_id(
        &self,
        payment_id: Uuid,
        request: PaymentRequest,
    ) -> BillingResult<Payment> {
        let now = self.clock.now();
        if request.amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(format!(
                "payment amount must be greater than zero, got {}",
                request.amount
            )));
        }
        if request.user_id.trim().is_empty() {
            return Err(BillingError::InvalidRequest("user id is required".into()));
        }
        validate_currency(&request.currency)?;
        request.card.validate(now)?;

        let payment = Payment {
            id: payment_id,
            user_id: request.user_id,
            subscription_id: request.subscription_id,
            amount: request.amount,
            currency: request.currency,
            status: PaymentStatus::Pending,
            card_last4: request.card.last4(),
            gateway_transaction_id: None,
            refund_transaction_id: None,
            refunded_amount: None,
            error_message: None,
            attempts: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let guard = self.locks.acquire(&lock_key(payment.id)).await;
        let payment = self.payments.insert(payment).await?;
        self.vault.store(payment.id, request.card);
        self.outbox
            .enqueue(DomainEvent::payment(
                EventType::PaymentCreated,
                &payment,
                now,
            ))
            .await?;
        drop(guard);

        info!(
            payment_id = %payment.id,
            user_id = %payment.user_id,
            subscription_id = %payment.subscription_id,
            amount = %payment.amount,
            currency = %payment.currency,
            "payment created"
        );
        self.outbox.flush().await;
        Ok(payment)
    }

    /// Charges the card held for a PENDING payment. Retryable gateway failures are
    /// retried with backoff; the returned payment is SUCCESS or FAILED, never left
    /// ambiguous. `timeout` bounds each gateway call.
    pub async fn capture(
        &self,
        payment_id: Uuid,
        timeout: Option<StdDuration>,
    ) -> BillingResult<Payment> {
        let guard = self.locks.acquire(&lock_key(payment_id)).await;
        let mut payment = self.load(payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Err(BillingError::invalid_transition(
                "payment",
                payment.id,
                payment.status,
                PaymentStatus::Success,
            ));
        }
        let card = self.vault.get(payment.id).ok_or_else(|| {
            BillingError::InvalidRequest(format!(
                "card details for payment {} are no longer held",
                payment.id
            ))
        })?;

        let timeout = timeout.unwrap_or(self.settings.gateway_timeout);
        let retry = self.settings.gateway_retry;
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                timeout,
                self.gateway.charge(&card, payment.amount, &payment.currency),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout),
            };
            match result {
                Ok(receipt) => break Ok(receipt),
                Err(err) if err.is_retryable() && retry.allows_retry_after(attempt) => {
                    warn!(
                        ?err,
                        payment_id = %payment.id,
                        gateway = self.gateway.name(),
                        attempt,
                        max_attempts = retry.max_attempts,
                        "retryable gateway error during capture"
                    );
                    retry.backoff(attempt).await;
                }
                Err(err) => break Err(err),
            }
        };

        let now = self.clock.now();
        payment.attempts = attempt;
        let event_type = match outcome {
            Ok(receipt) => {
                payment.transition(PaymentStatus::Success, now)?;
                payment.gateway_transaction_id = Some(receipt.gateway_transaction_id);
                payment.error_message = None;
                EventType::PaymentSucceeded
            }
            Err(err) => {
                payment.transition(PaymentStatus::Failed, now)?;
                payment.error_message = Some(failure_message(&err, attempt));
                warn!(
                    ?err,
                    payment_id = %payment.id,
                    attempts = attempt,
                    "payment capture failed"
                );
                EventType::PaymentFailed
            }
        };

        let payment = self.payments.save(payment).await?;
        self.vault.discard(payment.id);
        self.outbox
            .enqueue(DomainEvent::payment(event_type, &payment, now))
            .await?;
        drop(guard);

        info!(
            payment_id = %payment.id,
            status = %payment.status,
            attempts = payment.attempts,
            "payment capture finished"
        );
        self.outbox.flush().await;
        Ok(payment)
    }

    /// Refunds `amount` of a SUCCESS payment, or retries a REFUND_FAILED one. Credits the
    /// payment granted are clawed back by the PaymentRefunded consumer, so a failed
    /// reversal is redelivered instead of lost.
    pub async fn refund(
        &self,
        payment_id: Uuid,
        amount: Decimal,
        reason: &str,
    ) -> BillingResult<Payment> {
        let guard = self.locks.acquire(&lock_key(payment_id)).await;
        let mut payment = self.load(payment_id).await?;
        if !payment.status.is_refundable() {
            return Err(BillingError::invalid_transition(
                "payment",
                payment.id,
                payment.status,
                PaymentStatus::Refunded,
            ));
        }
        if amount <= Decimal::ZERO || amount > payment.amount {
            return Err(BillingError::InvalidAmount(format!(
                "refund amount must be in (0, {}], got {amount}",
                payment.amount
            )));
        }
        let gateway_transaction_id = payment.gateway_transaction_id.clone().ok_or_else(|| {
            BillingError::InvalidRequest(format!(
                "payment {} has no gateway transaction to refund",
                payment.id
            ))
        })?;

        let retry = self.settings.gateway_retry;
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.settings.gateway_timeout,
                self.gateway
                    .refund(&gateway_transaction_id, amount, reason),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout),
            };
            match result {
                Ok(receipt) => break Ok(receipt),
                Err(err) if err.is_retryable() && retry.allows_retry_after(attempt) => {
                    warn!(
                        ?err,
                        payment_id = %payment.id,
                        attempt,
                        "retryable gateway error during refund"
                    );
                    retry.backoff(attempt).await;
                }
                Err(err) => break Err(err),
            }
        };

        let now = self.clock.now();
        let event_type = match outcome {
            Ok(receipt) => {
                payment.transition(PaymentStatus::Refunded, now)?;
                payment.refund_transaction_id = Some(receipt.refund_transaction_id);
                payment.refunded_amount = Some(amount);
                payment.error_message = None;
                EventType::PaymentRefunded
            }
            Err(err) => {
                payment.transition(PaymentStatus::RefundFailed, now)?;
                payment.error_message = Some(failure_message(&err, attempt));
                error!(
                    ?err,
                    payment_id = %payment.id,
                    %reason,
                    "refund failed; payment left refundable for manual retry"
                );
                EventType::PaymentRefundFailed
            }
        };

        let payment = self.payments.save(payment).await?;
        self.outbox
            .enqueue(DomainEvent::payment(event_type, &payment, now))
            .await?;
        drop(guard);

        if payment.status == PaymentStatus::Refunded {
            info!(
                payment_id = %payment.id,
                amount = %amount,
                %reason,
                "payment refunded"
            );
        }
        self.outbox.flush().await;
        Ok(payment)
    }

    pub async fn cancel(&self, payment_id: Uuid) -> BillingResult<Payment> {
        let guard = self.locks.acquire(&lock_key(payment_id)).await;
        let mut payment = self.load(payment_id).await?;
        let now = self.clock.now();
        payment.transition(PaymentStatus::Cancelled, now)?;
        let payment = self.payments.save(payment).await?;
        self.vault.discard(payment.id);
        self.outbox
            .enqueue(DomainEvent::payment(
                EventType::PaymentCancelled,
                &payment,
                now,
            ))
            .await?;
        drop(guard);

        info!(payment_id = %payment.id, "payment cancelled");
        self.outbox.flush().await;
        Ok(payment)
    }

    pub async fn get(&self, payment_id: Uuid) -> BillingResult<Payment> {
        self.load(payment_id).await
    }

    pub async fn for_user(&self, user_id: &str) -> BillingResult<Vec<Payment>> {
        self.payments.find_by_user_id(user_id).await
    }

    pub async fn for_subscription(&self, subscription_id: Uuid) -> BillingResult<Vec<Payment>> {
        self.payments.find_by_subscription_id(subscription_id).await
    }

    pub async fn pending(&self) -> BillingResult<Vec<Payment>> {
        self.payments.find_by_status(PaymentStatus::Pending).await
    }

    pub async fn refunded(&self) -> BillingResult<Vec<Payment>> {
        self.payments.find_by_status(PaymentStatus::Refunded).await
    }

    /// Fails PENDING payments that nobody captured within `older_than`. Payments whose
    /// lock is held are left for the next sweep.
    pub async fn sweep_stale_pending(&self, older_than: Duration) -> BillingResult<Vec<Payment>> {
        let now = self.clock.now();
        let mut swept = Vec::new();
        for candidate in self.pending().await? {
            if candidate.created_at + older_than > now {
                continue;
            }
            let Some(guard) = self.locks.try_acquire(&lock_key(candidate.id)) else {
                continue;
            };
            let Some(mut payment) = self.payments.get(candidate.id).await? else {
                continue;
            };
            if payment.status != PaymentStatus::Pending {
                continue;
            }
            payment.transition(PaymentStatus::Failed, now)?;
            payment.error_message = Some("capture abandoned".into());
            let payment = self.payments.save(payment).await?;
            self.vault.discard(payment.id);
            self.outbox
                .enqueue(DomainEvent::payment(
                    EventType::PaymentFailed,
                    &payment,
                    now,
                ))
                .await?;
            drop(guard);

            warn!(
                payment_id = %payment.id,
                created_at = %payment.created_at,
                "stale pending payment marked failed"
            );
            swept.push(payment);
        }
        if !swept.is_empty() {
            self.outbox.flush().await;
        }
        Ok(swept)
    }

    /// Re-enqueues the status event of payments changed since `since` whose latest change
    /// never reached the outbox. Older payments may have had their entries pruned, so
    /// the window must not reach past the outbox retention.
    pub async fn rederive_events(&self, since: DateTime<Utc>) -> BillingResult<usize> {
        let mut rederived = 0;
        for payment in self.payments.find_updated_since(since).await? {
            let aggregate_id = payment.id.to_string();
            let event_type = EventType::for_payment_status(payment.status);
            let announced = match self.outbox.latest_recorded(&aggregate_id).await? {
                Some((sequence, _)) if sequence >= payment.version => true,
                Some((_, recorded)) => recorded == event_type,
                None => false,
            };
            if announced {
                continue;
            }
            warn!(
                payment_id = %payment.id,
                status = %payment.status,
                version = payment.version,
                "re-deriving missing payment event"
            );
            self.outbox
                .enqueue(DomainEvent::payment(event_type, &payment, self.clock.now()))
                .await?;
            rederived += 1;
        }
        Ok(rederived)
    }

    async fn load(&self, payment_id: Uuid) -> BillingResult<Payment> {
        self.payments
            .get(payment_id)
            .await?
            .ok_or_else(|| BillingError::not_found("payment", payment_id))
    }
}

fn failure_message(err: &GatewayError, attempts: u32) -> String {
    match err {
        GatewayError::Timeout => format!("gateway timeout after {attempts} attempts"),
        GatewayError::Unavailable(reason) => {
            format!("gateway unavailable after {attempts} attempts: {reason}")
        }
        other => other.to_string(),
    }
}
