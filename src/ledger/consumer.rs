use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::engine::CreditEngine;
use super::models::TransactionKind;
use crate::billing::models::Payment;
use crate::billing::store::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::events::{DomainEvent, EventHandler, EventType};

/// key: ledger-bonus-consumer -> plan bonus credits on activation and renewal
///
/// The grant is keyed by subscription and paying payment, so a redelivered or re-derived
/// activation never grants twice.
pub struct BonusCreditConsumer {
    credits: Arc<CreditEngine>,
    plans: Arc<dyn PlanCatalog>,
}

impl BonusCreditConsumer {
    pub fn new(credits: Arc<CreditEngine>, plans: Arc<dyn PlanCatalog>) -> Self {
        Self { credits, plans }
    }
}

#[async_trait]
impl EventHandler for BonusCreditConsumer {
    fn name(&self) -> &str {
        "bonus-credit-consumer"
    }

    async fn handle(&self, event: &DomainEvent) -> BillingResult<()> {
        if !matches!(
            event.event_type,
            EventType::SubscriptionActivated | EventType::SubscriptionRenewed
        ) {
            return Ok(());
        }
        let Some(subscription) = event.as_subscription() else {
            return Ok(());
        };
        let Some(payment_id) = subscription.last_payment_id else {
            warn!(
                subscription_id = %subscription.id,
                "activated subscription carries no payment; bonus skipped"
            );
            return Ok(());
        };

        let plan = match self.plans.get(subscription.plan_id).await {
            Ok(plan) => plan,
            Err(BillingError::NotFound { .. }) => {
                warn!(
                    subscription_id = %subscription.id,
                    plan_id = %subscription.plan_id,
                    "plan no longer in catalog; bonus skipped"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if plan.bonus_credits <= Decimal::ZERO {
            return Ok(());
        }

        let key = format!("subscription-bonus:{}:{}", subscription.id, payment_id);
        let granted = self
            .credits
            .credit(
                &subscription.user_id,
                plan.bonus_credits,
                TransactionKind::Grant,
                &key,
                Some(payment_id),
            )
            .await;
        let grant = match granted {
            Ok(grant) => grant,
            Err(BillingError::InvalidStateTransition {
                entity: "account", ..
            }) => {
                warn!(
                    user_id = %subscription.user_id,
                    subscription_id = %subscription.id,
                    "account is closed; bonus skipped"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            transaction_id = %grant.id,
            amount = %grant.amount,
            "subscription bonus credited"
        );
        Ok(())
    }
}

/// key: ledger-refund-reversal -> claw back credits granted by a refunded payment
///
/// Reverses the refunded share of the payment's grants. A shortfall is not an error: the
/// reconciliation sweep re-runs the reversal for refunded payments and collects it once
/// the user holds credits again.
pub struct RefundReversalConsumer {
    credits: Arc<CreditEngine>,
}

impl RefundReversalConsumer {
    pub fn new(credits: Arc<CreditEngine>) -> Self {
        Self { credits }
    }
}

/// Fraction of the payment that was refunded, 1 when the refund carries no amount.
pub fn refunded_share(payment: &Payment) -> Decimal {
    match payment.refunded_amount {
        Some(refunded) if payment.amount > Decimal::ZERO => {
            (refunded / payment.amount).clamp(Decimal::ZERO, Decimal::ONE)
        }
        _ => Decimal::ONE,
    }
}

#[async_trait]
impl EventHandler for RefundReversalConsumer {
    fn name(&self) -> &str {
        "refund-reversal-consumer"
    }

    async fn handle(&self, event: &DomainEvent) -> BillingResult<()> {
        if event.event_type != EventType::PaymentRefunded {
            return Ok(());
        }
        let Some(payment) = event.as_payment() else {
            return Ok(());
        };

        let outcome = self
            .credits
            .reverse_payment_grants(payment.id, refunded_share(payment))
            .await?;
        info!(
            payment_id = %payment.id,
            user_id = %payment.user_id,
            reversals = outcome.reversals.len(),
            shortfall = %outcome.shortfall,
            "refunded payment's grants reversed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::models::PaymentStatus;
    use chrono::Utc;
    use rstest::rstest;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn payment(amount: Decimal, refunded_amount: Option<Decimal>) -> Payment {
        let now = Utc::now();
        Payment {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            subscription_id: Uuid::new_v4(),
            amount,
            currency: "USD".into(),
            status: PaymentStatus::Refunded,
            card_last4: "4242".into(),
            gateway_transaction_id: Some("txn_1".into()),
            refund_transaction_id: Some("rf_1".into()),
            refunded_amount,
            error_message: None,
            attempts: 1,
            version: 3,
            created_at: now,
            updated_at: now,
        }
    }

    #[rstest]
    #[case(dec!(50), Some(dec!(50)), dec!(1))]
    #[case(dec!(50), Some(dec!(25)), dec!(0.5))]
    #[case(dec!(50), None, dec!(1))]
    #[case(dec!(50), Some(dec!(80)), dec!(1))]
    #[case(dec!(0), Some(dec!(0)), dec!(1))]
    fn refunded_share_follows_the_refunded_amount(
        #[case] amount: Decimal,
        #[case] refunded: Option<Decimal>,
        #[case] expected: Decimal,
    ) {
        assert_eq!(refunded_share(&payment(amount, refunded)), expected);
    }
}
