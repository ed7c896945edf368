#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use billing_core::billing::{
    CardDetails, ChargeReceipt, GatewayError, PaymentGateway, RefundReceipt, SubscriptionPlan,
};
use billing_core::{BillingConfig, BillingPlatform, ManualClock};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

/// Gateway whose answers are queued by the test. An empty queue approves.
#[derive(Default)]
pub struct ScriptedGateway {
    charges: Mutex<VecDeque<Result<(), GatewayError>>>,
    refunds: Mutex<VecDeque<Result<(), GatewayError>>>,
    charge_delay: Mutex<Option<StdDuration>>,
    pub charge_calls: AtomicUsize,
    pub refund_calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn script_charges(&self, outcomes: impl IntoIterator<Item = Result<(), GatewayError>>) {
        self.charges.lock().unwrap().extend(outcomes);
    }

    pub fn script_refunds(&self, outcomes: impl IntoIterator<Item = Result<(), GatewayError>>) {
        self.refunds.lock().unwrap().extend(outcomes);
    }

    pub fn hang_charges_for(&self, delay: StdDuration) {
        *self.charge_delay.lock().unwrap() = Some(delay);
    }

    pub fn charges(&self) -> usize {
        self.charge_calls.load(Ordering::SeqCst)
    }

    pub fn refunds(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }
}

pub fn declined() -> GatewayError {
    GatewayError::Declined {
        code: "card_declined".into(),
        message: "the card was declined".into(),
    }
}

pub fn unavailable() -> GatewayError {
    GatewayError::Unavailable("upstream 503".into())
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn charge(
        &self,
        _card: &CardDetails,
        _amount: Decimal,
        _currency: &str,
    ) -> Result<ChargeReceipt, GatewayError> {
        self.charge_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.charge_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = self.charges.lock().unwrap().pop_front().unwrap_or(Ok(()));
        outcome.map(|()| ChargeReceipt {
            gateway_transaction_id: format!("ch_{}", Uuid::new_v4().simple()),
        })
    }

    async fn refund(
        &self,
        _gateway_transaction_id: &str,
        _amount: Decimal,
        _reason: &str,
    ) -> Result<RefundReceipt, GatewayError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.refunds.lock().unwrap().pop_front().unwrap_or(Ok(()));
        outcome.map(|()| RefundReceipt {
            refund_transaction_id: format!("re_{}", Uuid::new_v4().simple()),
        })
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
}

pub fn card() -> CardDetails {
    CardDetails {
        holder_name: "Ada Lovelace".into(),
        number: "4242424242424242".into(),
        expire_month: 12,
        expire_year: 2030,
        cvc: "123".into(),
    }
}

/// 30 days, refunded on cancel, 100 bonus credits.
pub fn pro_plan() -> SubscriptionPlan {
    SubscriptionPlan {
        id: Uuid::from_u128(0x0a),
        code: "pro".into(),
        name: "Pro".into(),
        price: dec!(50),
        currency: "USD".into(),
        duration_days: 30,
        bonus_credits: dec!(100),
        refund_on_cancel: true,
        active: true,
    }
}

/// 30 days, no refund on cancel, no bonus.
pub fn basic_plan() -> SubscriptionPlan {
    SubscriptionPlan {
        id: Uuid::from_u128(0x0b),
        code: "basic".into(),
        name: "Basic".into(),
        price: dec!(10),
        currency: "USD".into(),
        duration_days: 30,
        bonus_credits: Decimal::ZERO,
        refund_on_cancel: false,
        active: true,
    }
}

pub fn retired_plan() -> SubscriptionPlan {
    SubscriptionPlan {
        id: Uuid::from_u128(0x0c),
        code: "legacy".into(),
        name: "Legacy".into(),
        active: false,
        ..basic_plan()
    }
}

pub fn test_config() -> BillingConfig {
    BillingConfig {
        retry_base_delay: StdDuration::ZERO,
        retry_max_delay: StdDuration::ZERO,
        gateway_timeout: StdDuration::from_secs(5),
        ..BillingConfig::default()
    }
}

pub struct Harness {
    pub platform: Arc<BillingPlatform>,
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<ScriptedGateway>,
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: BillingConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(start_time()));
    let gateway = Arc::new(ScriptedGateway::default());
    let platform = BillingPlatform::in_memory(
        config,
        gateway.clone(),
        vec![pro_plan(), basic_plan(), retired_plan()],
        clock.clone(),
    )
    .unwrap();
    Harness {
        platform: Arc::new(platform),
        clock,
        gateway,
    }
}
