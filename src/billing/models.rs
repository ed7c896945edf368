use std::fmt;

use chrono::{DateTime, Datelike, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

static CURRENCY_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{3}$").expect("invalid regex"));
static CARD_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{12,19}$").expect("invalid regex"));
static CARD_CVC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{3,4}$").expect("invalid regex"));

/// key: billing-plan-model -> catalog entry driving price, period, bonus credits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub price: Decimal,
    pub currency: String,
    pub duration_days: i64,
    #[serde(default)]
    pub bonus_credits: Decimal,
    #[serde(default)]
    pub refund_on_cancel: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl SubscriptionPlan {
    pub fn period(&self) -> Duration {
        Duration::days(self.duration_days)
    }

    pub fn validate(&self) -> BillingResult<()> {
        if self.price <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(format!(
                "plan {} must have a positive price",
                self.code
            )));
        }
        if self.bonus_credits < Decimal::ZERO {
            return Err(BillingError::InvalidAmount(format!(
                "plan {} cannot grant negative bonus credits",
                self.code
            )));
        }
        if self.duration_days <= 0 {
            return Err(BillingError::InvalidRequest(format!(
                "plan {} must last at least one day",
                self.code
            )));
        }
        validate_currency(&self.currency)
    }
}

/// Card data accepted at payment creation. Only the last four digits ever leave the
/// payment service; `Debug` never prints the number or CVC.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct CardDetails {
    pub holder_name: String,
    pub number: String,
    pub expire_month: u32,
    pub expire_year: i32,
    pub cvc: String,
}

impl fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardDetails")
            .field("holder_name", &self.holder_name)
            .field("number", &format_args!("**** {}", self.last4()))
            .field("expire_month", &self.expire_month)
            .field("expire_year", &self.expire_year)
            .finish_non_exhaustive()
    }
}

impl CardDetails {
    pub fn last4(&self) -> String {
        let digits = self.number.len();
        self.number
            .get(digits.saturating_sub(4)..)
            .unwrap_or_default()
            .to_string()
    }

    pub fn validate(&self, now: DateTime<Utc>) -> BillingResult<()> {
        if self.holder_name.trim().is_empty() {
            return Err(BillingError::InvalidRequest(
                "card holder name is required".into(),
            ));
        }
        if !CARD_NUMBER.is_match(&self.number) || !luhn_valid(&self.number) {
            return Err(BillingError::InvalidRequest("card number is malformed".into()));
        }
        if !(1..=12).contains(&self.expire_month) {
            return Err(BillingError::InvalidRequest(
                "card expiry month must be between 1 and 12".into(),
            ));
        }
        if !(1000..=9999).contains(&self.expire_year) {
            return Err(BillingError::InvalidRequest(
                "card expiry year must have four digits".into(),
            ));
        }
        if (self.expire_year, self.expire_month) < (now.year(), now.month()) {
            return Err(BillingError::InvalidRequest("card has expired".into()));
        }
        if !CARD_CVC.is_match(&self.cvc) {
            return Err(BillingError::InvalidRequest("card cvc is malformed".into()));
        }
        Ok(())
    }
}

fn luhn_valid(number: &str) -> bool {
    let mut sum = 0;
    for (idx, ch) in number.chars().rev().enumerate() {
        let Some(mut digit) = ch.to_digit(10) else {
            return false;
        };
        if idx % 2 == 1 {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
    }
    sum % 10 == 0
}

pub fn validate_currency(currency: &str) -> BillingResult<()> {
    if CURRENCY_CODE.is_match(currency) {
        Ok(())
    } else {
        Err(BillingError::InvalidRequest(format!(
            "currency `{currency}` is not an ISO-4217 code"
        )))
    }
}

/// key: billing-payment-request -> createPayment input
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub user_id: String,
    pub subscription_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub card: CardDetails,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Refunded,
    RefundFailed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::RefundFailed => "REFUND_FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }

    /// Edges of the payment lifecycle graph. REFUND_FAILED -> REFUND_FAILED is a failed
    /// manual retry.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Success)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Failed, Cancelled)
                | (Success, Refunded)
                | (Success, RefundFailed)
                | (RefundFailed, Refunded)
                | (RefundFailed, RefundFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Pending | PaymentStatus::Failed)
    }

    pub fn is_refundable(self) -> bool {
        matches!(self, PaymentStatus::Success | PaymentStatus::RefundFailed)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: billing-payment-model -> gateway-backed charge lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: String,
    pub subscription_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentStatus,
    pub card_last4: String,
    pub gateway_transaction_id: Option<String>,
    pub refund_transaction_id: Option<String>,
    pub refunded_amount: Option<Decimal>,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Applies a status change, refusing edges outside the lifecycle graph.
    pub fn transition(&mut self, next: PaymentStatus, now: DateTime<Utc>) -> BillingResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(BillingError::invalid_transition(
                "payment", self.id, self.status, next,
            ));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Expired,
    Cancelled,
    Suspended,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "PENDING",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Expired => "EXPIRED",
            SubscriptionStatus::Cancelled => "CANCELLED",
            SubscriptionStatus::Suspended => "SUSPENDED",
        }
    }

    /// ACTIVE -> ACTIVE is a renewal that extends the current period.
    pub fn can_transition_to(self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Cancelled)
                | (Active, Active)
                | (Active, Expired)
                | (Active, Cancelled)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Suspended, Expired)
                | (Suspended, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriptionStatus::Expired | SubscriptionStatus::Cancelled)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: billing-subscription-model -> user plan lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: String,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
    /// Last payment that paid for a period; refunded on cancel when the plan says so.
    pub last_payment_id: Option<Uuid>,
    /// Renewal payment currently awaiting an outcome.
    pub pending_payment_id: Option<Uuid>,
    pub cancel_reason: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn transition(
        &mut self,
        next: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(BillingError::invalid_transition(
                "subscription",
                self.id,
                self.status,
                next,
            ));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Moment after which the expiry sweep retires this subscription, if any.
    pub fn expires_after(&self, grace: Duration) -> Option<DateTime<Utc>> {
        match self.status {
            SubscriptionStatus::Active => self.end_date,
            SubscriptionStatus::Suspended => {
                let grace_end = self.suspended_at.map(|at| at + grace);
                match (self.end_date, grace_end) {
                    (Some(end), Some(grace_end)) => Some(end.max(grace_end)),
                    (end, grace_end) => end.or(grace_end),
                }
            }
            _ => None,
        }
    }

    pub fn within_grace(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.suspended_at
            .map(|suspended_at| suspended_at + grace >= now)
            .unwrap_or(false)
    }
}
