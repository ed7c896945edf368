use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use super::models::CardDetails;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub gateway_transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub refund_transaction_id: String,
}

/// Failure reported by a gateway, already classified by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("gateway call timed out")]
    Timeout,
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("declined ({code}): {message}")]
    Declined { code: String, message: String },
    #[error("request rejected by gateway: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Network-level failures are retried; declines and rejections are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Timeout | GatewayError::Unavailable(_))
    }
}

/// key: billing-gateway-adapter -> external card processor
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn charge(
        &self,
        card: &CardDetails,
        amount: Decimal,
        currency: &str,
    ) -> Result<ChargeReceipt, GatewayError>;

    async fn refund(
        &self,
        gateway_transaction_id: &str,
        amount: Decimal,
        reason: &str,
    ) -> Result<RefundReceipt, GatewayError>;
}

pub const SANDBOX_DECLINED_CARD: &str = "4000000000000002";
pub const SANDBOX_INSUFFICIENT_FUNDS_CARD: &str = "4000000000009995";
pub const SANDBOX_UNAVAILABLE_CARD: &str = "4000000000000119";

const SANDBOX_CHARGE_PREFIX: &str = "sbx_ch_";

/// key: billing-gateway-sandbox -> stub implementation
///
/// Approves every card except the sandbox test numbers above and only refunds charges
/// it issued itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct SandboxGateway;

#[async_trait]
impl PaymentGateway for SandboxGateway {
    fn name(&self) -> &str {
        "sandbox"
    }

    async fn charge(
        &self,
        card: &CardDetails,
        amount: Decimal,
        currency: &str,
    ) -> Result<ChargeReceipt, GatewayError> {
        if amount <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!(
                "cannot charge {amount} {currency}"
            )));
        }
        match card.number.as_str() {
            SANDBOX_DECLINED_CARD => Err(GatewayError::Declined {
                code: "card_declined".into(),
                message: "the card was declined".into(),
            }),
            SANDBOX_INSUFFICIENT_FUNDS_CARD => Err(GatewayError::Declined {
                code: "insufficient_funds".into(),
                message: "the card has insufficient funds".into(),
            }),
            SANDBOX_UNAVAILABLE_CARD => Err(GatewayError::Unavailable(
                "processing error, try again".into(),
            )),
            _ => Ok(ChargeReceipt {
                gateway_transaction_id: sandbox_id(SANDBOX_CHARGE_PREFIX),
            }),
        }
    }

    async fn refund(
        &self,
        gateway_transaction_id: &str,
        amount: Decimal,
        _reason: &str,
    ) -> Result<RefundReceipt, GatewayError> {
        if !gateway_transaction_id.starts_with(SANDBOX_CHARGE_PREFIX) {
            return Err(GatewayError::Rejected(format!(
                "unknown charge {gateway_transaction_id}"
            )));
        }
        if amount <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!("cannot refund {amount}")));
        }
        Ok(RefundReceipt {
            refund_transaction_id: sandbox_id("sbx_re_"),
        })
    }
}

fn sandbox_id(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}
