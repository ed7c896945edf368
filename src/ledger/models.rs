use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Credit pools an account holds. Each pool has its own balance and cannot go negative.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditType {
    #[default]
    Standard,
    Advanced,
}

impl CreditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditType::Standard => "STANDARD",
            CreditType::Advanced => "ADVANCED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "STANDARD" => Some(CreditType::Standard),
            "ADVANCED" => Some(CreditType::Advanced),
            _ => None,
        }
    }
}

impl fmt::Display for CreditType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: ledger-balance-model -> cached per-user balances with optimistic version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub user_id: String,
    /// Standard credit balance.
    pub balance: Decimal,
    pub advanced_balance: Decimal,
    /// Sum of positive standard entries.
    pub total_earned: Decimal,
    /// Sum of negative standard entries, as a positive number.
    pub total_used: Decimal,
    pub advanced_total_earned: Decimal,
    pub advanced_total_used: Decimal,
    /// Bumped by every append; appends must present the version they read.
    pub version: i64,
    /// Soft-delete mark. Closed accounts keep their rows and history.
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    pub fn empty(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            balance: Decimal::ZERO,
            advanced_balance: Decimal::ZERO,
            total_earned: Decimal::ZERO,
            total_used: Decimal::ZERO,
            advanced_total_earned: Decimal::ZERO,
            advanced_total_used: Decimal::ZERO,
            version: 0,
            deleted: false,
            updated_at: now,
        }
    }

    pub fn balance_of(&self, credit_type: CreditType) -> Decimal {
        match credit_type {
            CreditType::Standard => self.balance,
            CreditType::Advanced => self.advanced_balance,
        }
    }

    /// Checks and applies one entry: version, closure and sufficiency are verified before
    /// balance, totals and version move together. Idempotency keys are the store's concern.
    pub fn apply_entry(
        &mut self,
        tx: &CreditTransaction,
        expected_version: i64,
    ) -> BillingResult<()> {
        if self.version != expected_version {
            return Err(BillingError::version_conflict(
                format!("account:{}", self.user_id),
                expected_version,
                self.version,
            ));
        }
        if self.deleted {
            return Err(BillingError::invalid_transition(
                "account",
                &self.user_id,
                "closed",
                tx.kind,
            ));
        }
        let current = self.balance_of(tx.credit_type);
        let next = current + tx.amount;
        if next < Decimal::ZERO {
            return Err(BillingError::InsufficientCredits {
                user_id: tx.user_id.clone(),
                balance: current,
                requested: -tx.amount,
            });
        }

        let (balance, earned, used) = match tx.credit_type {
            CreditType::Standard => (
                &mut self.balance,
                &mut self.total_earned,
                &mut self.total_used,
            ),
            CreditType::Advanced => (
                &mut self.advanced_balance,
                &mut self.advanced_total_earned,
                &mut self.advanced_total_used,
            ),
        };
        *balance = next;
        if tx.amount > Decimal::ZERO {
            *earned += tx.amount;
        } else {
            *used -= tx.amount;
        }
        self.version += 1;
        self.updated_at = tx.timestamp;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Grant,
    Debit,
    RefundCredit,
    Adjustment,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Grant => "GRANT",
            TransactionKind::Debit => "DEBIT",
            TransactionKind::RefundCredit => "REFUND_CREDIT",
            TransactionKind::Adjustment => "ADJUSTMENT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "GRANT" => Some(TransactionKind::Grant),
            "DEBIT" => Some(TransactionKind::Debit),
            "REFUND_CREDIT" => Some(TransactionKind::RefundCredit),
            "ADJUSTMENT" => Some(TransactionKind::Adjustment),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: ledger-transaction-model -> immutable signed ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: String,
    /// Positive for credits, negative for debits and grant reversals.
    pub amount: Decimal,
    pub kind: TransactionKind,
    #[serde(default)]
    pub credit_type: CreditType,
    pub idempotency_key: String,
    pub timestamp: DateTime<Utc>,
    pub related_payment_id: Option<Uuid>,
    /// Set on entries that offset an earlier transaction.
    pub reverses: Option<Uuid>,
    pub description: Option<String>,
    pub deleted: bool,
}

impl CreditTransaction {
    /// True when a retried request carries the same economic intent as this entry.
    pub fn matches_request(
        &self,
        amount: Decimal,
        kind: TransactionKind,
        credit_type: CreditType,
        related_payment_id: Option<Uuid>,
    ) -> bool {
        self.amount == amount
            && self.kind == kind
            && self.credit_type == credit_type
            && self.related_payment_id == related_payment_id
    }
}
