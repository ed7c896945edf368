use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

/// key: billing-error-kind -> caller-facing failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidAmount,
    InsufficientCredits,
    DuplicateIdempotencyKey,
    GatewayTimeout,
    GatewayDeclined,
    VersionConflict,
    NotFound,
    InvalidStateTransition,
    InvalidRequest,
    Delivery,
    Contended,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidAmount => "invalid_amount",
            ErrorKind::InsufficientCredits => "insufficient_credits",
            ErrorKind::DuplicateIdempotencyKey => "duplicate_idempotency_key",
            ErrorKind::GatewayTimeout => "gateway_timeout",
            ErrorKind::GatewayDeclined => "gateway_declined",
            ErrorKind::VersionConflict => "version_conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidStateTransition => "invalid_state_transition",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Delivery => "delivery",
            ErrorKind::Contended => "contended",
            ErrorKind::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BillingError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("insufficient credits for user {user_id}: balance {balance}, requested {requested}")]
    InsufficientCredits {
        user_id: String,
        balance: Decimal,
        requested: Decimal,
    },
    #[error("idempotency key `{key}` was already used by user {user_id} for a different request")]
    DuplicateIdempotencyKey { user_id: String, key: String },
    #[error("gateway timeout: {0}")]
    GatewayTimeout(String),
    #[error("gateway declined: {0}")]
    GatewayDeclined(String),
    #[error("version conflict on {aggregate}: expected {expected}, found {found}")]
    VersionConflict {
        aggregate: String,
        expected: i64,
        found: i64,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid state transition for {entity} {id}: {from} -> {to}")]
    InvalidStateTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("event delivery failed: {0}")]
    Delivery(String),
    /// Optimistic writes kept losing to concurrent writers until the retry budget ran out.
    #[error("{aggregate} is busy after {attempts} attempts; retry later")]
    Contended { aggregate: String, attempts: u32 },
    #[error("storage failure: {0}")]
    Storage(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::InvalidAmount(_) => ErrorKind::InvalidAmount,
            BillingError::InsufficientCredits { .. } => ErrorKind::InsufficientCredits,
            BillingError::DuplicateIdempotencyKey { .. } => ErrorKind::DuplicateIdempotencyKey,
            BillingError::GatewayTimeout(_) => ErrorKind::GatewayTimeout,
            BillingError::GatewayDeclined(_) => ErrorKind::GatewayDeclined,
            BillingError::VersionConflict { .. } => ErrorKind::VersionConflict,
            BillingError::NotFound { .. } => ErrorKind::NotFound,
            BillingError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            BillingError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            BillingError::Delivery(_) => ErrorKind::Delivery,
            BillingError::Contended { .. } => ErrorKind::Contended,
            BillingError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Timeouts and optimistic-write conflicts are retried internally before surfacing.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::GatewayTimeout(_) | BillingError::VersionConflict { .. }
        )
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        BillingError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        id: impl ToString,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        BillingError::InvalidStateTransition {
            entity,
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn version_conflict(aggregate: impl ToString, expected: i64, found: i64) -> Self {
        BillingError::VersionConflict {
            aggregate: aggregate.to_string(),
            expected,
            found,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Storage(format!("stored record could not be decoded: {err}"))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    #[rstest]
    #[case::invalid_amount(BillingError::InvalidAmount("zero".into()), ErrorKind::InvalidAmount, false)]
    #[case::timeout(BillingError::GatewayTimeout("charge".into()), ErrorKind::GatewayTimeout, true)]
    #[case::declined(BillingError::GatewayDeclined("stolen card".into()), ErrorKind::GatewayDeclined, false)]
    #[case::conflict(BillingError::version_conflict("ledger:u1", 2, 3), ErrorKind::VersionConflict, true)]
    #[case::missing(BillingError::not_found("payment", "p-1"), ErrorKind::NotFound, false)]
    #[case::contended(BillingError::Contended { aggregate: "account:u1".into(), attempts: 5 }, ErrorKind::Contended, false)]
    #[case::storage(BillingError::from(sqlx::Error::PoolTimedOut), ErrorKind::Storage, false)]
    fn classifies_errors(
        #[case] error: BillingError,
        #[case] kind: ErrorKind,
        #[case] retryable: bool,
    ) {
        assert_eq!(error.kind(), kind);
        assert_eq!(error.is_retryable(), retryable);
    }

    #[test]
    fn renders_human_messages() {
        let err = BillingError::InsufficientCredits {
            user_id: "u1".into(),
            balance: dec!(0),
            requested: dec!(1),
        };
        assert_eq!(
            err.to_string(),
            "insufficient credits for user u1: balance 0, requested 1"
        );

        let err = BillingError::invalid_transition("payment", "p-1", "failed", "refunded");
        assert_eq!(
            err.to_string(),
            "invalid state transition for payment p-1: failed -> refunded"
        );
        assert_eq!(err.kind().as_str(), "invalid_state_transition");
    }
}
