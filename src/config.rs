use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Duration;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::billing::models::SubscriptionPlan;
use crate::billing::payments::PaymentSettings;
use crate::retry::RetryPolicy;

/// key: billing-config -> expiration scan cadence
pub static BILLING_EXPIRATION_SCAN_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_EXPIRATION_SCAN_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

/// key: billing-config -> grace window before a suspended subscription expires
pub static BILLING_SUSPENSION_GRACE_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_SUSPENSION_GRACE_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(3)
});

pub static BILLING_LEDGER_MAX_APPEND_ATTEMPTS: Lazy<u32> = Lazy::new(|| {
    std::env::var("BILLING_LEDGER_MAX_APPEND_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5)
});

pub static BILLING_GATEWAY_MAX_ATTEMPTS: Lazy<u32> = Lazy::new(|| {
    std::env::var("BILLING_GATEWAY_MAX_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3)
});

pub static BILLING_GATEWAY_TIMEOUT_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_GATEWAY_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(10_000)
});

pub static BILLING_RETRY_BASE_DELAY_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_RETRY_BASE_DELAY_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(50)
});

pub static BILLING_RETRY_MAX_DELAY_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_RETRY_MAX_DELAY_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(2_000)
});

/// key: billing-config -> age at which an uncaptured payment is abandoned
pub static BILLING_PENDING_PAYMENT_TIMEOUT_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_PENDING_PAYMENT_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(900)
});

/// key: billing-config -> welcome grant on first ledger access
pub static BILLING_INITIAL_CREDIT_AMOUNT: Lazy<Decimal> = Lazy::new(|| {
    std::env::var("BILLING_INITIAL_CREDIT_AMOUNT")
        .ok()
        .and_then(|value| value.trim().parse::<Decimal>().ok())
        .filter(|value| *value >= Decimal::ZERO)
        .unwrap_or(Decimal::ZERO)
});

pub static BILLING_INITIAL_ADVANCED_CREDIT_AMOUNT: Lazy<Decimal> = Lazy::new(|| {
    std::env::var("BILLING_INITIAL_ADVANCED_CREDIT_AMOUNT")
        .ok()
        .and_then(|value| value.trim().parse::<Decimal>().ok())
        .filter(|value| *value >= Decimal::ZERO)
        .unwrap_or(Decimal::ZERO)
});

/// key: billing-config -> delivery attempts before an outbox entry is dead-lettered
pub static BILLING_OUTBOX_MAX_ATTEMPTS: Lazy<u32> = Lazy::new(|| {
    std::env::var("BILLING_OUTBOX_MAX_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(10)
});

/// key: billing-config -> how long delivered events and consumer marks are kept
pub static BILLING_OUTBOX_RETENTION_HOURS: Lazy<i64> = Lazy::new(|| {
    std::env::var("BILLING_OUTBOX_RETENTION_HOURS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(168)
});

pub static BILLING_DATABASE_MAX_CONNECTIONS: Lazy<u32> = Lazy::new(|| {
    std::env::var("BILLING_DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5)
});

/// Postgres is used when set; otherwise the platform runs on in-process stores.
pub static DATABASE_URL: Lazy<Option<String>> = Lazy::new(|| read_optional_env("DATABASE_URL"));

pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
});

/// key: billing-config -> prometheus scrape listener
pub static BILLING_METRICS_ADDR: Lazy<Option<SocketAddr>> = Lazy::new(|| {
    read_optional_env("BILLING_METRICS_ADDR").and_then(|value| value.parse::<SocketAddr>().ok())
});

pub static BILLING_PLAN_CATALOG_PATH: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("BILLING_PLAN_CATALOG_PATH"));

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Snapshot of the settings the platform is wired with.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingConfig {
    pub expiration_scan_interval: StdDuration,
    pub suspension_grace: Duration,
    pub ledger_max_append_attempts: u32,
    pub gateway_max_attempts: u32,
    pub gateway_timeout: StdDuration,
    pub retry_base_delay: StdDuration,
    pub retry_max_delay: StdDuration,
    pub pending_payment_timeout: Duration,
    pub initial_credit_amount: Decimal,
    pub initial_advanced_credit_amount: Decimal,
    pub outbox_max_attempts: u32,
    pub outbox_retention: Duration,
    pub plan_catalog_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            expiration_scan_interval: StdDuration::from_secs(300),
            suspension_grace: Duration::days(3),
            ledger_max_append_attempts: 5,
            gateway_max_attempts: 3,
            gateway_timeout: StdDuration::from_millis(10_000),
            retry_base_delay: StdDuration::from_millis(50),
            retry_max_delay: StdDuration::from_millis(2_000),
            pending_payment_timeout: Duration::seconds(900),
            initial_credit_amount: Decimal::ZERO,
            initial_advanced_credit_amount: Decimal::ZERO,
            outbox_max_attempts: 10,
            outbox_retention: Duration::hours(168),
            plan_catalog_path: None,
            database_url: None,
            database_max_connections: 5,
            metrics_addr: None,
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> Self {
        Self {
            expiration_scan_interval: StdDuration::from_secs(
                *BILLING_EXPIRATION_SCAN_INTERVAL_SECS,
            ),
            suspension_grace: Duration::days(*BILLING_SUSPENSION_GRACE_DAYS),
            ledger_max_append_attempts: *BILLING_LEDGER_MAX_APPEND_ATTEMPTS,
            gateway_max_attempts: *BILLING_GATEWAY_MAX_ATTEMPTS,
            gateway_timeout: StdDuration::from_millis(*BILLING_GATEWAY_TIMEOUT_MS),
            retry_base_delay: StdDuration::from_millis(*BILLING_RETRY_BASE_DELAY_MS),
            retry_max_delay: StdDuration::from_millis(*BILLING_RETRY_MAX_DELAY_MS),
            pending_payment_timeout: Duration::seconds(*BILLING_PENDING_PAYMENT_TIMEOUT_SECS),
            initial_credit_amount: *BILLING_INITIAL_CREDIT_AMOUNT,
            initial_advanced_credit_amount: *BILLING_INITIAL_ADVANCED_CREDIT_AMOUNT,
            outbox_max_attempts: *BILLING_OUTBOX_MAX_ATTEMPTS,
            outbox_retention: Duration::hours(*BILLING_OUTBOX_RETENTION_HOURS),
            plan_catalog_path: BILLING_PLAN_CATALOG_PATH.as_ref().map(PathBuf::from),
            database_url: DATABASE_URL.clone(),
            database_max_connections: *BILLING_DATABASE_MAX_CONNECTIONS,
            metrics_addr: *BILLING_METRICS_ADDR,
        }
    }

    pub fn ledger_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.ledger_max_append_attempts,
            self.retry_base_delay,
            self.retry_max_delay,
        )
    }

    pub fn gateway_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.gateway_max_attempts,
            self.retry_base_delay,
            self.retry_max_delay,
        )
    }

    pub fn payment_settings(&self) -> PaymentSettings {
        PaymentSettings {
            gateway_retry: self.gateway_retry(),
            gateway_timeout: self.gateway_timeout,
        }
    }

    pub fn load_plans(&self) -> Result<Vec<SubscriptionPlan>> {
        match &self.plan_catalog_path {
            Some(path) => load_plan_catalog(path),
            None => Ok(default_plan_catalog()),
        }
    }
}

/// Reads a JSON array of plans and validates every entry.
pub fn load_plan_catalog(path: &Path) -> Result<Vec<SubscriptionPlan>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read plan catalog {}", path.display()))?;
    let plans: Vec<SubscriptionPlan> = serde_json::from_str(&raw)
        .with_context(|| format!("plan catalog {} is not valid JSON", path.display()))?;
    for plan in &plans {
        plan.validate()
            .with_context(|| format!("plan `{}` in {} is invalid", plan.code, path.display()))?;
    }
    Ok(plans)
}

pub fn default_plan_catalog() -> Vec<SubscriptionPlan> {
    vec![
        SubscriptionPlan {
            id: Uuid::from_u128(0x5b1f_0c9e_4f7a_4a8e_9d01_0000_0000_0001),
            code: "starter-monthly".into(),
            name: "Starter".into(),
            price: Decimal::new(999, 2),
            currency: "USD".into(),
            duration_days: 30,
            bonus_credits: Decimal::from(100),
            refund_on_cancel: false,
            active: true,
        },
        SubscriptionPlan {
            id: Uuid::from_u128(0x5b1f_0c9e_4f7a_4a8e_9d01_0000_0000_0002),
            code: "pro-monthly".into(),
            name: "Pro".into(),
            price: Decimal::new(2999, 2),
            currency: "USD".into(),
            duration_days: 30,
            bonus_credits: Decimal::from(500),
            refund_on_cancel: true,
            active: true,
        },
        SubscriptionPlan {
            id: Uuid::from_u128(0x5b1f_0c9e_4f7a_4a8e_9d01_0000_0000_0003),
            code: "pro-annual".into(),
            name: "Pro (annual)".into(),
            price: Decimal::from(299),
            currency: "USD".into(),
            duration_days: 365,
            bonus_credits: Decimal::from(6000),
            refund_on_cancel: true,
            active: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn default_catalog_is_valid() {
        let plans = default_plan_catalog();
        assert_eq!(plans.len(), 3);
        for plan in plans {
            plan.validate().unwrap();
        }
    }

    #[test]
    fn loads_catalog_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{
                "id": "6f1c2a4e-8d1b-4c1e-9a55-0c6e5d8a1f10",
                "code": "team",
                "name": "Team",
                "price": "49.00",
                "currency": "EUR",
                "duration_days": 30,
                "bonus_credits": "250"
            }}]"#
        )
        .unwrap();

        let config = BillingConfig {
            plan_catalog_path: Some(file.path().to_path_buf()),
            ..BillingConfig::default()
        };
        let plans = config.load_plans().unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].code, "team");
        assert_eq!(plans[0].price, dec!(49.00));
        assert!(plans[0].active);
        assert!(!plans[0].refund_on_cancel);
    }

    #[test]
    fn rejects_catalog_with_invalid_plan() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{
                "id": "6f1c2a4e-8d1b-4c1e-9a55-0c6e5d8a1f10",
                "code": "broken",
                "name": "Broken",
                "price": "0",
                "currency": "usd",
                "duration_days": 30
            }}]"#
        )
        .unwrap();

        let err = load_plan_catalog(file.path()).unwrap_err();
        assert!(err.to_string().contains("broken"), "{err:#}");
    }

    #[test]
    fn retry_policies_follow_settings() {
        let config = BillingConfig {
            ledger_max_append_attempts: 7,
            gateway_max_attempts: 2,
            ..BillingConfig::default()
        };
        assert_eq!(config.ledger_retry().max_attempts, 7);
        assert_eq!(config.payment_settings().gateway_retry.max_attempts, 2);
    }

    #[test]
    fn defaults_keep_a_week_of_delivered_events() {
        let config = BillingConfig::default();
        assert_eq!(config.outbox_retention, Duration::days(7));
        assert_eq!(config.outbox_max_attempts, 10);
        assert!(config.database_url.is_none());
    }
}
