use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info};

use super::models::{AccountBalance, CreditTransaction, CreditType};
use super::store::LedgerStore;
use crate::error::BillingResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Cached balance differs from the sum of the pool's entries.
    Balance,
    /// Cached balance differs from earned minus used.
    Totals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerDiscrepancy {
    pub user_id: String,
    pub credit_type: CreditType,
    pub kind: DiscrepancyKind,
    pub cached_balance: Decimal,
    pub computed_balance: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerReport {
    pub users_checked: usize,
    pub discrepancies: Vec<LedgerDiscrepancy>,
}

impl LedgerReport {
    pub fn is_consistent(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

fn pool_totals(account: &AccountBalance, credit_type: CreditType) -> (Decimal, Decimal) {
    match credit_type {
        CreditType::Standard => (account.total_earned, account.total_used),
        CreditType::Advanced => (account.advanced_total_earned, account.advanced_total_used),
    }
}

fn audit_pool(
    account: &AccountBalance,
    history: &[CreditTransaction],
    credit_type: CreditType,
    report: &mut LedgerReport,
) {
    let cached_balance = account.balance_of(credit_type);
    let computed_balance: Decimal = history
        .iter()
        .filter(|tx| !tx.deleted && tx.credit_type == credit_type)
        .map(|tx| tx.amount)
        .sum();
    let (earned, used) = pool_totals(account, credit_type);

    for (kind, computed) in [
        (DiscrepancyKind::Balance, computed_balance),
        (DiscrepancyKind::Totals, earned - used),
    ] {
        if computed == cached_balance {
            continue;
        }
        error!(
            user_id = %account.user_id,
            %credit_type,
            ?kind,
            cached = %cached_balance,
            computed = %computed,
            "ledger balance does not match transaction log"
        );
        report.discrepancies.push(LedgerDiscrepancy {
            user_id: account.user_id.clone(),
            credit_type,
            kind,
            cached_balance,
            computed_balance: computed,
        });
    }
}

/// key: ledger-reconciliation -> balance == sum(non-deleted entries) audit per pool
///
/// Read-only; safe to run against a live store or an offline copy.
pub async fn reconcile(store: &dyn LedgerStore) -> BillingResult<LedgerReport> {
    let mut report = LedgerReport::default();
    for user_id in store.user_ids().await? {
        let Some(account) = store.account(&user_id).await? else {
            continue;
        };
        let history = store.find_by_user_id(&user_id).await?;
        report.users_checked += 1;

        for credit_type in [CreditType::Standard, CreditType::Advanced] {
            audit_pool(&account, &history, credit_type, &mut report);
        }
    }

    info!(
        users_checked = report.users_checked,
        discrepancies = report.discrepancies.len(),
        "ledger reconciliation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{CreditTransaction, TransactionKind};
    use crate::ledger::store::InMemoryLedgerStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn grant(user: &str, amount: Decimal, key: &str, credit_type: CreditType) -> CreditTransaction {
        CreditTransaction {
            id: Uuid::new_v4(),
            user_id: user.into(),
            amount,
            kind: TransactionKind::Grant,
            credit_type,
            idempotency_key: key.into(),
            timestamp: Utc::now(),
            related_payment_id: None,
            reverses: None,
            description: None,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn consistent_ledger_reports_no_discrepancies() {
        let store = InMemoryLedgerStore::new();
        store
            .append_transaction(grant("u1", dec!(5), "a", CreditType::Standard), 0)
            .await
            .unwrap();
        store
            .append_transaction(grant("u1", dec!(2), "b", CreditType::Advanced), 1)
            .await
            .unwrap();
        store
            .append_transaction(grant("u2", dec!(7), "a", CreditType::Standard), 0)
            .await
            .unwrap();

        let report = reconcile(&store).await.unwrap();
        assert_eq!(report.users_checked, 2);
        assert!(report.is_consistent());
    }

    #[tokio::test]
    async fn drifted_cache_is_reported() {
        let store = InMemoryLedgerStore::new();
        store
            .append_transaction(grant("u1", dec!(5), "a", CreditType::Standard), 0)
            .await
            .unwrap();
        store
            .append_transaction(grant("u1", dec!(3), "b", CreditType::Advanced), 1)
            .await
            .unwrap();
        store.overwrite_cached_balance("u1", dec!(9));

        let report = reconcile(&store).await.unwrap();
        assert_eq!(
            report.discrepancies,
            vec![
                LedgerDiscrepancy {
                    user_id: "u1".into(),
                    credit_type: CreditType::Standard,
                    kind: DiscrepancyKind::Balance,
                    cached_balance: dec!(9),
                    computed_balance: dec!(5),
                },
                LedgerDiscrepancy {
                    user_id: "u1".into(),
                    credit_type: CreditType::Standard,
                    kind: DiscrepancyKind::Totals,
                    cached_balance: dec!(9),
                    computed_balance: dec!(5),
                },
            ]
        );
    }
}
