use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::models::{AccountBalance, CreditTransaction, CreditType, TransactionKind};
use super::store::LedgerStore;
use crate::error::{BillingError, BillingResult};

const ACCOUNT_COLUMNS: &str = "user_id, balance, advanced_balance, total_earned, total_used, \
     advanced_total_earned, advanced_total_used, version, deleted, updated_at";

const TRANSACTION_COLUMNS: &str = "id, user_id, amount, kind, credit_type, idempotency_key, \
     occurred_at, related_payment_id, reverses, description, deleted";

fn account_from_row(row: &PgRow) -> BillingResult<AccountBalance> {
    Ok(AccountBalance {
        user_id: row.try_get("user_id")?,
        balance: row.try_get("balance")?,
        advanced_balance: row.try_get("advanced_balance")?,
        total_earned: row.try_get("total_earned")?,
        total_used: row.try_get("total_used")?,
        advanced_total_earned: row.try_get("advanced_total_earned")?,
        advanced_total_used: row.try_get("advanced_total_used")?,
        version: row.try_get("version")?,
        deleted: row.try_get("deleted")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> BillingResult<CreditTransaction> {
    let kind: String = row.try_get("kind")?;
    let credit_type: String = row.try_get("credit_type")?;
    Ok(CreditTransaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        kind: TransactionKind::parse(&kind)
            .ok_or_else(|| BillingError::Storage(format!("unknown transaction kind {kind}")))?,
        credit_type: CreditType::parse(&credit_type)
            .ok_or_else(|| BillingError::Storage(format!("unknown credit type {credit_type}")))?,
        idempotency_key: row.try_get("idempotency_key")?,
        timestamp: row.try_get("occurred_at")?,
        related_payment_id: row.try_get("related_payment_id")?,
        reverses: row.try_get("reverses")?,
        description: row.try_get("description")?,
        deleted: row.try_get("deleted")?,
    })
}

/// key: ledger-store-postgres -> credit_accounts + credit_transactions tables
///
/// Appends lock the account row for the length of one database transaction; the
/// `(user_id, idempotency_key)` unique index backs the duplicate check.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_account(
        db: &mut Transaction<'_, Postgres>,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<AccountBalance> {
        sqlx::query(
            r#"
            INSERT INTO credit_accounts (user_id, updated_at)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&mut **db)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM credit_accounts WHERE user_id = $1 FOR UPDATE"
        ))
        .bind(user_id)
        .fetch_one(&mut **db)
        .await?;
        account_from_row(&row)
    }

    async fn write_account(
        db: &mut Transaction<'_, Postgres>,
        account: &AccountBalance,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE credit_accounts
            SET balance = $2,
                advanced_balance = $3,
                total_earned = $4,
                total_used = $5,
                advanced_total_earned = $6,
                advanced_total_used = $7,
                version = $8,
                deleted = $9,
                updated_at = $10
            WHERE user_id = $1
            "#,
        )
        .bind(&account.user_id)
        .bind(account.balance)
        .bind(account.advanced_balance)
        .bind(account.total_earned)
        .bind(account.total_used)
        .bind(account.advanced_total_earned)
        .bind(account.advanced_total_used)
        .bind(account.version)
        .bind(account.deleted)
        .bind(account.updated_at)
        .execute(&mut **db)
        .await?;
        Ok(())
    }

    async fn select_transactions(
        &self,
        filter: &str,
        bind: impl FnOnce(
            sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM credit_transactions {filter}");
        let rows = bind(sqlx::query(&sql)).fetch_all(&self.pool).await?;
        rows.iter().map(transaction_from_row).collect()
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn account(&self, user_id: &str) -> BillingResult<Option<AccountBalance>> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM credit_accounts WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn append_transaction(
        &self,
        tx: CreditTransaction,
        expected_version: i64,
    ) -> BillingResult<AccountBalance> {
        let mut db = self.pool.begin().await?;
        let mut account = Self::lock_account(&mut db, &tx.user_id, tx.timestamp).await?;

        if account.version == expected_version {
            let taken = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM credit_transactions WHERE user_id = $1 AND idempotency_key = $2",
            )
            .bind(&tx.user_id)
            .bind(&tx.idempotency_key)
            .fetch_one(&mut *db)
            .await?;
            if taken > 0 {
                return Err(BillingError::DuplicateIdempotencyKey {
                    user_id: tx.user_id.clone(),
                    key: tx.idempotency_key.clone(),
                });
            }
        }
        account.apply_entry(&tx, expected_version)?;

        sqlx::query(
            r#"
            INSERT INTO credit_transactions (
                id, user_id, amount, kind, credit_type, idempotency_key,
                occurred_at, related_payment_id, reverses, description, deleted
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(tx.id)
        .bind(&tx.user_id)
        .bind(tx.amount)
        .bind(tx.kind.as_str())
        .bind(tx.credit_type.as_str())
        .bind(&tx.idempotency_key)
        .bind(tx.timestamp)
        .bind(tx.related_payment_id)
        .bind(tx.reverses)
        .bind(&tx.description)
        .bind(tx.deleted)
        .execute(&mut *db)
        .await?;
        Self::write_account(&mut db, &account).await?;
        db.commit().await?;
        Ok(account)
    }

    async fn find_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> BillingResult<Option<CreditTransaction>> {
        let found = self
            .select_transactions("WHERE user_id = $1 AND idempotency_key = $2", |query| {
                query.bind(user_id.to_string()).bind(key.to_string())
            })
            .await?;
        Ok(found.into_iter().next())
    }

    async fn find_transaction(&self, id: Uuid) -> BillingResult<Option<CreditTransaction>> {
        let found = self
            .select_transactions("WHERE id = $1", |query| query.bind(id))
            .await?;
        Ok(found.into_iter().next())
    }

    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Vec<CreditTransaction>> {
        self.select_transactions("WHERE user_id = $1 ORDER BY seq", |query| {
            query.bind(user_id.to_string())
        })
        .await
    }

    async fn find_by_related_payment(
        &self,
        payment_id: Uuid,
    ) -> BillingResult<Vec<CreditTransaction>> {
        self.select_transactions(
            "WHERE related_payment_id = $1 ORDER BY occurred_at, seq",
            |query| query.bind(payment_id),
        )
        .await
    }

    async fn find_by_timestamp_after(
        &self,
        after: DateTime<Utc>,
    ) -> BillingResult<Vec<CreditTransaction>> {
        self.select_transactions("WHERE occurred_at > $1 ORDER BY occurred_at, seq", |query| {
            query.bind(after)
        })
        .await
    }

    async fn mark_account_deleted(
        &self,
        user_id: &str,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<AccountBalance> {
        let mut db = self.pool.begin().await?;
        let mut account = Self::lock_account(&mut db, user_id, now).await?;
        if account.version != expected_version {
            return Err(BillingError::version_conflict(
                format!("account:{user_id}"),
                expected_version,
                account.version,
            ));
        }
        account.deleted = true;
        account.version += 1;
        account.updated_at = now;
        Self::write_account(&mut db, &account).await?;
        db.commit().await?;
        Ok(account)
    }

    async fn user_ids(&self) -> BillingResult<Vec<String>> {
        Ok(
            sqlx::query_scalar::<_, String>("SELECT user_id FROM credit_accounts ORDER BY user_id")
                .fetch_all(&self.pool)
                .await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn entry(user: &str, amount: Decimal, key: &str) -> CreditTransaction {
        CreditTransaction {
            id: Uuid::new_v4(),
            user_id: user.into(),
            amount,
            kind: if amount < Decimal::ZERO {
                TransactionKind::Debit
            } else {
                TransactionKind::Grant
            },
            credit_type: CreditType::Standard,
            idempotency_key: key.into(),
            timestamp: Utc::now(),
            related_payment_id: None,
            reverses: None,
            description: None,
            deleted: false,
        }
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL with Postgres server"]
    async fn appends_move_balance_and_totals_atomically(pool: PgPool) {
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = PgLedgerStore::new(pool);

        store
            .append_transaction(entry("u1", dec!(100), "grant"), 0)
            .await
            .unwrap();
        let account = store
            .append_transaction(entry("u1", dec!(-40), "spend"), 1)
            .await
            .unwrap();
        assert_eq!(account.balance, dec!(60));
        assert_eq!(account.total_earned, dec!(100));
        assert_eq!(account.total_used, dec!(40));
        assert_eq!(account.version, 2);
        assert_eq!(store.account("u1").await.unwrap(), Some(account));

        let history = store.find_by_user_id("u1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].amount, dec!(-40));
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL with Postgres server"]
    async fn rejected_appends_leave_no_trace(pool: PgPool) {
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = PgLedgerStore::new(pool);
        store
            .append_transaction(entry("u1", dec!(10), "grant"), 0)
            .await
            .unwrap();

        let overdraw = store
            .append_transaction(entry("u1", dec!(-11), "spend"), 1)
            .await
            .unwrap_err();
        assert!(matches!(overdraw, BillingError::InsufficientCredits { .. }));
        let duplicate = store
            .append_transaction(entry("u1", dec!(10), "grant"), 1)
            .await
            .unwrap_err();
        assert!(matches!(duplicate, BillingError::DuplicateIdempotencyKey { .. }));
        let stale = store
            .append_transaction(entry("u1", dec!(1), "late"), 0)
            .await
            .unwrap_err();
        assert!(matches!(stale, BillingError::VersionConflict { .. }));

        assert_eq!(store.find_by_user_id("u1").await.unwrap().len(), 1);
        let account = store.account("u1").await.unwrap().unwrap();
        assert_eq!((account.balance, account.version), (dec!(10), 1));
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL with Postgres server"]
    async fn closed_accounts_refuse_appends(pool: PgPool) {
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = PgLedgerStore::new(pool);
        let closed = store
            .mark_account_deleted("u1", 0, Utc::now())
            .await
            .unwrap();
        assert!(closed.deleted);

        let err = store
            .append_transaction(entry("u1", dec!(5), "late"), closed.version)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidStateTransition { .. }));
        assert_eq!(store.user_ids().await.unwrap(), vec!["u1".to_string()]);
    }
}
