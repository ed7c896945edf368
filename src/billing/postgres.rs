use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{Payment, PaymentStatus, Subscription, SubscriptionStatus};
use super::store::{PaymentRepository, SubscriptionRepository, Versioned};
use crate::error::{BillingError, BillingResult};

/// Records kept as a JSONB snapshot next to the columns they are queried by.
trait Snapshot: Versioned + Serialize + DeserializeOwned {
    const TABLE: &'static str;
    /// Column holding the record's parent id.
    const LINK_COLUMN: &'static str;

    fn user_id(&self) -> &str;
    fn link(&self) -> Uuid;
    fn status(&self) -> &'static str;
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;
}

impl Snapshot for Payment {
    const TABLE: &'static str = "payments";
    const LINK_COLUMN: &'static str = "subscription_id";

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn link(&self) -> Uuid {
        self.subscription_id
    }

    fn status(&self) -> &'static str {
        self.status.as_str()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Snapshot for Subscription {
    const TABLE: &'static str = "subscriptions";
    const LINK_COLUMN: &'static str = "plan_id";

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn link(&self) -> Uuid {
        self.plan_id
    }

    fn status(&self) -> &'static str {
        self.status.as_str()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

struct SnapshotTable<T> {
    pool: PgPool,
    record: PhantomData<fn() -> T>,
}

impl<T: Snapshot> SnapshotTable<T> {
    fn new(pool: PgPool) -> Self {
        Self {
            pool,
            record: PhantomData,
        }
    }

    async fn insert(&self, mut record: T) -> BillingResult<T> {
        record.set_version(1);
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {table} (id, user_id, {link}, status, version, created_at, updated_at, record)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
            table = T::TABLE,
            link = T::LINK_COLUMN,
        ))
        .bind(record.id())
        .bind(record.user_id())
        .bind(record.link())
        .bind(record.status())
        .bind(record.version())
        .bind(record.created_at())
        .bind(record.updated_at())
        .bind(serde_json::to_value(&record)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::InvalidRequest(format!(
                "{} {} already exists",
                T::ENTITY,
                record.id()
            )));
        }
        Ok(record)
    }

    async fn save(&self, mut record: T) -> BillingResult<T> {
        let expected = record.version();
        record.set_version(expected + 1);
        let result = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET status = $3, version = $4, updated_at = $5, record = $6
            WHERE id = $1 AND version = $2
            "#,
            table = T::TABLE,
        ))
        .bind(record.id())
        .bind(expected)
        .bind(record.status())
        .bind(record.version())
        .bind(record.updated_at())
        .bind(serde_json::to_value(&record)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(record);
        }

        let found = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT version FROM {} WHERE id = $1",
            T::TABLE
        ))
        .bind(record.id())
        .fetch_optional(&self.pool)
        .await?;
        match found {
            None => Err(BillingError::not_found(T::ENTITY, record.id())),
            Some(found) => Err(BillingError::version_conflict(
                format!("{}:{}", T::ENTITY, record.id()),
                expected,
                found,
            )),
        }
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<T>> {
        let record = sqlx::query_scalar::<_, serde_json::Value>(&format!(
            "SELECT record FROM {} WHERE id = $1",
            T::TABLE
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record.map(serde_json::from_value).transpose()?)
    }

    async fn select<V>(&self, filter: &str, value: Option<V>) -> BillingResult<Vec<T>>
    where
        V: for<'q> sqlx::Encode<'q, sqlx::Postgres> + sqlx::Type<sqlx::Postgres> + Send + 'static,
    {
        let sql = format!(
            "SELECT record FROM {} {filter} ORDER BY created_at, id",
            T::TABLE
        );
        let mut query = sqlx::query_scalar::<_, serde_json::Value>(&sql);
        if let Some(value) = value {
            query = query.bind(value);
        }
        let records = query.fetch_all(&self.pool).await?;
        Ok(records
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<T>, _>>()?)
    }
}

/// key: billing-persistence-postgres -> payments table with JSONB snapshots
pub struct PgPaymentRepository {
    table: SnapshotTable<Payment>,
}

impl PgPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            table: SnapshotTable::new(pool),
        }
    }
}

#[async_trait]
impl PaymentRepository for PgPaymentRepository {
    async fn insert(&self, payment: Payment) -> BillingResult<Payment> {
        self.table.insert(payment).await
    }

    async fn save(&self, payment: Payment) -> BillingResult<Payment> {
        self.table.save(payment).await
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        self.table.get(id).await
    }

    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Vec<Payment>> {
        self.table
            .select("WHERE user_id = $1", Some(user_id.to_string()))
            .await
    }

    async fn find_by_subscription_id(&self, subscription_id: Uuid) -> BillingResult<Vec<Payment>> {
        self.table
            .select("WHERE subscription_id = $1", Some(subscription_id))
            .await
    }

    async fn find_by_status(&self, status: PaymentStatus) -> BillingResult<Vec<Payment>> {
        self.table
            .select("WHERE status = $1", Some(status.as_str()))
            .await
    }

    async fn find_updated_since(&self, since: DateTime<Utc>) -> BillingResult<Vec<Payment>> {
        self.table.select("WHERE updated_at >= $1", Some(since)).await
    }

    async fn all(&self) -> BillingResult<Vec<Payment>> {
        self.table.select::<String>("", None).await
    }
}

/// key: billing-persistence-postgres -> subscriptions table with JSONB snapshots
pub struct PgSubscriptionRepository {
    table: SnapshotTable<Subscription>,
}

impl PgSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            table: SnapshotTable::new(pool),
        }
    }
}

#[async_trait]
impl SubscriptionRepository for PgSubscriptionRepository {
    async fn insert(&self, subscription: Subscription) -> BillingResult<Subscription> {
        self.table.insert(subscription).await
    }

    async fn save(&self, subscription: Subscription) -> BillingResult<Subscription> {
        self.table.save(subscription).await
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        self.table.get(id).await
    }

    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Vec<Subscription>> {
        self.table
            .select("WHERE user_id = $1", Some(user_id.to_string()))
            .await
    }

    async fn find_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> BillingResult<Vec<Subscription>> {
        self.table
            .select("WHERE status = $1", Some(status.as_str()))
            .await
    }

    async fn find_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> BillingResult<Vec<Subscription>> {
        self.table.select("WHERE updated_at >= $1", Some(since)).await
    }

    async fn all(&self) -> BillingResult<Vec<Subscription>> {
        self.table.select::<String>("", None).await
    }
}
