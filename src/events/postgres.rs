use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::outbox::{OutboxEntry, OutboxStatus, OutboxStore};
use super::{DomainEvent, EventType, ProcessedEventStore};
use crate::error::{BillingError, BillingResult};

const OUTBOX_COLUMNS: &str =
    "position, event, status, attempts, last_error, enqueued_at, delivered_at";

fn entry_from_row(row: &PgRow) -> BillingResult<OutboxEntry> {
    let position: i64 = row.try_get("position")?;
    let event: DomainEvent = serde_json::from_value(row.try_get("event")?)?;
    let status: String = row.try_get("status")?;
    let attempts: i32 = row.try_get("attempts")?;
    Ok(OutboxEntry {
        position: position as u64,
        topic: event.topic(),
        event,
        status: OutboxStatus::parse(&status)
            .ok_or_else(|| BillingError::Storage(format!("unknown outbox status {status}")))?,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error")?,
        enqueued_at: row.try_get("enqueued_at")?,
        delivered_at: row.try_get("delivered_at")?,
    })
}

/// key: billing-outbox-postgres -> event_outbox table
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn select(
        &self,
        filter: &str,
        status: Option<OutboxStatus>,
    ) -> BillingResult<Vec<OutboxEntry>> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM event_outbox {filter}");
        let mut query = sqlx::query(&sql);
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn append(&self, event: DomainEvent) -> BillingResult<OutboxEntry> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO event_outbox (
                event_id, topic, event_type, aggregate_id, sequence, event, enqueued_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(event.event_id)
        .bind(event.topic().as_str())
        .bind(event.event_type.as_str())
        .bind(&event.aggregate_id)
        .bind(event.sequence)
        .bind(serde_json::to_value(&event)?)
        .bind(event.timestamp)
        .fetch_one(&self.pool)
        .await?;
        entry_from_row(&row)
    }

    async fn get(&self, position: u64) -> BillingResult<Option<OutboxEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM event_outbox WHERE position = $1"
        ))
        .bind(position as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn pending(&self) -> BillingResult<Vec<OutboxEntry>> {
        self.select(
            "WHERE status = $1 ORDER BY position",
            Some(OutboxStatus::Pending),
        )
        .await
    }

    async fn dead_lettered(&self) -> BillingResult<Vec<OutboxEntry>> {
        self.select(
            "WHERE status = $1 ORDER BY position",
            Some(OutboxStatus::DeadLettered),
        )
        .await
    }

    async fn entries_for(&self, aggregate_id: &str) -> BillingResult<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM event_outbox WHERE aggregate_id = $1 ORDER BY position"
        ))
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn latest_recorded(
        &self,
        aggregate_id: &str,
    ) -> BillingResult<Option<(i64, EventType)>> {
        let row = sqlx::query(
            r#"
            SELECT sequence, event_type
            FROM event_outbox
            WHERE aggregate_id = $1
            ORDER BY sequence DESC, position DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let sequence: i64 = row.try_get("sequence")?;
        let event_type: String = row.try_get("event_type")?;
        let event_type = EventType::parse(&event_type)
            .ok_or_else(|| BillingError::Storage(format!("unknown event type {event_type}")))?;
        Ok(Some((sequence, event_type)))
    }

    async fn mark_delivered(&self, position: u64, at: DateTime<Utc>) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'delivered',
                attempts = attempts + 1,
                delivered_at = $2,
                last_error = NULL
            WHERE position = $1
            "#,
        )
        .bind(position as i64)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        position: u64,
        error: &str,
        max_attempts: u32,
    ) -> BillingResult<Option<OutboxEntry>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE event_outbox
            SET attempts = attempts + 1,
                last_error = $2,
                status = CASE WHEN attempts + 1 >= $3 THEN 'dead_lettered' ELSE status END
            WHERE position = $1
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(position as i64)
        .bind(error)
        .bind(max_attempts as i32)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn requeue(&self, position: u64) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'pending', attempts = 0
            WHERE position = $1 AND status = 'dead_lettered'
            "#,
        )
        .bind(position as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn prune_delivered(&self, before: DateTime<Utc>) -> BillingResult<usize> {
        let result = sqlx::query(
            "DELETE FROM event_outbox WHERE status = 'delivered' AND enqueued_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

/// key: billing-processed-events-postgres -> processed_events table
#[derive(Clone)]
pub struct PgProcessedEventStore {
    pool: PgPool,
}

impl PgProcessedEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedEventStore for PgProcessedEventStore {
    async fn is_processed(&self, consumer: &str, event_id: Uuid) -> BillingResult<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM processed_events WHERE consumer = $1 AND event_id = $2",
        )
        .bind(consumer)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(found > 0)
    }

    async fn mark_processed(
        &self,
        consumer: &str,
        event_id: Uuid,
        at: DateTime<Utc>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (consumer, event_id, processed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (consumer, event_id) DO NOTHING
            "#,
        )
        .bind(consumer)
        .bind(event_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> BillingResult<usize> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{CreditTransaction, CreditType, TransactionKind};
    use chrono::Duration;
    use rust_decimal::Decimal;

    fn credit_event(sequence: i64, at: DateTime<Utc>) -> DomainEvent {
        let tx = CreditTransaction {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            amount: Decimal::ONE,
            kind: TransactionKind::Grant,
            credit_type: CreditType::Standard,
            idempotency_key: format!("k{sequence}"),
            timestamp: at,
            related_payment_id: None,
            reverses: None,
            description: None,
            deleted: false,
        };
        DomainEvent::credit(EventType::CreditGranted, &tx, sequence, at)
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL with Postgres server"]
    async fn outbox_rows_dead_letter_and_prune(pool: PgPool) {
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = PgOutboxStore::new(pool);
        let now = Utc::now();

        let first = store.append(credit_event(1, now - Duration::days(9))).await.unwrap();
        let second = store.append(credit_event(2, now)).await.unwrap();
        assert!(second.position > first.position);
        assert_eq!(
            store.latest_recorded("account:u1").await.unwrap(),
            Some((2, EventType::CreditGranted))
        );

        let failed = store
            .record_failure(second.position, "consumer offline", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, OutboxStatus::DeadLettered);
        assert_eq!(store.dead_lettered().await.unwrap().len(), 1);
        assert!(store.requeue(second.position).await.unwrap());

        store.mark_delivered(first.position, now).await.unwrap();
        assert_eq!(store.prune_delivered(now - Duration::days(7)).await.unwrap(), 1);
        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event, second.event);
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL with Postgres server"]
    async fn processed_marks_are_idempotent_and_purgeable(pool: PgPool) {
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let store = PgProcessedEventStore::new(pool);
        let event_id = Uuid::new_v4();
        let at = Utc::now() - Duration::days(30);

        store.mark_processed("consumer", event_id, at).await.unwrap();
        store.mark_processed("consumer", event_id, at).await.unwrap();
        assert!(store.is_processed("consumer", event_id).await.unwrap());
        assert!(!store.is_processed("other", event_id).await.unwrap());

        assert_eq!(store.purge_before(Utc::now()).await.unwrap(), 1);
        assert!(!store.is_processed("consumer", event_id).await.unwrap());
    }
}
