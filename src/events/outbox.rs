use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::increment_counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{DomainEvent, EventBus, EventType, Topic};
use crate::error::BillingResult;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Delivered,
    /// Gave up after the attempt limit; no longer blocks its aggregate.
    DeadLettered,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OutboxStatus::Pending),
            "delivered" => Some(OutboxStatus::Delivered),
            "dead_lettered" => Some(OutboxStatus::DeadLettered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboxEntry {
    pub position: u64,
    pub topic: Topic,
    pub event: DomainEvent,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    fn new(position: u64, event: DomainEvent) -> Self {
        Self {
            position,
            topic: event.topic(),
            enqueued_at: event.timestamp,
            event,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            delivered_at: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// key: billing-outbox-store -> durable record of enqueued events
///
/// Positions are assigned by the store and increase with every append.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn append(&self, event: DomainEvent) -> BillingResult<OutboxEntry>;

    async fn get(&self, position: u64) -> BillingResult<Option<OutboxEntry>>;

    /// Pending entries in position order.
    async fn pending(&self) -> BillingResult<Vec<OutboxEntry>>;

    async fn dead_lettered(&self) -> BillingResult<Vec<OutboxEntry>>;

    /// Every retained entry of one aggregate in position order.
    async fn entries_for(&self, aggregate_id: &str) -> BillingResult<Vec<OutboxEntry>>;

    /// Highest aggregate version recorded and the event announcing it.
    async fn latest_recorded(&self, aggregate_id: &str)
        -> BillingResult<Option<(i64, EventType)>>;

    async fn mark_delivered(&self, position: u64, at: DateTime<Utc>) -> BillingResult<()>;

    /// Counts a failed attempt and dead-letters the entry once `max_attempts` is reached.
    /// Returns the entry as stored afterwards.
    async fn record_failure(
        &self,
        position: u64,
        error: &str,
        max_attempts: u32,
    ) -> BillingResult<Option<OutboxEntry>>;

    /// Puts a dead-lettered entry back in the queue with a fresh attempt budget.
    async fn requeue(&self, position: u64) -> BillingResult<bool>;

    /// Drops delivered entries enqueued before `before`.
    async fn prune_delivered(&self, before: DateTime<Utc>) -> BillingResult<usize>;
}

#[derive(Debug)]
pub struct InMemoryOutboxStore {
    entries: DashMap<u64, OutboxEntry>,
    latest: DashMap<String, (i64, EventType)>,
    next_position: AtomicU64,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            latest: DashMap::new(),
            next_position: AtomicU64::new(1),
        }
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(&self, keep: impl Fn(&OutboxEntry) -> bool) -> Vec<OutboxEntry> {
        let mut found: Vec<OutboxEntry> = self
            .entries
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|entry| entry.position);
        found
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, event: DomainEvent) -> BillingResult<OutboxEntry> {
        let position = self.next_position.fetch_add(1, Ordering::SeqCst);
        self.latest
            .entry(event.aggregate_id.clone())
            .and_modify(|latest| {
                if event.sequence >= latest.0 {
                    *latest = (event.sequence, event.event_type);
                }
            })
            .or_insert((event.sequence, event.event_type));
        let entry = OutboxEntry::new(position, event);
        self.entries.insert(position, entry.clone());
        Ok(entry)
    }

    async fn get(&self, position: u64) -> BillingResult<Option<OutboxEntry>> {
        Ok(self.entries.get(&position).map(|entry| entry.value().clone()))
    }

    async fn pending(&self) -> BillingResult<Vec<OutboxEntry>> {
        Ok(self.collect(|entry| entry.status == OutboxStatus::Pending))
    }

    async fn dead_lettered(&self) -> BillingResult<Vec<OutboxEntry>> {
        Ok(self.collect(|entry| entry.status == OutboxStatus::DeadLettered))
    }

    async fn entries_for(&self, aggregate_id: &str) -> BillingResult<Vec<OutboxEntry>> {
        Ok(self.collect(|entry| entry.event.aggregate_id == aggregate_id))
    }

    async fn latest_recorded(
        &self,
        aggregate_id: &str,
    ) -> BillingResult<Option<(i64, EventType)>> {
        Ok(self.latest.get(aggregate_id).map(|latest| *latest))
    }

    async fn mark_delivered(&self, position: u64, at: DateTime<Utc>) -> BillingResult<()> {
        if let Some(mut stored) = self.entries.get_mut(&position) {
            stored.status = OutboxStatus::Delivered;
            stored.attempts += 1;
            stored.delivered_at = Some(at);
            stored.last_error = None;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        position: u64,
        error: &str,
        max_attempts: u32,
    ) -> BillingResult<Option<OutboxEntry>> {
        Ok(self.entries.get_mut(&position).map(|mut stored| {
            stored.attempts += 1;
            stored.last_error = Some(error.to_string());
            if stored.attempts >= max_attempts {
                stored.status = OutboxStatus::DeadLettered;
            }
            stored.clone()
        }))
    }

    async fn requeue(&self, position: u64) -> BillingResult<bool> {
        Ok(match self.entries.get_mut(&position) {
            Some(mut stored) if stored.status == OutboxStatus::DeadLettered => {
                stored.status = OutboxStatus::Pending;
                stored.attempts = 0;
                true
            }
            _ => false,
        })
    }

    async fn prune_delivered(&self, before: DateTime<Utc>) -> BillingResult<usize> {
        let stale: Vec<u64> = self
            .entries
            .iter()
            .filter(|entry| entry.status == OutboxStatus::Delivered && entry.enqueued_at < before)
            .map(|entry| *entry.key())
            .collect();
        let mut pruned = 0;
        for position in stale {
            if self
                .entries
                .remove_if(&position, |_, entry| entry.status == OutboxStatus::Delivered)
                .is_some()
            {
                pruned += 1;
            }
        }
        let retained: HashSet<String> = self
            .entries
            .iter()
            .map(|entry| entry.event.aggregate_id.clone())
            .collect();
        self.latest
            .retain(|aggregate_id, _| retained.contains(aggregate_id));
        Ok(pruned)
    }
}

/// key: billing-outbox -> local record of events awaiting delivery
///
/// State machines persist their record, enqueue the event here, release their aggregate
/// lock and then flush. Entries stay pending until every subscriber accepts them, and
/// entries of one aggregate are delivered in position order by one flusher at a time.
/// An entry that keeps failing is dead-lettered after `max_attempts` so the aggregate's
/// later events can move on.
pub struct Outbox {
    bus: Arc<dyn EventBus>,
    store: Arc<dyn OutboxStore>,
    in_flight: DashMap<String, ()>,
    max_attempts: u32,
}

struct Claim<'a> {
    in_flight: &'a DashMap<String, ()>,
    aggregate_id: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.aggregate_id);
    }
}

impl Outbox {
    pub fn new(bus: Arc<dyn EventBus>, store: Arc<dyn OutboxStore>, max_attempts: u32) -> Self {
        Self {
            bus,
            store,
            in_flight: DashMap::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn in_memory(bus: Arc<dyn EventBus>) -> Self {
        Self::new(bus, Arc::new(InMemoryOutboxStore::new()), 10)
    }

    /// Records the event. A failure here leaves the aggregate's record ahead of its
    /// events; the reconciliation sweep re-derives the missing one.
    pub async fn enqueue(&self, event: DomainEvent) -> BillingResult<u64> {
        let entry = self.store.append(event).await?;
        debug!(
            position = entry.position,
            event_id = %entry.event.event_id,
            event_type = %entry.event.event_type,
            aggregate_id = %entry.event.aggregate_id,
            "event enqueued"
        );
        Ok(entry.position)
    }

    pub async fn latest_recorded(
        &self,
        aggregate_id: &str,
    ) -> BillingResult<Option<(i64, EventType)>> {
        self.store.latest_recorded(aggregate_id).await
    }

    pub async fn pending(&self) -> BillingResult<Vec<OutboxEntry>> {
        self.store.pending().await
    }

    pub async fn dead_lettered(&self) -> BillingResult<Vec<OutboxEntry>> {
        self.store.dead_lettered().await
    }

    pub async fn entries_for(&self, aggregate_id: &str) -> BillingResult<Vec<OutboxEntry>> {
        self.store.entries_for(aggregate_id).await
    }

    /// Gives a dead-lettered entry another full attempt budget. Consumers that already
    /// handled it skip it on redelivery.
    pub async fn requeue(&self, position: u64) -> BillingResult<bool> {
        let requeued = self.store.requeue(position).await?;
        if requeued {
            warn!(position, "dead-lettered event requeued");
        }
        Ok(requeued)
    }

    pub async fn prune_delivered(&self, before: DateTime<Utc>) -> BillingResult<usize> {
        let pruned = self.store.prune_delivered(before).await?;
        if pruned > 0 {
            debug!(pruned, %before, "pruned delivered outbox entries");
        }
        Ok(pruned)
    }

    fn claim(&self, aggregate_id: &str) -> Option<Claim<'_>> {
        match self.in_flight.entry(aggregate_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(Claim {
                    in_flight: &self.in_flight,
                    aggregate_id: aggregate_id.to_string(),
                })
            }
        }
    }

    /// Delivers pending entries until a pass makes no progress. An aggregate whose
    /// delivery fails is skipped for the rest of the flush so its later events are
    /// never delivered ahead of the failed one.
    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        let mut failed_aggregates: HashSet<String> = HashSet::new();

        loop {
            let mut progressed = false;
            let mut busy: HashSet<String> = HashSet::new();
            let candidates: Vec<(u64, String)> = match self.store.pending().await {
                Ok(pending) => pending
                    .into_iter()
                    .map(|entry| (entry.position, entry.event.aggregate_id))
                    .collect(),
                Err(err) => {
                    warn!(?err, "outbox could not be read; flush abandoned");
                    break;
                }
            };

            for (position, aggregate_id) in candidates {
                if failed_aggregates.contains(&aggregate_id) || busy.contains(&aggregate_id) {
                    continue;
                }
                let Some(_claim) = self.claim(&aggregate_id) else {
                    busy.insert(aggregate_id);
                    continue;
                };

                let entry = match self.store.get(position).await {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(?err, position, "outbox entry could not be read");
                        failed_aggregates.insert(aggregate_id);
                        continue;
                    }
                };
                let Some(entry) = entry.filter(|entry| entry.status == OutboxStatus::Pending)
                else {
                    continue;
                };

                match self.bus.publish(entry.topic, &entry.event).await {
                    Ok(()) => {
                        if let Err(err) = self.store.mark_delivered(position, Utc::now()).await {
                            warn!(?err, position, "delivered event could not be marked");
                            failed_aggregates.insert(aggregate_id);
                            continue;
                        }
                        report.delivered += 1;
                        progressed = true;
                    }
                    Err(err) => {
                        report.failed += 1;
                        let stored = self
                            .store
                            .record_failure(position, &err.to_string(), self.max_attempts)
                            .await;
                        match stored {
                            Ok(Some(stored)) if stored.status == OutboxStatus::DeadLettered => {
                                error!(
                                    ?err,
                                    position,
                                    attempts = stored.attempts,
                                    topic = %entry.topic,
                                    event_id = %entry.event.event_id,
                                    event_type = %entry.event.event_type,
                                    aggregate_id = %entry.event.aggregate_id,
                                    "event dead-lettered after repeated delivery failures"
                                );
                                increment_counter!(
                                    "outbox_dead_lettered_total",
                                    "topic" => entry.topic.as_str()
                                );
                                report.dead_lettered += 1;
                                progressed = true;
                            }
                            stored => {
                                warn!(
                                    ?err,
                                    position,
                                    attempts = stored
                                        .ok()
                                        .flatten()
                                        .map(|stored| stored.attempts)
                                        .unwrap_or_default(),
                                    topic = %entry.topic,
                                    event_id = %entry.event.event_id,
                                    aggregate_id = %entry.event.aggregate_id,
                                    "event delivery failed; left pending for redelivery"
                                );
                                failed_aggregates.insert(aggregate_id);
                            }
                        }
                    }
                }
            }

            if !progressed {
                break;
            }
        }

        report
    }
}
