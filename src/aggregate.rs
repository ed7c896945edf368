use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// key: billing-aggregate-locks -> serial command execution per aggregate
///
/// Commands and events touching the same Payment or Subscription queue on the same
/// mutex; distinct aggregates never contend. Guards must be dropped before publishing
/// events so downstream handlers can take their own aggregate locks.
#[derive(Debug, Default)]
pub struct AggregateLocks {
    locks: Arc<LockTable>,
}

/// Holds one aggregate's lock. Dropping the last holder removes the mutex from the table.
#[derive(Debug)]
pub struct AggregateGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable>,
    key: String,
}

impl Drop for AggregateGuard {
    fn drop(&mut self) {
        self.guard.take();
        // waiters hold a clone of the Arc, so a count of one means nobody is queued
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl AggregateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, key: &str) -> AggregateGuard {
        let guard = self.lock_for(key).lock_owned().await;
        AggregateGuard {
            guard: Some(guard),
            locks: self.locks.clone(),
            key: key.to_string(),
        }
    }

    /// Non-blocking variant used by sweeps that must skip busy aggregates.
    pub fn try_acquire(&self, key: &str) -> Option<AggregateGuard> {
        let guard = self.lock_for(key).try_lock_owned().ok()?;
        Some(AggregateGuard {
            guard: Some(guard),
            locks: self.locks.clone(),
            key: key.to_string(),
        })
    }

    /// Number of aggregates currently locked or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
