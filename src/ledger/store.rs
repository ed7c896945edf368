use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::models::{AccountBalance, CreditTransaction};
use crate::error::{BillingError, BillingResult};

/// key: ledger-store -> durable balance + append-only transaction log
///
/// `append_transaction` is the only mutation of economic state: it appends the entry and
/// moves the cached balance in one atomic step, keyed by `(user_id, idempotency_key)`
/// and guarded by the account version the caller read.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn account(&self, user_id: &str) -> BillingResult<Option<AccountBalance>>;

    /// Fails with `VersionConflict` when `expected_version` is stale,
    /// `DuplicateIdempotencyKey` when the key is taken for this user and
    /// `InsufficientCredits` when the result would be negative.
    async fn append_transaction(
        &self,
        tx: CreditTransaction,
        expected_version: i64,
    ) -> BillingResult<AccountBalance>;

    async fn find_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> BillingResult<Option<CreditTransaction>>;

    async fn find_transaction(&self, id: Uuid) -> BillingResult<Option<CreditTransaction>>;

    /// All entries for the user in append order, soft-deleted ones included.
    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Vec<CreditTransaction>>;

    async fn find_by_related_payment(
        &self,
        payment_id: Uuid,
    ) -> BillingResult<Vec<CreditTransaction>>;

    async fn find_by_timestamp_after(
        &self,
        after: DateTime<Utc>,
    ) -> BillingResult<Vec<CreditTransaction>>;

    async fn mark_account_deleted(
        &self,
        user_id: &str,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<AccountBalance>;

    async fn user_ids(&self) -> BillingResult<Vec<String>>;
}

#[derive(Debug, Clone)]
struct UserLedger {
    account: AccountBalance,
    transactions: Vec<CreditTransaction>,
    keys: HashMap<String, usize>,
}

impl UserLedger {
    fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            account: AccountBalance::empty(user_id, now),
            transactions: Vec::new(),
            keys: HashMap::new(),
        }
    }

    fn apply(&mut self, tx: CreditTransaction, expected_version: i64) -> BillingResult<()> {
        if self.account.version == expected_version
            && self.keys.contains_key(&tx.idempotency_key)
        {
            return Err(BillingError::DuplicateIdempotencyKey {
                user_id: tx.user_id.clone(),
                key: tx.idempotency_key.clone(),
            });
        }
        self.account.apply_entry(&tx, expected_version)?;
        self.keys
            .insert(tx.idempotency_key.clone(), self.transactions.len());
        self.transactions.push(tx);
        Ok(())
    }
}

/// In-process ledger backed by `DashMap`; each user's ledger is one shard entry so an
/// append holds exactly that user's lock.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    ledgers: DashMap<String, UserLedger>,
    owners: DashMap<Uuid, String>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn overwrite_cached_balance(&self, user_id: &str, balance: rust_decimal::Decimal) {
        if let Some(mut ledger) = self.ledgers.get_mut(user_id) {
            ledger.account.balance = balance;
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn account(&self, user_id: &str) -> BillingResult<Option<AccountBalance>> {
        Ok(self
            .ledgers
            .get(user_id)
            .map(|ledger| ledger.account.clone()))
    }

    async fn append_transaction(
        &self,
        tx: CreditTransaction,
        expected_version: i64,
    ) -> BillingResult<AccountBalance> {
        let tx_id = tx.id;
        let user_id = tx.user_id.clone();
        // the owner is recorded while the user's shard entry is still held
        match self.ledgers.entry(user_id.clone()) {
            Entry::Occupied(mut entry) => {
                let ledger = entry.get_mut();
                ledger.apply(tx, expected_version)?;
                self.owners.insert(tx_id, user_id);
                Ok(ledger.account.clone())
            }
            Entry::Vacant(entry) => {
                let mut ledger = UserLedger::new(&user_id, tx.timestamp);
                ledger.apply(tx, expected_version)?;
                let account = ledger.account.clone();
                entry.insert(ledger);
                self.owners.insert(tx_id, user_id);
                Ok(account)
            }
        }
    }

    async fn find_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> BillingResult<Option<CreditTransaction>> {
        Ok(self.ledgers.get(user_id).and_then(|ledger| {
            ledger
                .keys
                .get(key)
                .and_then(|idx| ledger.transactions.get(*idx).cloned())
        }))
    }

    async fn find_transaction(&self, id: Uuid) -> BillingResult<Option<CreditTransaction>> {
        let Some(user_id) = self.owners.get(&id).map(|owner| owner.value().clone()) else {
            return Ok(None);
        };
        Ok(self.ledgers.get(&user_id).and_then(|ledger| {
            ledger
                .transactions
                .iter()
                .find(|tx| tx.id == id)
                .cloned()
        }))
    }

    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Vec<CreditTransaction>> {
        Ok(self
            .ledgers
            .get(user_id)
            .map(|ledger| ledger.transactions.clone())
            .unwrap_or_default())
    }

    async fn find_by_related_payment(
        &self,
        payment_id: Uuid,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let mut found: Vec<CreditTransaction> = self
            .ledgers
            .iter()
            .flat_map(|ledger| {
                ledger
                    .transactions
                    .iter()
                    .filter(|tx| tx.related_payment_id == Some(payment_id))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        found.sort_by_key(|tx| tx.timestamp);
        Ok(found)
    }

    async fn find_by_timestamp_after(
        &self,
        after: DateTime<Utc>,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let mut found: Vec<CreditTransaction> = self
            .ledgers
            .iter()
            .flat_map(|ledger| {
                ledger
                    .transactions
                    .iter()
                    .filter(|tx| tx.timestamp > after)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        found.sort_by_key(|tx| tx.timestamp);
        Ok(found)
    }

    async fn mark_account_deleted(
        &self,
        user_id: &str,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<AccountBalance> {
        let mut ledger = self
            .ledgers
            .entry(user_id.to_string())
            .or_insert_with(|| UserLedger::new(user_id, now));
        if ledger.account.version != expected_version {
            return Err(BillingError::version_conflict(
                format!("account:{user_id}"),
                expected_version,
                ledger.account.version,
            ));
        }
        ledger.account.deleted = true;
        ledger.account.version += 1;
        ledger.account.updated_at = now;
        Ok(ledger.account.clone())
    }

    async fn user_ids(&self) -> BillingResult<Vec<String>> {
        let mut ids: Vec<String> = self.ledgers.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        Ok(ids)
    }
}
