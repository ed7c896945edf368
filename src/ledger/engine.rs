use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{histogram, increment_counter};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::{AccountBalance, CreditTransaction, CreditType, TransactionKind};
use super::store::LedgerStore;
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::events::{DomainEvent, EventType, Outbox};
use crate::retry::RetryPolicy;

struct Draft<'a> {
    user_id: &'a str,
    amount: Decimal,
    kind: TransactionKind,
    credit_type: CreditType,
    idempotency_key: String,
    related_payment_id: Option<Uuid>,
    reverses: Option<Uuid>,
    description: Option<String>,
    event_type: EventType,
}

/// Outcome of clawing back the grants tied to a refunded payment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrantReversal {
    /// Offsets written by this call.
    pub reversals: Vec<CreditTransaction>,
    /// Credits still owed back because the user already spent them or the account is closed.
    pub shortfall: Decimal,
}

impl GrantReversal {
    pub fn is_complete(&self) -> bool {
        self.shortfall.is_zero()
    }
}

/// key: credit-engine -> sufficiency + idempotency over the ledger store
pub struct CreditEngine {
    store: Arc<dyn LedgerStore>,
    outbox: Arc<Outbox>,
    clock: Arc<dyn Clock>,
    append_retry: RetryPolicy,
    initial_credit: Decimal,
    initial_advanced_credit: Decimal,
}

impl CreditEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        outbox: Arc<Outbox>,
        clock: Arc<dyn Clock>,
        append_retry: RetryPolicy,
        initial_credit: Decimal,
    ) -> Self {
        Self {
            store,
            outbox,
            clock,
            append_retry,
            initial_credit,
            initial_advanced_credit: Decimal::ZERO,
        }
    }

    /// Advanced credits granted alongside the standard welcome credit.
    pub fn with_initial_advanced_credit(mut self, amount: Decimal) -> Self {
        self.initial_advanced_credit = amount;
        self
    }

    /// Standard credit balance.
    pub async fn balance(&self, user_id: &str) -> BillingResult<Decimal> {
        Ok(self.account(user_id).await?.balance)
    }

    pub async fn balance_of(&self, user_id: &str, credit_type: CreditType) -> BillingResult<Decimal> {
        Ok(self.account(user_id).await?.balance_of(credit_type))
    }

    pub async fn account(&self, user_id: &str) -> BillingResult<AccountBalance> {
        self.ensure_welcome_grant(user_id).await?;
        Ok(self
            .store
            .account(user_id)
            .await?
            .unwrap_or_else(|| AccountBalance::empty(user_id, self.clock.now())))
    }

    /// Non-deleted entries, oldest first.
    pub async fn transactions(&self, user_id: &str) -> BillingResult<Vec<CreditTransaction>> {
        self.ensure_welcome_grant(user_id).await?;
        let mut transactions: Vec<CreditTransaction> = self
            .store
            .find_by_user_id(user_id)
            .await?
            .into_iter()
            .filter(|tx| !tx.deleted)
            .collect();
        transactions.sort_by_key(|tx| tx.timestamp);
        Ok(transactions)
    }

    pub async fn transaction(&self, id: Uuid) -> BillingResult<CreditTransaction> {
        self.store
            .find_transaction(id)
            .await?
            .ok_or_else(|| BillingError::not_found("credit transaction", id))
    }

    /// Entries written after `after` across all users, oldest first.
    pub async fn transactions_since(
        &self,
        after: DateTime<Utc>,
    ) -> BillingResult<Vec<CreditTransaction>> {
        Ok(self
            .store
            .find_by_timestamp_after(after)
            .await?
            .into_iter()
            .filter(|tx| !tx.deleted)
            .collect())
    }

    pub async fn credit(
        &self,
        user_id: &str,
        amount: Decimal,
        kind: TransactionKind,
        idempotency_key: &str,
        related_payment_id: Option<Uuid>,
    ) -> BillingResult<CreditTransaction> {
        self.credit_of_type(
            user_id,
            CreditType::Standard,
            amount,
            kind,
            idempotency_key,
            related_payment_id,
        )
        .await
    }

    pub async fn credit_of_type(
        &self,
        user_id: &str,
        credit_type: CreditType,
        amount: Decimal,
        kind: TransactionKind,
        idempotency_key: &str,
        related_payment_id: Option<Uuid>,
    ) -> BillingResult<CreditTransaction> {
        ensure_positive(amount)?;
        if kind == TransactionKind::Debit {
            return Err(BillingError::InvalidRequest(
                "debits must go through debit()".into(),
            ));
        }
        let idempotency_key = require_key(idempotency_key)?;
        self.ensure_welcome_grant(user_id).await?;
        self.append(Draft {
            user_id,
            amount,
            kind,
            credit_type,
            idempotency_key,
            related_payment_id,
            reverses: None,
            description: None,
            event_type: EventType::CreditGranted,
        })
        .await
    }

    pub async fn debit(
        &self,
        user_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> BillingResult<CreditTransaction> {
        self.debit_of_type(user_id, CreditType::Standard, amount, idempotency_key)
            .await
    }

    pub async fn debit_of_type(
        &self,
        user_id: &str,
        credit_type: CreditType,
        amount: Decimal,
        idempotency_key: &str,
    ) -> BillingResult<CreditTransaction> {
        ensure_positive(amount)?;
        let idempotency_key = require_key(idempotency_key)?;
        self.ensure_welcome_grant(user_id).await?;
        self.append(Draft {
            user_id,
            amount: -amount,
            kind: TransactionKind::Debit,
            credit_type,
            idempotency_key,
            related_payment_id: None,
            reverses: None,
            description: None,
            event_type: EventType::CreditDebited,
        })
        .await
    }

    /// Writes the offsetting entry for `transaction_id`. The original is never touched;
    /// a second call returns the same offset.
    pub async fn reverse(&self, transaction_id: Uuid) -> BillingResult<CreditTransaction> {
        let original = self.transaction(transaction_id).await?;
        if original.reverses.is_some() {
            return Err(BillingError::invalid_transition(
                "credit transaction",
                original.id,
                "reversal",
                "reversed",
            ));
        }
        if original.deleted {
            return Err(BillingError::invalid_transition(
                "credit transaction",
                original.id,
                "deleted",
                "reversed",
            ));
        }

        let amount = -original.amount;
        let kind = if amount > Decimal::ZERO {
            TransactionKind::RefundCredit
        } else {
            TransactionKind::Adjustment
        };
        self.append(Draft {
            user_id: &original.user_id,
            amount,
            kind,
            credit_type: original.credit_type,
            idempotency_key: format!("reversal:{}", original.id),
            related_payment_id: original.related_payment_id,
            reverses: Some(original.id),
            description: Some(format!("reversal of {} {}", original.kind, original.id)),
            event_type: EventType::CreditReversed,
        })
        .await
    }

    /// Claws back `share` (0..=1) of every grant tied to a refunded payment. Only what the
    /// user still holds is taken; the rest is reported as shortfall and a later call takes
    /// whatever has become available. Calling again once complete writes nothing.
    pub async fn reverse_payment_grants(
        &self,
        payment_id: Uuid,
        share: Decimal,
    ) -> BillingResult<GrantReversal> {
        let share = share.clamp(Decimal::ZERO, Decimal::ONE);
        let related: Vec<CreditTransaction> = self
            .store
            .find_by_related_payment(payment_id)
            .await?
            .into_iter()
            .filter(|tx| !tx.deleted)
            .collect();
        let grants = related
            .iter()
            .filter(|tx| tx.kind == TransactionKind::Grant && tx.reverses.is_none());

        let mut outcome = GrantReversal::default();
        for grant in grants {
            let target = (grant.amount * share).round_dp(grant.amount.scale());
            let offsets = related
                .iter()
                .filter(|tx| tx.reverses == Some(grant.id))
                .count();
            let reversed: Decimal = related
                .iter()
                .filter(|tx| tx.reverses == Some(grant.id))
                .map(|tx| -tx.amount)
                .sum();
            let outstanding = target - reversed;
            if outstanding <= Decimal::ZERO {
                continue;
            }

            let account = self.account(&grant.user_id).await?;
            if account.deleted {
                outcome.shortfall += outstanding;
                continue;
            }
            let amount = outstanding.min(account.balance_of(grant.credit_type));
            if amount <= Decimal::ZERO {
                outcome.shortfall += outstanding;
                continue;
            }

            let idempotency_key = if offsets == 0 {
                format!("reversal:{}", grant.id)
            } else {
                format!("reversal:{}:{offsets}", grant.id)
            };
            let reversal = self
                .append(Draft {
                    user_id: &grant.user_id,
                    amount: -amount,
                    kind: TransactionKind::Adjustment,
                    credit_type: grant.credit_type,
                    idempotency_key,
                    related_payment_id: grant.related_payment_id,
                    reverses: Some(grant.id),
                    description: Some(format!(
                        "reversal of {} {} for refunded payment {payment_id}",
                        grant.kind, grant.id
                    )),
                    event_type: EventType::CreditReversed,
                })
                .await?;
            outcome.shortfall += outstanding - amount;
            outcome.reversals.push(reversal);
        }

        if !outcome.is_complete() {
            warn!(
                %payment_id,
                shortfall = %outcome.shortfall,
                "refunded payment's credits were already spent; shortfall left outstanding"
            );
        }
        Ok(outcome)
    }

    /// Soft-closes the account; the balance row and history are kept.
    pub async fn close_account(&self, user_id: &str) -> BillingResult<AccountBalance> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let account = self
                .store
                .account(user_id)
                .await?
                .unwrap_or_else(|| AccountBalance::empty(user_id, self.clock.now()));
            if account.deleted {
                return Ok(account);
            }
            match self
                .store
                .mark_account_deleted(user_id, account.version, self.clock.now())
                .await
            {
                Ok(closed) => {
                    info!(%user_id, balance = %closed.balance, "credit account closed");
                    return Ok(closed);
                }
                Err(err) if err.is_retryable() && self.append_retry.allows_retry_after(attempt) => {
                    self.append_retry.backoff(attempt).await;
                }
                Err(err) => return Err(exhausted(err, user_id, attempt)),
            }
        }
    }

    async fn ensure_welcome_grant(&self, user_id: &str) -> BillingResult<()> {
        if (self.initial_credit <= Decimal::ZERO && self.initial_advanced_credit <= Decimal::ZERO)
            || self.store.account(user_id).await?.is_some()
        {
            return Ok(());
        }
        let grants = [
            (CreditType::Standard, self.initial_credit, format!("welcome:{user_id}")),
            (
                CreditType::Advanced,
                self.initial_advanced_credit,
                format!("welcome-advanced:{user_id}"),
            ),
        ];
        for (credit_type, amount, idempotency_key) in grants {
            if amount <= Decimal::ZERO {
                continue;
            }
            self.append(Draft {
                user_id,
                amount,
                kind: TransactionKind::Grant,
                credit_type,
                idempotency_key,
                related_payment_id: None,
                reverses: None,
                description: Some("welcome credit".into()),
                event_type: EventType::CreditGranted,
            })
            .await?;
        }
        Ok(())
    }

    async fn append(&self, draft: Draft<'_>) -> BillingResult<CreditTransaction> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(existing) = self
                .store
                .find_by_idempotency_key(draft.user_id, &draft.idempotency_key)
                .await?
            {
                return replay(existing, &draft);
            }

            let now = self.clock.now();
            let account = self
                .store
                .account(draft.user_id)
                .await?
                .unwrap_or_else(|| AccountBalance::empty(draft.user_id, now));
            if account.deleted {
                increment_counter!("credit_transactions_rejected_total", "reason" => "closed");
                return Err(BillingError::invalid_transition(
                    "account",
                    draft.user_id,
                    "closed",
                    draft.kind,
                ));
            }
            let available = account.balance_of(draft.credit_type);
            if available + draft.amount < Decimal::ZERO {
                increment_counter!(
                    "credit_transactions_rejected_total",
                    "reason" => "insufficient",
                    "credit_type" => draft.credit_type.as_str()
                );
                return Err(BillingError::InsufficientCredits {
                    user_id: draft.user_id.to_string(),
                    balance: available,
                    requested: -draft.amount,
                });
            }

            let tx = CreditTransaction {
                id: Uuid::new_v4(),
                user_id: draft.user_id.to_string(),
                amount: draft.amount,
                kind: draft.kind,
                credit_type: draft.credit_type,
                idempotency_key: draft.idempotency_key.clone(),
                timestamp: now,
                related_payment_id: draft.related_payment_id,
                reverses: draft.reverses,
                description: draft.description.clone(),
                deleted: false,
            };

            match self.store.append_transaction(tx.clone(), account.version).await {
                Ok(updated) => {
                    info!(
                        user_id = %tx.user_id,
                        transaction_id = %tx.id,
                        kind = %tx.kind,
                        credit_type = %tx.credit_type,
                        amount = %tx.amount,
                        balance = %updated.balance_of(tx.credit_type),
                        "ledger entry appended"
                    );
                    increment_counter!(
                        "credit_transactions_total",
                        "kind" => tx.kind.as_str(),
                        "credit_type" => tx.credit_type.as_str()
                    );
                    histogram!(
                        "credit_transaction_amount",
                        tx.amount.abs().to_f64().unwrap_or_default(),
                        "credit_type" => tx.credit_type.as_str()
                    );
                    self.outbox
                        .enqueue(DomainEvent::credit(
                            draft.event_type,
                            &tx,
                            updated.version,
                            now,
                        ))
                        .await?;
                    self.outbox.flush().await;
                    return Ok(tx);
                }
                Err(err @ BillingError::DuplicateIdempotencyKey { .. }) => {
                    // a concurrent request with the same key won the race
                    return match self
                        .store
                        .find_by_idempotency_key(draft.user_id, &draft.idempotency_key)
                        .await?
                    {
                        Some(existing) => replay(existing, &draft),
                        None => Err(err),
                    };
                }
                Err(err) if err.is_retryable() && self.append_retry.allows_retry_after(attempt) => {
                    warn!(
                        ?err,
                        user_id = %draft.user_id,
                        attempt,
                        "ledger append conflicted, retrying"
                    );
                    self.append_retry.backoff(attempt).await;
                }
                Err(err) => return Err(exhausted(err, draft.user_id, attempt)),
            }
        }
    }
}

/// A conflict that outlived the retry budget is reported as contention on the account.
fn exhausted(err: BillingError, user_id: &str, attempts: u32) -> BillingError {
    match err {
        BillingError::VersionConflict { .. } => {
            warn!(%user_id, attempts, "ledger append gave up after repeated conflicts");
            BillingError::Contended {
                aggregate: format!("account:{user_id}"),
                attempts,
            }
        }
        other => other,
    }
}

fn replay(existing: CreditTransaction, draft: &Draft<'_>) -> BillingResult<CreditTransaction> {
    if existing.matches_request(
        draft.amount,
        draft.kind,
        draft.credit_type,
        draft.related_payment_id,
    ) {
        Ok(existing)
    } else {
        Err(BillingError::DuplicateIdempotencyKey {
            user_id: draft.user_id.to_string(),
            key: draft.idempotency_key.clone(),
        })
    }
}

fn ensure_positive(amount: Decimal) -> BillingResult<()> {
    if amount <= Decimal::ZERO {
        return Err(BillingError::InvalidAmount(format!(
            "amount must be greater than zero, got {amount}"
        )));
    }
    Ok(())
}

fn require_key(key: &str) -> BillingResult<String> {
    let key = key.trim();
    if key.is_empty() {
        return Err(BillingError::InvalidRequest(
            "idempotency key is required".into(),
        ));
    }
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::events::InMemoryEventBus;
    use crate::ledger::store::InMemoryLedgerStore;
    use async_trait::async_trait;
    use rstest::rstest;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine_on(store: Arc<dyn LedgerStore>, initial_credit: Decimal) -> CreditEngine {
        let outbox = Arc::new(Outbox::in_memory(Arc::new(InMemoryEventBus::new())));
        CreditEngine::new(
            store,
            outbox,
            Arc::new(SystemClock),
            RetryPolicy::immediate(5),
            initial_credit,
        )
    }

    fn engine_with(initial_credit: Decimal) -> CreditEngine {
        engine_on(Arc::new(InMemoryLedgerStore::new()), initial_credit)
    }

    /// Loses every append to an imaginary concurrent writer.
    #[derive(Default)]
    struct AlwaysConflicting {
        inner: InMemoryLedgerStore,
        appends: AtomicU32,
    }

    #[async_trait]
    impl LedgerStore for AlwaysConflicting {
        async fn account(&self, user_id: &str) -> BillingResult<Option<AccountBalance>> {
            self.inner.account(user_id).await
        }

        async fn append_transaction(
            &self,
            _tx: CreditTransaction,
            expected_version: i64,
        ) -> BillingResult<AccountBalance> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            Err(BillingError::version_conflict(
                "account:u1",
                expected_version,
                expected_version + 1,
            ))
        }

        async fn find_by_idempotency_key(
            &self,
            user_id: &str,
            key: &str,
        ) -> BillingResult<Option<CreditTransaction>> {
            self.inner.find_by_idempotency_key(user_id, key).await
        }

        async fn find_transaction(&self, id: Uuid) -> BillingResult<Option<CreditTransaction>> {
            self.inner.find_transaction(id).await
        }

        async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Vec<CreditTransaction>> {
            self.inner.find_by_user_id(user_id).await
        }

        async fn find_by_related_payment(
            &self,
            payment_id: Uuid,
        ) -> BillingResult<Vec<CreditTransaction>> {
            self.inner.find_by_related_payment(payment_id).await
        }

        async fn find_by_timestamp_after(
            &self,
            after: DateTime<Utc>,
        ) -> BillingResult<Vec<CreditTransaction>> {
            self.inner.find_by_timestamp_after(after).await
        }

        async fn mark_account_deleted(
            &self,
            user_id: &str,
            expected_version: i64,
            now: DateTime<Utc>,
        ) -> BillingResult<AccountBalance> {
            self.inner
                .mark_account_deleted(user_id, expected_version, now)
                .await
        }

        async fn user_ids(&self) -> BillingResult<Vec<String>> {
            self.inner.user_ids().await
        }
    }

    #[rstest]
    #[case(dec!(0))]
    #[case(dec!(-5))]
    #[tokio::test]
    async fn rejects_non_positive_amounts(#[case] amount: Decimal) {
        let engine = engine_with(Decimal::ZERO);
        let err = engine
            .credit("u1", amount, TransactionKind::Grant, "k1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidAmount(_)));
        let err = engine.debit("u1", amount, "k2").await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn credit_refuses_debit_kind() {
        let engine = engine_with(Decimal::ZERO);
        let err = engine
            .credit("u1", dec!(5), TransactionKind::Debit, "k1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn reusing_key_with_different_amount_is_a_conflict() {
        let engine = engine_with(Decimal::ZERO);
        engine
            .credit("u1", dec!(10), TransactionKind::Grant, "k1", None)
            .await
            .unwrap();
        let err = engine
            .credit("u1", dec!(11), TransactionKind::Grant, "k1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::DuplicateIdempotencyKey { .. }));
        assert_eq!(engine.balance("u1").await.unwrap(), dec!(10));
    }

    #[tokio::test]
    async fn welcome_credit_is_granted_once_on_first_access() {
        let engine = engine_with(dec!(25));
        assert_eq!(engine.balance("u1").await.unwrap(), dec!(25));
        assert_eq!(engine.balance("u1").await.unwrap(), dec!(25));
        let transactions = engine.transactions("u1").await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].idempotency_key, "welcome:u1");
    }

    #[tokio::test]
    async fn reversing_a_reversal_is_refused() {
        let engine = engine_with(Decimal::ZERO);
        let grant = engine
            .credit("u1", dec!(10), TransactionKind::Grant, "k1", None)
            .await
            .unwrap();
        let reversal = engine.reverse(grant.id).await.unwrap();
        assert_eq!(reversal.kind, TransactionKind::Adjustment);
        assert_eq!(reversal.amount, dec!(-10));

        let again = engine.reverse(grant.id).await.unwrap();
        assert_eq!(again.id, reversal.id);

        let err = engine.reverse(reversal.id).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidStateTransition { .. }));
        assert_eq!(engine.balance("u1").await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn closed_account_rejects_new_entries() {
        let engine = engine_with(Decimal::ZERO);
        engine
            .credit("u1", dec!(10), TransactionKind::Grant, "k1", None)
            .await
            .unwrap();
        let closed = engine.close_account("u1").await.unwrap();
        assert!(closed.deleted);
        let err = engine.debit("u1", dec!(1), "k2").await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidStateTransition { .. }));
        assert_eq!(engine.transactions("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_conflicts_surface_as_contention() {
        let store = Arc::new(AlwaysConflicting::default());
        let engine = engine_on(store.clone(), Decimal::ZERO);
        let err = engine
            .credit("u1", dec!(5), TransactionKind::Grant, "k1", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::Contended { ref aggregate, attempts: 5 } if aggregate == "account:u1"
        ));
        assert_eq!(err.kind(), crate::error::ErrorKind::Contended);
        assert_eq!(store.appends.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn advanced_credits_live_in_their_own_pool() {
        let engine = engine_with(Decimal::ZERO);
        engine
            .credit_of_type("u1", CreditType::Advanced, dec!(3), TransactionKind::Grant, "a1", None)
            .await
            .unwrap();
        let err = engine.debit("u1", dec!(1), "d1").await.unwrap_err();
        assert!(matches!(err, BillingError::InsufficientCredits { .. }));

        let debit = engine
            .debit_of_type("u1", CreditType::Advanced, dec!(2), "d2")
            .await
            .unwrap();
        assert_eq!(debit.credit_type, CreditType::Advanced);
        let account = engine.account("u1").await.unwrap();
        assert_eq!(account.balance, dec!(0));
        assert_eq!(account.advanced_balance, dec!(1));
        assert_eq!(account.advanced_total_used, dec!(2));

        // the reversal lands in the pool of the original
        let reversal = engine.reverse(debit.id).await.unwrap();
        assert_eq!(reversal.credit_type, CreditType::Advanced);
        assert_eq!(
            engine.balance_of("u1", CreditType::Advanced).await.unwrap(),
            dec!(3)
        );
    }

    #[tokio::test]
    async fn welcome_grant_can_include_advanced_credits() {
        let engine = engine_with(dec!(10)).with_initial_advanced_credit(dec!(2));
        let account = engine.account("u1").await.unwrap();
        assert_eq!(account.balance, dec!(10));
        assert_eq!(account.advanced_balance, dec!(2));
        assert_eq!(account.total_earned, dec!(10));
        assert_eq!(engine.transactions("u1").await.unwrap().len(), 2);
    }

    #[rstest]
    #[case::full(dec!(1), dec!(-100))]
    #[case::half(dec!(0.5), dec!(-50))]
    #[case::fifth(dec!(0.2), dec!(-20))]
    #[tokio::test]
    async fn payment_grants_are_reversed_in_proportion(
        #[case] share: Decimal,
        #[case] expected: Decimal,
    ) {
        let engine = engine_with(Decimal::ZERO);
        let payment_id = Uuid::new_v4();
        engine
            .credit("u1", dec!(100), TransactionKind::Grant, "bonus", Some(payment_id))
            .await
            .unwrap();

        let outcome = engine
            .reverse_payment_grants(payment_id, share)
            .await
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.reversals.len(), 1);
        assert_eq!(outcome.reversals[0].amount, expected);

        // a second pass finds nothing left to take
        let again = engine
            .reverse_payment_grants(payment_id, share)
            .await
            .unwrap();
        assert!(again.reversals.is_empty());
        assert!(again.is_complete());
    }

    #[tokio::test]
    async fn spent_grants_leave_a_shortfall_collected_later() {
        let engine = engine_with(Decimal::ZERO);
        let payment_id = Uuid::new_v4();
        engine
            .credit("u1", dec!(100), TransactionKind::Grant, "bonus", Some(payment_id))
            .await
            .unwrap();
        engine.debit("u1", dec!(70), "spend").await.unwrap();

        let first = engine
            .reverse_payment_grants(payment_id, Decimal::ONE)
            .await
            .unwrap();
        assert_eq!(first.reversals[0].amount, dec!(-30));
        assert_eq!(first.shortfall, dec!(70));
        assert_eq!(engine.balance("u1").await.unwrap(), dec!(0));

        engine
            .credit("u1", dec!(50), TransactionKind::Adjustment, "top-up", None)
            .await
            .unwrap();
        let second = engine
            .reverse_payment_grants(payment_id, Decimal::ONE)
            .await
            .unwrap();
        assert_eq!(second.reversals[0].amount, dec!(-50));
        assert_eq!(second.shortfall, dec!(20));
        assert_eq!(
            second.reversals[0].idempotency_key,
            format!("reversal:{}:1", first.reversals[0].reverses.unwrap())
        );
    }
}
