use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::models::{Payment, PaymentStatus, Subscription, SubscriptionPlan, SubscriptionStatus};
use crate::error::{BillingError, BillingResult};

/// key: billing-persistence -> per-record optimistic versioning
///
/// `save` takes the record as it was read; the stored version must still match, and the
/// returned copy carries the bumped version.
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn insert(&self, payment: Payment) -> BillingResult<Payment>;
    async fn save(&self, payment: Payment) -> BillingResult<Payment>;
    async fn get(&self, id: Uuid) -> BillingResult<Option<Payment>>;
    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Vec<Payment>>;
    async fn find_by_subscription_id(&self, subscription_id: Uuid) -> BillingResult<Vec<Payment>>;
    async fn find_by_status(&self, status: PaymentStatus) -> BillingResult<Vec<Payment>>;
    /// Records changed at or after `since`, oldest first.
    async fn find_updated_since(&self, since: DateTime<Utc>) -> BillingResult<Vec<Payment>>;
    async fn all(&self) -> BillingResult<Vec<Payment>>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn insert(&self, subscription: Subscription) -> BillingResult<Subscription>;
    async fn save(&self, subscription: Subscription) -> BillingResult<Subscription>;
    async fn get(&self, id: Uuid) -> BillingResult<Option<Subscription>>;
    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Vec<Subscription>>;
    async fn find_by_status(&self, status: SubscriptionStatus)
        -> BillingResult<Vec<Subscription>>;
    async fn find_updated_since(&self, since: DateTime<Utc>)
        -> BillingResult<Vec<Subscription>>;
    async fn all(&self) -> BillingResult<Vec<Subscription>>;
}

/// key: billing-plan-catalog -> plan lookup
#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn get(&self, plan_id: Uuid) -> BillingResult<SubscriptionPlan>;
    async fn find_by_code(&self, code: &str) -> BillingResult<Option<SubscriptionPlan>>;
    async fn list_active(&self) -> BillingResult<Vec<SubscriptionPlan>>;
    async fn upsert(&self, plan: SubscriptionPlan) -> BillingResult<SubscriptionPlan>;
}

pub(crate) trait Versioned: Clone + Send + Sync {
    const ENTITY: &'static str;

    fn id(&self) -> Uuid;
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);
}

impl Versioned for Payment {
    const ENTITY: &'static str = "payment";

    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

impl Versioned for Subscription {
    const ENTITY: &'static str = "subscription";

    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }
}

#[derive(Debug)]
struct VersionedTable<T> {
    rows: DashMap<Uuid, T>,
}

impl<T> Default for VersionedTable<T> {
    fn default() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }
}

impl<T: Versioned> VersionedTable<T> {
    fn insert(&self, mut record: T) -> BillingResult<T> {
        match self.rows.entry(record.id()) {
            Entry::Occupied(_) => Err(BillingError::InvalidRequest(format!(
                "{} {} already exists",
                T::ENTITY,
                record.id()
            ))),
            Entry::Vacant(slot) => {
                record.set_version(1);
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    fn save(&self, mut record: T) -> BillingResult<T> {
        let mut stored = self
            .rows
            .get_mut(&record.id())
            .ok_or_else(|| BillingError::not_found(T::ENTITY, record.id()))?;
        if stored.version() != record.version() {
            return Err(BillingError::version_conflict(
                format!("{}:{}", T::ENTITY, record.id()),
                record.version(),
                stored.version(),
            ));
        }
        record.set_version(record.version() + 1);
        *stored = record.clone();
        Ok(record)
    }

    fn get(&self, id: Uuid) -> Option<T> {
        self.rows.get(&id).map(|row| row.value().clone())
    }

    fn filter(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.rows
            .iter()
            .filter(|row| predicate(row.value()))
            .map(|row| row.value().clone())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPaymentRepository {
    table: VersionedTable<Payment>,
}

impl InMemoryPaymentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn oldest_first_payments(mut payments: Vec<Payment>) -> Vec<Payment> {
    payments.sort_by_key(|payment| (payment.created_at, payment.id));
    payments
}

#[async_trait]
impl PaymentRepository for InMemoryPaymentRepository {
    async fn insert(&self, payment: Payment) -> BillingResult<Payment> {
        self.table.insert(payment)
    }

    async fn save(&self, payment: Payment) -> BillingResult<Payment> {
        self.table.save(payment)
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        Ok(self.table.get(id))
    }

    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Vec<Payment>> {
        Ok(oldest_first_payments(
            self.table.filter(|payment| payment.user_id == user_id),
        ))
    }

    async fn find_by_subscription_id(&self, subscription_id: Uuid) -> BillingResult<Vec<Payment>> {
        Ok(oldest_first_payments(
            self.table
                .filter(|payment| payment.subscription_id == subscription_id),
        ))
    }

    async fn find_by_status(&self, status: PaymentStatus) -> BillingResult<Vec<Payment>> {
        Ok(oldest_first_payments(
            self.table.filter(|payment| payment.status == status),
        ))
    }

    async fn find_updated_since(&self, since: DateTime<Utc>) -> BillingResult<Vec<Payment>> {
        Ok(oldest_first_payments(
            self.table.filter(|payment| payment.updated_at >= since),
        ))
    }

    async fn all(&self) -> BillingResult<Vec<Payment>> {
        Ok(oldest_first_payments(self.table.filter(|_| true)))
    }
}

#[derive(Debug, Default)]
pub struct InMemorySubscriptionRepository {
    table: VersionedTable<Subscription>,
}

impl InMemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn oldest_first_subscriptions(mut subscriptions: Vec<Subscription>) -> Vec<Subscription> {
    subscriptions.sort_by_key(|subscription| (subscription.created_at, subscription.id));
    subscriptions
}

#[async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn insert(&self, subscription: Subscription) -> BillingResult<Subscription> {
        self.table.insert(subscription)
    }

    async fn save(&self, subscription: Subscription) -> BillingResult<Subscription> {
        self.table.save(subscription)
    }

    async fn get(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.table.get(id))
    }

    async fn find_by_user_id(&self, user_id: &str) -> BillingResult<Vec<Subscription>> {
        Ok(oldest_first_subscriptions(
            self.table
                .filter(|subscription| subscription.user_id == user_id),
        ))
    }

    async fn find_by_status(
        &self,
        status: SubscriptionStatus,
    ) -> BillingResult<Vec<Subscription>> {
        Ok(oldest_first_subscriptions(
            self.table.filter(|subscription| subscription.status == status),
        ))
    }

    async fn find_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> BillingResult<Vec<Subscription>> {
        Ok(oldest_first_subscriptions(
            self.table
                .filter(|subscription| subscription.updated_at >= since),
        ))
    }

    async fn all(&self) -> BillingResult<Vec<Subscription>> {
        Ok(oldest_first_subscriptions(self.table.filter(|_| true)))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPlanCatalog {
    plans: DashMap<Uuid, SubscriptionPlan>,
}

impl InMemoryPlanCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans(plans: impl IntoIterator<Item = SubscriptionPlan>) -> BillingResult<Self> {
        let catalog = Self::new();
        for plan in plans {
            plan.validate()?;
            catalog.plans.insert(plan.id, plan);
        }
        Ok(catalog)
    }
}

#[async_trait]
impl PlanCatalog for InMemoryPlanCatalog {
    async fn get(&self, plan_id: Uuid) -> BillingResult<SubscriptionPlan> {
        self.plans
            .get(&plan_id)
            .map(|plan| plan.value().clone())
            .ok_or_else(|| BillingError::not_found("plan", plan_id))
    }

    async fn find_by_code(&self, code: &str) -> BillingResult<Option<SubscriptionPlan>> {
        Ok(self
            .plans
            .iter()
            .find(|plan| plan.code == code)
            .map(|plan| plan.value().clone()))
    }

    async fn list_active(&self) -> BillingResult<Vec<SubscriptionPlan>> {
        let mut plans: Vec<SubscriptionPlan> = self
            .plans
            .iter()
            .filter(|plan| plan.active)
            .map(|plan| plan.value().clone())
            .collect();
        plans.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.code.cmp(&b.code)));
        Ok(plans)
    }

    async fn upsert(&self, plan: SubscriptionPlan) -> BillingResult<SubscriptionPlan> {
        plan.validate()?;
        self.plans.insert(plan.id, plan.clone());
        Ok(plan)
    }
}
