//! Collaborator interfaces of the billing engine
//!
//! Every state change is a conditional write: the implementation only touches
//! a row that is still in the expected pre-state and reports whether it did.
//! A `false` / `0` result means another actor already moved the row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hris_shared::SubscriptionStatus;
use uuid::Uuid;

use crate::catalog::{Feature, Plan};
use crate::error::BillingResult;
use crate::invoices::{Invoice, PaymentUpdate, SettleOutcome};
use crate::subscriptions::{Subscription, SubscriptionAdvance};

/// Read access to the plan catalog
#[async_trait]
pub trait PlanReader: Send + Sync {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>>;

    async fn list_plans(&self) -> BillingResult<Vec<Plan>>;

    /// Features whose plan link is switched on
    async fn plan_features(&self, plan_id: Uuid) -> BillingResult<Vec<Feature>>;
}

/// Persistence of the per-tenant subscription row
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_by_tenant(&self, tenant_id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Fails with `SubscriptionExists` when the tenant already has one
    async fn insert(&self, subscription: &Subscription) -> BillingResult<()>;

    /// Set or clear `pending_plan_id` while the row still has `expected_plan_id`
    /// and one of `allowed` statuses
    async fn set_pending_plan(
        &self,
        tenant_id: Uuid,
        expected_plan_id: Uuid,
        allowed: &[SubscriptionStatus],
        pending_plan_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> BillingResult<bool>;

    /// Set or clear `pending_max_seats` while the row still has
    /// `expected_max_seats` and one of `allowed` statuses
    async fn set_pending_seats(
        &self,
        tenant_id: Uuid,
        expected_max_seats: i32,
        allowed: &[SubscriptionStatus],
        pending_max_seats: Option<i32>,
        now: DateTime<Utc>,
    ) -> BillingResult<bool>;

    /// Move one tenant's subscription from any of `from` to `to`.
    /// Moving to `cancelled` also records the time and turns auto-renew off.
    async fn transition(
        &self,
        tenant_id: Uuid,
        from: &[SubscriptionStatus],
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> BillingResult<bool>;

    /// Bulk move every subscription in `from` whose period ended at or before
    /// `period_ended_by`
    async fn sweep_status(
        &self,
        from: &[SubscriptionStatus],
        to: SubscriptionStatus,
        period_ended_by: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<u64>;

    /// Copy due `pending_max_seats` into `max_seats` and clear it
    async fn apply_pending_seats(&self, now: DateTime<Utc>) -> BillingResult<u64>;

    /// Copy due `pending_plan_id` into `plan_id` and clear it, clamping
    /// `max_seats` to the new plan's cap
    async fn apply_pending_plans(&self, now: DateTime<Utc>) -> BillingResult<u64>;
}

/// Persistence of invoices. Rows are never deleted.
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Fails with `PendingInvoiceExists` when the subscription already has a
    /// pending invoice
    async fn insert(&self, invoice: &Invoice) -> BillingResult<()>;

    async fn get(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>>;

    async fn get_by_gateway_id(&self, gateway_invoice_id: &str) -> BillingResult<Option<Invoice>>;

    async fn find_pending(&self, subscription_id: Uuid) -> BillingResult<Option<Invoice>>;

    /// Newest first
    async fn list_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Vec<Invoice>>;

    /// Move a pending invoice to a terminal status and, when `advance` is
    /// given, apply it to the owning subscription. Both writes commit together
    /// or not at all. An advance the subscription's current status does not
    /// admit is skipped and the invoice is still settled, with a note.
    async fn settle(
        &self,
        invoice_id: Uuid,
        update: &PaymentUpdate,
        advance: Option<&SubscriptionAdvance>,
    ) -> BillingResult<SettleOutcome>;

    /// Expire pending invoices created before `created_before` or whose
    /// gateway expiry has passed
    async fn expire_stale(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<u64>;
}

/// Live head count from the employee module
#[async_trait]
pub trait EmployeeCounter: Send + Sync {
    async fn count_active_by_tenant(&self, tenant_id: Uuid) -> BillingResult<i64>;
}
