//! Subscription aggregate
//!
//! One subscription per tenant, mutated for the tenant's lifetime and never
//! deleted. Status edges:
//!
//! ```text
//! trial     -> active (checkout paid), past_due (period over)
//! active    -> active (renewal paid), past_due (period over), cancelled
//! past_due  -> active (invoice paid), expired (grace over), cancelled
//! cancelled -> expired (period over), active (checkout paid)
//! expired   -> active (checkout paid)
//! ```
//!
//! Upgrades and seat increases go through a paid invoice and take effect when
//! the payment lands. Downgrades and seat decreases are free and deferred to
//! the end of the current period.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hris_shared::{BillingCycle, InvoiceKind, SubscriptionStatus};
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::{classify_change, PlanCatalog, PlanChange};
use crate::error::{BillingError, BillingResult};
use crate::invoices::{Invoice, InvoiceDraft, InvoiceService, InvoiceSnapshot};
use crate::pricing;
use crate::store::{EmployeeCounter, SubscriptionStore};

use SubscriptionStatus::{Active, Cancelled, Expired, PastDue, Trial};

/// Statuses in which plan and seat changes may be requested
const CHANGEABLE: &[SubscriptionStatus] = &[Trial, Active];
/// Upgrades are also how a past-due tenant gets back to good standing
const UPGRADEABLE: &[SubscriptionStatus] = &[Trial, Active, PastDue];
const CANCELLABLE: &[SubscriptionStatus] = &[Active, PastDue];
/// Paid seats only land on a subscription in good standing
const SEAT_INCREASABLE: &[SubscriptionStatus] = &[Active];
const ANY_STATUS: &[SubscriptionStatus] = &[Trial, Active, PastDue, Cancelled, Expired];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub max_seats: i32,
    /// Deferred seat decrease, always below `max_seats`
    pub pending_max_seats: Option<i32>,
    pub billing_cycle: BillingCycle,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    /// Deferred downgrade, always a lower tier than `plan_id`
    pub pending_plan_id: Option<Uuid>,
    pub auto_renew: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether the state machine has an edge from `from` to `to`.
///
/// Reaching `active` from `cancelled` or `expired` is only possible through a
/// paid checkout.
pub fn can_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> bool {
    matches!(
        (from, to),
        (Trial, Active)
            | (Trial, PastDue)
            | (Trial, Expired)
            | (Active, Active)
            | (Active, PastDue)
            | (Active, Cancelled)
            | (PastDue, Active)
            | (PastDue, Expired)
            | (PastDue, Cancelled)
            | (Cancelled, Active)
            | (Cancelled, Expired)
            | (Expired, Active)
    )
}

impl Subscription {
    pub fn can_transition_to(&self, to: SubscriptionStatus) -> bool {
        can_transition(self.status, to)
    }

    /// Cancelled subscriptions keep access until their period ends
    pub fn has_access_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            Trial | Active | PastDue => true,
            Cancelled => now < self.current_period_end,
            Expired => false,
        }
    }

    fn require_status(&self, allowed: &[SubscriptionStatus]) -> BillingResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(BillingError::SubscriptionInactive(self.status.to_string()))
        }
    }

    fn require_seat_change_allowed(&self) -> BillingResult<()> {
        if self.status == PastDue {
            return Err(BillingError::CannotUpgradeDuringGracePeriod);
        }
        self.require_status(CHANGEABLE)
    }
}

/// Absolute subscription state written when an invoice is paid.
///
/// Every field comes from the invoice snapshot, so applying the same advance
/// twice leaves the row unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionAdvance {
    pub subscription_id: Uuid,
    /// New plan; `None` keeps the current one
    pub plan_id: Option<Uuid>,
    pub max_seats: i32,
    /// New `[start, end)`; `None` keeps the current period
    pub period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub billing_cycle: Option<BillingCycle>,
    pub clear_pending_plan: bool,
    /// Drop any pending seat decrease. Stores also drop one that would no
    /// longer be a decrease against the new `max_seats`.
    pub clear_pending_seats: bool,
    /// Status after the change; `None` keeps the current one
    pub status_after: Option<SubscriptionStatus>,
}

impl SubscriptionAdvance {
    pub fn from_invoice(invoice: &Invoice) -> Self {
        let snapshot = &invoice.snapshot;
        let new_period = invoice.kind.starts_new_period();
        Self {
            subscription_id: invoice.subscription_id,
            plan_id: new_period.then_some(snapshot.plan_id),
            max_seats: snapshot.target_max_seats,
            period: new_period.then_some((snapshot.period_start, snapshot.period_end)),
            billing_cycle: new_period.then_some(snapshot.billing_cycle),
            clear_pending_plan: new_period,
            clear_pending_seats: invoice.kind != InvoiceKind::Upgrade,
            status_after: new_period.then_some(Active),
        }
    }

    /// Whether this advance may be written over a subscription in `current`.
    /// A seat-only change never moves status, so it needs good standing.
    pub fn applies_to(&self, current: SubscriptionStatus) -> bool {
        match self.status_after {
            Some(to) => can_transition(current, to),
            None => SEAT_INCREASABLE.contains(&current),
        }
    }
}

/// Use cases of the subscription aggregate
#[derive(Clone)]
pub struct SubscriptionService {
    catalog: PlanCatalog,
    store: Arc<dyn SubscriptionStore>,
    employees: Arc<dyn EmployeeCounter>,
    invoices: InvoiceService,
}

impl SubscriptionService {
    pub fn new(
        catalog: PlanCatalog,
        store: Arc<dyn SubscriptionStore>,
        employees: Arc<dyn EmployeeCounter>,
        invoices: InvoiceService,
    ) -> Self {
        Self {
            catalog,
            store,
            employees,
            invoices,
        }
    }

    /// Create the tenant's trial subscription at onboarding
    pub async fn start_trial(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
        seats: i32,
        trial_days: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        if seats < 1 {
            return Err(BillingError::InvalidSeatCount);
        }
        let plan = self.catalog.get_active_plan(plan_id).await?;
        plan.ensure_allows_seats(seats)?;

        let trial_end = now + chrono::Duration::days(trial_days.max(0));
        let subscription = Subscription {
            id: Uuid::new_v4(),
            tenant_id,
            plan_id: plan.id,
            status: Trial,
            max_seats: seats,
            pending_max_seats: None,
            billing_cycle: BillingCycle::Monthly,
            current_period_start: now,
            current_period_end: trial_end,
            trial_ends_at: Some(trial_end),
            pending_plan_id: None,
            auto_renew: true,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&subscription).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            plan = %plan.name,
            seats,
            trial_ends_at = %trial_end,
            "Trial subscription started"
        );
        Ok(subscription)
    }

    pub async fn get(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .get_by_tenant(tenant_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(tenant_id))
    }

    /// Tenants without a subscription have no access
    pub async fn has_access(&self, tenant_id: Uuid, now: DateTime<Utc>) -> BillingResult<bool> {
        Ok(self
            .store
            .get_by_tenant(tenant_id)
            .await?
            .is_some_and(|s| s.has_access_at(now)))
    }

    /// Open an invoice for a full period of a higher-tier plan starting now.
    /// The plan switches when the invoice is paid.
    pub async fn request_upgrade(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
        payer_email: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Invoice> {
        let subscription = self.get(tenant_id).await?;
        subscription.require_status(UPGRADEABLE)?;

        let current = self.catalog.get_plan(subscription.plan_id).await?;
        let target = self.catalog.get_active_plan(plan_id).await?;
        match classify_change(&current, &target) {
            PlanChange::Upgrade => {}
            PlanChange::Same => return Err(BillingError::SamePlan),
            PlanChange::Downgrade => return Err(BillingError::NotAnUpgrade),
        }

        let seats = subscription.max_seats;
        target.ensure_allows_seats(seats)?;

        let period_end = pricing::period_end(now, subscription.billing_cycle)?;
        let draft = InvoiceDraft {
            tenant_id,
            subscription_id: subscription.id,
            kind: InvoiceKind::Upgrade,
            snapshot: InvoiceSnapshot {
                plan_id: target.id,
                plan_name: target.name,
                price_per_seat: target.price_per_seat,
                seat_count: seats,
                target_max_seats: seats,
                billing_cycle: subscription.billing_cycle,
                period_start: now,
                period_end,
            },
            is_prorated: false,
        };

        self.invoices.issue(draft, payer_email, now).await
    }

    /// Schedule a move to a lower tier at the end of the current period
    pub async fn request_downgrade(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let subscription = self.get(tenant_id).await?;
        subscription.require_status(CHANGEABLE)?;

        let current = self.catalog.get_plan(subscription.plan_id).await?;
        let target = self.catalog.get_active_plan(plan_id).await?;
        match classify_change(&current, &target) {
            PlanChange::Downgrade => {}
            PlanChange::Same => return Err(BillingError::SamePlan),
            PlanChange::Upgrade => return Err(BillingError::NotADowngrade),
        }

        if let Some(cap) = target.max_seats {
            let active = self.employees.count_active_by_tenant(tenant_id).await?;
            if i64::from(cap) < active {
                return Err(BillingError::SeatsBelowActive {
                    requested: cap,
                    active,
                });
            }
        }

        let updated = self
            .store
            .set_pending_plan(tenant_id, subscription.plan_id, CHANGEABLE, Some(target.id), now)
            .await?;
        if !updated {
            return Err(BillingError::ConcurrentUpdate);
        }

        tracing::info!(
            tenant_id = %tenant_id,
            from = %current.name,
            to = %target.name,
            effective_at = %subscription.current_period_end,
            "Downgrade scheduled"
        );
        self.get(tenant_id).await
    }

    pub async fn cancel_pending_downgrade(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let subscription = self.get(tenant_id).await?;
        if subscription.pending_plan_id.is_none() {
            return Err(BillingError::NothingPending);
        }

        let updated = self
            .store
            .set_pending_plan(tenant_id, subscription.plan_id, ANY_STATUS, None, now)
            .await?;
        if !updated {
            return Err(BillingError::ConcurrentUpdate);
        }

        tracing::info!(tenant_id = %tenant_id, "Pending downgrade cancelled");
        self.get(tenant_id).await
    }

    /// Open a prorated invoice for the added seats over the rest of the
    /// current period. The limit rises when the invoice is paid.
    pub async fn request_seat_increase(
        &self,
        tenant_id: Uuid,
        seats: i32,
        payer_email: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Invoice> {
        let subscription = self.get(tenant_id).await?;
        subscription.require_seat_change_allowed()?;
        if !SEAT_INCREASABLE.contains(&subscription.status) {
            // Trial days are free; paid seats come with a checkout
            return Err(BillingError::SeatIncreaseDuringTrial);
        }

        if seats < 1 {
            return Err(BillingError::InvalidSeatCount);
        }
        if seats == subscription.max_seats {
            return Err(BillingError::SameAsCurrentSeats(seats));
        }
        if seats < subscription.max_seats {
            return Err(BillingError::NotASeatIncrease(subscription.max_seats));
        }
        if now >= subscription.current_period_end {
            // The sweep has not caught up yet; the period is already over
            return Err(BillingError::CannotUpgradeDuringGracePeriod);
        }

        let plan = self.catalog.get_plan(subscription.plan_id).await?;
        plan.ensure_allows_seats(seats)?;

        let draft = InvoiceDraft {
            tenant_id,
            subscription_id: subscription.id,
            kind: InvoiceKind::SeatIncrease,
            snapshot: InvoiceSnapshot {
                plan_id: plan.id,
                plan_name: plan.name,
                price_per_seat: plan.price_per_seat,
                seat_count: seats - subscription.max_seats,
                target_max_seats: seats,
                billing_cycle: subscription.billing_cycle,
                period_start: now,
                period_end: subscription.current_period_end,
            },
            is_prorated: true,
        };

        self.invoices.issue(draft, payer_email, now).await
    }

    /// Schedule a lower seat limit for the end of the current period
    pub async fn request_seat_decrease(
        &self,
        tenant_id: Uuid,
        seats: i32,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let subscription = self.get(tenant_id).await?;
        subscription.require_seat_change_allowed()?;

        if seats < 1 {
            return Err(BillingError::InvalidSeatCount);
        }
        if seats == subscription.max_seats {
            return Err(BillingError::SameAsCurrentSeats(seats));
        }
        if seats > subscription.max_seats {
            return Err(BillingError::NotASeatDecrease(subscription.max_seats));
        }

        let active = self.employees.count_active_by_tenant(tenant_id).await?;
        if i64::from(seats) < active {
            return Err(BillingError::SeatsBelowActive {
                requested: seats,
                active,
            });
        }

        let updated = self
            .store
            .set_pending_seats(tenant_id, subscription.max_seats, CHANGEABLE, Some(seats), now)
            .await?;
        if !updated {
            return Err(BillingError::ConcurrentUpdate);
        }

        tracing::info!(
            tenant_id = %tenant_id,
            from = subscription.max_seats,
            to = seats,
            effective_at = %subscription.current_period_end,
            "Seat decrease scheduled"
        );
        self.get(tenant_id).await
    }

    pub async fn cancel_pending_seat_change(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<Subscription> {
        let subscription = self.get(tenant_id).await?;
        if subscription.pending_max_seats.is_none() {
            return Err(BillingError::NothingPending);
        }

        let updated = self
            .store
            .set_pending_seats(tenant_id, subscription.max_seats, ANY_STATUS, None, now)
            .await?;
        if !updated {
            return Err(BillingError::ConcurrentUpdate);
        }

        tracing::info!(tenant_id = %tenant_id, "Pending seat change cancelled");
        self.get(tenant_id).await
    }

    /// Stop renewal. Access continues until the current period ends.
    pub async fn cancel(&self, tenant_id: Uuid, now: DateTime<Utc>) -> BillingResult<Subscription> {
        let subscription = self.get(tenant_id).await?;
        if !subscription.can_transition_to(Cancelled) {
            return Err(BillingError::InvalidTransition {
                from: subscription.status.to_string(),
                to: Cancelled.to_string(),
            });
        }

        let moved = self
            .store
            .transition(tenant_id, CANCELLABLE, Cancelled, now)
            .await?;
        if !moved {
            return Err(BillingError::ConcurrentUpdate);
        }

        tracing::info!(
            tenant_id = %tenant_id,
            from = %subscription.status,
            access_until = %subscription.current_period_end,
            "Subscription cancelled"
        );
        self.get(tenant_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoices::PaymentUpdate;
    use crate::testing::{at, Harness};
    use rust_decimal::Decimal;

    #[test]
    fn test_no_way_out_of_expired_except_checkout() {
        assert!(can_transition(Expired, Active));
        assert!(!can_transition(Expired, Trial));
        assert!(!can_transition(Expired, PastDue));
        assert!(!can_transition(Expired, Cancelled));
        assert!(!can_transition(Cancelled, PastDue));
        assert!(!can_transition(Trial, Cancelled));
    }

    #[test]
    fn test_guarded_moves_follow_state_machine() {
        for from in CANCELLABLE {
            assert!(can_transition(*from, Cancelled));
        }
        // Sweep edges
        for from in [Trial, Active] {
            assert!(can_transition(from, PastDue));
        }
        assert!(can_transition(PastDue, Expired));
        assert!(can_transition(Cancelled, Expired));
    }

    #[test]
    fn test_seat_only_advance_needs_good_standing() {
        let seats_only = SubscriptionAdvance {
            subscription_id: Uuid::new_v4(),
            plan_id: None,
            max_seats: 15,
            period: None,
            billing_cycle: None,
            clear_pending_plan: false,
            clear_pending_seats: true,
            status_after: None,
        };
        assert!(seats_only.applies_to(Active));
        for status in [Trial, PastDue, Cancelled, Expired] {
            assert!(!seats_only.applies_to(status));
        }

        let renewal = SubscriptionAdvance {
            status_after: Some(Active),
            ..seats_only
        };
        for status in ANY_STATUS {
            assert!(renewal.applies_to(*status));
        }
    }

    #[tokio::test]
    async fn test_start_trial_twice_rejected() {
        let h = Harness::new();
        let tenant = h.trial_tenant(at(2024, 1, 1), 5).await;

        let err = h
            .billing
            .subscriptions
            .start_trial(tenant, h.plan_b.id, 5, 14, at(2024, 1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionExists));
    }

    #[tokio::test]
    async fn test_trial_period_matches_trial_days() {
        let h = Harness::new();
        let tenant = h.trial_tenant(at(2024, 1, 1), 5).await;

        let sub = h.billing.subscriptions.get(tenant).await.unwrap();
        assert_eq!(sub.status, Trial);
        assert_eq!(sub.current_period_end, at(2024, 1, 15));
        assert_eq!(sub.trial_ends_at, Some(at(2024, 1, 15)));
    }

    #[tokio::test]
    async fn test_downgrade_to_same_plan_rejected() {
        let h = Harness::new();
        let tenant = h.trial_tenant(at(2024, 1, 1), 5).await;

        let err = h
            .billing
            .subscriptions
            .request_downgrade(tenant, h.plan_b.id, at(2024, 1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SamePlan));
    }

    #[tokio::test]
    async fn test_tier_direction_checked() {
        let h = Harness::new();
        let tenant = h.trial_tenant(at(2024, 1, 1), 5).await;
        let now = at(2024, 1, 2);

        let err = h
            .billing
            .subscriptions
            .request_downgrade(tenant, h.plan_c.id, now)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotADowngrade));

        let err = h
            .billing
            .subscriptions
            .request_upgrade(tenant, h.plan_a.id, "owner@tenant.test", now)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotAnUpgrade));
    }

    #[tokio::test]
    async fn test_downgrade_blocked_when_cap_below_head_count() {
        let h = Harness::new();
        let tenant = h.trial_tenant(at(2024, 1, 1), 30).await;
        // Plan-A is capped at 20 seats
        h.employees.set(tenant, 25);

        let err = h
            .billing
            .subscriptions
            .request_downgrade(tenant, h.plan_a.id, at(2024, 1, 2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::SeatsBelowActive {
                requested: 20,
                active: 25
            }
        ));
        let sub = h.billing.subscriptions.get(tenant).await.unwrap();
        assert_eq!(sub.pending_plan_id, None);
    }

    #[tokio::test]
    async fn test_cancel_pending_downgrade() {
        let h = Harness::new();
        let tenant = h.trial_tenant(at(2024, 1, 1), 5).await;
        let subs = &h.billing.subscriptions;

        subs.request_downgrade(tenant, h.plan_a.id, at(2024, 1, 2))
            .await
            .unwrap();
        let sub = subs.cancel_pending_downgrade(tenant, at(2024, 1, 3)).await.unwrap();
        assert_eq!(sub.pending_plan_id, None);

        let err = subs
            .cancel_pending_downgrade(tenant, at(2024, 1, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NothingPending));
    }

    #[tokio::test]
    async fn test_upgrade_applies_on_payment_and_clears_downgrade() {
        let h = Harness::new();
        let tenant = h.trial_tenant(at(2024, 1, 1), 5).await;
        let subs = &h.billing.subscriptions;

        subs.request_downgrade(tenant, h.plan_a.id, at(2024, 1, 2))
            .await
            .unwrap();
        let invoice = subs
            .request_upgrade(tenant, h.plan_c.id, "owner@tenant.test", at(2024, 1, 5))
            .await
            .unwrap();

        assert_eq!(invoice.kind, InvoiceKind::Upgrade);
        assert_eq!(invoice.amount, Decimal::from(50_000 * 5));
        // Nothing changes before payment
        let before = subs.get(tenant).await.unwrap();
        assert_eq!(before.plan_id, h.plan_b.id);

        h.billing
            .invoices
            .update_payment(invoice.id, PaymentUpdate::paid(at(2024, 1, 6), None, None))
            .await
            .unwrap();

        let after = subs.get(tenant).await.unwrap();
        assert_eq!(after.plan_id, h.plan_c.id);
        assert_eq!(after.status, Active);
        assert_eq!(after.pending_plan_id, None);
        assert_eq!(after.current_period_start, at(2024, 1, 5));
        assert_eq!(after.current_period_end, at(2024, 2, 5));
    }

    #[tokio::test]
    async fn test_upgrade_past_seat_cap_rejected() {
        let h = Harness::new();
        let tenant = h.tenant_on(h.plan_a.id, 15).await;
        h.store.set_plan_cap(h.plan_b.id, Some(10));

        let err = h
            .billing
            .subscriptions
            .request_upgrade(tenant, h.plan_b.id, "owner@tenant.test", at(2024, 1, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ExceedsPlanMaxSeats { max_seats: 10, .. }));
    }

    #[tokio::test]
    async fn test_seat_increase_is_prorated_and_keeps_period() {
        let h = Harness::new();
        let tenant = h.active_tenant(at(2024, 1, 1), 10).await;
        let subs = &h.billing.subscriptions;

        // 2024-01-16 .. 2024-02-01 is 16 of 31 days
        let invoice = subs
            .request_seat_increase(tenant, 12, "owner@tenant.test", at(2024, 1, 16))
            .await
            .unwrap();
        assert!(invoice.is_prorated);
        assert_eq!(invoice.snapshot.seat_count, 2);
        assert_eq!(invoice.snapshot.target_max_seats, 12);
        // Plan-B: 40,000 × 2 × 16 / 31
        assert_eq!(invoice.amount, Decimal::new(4_129_032, 2));

        h.billing
            .invoices
            .update_payment(invoice.id, PaymentUpdate::paid(at(2024, 1, 16), None, None))
            .await
            .unwrap();

        let sub = subs.get(tenant).await.unwrap();
        assert_eq!(sub.max_seats, 12);
        assert_eq!(sub.plan_id, h.plan_b.id);
        assert_eq!(sub.current_period_start, at(2024, 1, 1));
        assert_eq!(sub.current_period_end, at(2024, 2, 1));
    }

    #[tokio::test]
    async fn test_seat_increase_rejected_during_trial() {
        let h = Harness::new();
        let tenant = h.trial_tenant(at(2024, 1, 1), 5).await;

        let err = h
            .billing
            .subscriptions
            .request_seat_increase(tenant, 8, "owner@tenant.test", at(2024, 1, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SeatIncreaseDuringTrial));
        assert_eq!(h.gateway.created_count(), 0);
        let sub = h.billing.subscriptions.get(tenant).await.unwrap();
        assert_eq!(h.store.pending_count(sub.id), 0);
    }

    #[tokio::test]
    async fn test_seat_requests_validated() {
        let h = Harness::new();
        let tenant = h.active_tenant(at(2024, 1, 1), 10).await;
        let subs = &h.billing.subscriptions;
        let now = at(2024, 1, 10);

        let err = subs.request_seat_decrease(tenant, 0, now).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidSeatCount));

        let err = subs.request_seat_decrease(tenant, 10, now).await.unwrap_err();
        assert!(matches!(err, BillingError::SameAsCurrentSeats(10)));

        let err = subs.request_seat_decrease(tenant, 11, now).await.unwrap_err();
        assert!(matches!(err, BillingError::NotASeatDecrease(10)));

        let err = subs
            .request_seat_increase(tenant, 9, "owner@tenant.test", now)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotASeatIncrease(10)));
    }

    #[tokio::test]
    async fn test_seat_changes_blocked_while_past_due() {
        let h = Harness::new();
        let tenant = h.active_tenant(at(2024, 1, 1), 10).await;
        h.billing.reconciler.run_all(at(2024, 2, 2)).await;
        let subs = &h.billing.subscriptions;
        assert_eq!(subs.get(tenant).await.unwrap().status, PastDue);

        let err = subs
            .request_seat_decrease(tenant, 5, at(2024, 2, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::CannotUpgradeDuringGracePeriod));

        let err = subs
            .request_seat_increase(tenant, 15, "owner@tenant.test", at(2024, 2, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::CannotUpgradeDuringGracePeriod));

        // Upgrades remain possible
        assert!(subs
            .request_upgrade(tenant, h.plan_c.id, "owner@tenant.test", at(2024, 2, 2))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_cancel_keeps_access_until_period_end() {
        let h = Harness::new();
        let tenant = h.active_tenant(at(2024, 1, 1), 10).await;
        let subs = &h.billing.subscriptions;

        let sub = subs.cancel(tenant, at(2024, 1, 10)).await.unwrap();
        assert_eq!(sub.status, Cancelled);
        assert!(!sub.auto_renew);
        assert_eq!(sub.cancelled_at, Some(at(2024, 1, 10)));
        assert!(subs.has_access(tenant, at(2024, 1, 31)).await.unwrap());
        assert!(!subs.has_access(tenant, at(2024, 2, 1)).await.unwrap());

        let err = subs.cancel(tenant, at(2024, 1, 11)).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_trial_cannot_be_cancelled() {
        let h = Harness::new();
        let tenant = h.trial_tenant(at(2024, 1, 1), 5).await;

        let err = h
            .billing
            .subscriptions
            .cancel(tenant, at(2024, 1, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_unknown_tenant_has_no_access() {
        let h = Harness::new();
        assert!(!h
            .billing
            .subscriptions
            .has_access(Uuid::new_v4(), at(2024, 1, 1))
            .await
            .unwrap());
    }
}
