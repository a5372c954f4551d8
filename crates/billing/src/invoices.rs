//! Invoice lifecycle
//!
//! Invoices are created per checkout, upgrade or seat increase, carry a frozen
//! snapshot of every pricing input, and leave `pending` at most once.
//!
//! ## Guarantees
//!
//! - At most one pending invoice per subscription (checked up front and
//!   enforced by the store on insert)
//! - No local invoice exists until the gateway has accepted it
//! - Repeating a payment update on a settled invoice is a successful no-op
//! - Time-based expiry is left to the reconciler sweep

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hris_shared::{BillingCycle, InvoiceKind, InvoiceStatus, SubscriptionStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayInvoiceRequest, PaymentGateway};
use crate::pricing;
use crate::store::{EmployeeCounter, InvoiceStore, SubscriptionStore};
use crate::subscriptions::{Subscription, SubscriptionAdvance};

/// Pricing inputs frozen when the invoice is created
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceSnapshot {
    pub plan_id: Uuid,
    pub plan_name: String,
    pub price_per_seat: Decimal,
    /// Seats being charged
    pub seat_count: i32,
    /// Seat limit of the subscription once paid
    pub target_max_seats: i32,
    pub billing_cycle: BillingCycle,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl InvoiceSnapshot {
    /// Amount implied by the snapshot alone
    pub fn expected_amount(&self, is_prorated: bool) -> BillingResult<Decimal> {
        pricing::amount_from_snapshot(self, is_prorated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invoice {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub kind: InvoiceKind,
    pub gateway_invoice_id: Option<String>,
    pub gateway_invoice_url: Option<String>,
    pub gateway_expires_at: Option<DateTime<Utc>>,
    pub amount: Decimal,
    pub is_prorated: bool,
    pub snapshot: InvoiceSnapshot,
    pub status: InvoiceStatus,
    pub issued_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_method: Option<String>,
    pub payment_channel: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Terminal payment state reported for an invoice
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentUpdate {
    pub status: InvoiceStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_method: Option<String>,
    pub payment_channel: Option<String>,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentUpdate {
    pub fn paid(paid_at: DateTime<Utc>, method: Option<String>, channel: Option<String>) -> Self {
        Self {
            status: InvoiceStatus::Paid,
            paid_at: Some(paid_at),
            payment_method: method,
            payment_channel: channel,
            notes: None,
            updated_at: paid_at,
        }
    }

    pub fn expired(now: DateTime<Utc>, notes: Option<String>) -> Self {
        Self {
            status: InvoiceStatus::Expired,
            paid_at: None,
            payment_method: None,
            payment_channel: None,
            notes,
            updated_at: now,
        }
    }
}

/// Result of applying a payment update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum SettleOutcome {
    /// The invoice moved out of `pending` now
    Applied,
    /// The invoice is paid but the subscription had moved to a status the
    /// change cannot be applied in; it needs manual reconciliation
    PaidNotApplied(SubscriptionStatus),
    /// Someone already settled it; nothing changed
    AlreadySettled(InvoiceStatus),
}

/// Note stored on an invoice whose change was skipped at settlement
pub(crate) fn not_applied_note(subscription_status: SubscriptionStatus) -> String {
    format!("Paid while subscription was {subscription_status}; change not applied")
}

/// Everything needed to open a pending invoice
#[derive(Debug, Clone)]
pub struct InvoiceDraft {
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub kind: InvoiceKind,
    pub snapshot: InvoiceSnapshot,
    pub is_prorated: bool,
}

/// Checkout request from a tenant
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub plan_id: Uuid,
    pub seats: i32,
    pub billing_cycle: BillingCycle,
    pub payer_email: String,
}

/// `[start, end)` of the period bought by a checkout.
///
/// Active and past-due subscriptions renew back to back so a late payment
/// covers the overdue period. A trial converts from the day it started.
/// Cancelled and expired subscriptions start over now.
pub fn checkout_period(
    subscription: &Subscription,
    cycle: BillingCycle,
    now: DateTime<Utc>,
) -> BillingResult<(DateTime<Utc>, DateTime<Utc>)> {
    let start = match subscription.status {
        SubscriptionStatus::Active | SubscriptionStatus::PastDue => subscription.current_period_end,
        SubscriptionStatus::Trial => subscription.current_period_start,
        SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => now,
    };
    let end = pricing::period_end(start, cycle)?;

    // A trial longer than one cycle has nothing left of its first period
    if subscription.status == SubscriptionStatus::Trial && end <= now {
        return Ok((now, pricing::period_end(now, cycle)?));
    }
    Ok((start, end))
}

/// Invoice lifecycle manager
#[derive(Clone)]
pub struct InvoiceService {
    catalog: PlanCatalog,
    invoices: Arc<dyn InvoiceStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    employees: Arc<dyn EmployeeCounter>,
    gateway: Arc<dyn PaymentGateway>,
    invoice_expiry: chrono::Duration,
}

impl InvoiceService {
    pub fn new(
        catalog: PlanCatalog,
        invoices: Arc<dyn InvoiceStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        employees: Arc<dyn EmployeeCounter>,
        gateway: Arc<dyn PaymentGateway>,
        invoice_expiry: chrono::Duration,
    ) -> Self {
        Self {
            catalog,
            invoices,
            subscriptions,
            employees,
            gateway,
            invoice_expiry,
        }
    }

    async fn subscription_for(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        self.subscriptions
            .get_by_tenant(tenant_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(tenant_id))
    }

    async fn ensure_no_pending(&self, subscription_id: Uuid) -> BillingResult<()> {
        if self.invoices.find_pending(subscription_id).await?.is_some() {
            return Err(BillingError::PendingInvoiceExists);
        }
        Ok(())
    }

    /// Buy a full period of `plan` for `seats` seats
    pub async fn checkout(
        &self,
        tenant_id: Uuid,
        request: CheckoutRequest,
        now: DateTime<Utc>,
    ) -> BillingResult<Invoice> {
        let subscription = self.subscription_for(tenant_id).await?;
        self.ensure_no_pending(subscription.id).await?;

        if request.seats < 1 {
            return Err(BillingError::InvalidSeatCount);
        }
        let plan = self.catalog.get_active_plan(request.plan_id).await?;

        let active = self.employees.count_active_by_tenant(tenant_id).await?;
        if i64::from(request.seats) < active {
            return Err(BillingError::InsufficientSeats {
                requested: request.seats,
                active,
            });
        }
        plan.ensure_allows_seats(request.seats)?;

        let (period_start, period_end) =
            checkout_period(&subscription, request.billing_cycle, now)?;

        let draft = InvoiceDraft {
            tenant_id,
            subscription_id: subscription.id,
            kind: InvoiceKind::Checkout,
            snapshot: InvoiceSnapshot {
                plan_id: plan.id,
                plan_name: plan.name,
                price_per_seat: plan.price_per_seat,
                seat_count: request.seats,
                target_max_seats: request.seats,
                billing_cycle: request.billing_cycle,
                period_start,
                period_end,
            },
            is_prorated: false,
        };

        self.issue(draft, &request.payer_email, now).await
    }

    /// Open a pending invoice: gateway first, then the local row
    pub async fn issue(
        &self,
        draft: InvoiceDraft,
        payer_email: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Invoice> {
        self.ensure_no_pending(draft.subscription_id).await?;

        let amount = draft.snapshot.expected_amount(draft.is_prorated)?;
        let invoice_id = Uuid::new_v4();
        let snapshot = &draft.snapshot;
        let description = format!(
            "{} plan, {} seats, {} ({})",
            snapshot.plan_name, snapshot.seat_count, snapshot.billing_cycle, draft.kind
        );

        let gateway_invoice = self
            .gateway
            .create_invoice(&GatewayInvoiceRequest {
                external_id: invoice_id,
                amount,
                payer_email: payer_email.to_string(),
                description,
                issued_at: now,
                expires_at: now + self.invoice_expiry,
            })
            .await?;

        let invoice = Invoice {
            id: invoice_id,
            tenant_id: draft.tenant_id,
            subscription_id: draft.subscription_id,
            kind: draft.kind,
            gateway_invoice_id: Some(gateway_invoice.gateway_id.clone()),
            gateway_invoice_url: Some(gateway_invoice.url),
            gateway_expires_at: Some(gateway_invoice.expires_at),
            amount,
            is_prorated: draft.is_prorated,
            snapshot: draft.snapshot,
            status: InvoiceStatus::Pending,
            issued_at: now,
            paid_at: None,
            payment_method: None,
            payment_channel: None,
            notes: None,
            created_at: now,
        };

        if let Err(e) = self.invoices.insert(&invoice).await {
            // Lost a race with a concurrent request; do not leave a payable orphan
            if let Err(expire_err) = self
                .gateway
                .expire_invoice(&gateway_invoice.gateway_id)
                .await
            {
                tracing::warn!(
                    gateway_id = %gateway_invoice.gateway_id,
                    error = %expire_err,
                    "Failed to expire orphaned gateway invoice"
                );
            }
            return Err(e);
        }

        tracing::info!(
            tenant_id = %invoice.tenant_id,
            invoice_id = %invoice.id,
            kind = %invoice.kind,
            amount = %invoice.amount,
            prorated = invoice.is_prorated,
            "Invoice issued"
        );

        Ok(invoice)
    }

    /// Record a terminal payment status. Paying an invoice also advances its
    /// subscription in the same transaction. Repeats are no-ops.
    pub async fn update_payment(
        &self,
        invoice_id: Uuid,
        update: PaymentUpdate,
    ) -> BillingResult<SettleOutcome> {
        if !update.status.is_terminal() {
            return Err(BillingError::InvalidTransition {
                from: InvoiceStatus::Pending.to_string(),
                to: update.status.to_string(),
            });
        }

        let invoice = self
            .invoices
            .get(invoice_id)
            .await?
            .ok_or_else(|| BillingError::InvoiceNotFound(invoice_id.to_string()))?;

        if invoice.status.is_terminal() {
            tracing::debug!(
                invoice_id = %invoice_id,
                current = %invoice.status,
                reported = %update.status,
                "Invoice already settled, ignoring update"
            );
            return Ok(SettleOutcome::AlreadySettled(invoice.status));
        }

        let advance = match update.status {
            InvoiceStatus::Paid => Some(SubscriptionAdvance::from_invoice(&invoice)),
            _ => None,
        };

        let outcome = self
            .invoices
            .settle(invoice_id, &update, advance.as_ref())
            .await?;

        match outcome {
            SettleOutcome::Applied => tracing::info!(
                tenant_id = %invoice.tenant_id,
                invoice_id = %invoice_id,
                status = %update.status,
                "Invoice settled"
            ),
            SettleOutcome::PaidNotApplied(subscription_status) => tracing::warn!(
                tenant_id = %invoice.tenant_id,
                invoice_id = %invoice_id,
                kind = %invoice.kind,
                subscription_status = %subscription_status,
                "Invoice paid but its change was not applied; needs manual reconciliation"
            ),
            SettleOutcome::AlreadySettled(status) => tracing::debug!(
                invoice_id = %invoice_id,
                status = %status,
                "Invoice settled concurrently"
            ),
        }

        Ok(outcome)
    }

    /// Invoice owned by `tenant_id`
    pub async fn get(&self, tenant_id: Uuid, invoice_id: Uuid) -> BillingResult<Invoice> {
        match self.invoices.get(invoice_id).await? {
            Some(invoice) if invoice.tenant_id == tenant_id => Ok(invoice),
            _ => Err(BillingError::InvoiceNotFound(invoice_id.to_string())),
        }
    }

    pub async fn list_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Vec<Invoice>> {
        self.invoices.list_for_tenant(tenant_id).await
    }

    pub async fn pending_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Option<Invoice>> {
        let subscription = self.subscription_for(tenant_id).await?;
        self.invoices.find_pending(subscription.id).await
    }

    /// Withdraw the tenant's pending invoice at the gateway and locally
    pub async fn cancel_pending(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
    ) -> BillingResult<SettleOutcome> {
        let invoice = self
            .pending_for_tenant(tenant_id)
            .await?
            .ok_or(BillingError::NothingPending)?;

        if let Some(gateway_id) = invoice.gateway_invoice_id.as_deref() {
            self.gateway.expire_invoice(gateway_id).await?;
        }

        let outcome = self
            .invoices
            .settle(
                invoice.id,
                &PaymentUpdate::expired(now, Some("Cancelled by tenant".to_string())),
                None,
            )
            .await?;

        tracing::info!(
            tenant_id = %tenant_id,
            invoice_id = %invoice.id,
            outcome = ?outcome,
            "Pending invoice cancelled"
        );
        Ok(outcome)
    }
}
