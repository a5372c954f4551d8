//! In-memory collaborators for unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hris_shared::{BillingCycle, InvoiceStatus, SubscriptionStatus};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::catalog::{Feature, Plan};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayInvoice, GatewayInvoiceRequest, PaymentGateway};
use crate::invoices::{not_applied_note, CheckoutRequest, Invoice, PaymentUpdate, SettleOutcome};
use crate::store::{EmployeeCounter, InvoiceStore, PlanReader, SubscriptionStore};
use crate::subscriptions::{Subscription, SubscriptionAdvance};
use crate::webhooks::HmacWebhookVerifier;
use crate::{BillingService, Collaborators};

pub const WEBHOOK_SECRET: &str = "whsec_test";

/// Midnight UTC on the given day
pub fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

pub fn plan(name: &str, tier_level: i32, price_per_seat: i64, max_seats: Option<i32>) -> Plan {
    Plan {
        id: Uuid::new_v4(),
        name: name.to_string(),
        price_per_seat: Decimal::from(price_per_seat),
        tier_level,
        max_seats,
        is_active: true,
    }
}

pub fn test_config() -> BillingConfig {
    BillingConfig {
        gateway_base_url: "https://gateway.test".to_string(),
        gateway_secret_key: "sk_test".to_string(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        invoice_expiry: chrono::Duration::hours(24),
        stale_invoice_window: chrono::Duration::hours(48),
        operation_timeout: Duration::from_secs(5),
    }
}

#[derive(Default)]
struct State {
    plans: HashMap<Uuid, Plan>,
    features: Vec<(Uuid, Feature, bool)>,
    subscriptions: HashMap<Uuid, Subscription>,
    invoices: Vec<Invoice>,
    fail_next_invoice_insert: bool,
    fail_invoice_sweeps: bool,
}

/// Single-process stand-in for the Postgres store with the same
/// conditional-write semantics
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_plan(&self, plan: Plan) {
        self.lock().plans.insert(plan.id, plan);
    }

    pub fn set_plan_cap(&self, plan_id: Uuid, max_seats: Option<i32>) {
        if let Some(plan) = self.lock().plans.get_mut(&plan_id) {
            plan.max_seats = max_seats;
        }
    }

    pub fn add_feature(&self, plan_id: Uuid, code: &str, is_active: bool) {
        let feature = Feature {
            id: Uuid::new_v4(),
            code: code.to_string(),
            name: code.replace('_', " "),
            description: None,
        };
        self.lock().features.push((plan_id, feature, is_active));
    }

    /// Next invoice insert behaves as if a concurrent request won the race
    pub fn fail_next_invoice_insert_as_duplicate(&self) {
        self.lock().fail_next_invoice_insert = true;
    }

    pub fn fail_invoice_sweeps(&self) {
        self.lock().fail_invoice_sweeps = true;
    }

    pub fn pending_count(&self, subscription_id: Uuid) -> usize {
        self.lock()
            .invoices
            .iter()
            .filter(|i| i.subscription_id == subscription_id && i.status == InvoiceStatus::Pending)
            .count()
    }
}

fn apply_advance(sub: &mut Subscription, advance: &SubscriptionAdvance, now: DateTime<Utc>) {
    if let Some(plan_id) = advance.plan_id {
        sub.plan_id = plan_id;
    }
    if let Some((start, end)) = advance.period {
        sub.current_period_start = start;
        sub.current_period_end = end;
    }
    if let Some(cycle) = advance.billing_cycle {
        sub.billing_cycle = cycle;
    }
    sub.max_seats = advance.max_seats;
    if advance.clear_pending_plan {
        sub.pending_plan_id = None;
    }
    if advance.clear_pending_seats || sub.pending_max_seats.is_some_and(|p| p >= sub.max_seats) {
        sub.pending_max_seats = None;
    }
    if let Some(status) = advance.status_after {
        sub.status = status;
        sub.cancelled_at = None;
        sub.auto_renew = true;
    }
    sub.updated_at = now;
}

#[async_trait]
impl PlanReader for MemoryStore {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(self.lock().plans.get(&plan_id).cloned())
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        Ok(self.lock().plans.values().cloned().collect())
    }

    async fn plan_features(&self, plan_id: Uuid) -> BillingResult<Vec<Feature>> {
        Ok(self
            .lock()
            .features
            .iter()
            .filter(|(p, _, active)| *p == plan_id && *active)
            .map(|(_, f, _)| f.clone())
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get_by_tenant(&self, tenant_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.lock().subscriptions.get(&tenant_id).cloned())
    }

    async fn insert(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut state = self.lock();
        if state.subscriptions.contains_key(&subscription.tenant_id) {
            return Err(BillingError::SubscriptionExists);
        }
        state
            .subscriptions
            .insert(subscription.tenant_id, subscription.clone());
        Ok(())
    }

    async fn set_pending_plan(
        &self,
        tenant_id: Uuid,
        expected_plan_id: Uuid,
        allowed: &[SubscriptionStatus],
        pending_plan_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let mut state = self.lock();
        match state.subscriptions.get_mut(&tenant_id) {
            Some(sub) if sub.plan_id == expected_plan_id && allowed.contains(&sub.status) => {
                sub.pending_plan_id = pending_plan_id;
                sub.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_pending_seats(
        &self,
        tenant_id: Uuid,
        expected_max_seats: i32,
        allowed: &[SubscriptionStatus],
        pending_max_seats: Option<i32>,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let mut state = self.lock();
        match state.subscriptions.get_mut(&tenant_id) {
            Some(sub) if sub.max_seats == expected_max_seats && allowed.contains(&sub.status) => {
                sub.pending_max_seats = pending_max_seats;
                sub.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition(
        &self,
        tenant_id: Uuid,
        from: &[SubscriptionStatus],
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let mut state = self.lock();
        match state.subscriptions.get_mut(&tenant_id) {
            Some(sub) if from.contains(&sub.status) => {
                sub.status = to;
                if to == SubscriptionStatus::Cancelled {
                    sub.cancelled_at = Some(now);
                    sub.auto_renew = false;
                }
                sub.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sweep_status(
        &self,
        from: &[SubscriptionStatus],
        to: SubscriptionStatus,
        period_ended_by: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<u64> {
        let mut state = self.lock();
        let mut moved = 0;
        for sub in state.subscriptions.values_mut() {
            if from.contains(&sub.status) && sub.current_period_end <= period_ended_by {
                sub.status = to;
                sub.updated_at = now;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn apply_pending_seats(&self, now: DateTime<Utc>) -> BillingResult<u64> {
        let mut state = self.lock();
        let mut applied = 0;
        for sub in state.subscriptions.values_mut() {
            if sub.current_period_end > now {
                continue;
            }
            if let Some(seats) = sub.pending_max_seats.take() {
                sub.max_seats = seats;
                sub.updated_at = now;
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn apply_pending_plans(&self, now: DateTime<Utc>) -> BillingResult<u64> {
        let mut state = self.lock();
        let caps: HashMap<Uuid, Option<i32>> = state
            .plans
            .values()
            .map(|p| (p.id, p.max_seats))
            .collect();
        let mut applied = 0;
        for sub in state.subscriptions.values_mut() {
            if sub.current_period_end > now {
                continue;
            }
            if let Some(plan_id) = sub.pending_plan_id.take() {
                sub.plan_id = plan_id;
                if let Some(cap) = caps.get(&plan_id).copied().flatten() {
                    sub.max_seats = sub.max_seats.min(cap);
                }
                if sub.pending_max_seats.is_some_and(|p| p >= sub.max_seats) {
                    sub.pending_max_seats = None;
                }
                sub.updated_at = now;
                applied += 1;
            }
        }
        Ok(applied)
    }
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn insert(&self, invoice: &Invoice) -> BillingResult<()> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_invoice_insert) {
            return Err(BillingError::PendingInvoiceExists);
        }
        let has_pending = state.invoices.iter().any(|i| {
            i.subscription_id == invoice.subscription_id && i.status == InvoiceStatus::Pending
        });
        if has_pending && invoice.status == InvoiceStatus::Pending {
            return Err(BillingError::PendingInvoiceExists);
        }
        state.invoices.push(invoice.clone());
        Ok(())
    }

    async fn get(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self.lock().invoices.iter().find(|i| i.id == invoice_id).cloned())
    }

    async fn get_by_gateway_id(&self, gateway_invoice_id: &str) -> BillingResult<Option<Invoice>> {
        Ok(self
            .lock()
            .invoices
            .iter()
            .find(|i| i.gateway_invoice_id.as_deref() == Some(gateway_invoice_id))
            .cloned())
    }

    async fn find_pending(&self, subscription_id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(self
            .lock()
            .invoices
            .iter()
            .find(|i| i.subscription_id == subscription_id && i.status == InvoiceStatus::Pending)
            .cloned())
    }

    async fn list_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .lock()
            .invoices
            .iter()
            .rev()
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect();
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invoices)
    }

    async fn settle(
        &self,
        invoice_id: Uuid,
        update: &PaymentUpdate,
        advance: Option<&SubscriptionAdvance>,
    ) -> BillingResult<SettleOutcome> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let invoice = state
            .invoices
            .iter_mut()
            .find(|i| i.id == invoice_id)
            .ok_or_else(|| BillingError::InvoiceNotFound(invoice_id.to_string()))?;
        if invoice.status != InvoiceStatus::Pending {
            return Ok(SettleOutcome::AlreadySettled(invoice.status));
        }

        let mut skipped = None;
        if let Some(advance) = advance {
            let sub = state
                .subscriptions
                .values_mut()
                .find(|s| s.id == advance.subscription_id)
                .ok_or_else(|| {
                    BillingError::CorruptRecord(format!(
                        "invoice {} references missing subscription",
                        invoice_id
                    ))
                })?;
            if !advance.applies_to(sub.status) {
                skipped = Some(sub.status);
            } else {
                apply_advance(sub, advance, update.updated_at);
            }
        }

        invoice.status = update.status;
        invoice.paid_at = update.paid_at;
        invoice.payment_method = update.payment_method.clone();
        invoice.payment_channel = update.payment_channel.clone();
        if let Some(status) = skipped {
            invoice.notes = Some(not_applied_note(status));
            return Ok(SettleOutcome::PaidNotApplied(status));
        }
        if update.notes.is_some() {
            invoice.notes = update.notes.clone();
        }
        Ok(SettleOutcome::Applied)
    }

    async fn expire_stale(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<u64> {
        let mut state = self.lock();
        if state.fail_invoice_sweeps {
            return Err(BillingError::Database("connection reset".to_string()));
        }
        let mut expired = 0;
        for invoice in state.invoices.iter_mut() {
            let gateway_expired = invoice.gateway_expires_at.is_some_and(|e| e <= now);
            if invoice.status == InvoiceStatus::Pending
                && (invoice.created_at < created_before || gateway_expired)
            {
                invoice.status = InvoiceStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

/// Gateway that accepts everything and counts calls
#[derive(Default)]
pub struct FakeGateway {
    created: AtomicUsize,
    expired: AtomicUsize,
    fail_next_create: AtomicBool,
}

impl FakeGateway {
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn expired_count(&self) -> usize {
        self.expired.load(Ordering::SeqCst)
    }

    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_invoice(
        &self,
        request: &GatewayInvoiceRequest,
    ) -> BillingResult<GatewayInvoice> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(BillingError::Gateway("connection refused".to_string()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(GatewayInvoice {
            gateway_id: format!("gw-{}", n),
            url: format!("https://pay.test/gw-{}", n),
            expires_at: request.expires_at,
        })
    }

    async fn expire_invoice(&self, _gateway_id: &str) -> BillingResult<()> {
        self.expired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeEmployees {
    counts: Mutex<HashMap<Uuid, i64>>,
}

impl FakeEmployees {
    pub fn set(&self, tenant_id: Uuid, active: i64) {
        self.counts.lock().unwrap().insert(tenant_id, active);
    }
}

#[async_trait]
impl EmployeeCounter for FakeEmployees {
    async fn count_active_by_tenant(&self, tenant_id: Uuid) -> BillingResult<i64> {
        Ok(self.counts.lock().unwrap().get(&tenant_id).copied().unwrap_or(0))
    }
}

/// A fully wired engine over in-memory collaborators with three plans:
/// Plan-A (tier 1, 30,000, max 20), Plan-B (tier 2, 40,000, max 50) and
/// Plan-C (tier 3, 50,000, uncapped)
pub struct Harness {
    pub billing: BillingService,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub employees: Arc<FakeEmployees>,
    pub plan_a: Plan,
    pub plan_b: Plan,
    pub plan_c: Plan,
    verifier: HmacWebhookVerifier,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let plan_a = plan("Plan-A", 1, 30_000, Some(20));
        let plan_b = plan("Plan-B", 2, 40_000, Some(50));
        let plan_c = plan("Plan-C", 3, 50_000, None);
        for p in [&plan_a, &plan_b, &plan_c] {
            store.add_plan(p.clone());
        }

        let gateway = Arc::new(FakeGateway::default());
        let employees = Arc::new(FakeEmployees::default());
        let billing = BillingService::with_collaborators(
            test_config(),
            Collaborators {
                plans: store.clone(),
                subscriptions: store.clone(),
                invoices: store.clone(),
                employees: employees.clone(),
                gateway: gateway.clone(),
                verifier: Arc::new(HmacWebhookVerifier::new(WEBHOOK_SECRET)),
            },
        );

        Self {
            billing,
            store,
            gateway,
            employees,
            plan_a,
            plan_b,
            plan_c,
            verifier: HmacWebhookVerifier::new(WEBHOOK_SECRET),
        }
    }

    pub fn sign(&self, body: &[u8]) -> String {
        self.verifier.sign(body).unwrap()
    }

    /// New tenant on a 14 day Plan-B trial starting at `start`
    pub async fn trial_tenant(&self, start: DateTime<Utc>, seats: i32) -> Uuid {
        let tenant = Uuid::new_v4();
        self.billing
            .subscriptions
            .start_trial(tenant, self.plan_b.id, seats, 14, start)
            .await
            .unwrap();
        tenant
    }

    /// New tenant on a trial of `plan_id` starting 2024-01-01
    pub async fn tenant_on(&self, plan_id: Uuid, seats: i32) -> Uuid {
        let tenant = Uuid::new_v4();
        self.billing
            .subscriptions
            .start_trial(tenant, plan_id, seats, 14, at(2024, 1, 1))
            .await
            .unwrap();
        tenant
    }

    /// New tenant with a paid monthly Plan-B period starting at `start`
    pub async fn active_tenant(&self, start: DateTime<Utc>, seats: i32) -> Uuid {
        let tenant = self.trial_tenant(start, seats).await;
        let invoice = self
            .billing
            .invoices
            .checkout(
                tenant,
                CheckoutRequest {
                    plan_id: self.plan_b.id,
                    seats,
                    billing_cycle: BillingCycle::Monthly,
                    payer_email: "owner@tenant.test".to_string(),
                },
                start,
            )
            .await
            .unwrap();
        self.billing
            .invoices
            .update_payment(invoice.id, PaymentUpdate::paid(start, None, None))
            .await
            .unwrap();
        tenant
    }
}
