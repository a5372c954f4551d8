// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries plan names and seat counts
#![allow(clippy::too_many_arguments)] // Conditional store writes take their full pre-state
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::new_without_default))]

//! HRIS Billing Engine
//!
//! Per-tenant subscription lifecycle: plan tier, seat count, billing period
//! and payment status, driven by three independent actors.
//!
//! ## Features
//!
//! - **Plan Catalog**: Plans, tiers and the features they unlock
//! - **Pricing**: Full-period and prorated amounts, yearly at ten months
//! - **Subscriptions**: Trial, upgrade, deferred downgrade, seat changes, cancel
//! - **Invoices**: Snapshotted invoices with at most one pending per subscription
//! - **Webhooks**: Signed, idempotent gateway callbacks
//! - **Reconciliation**: Set-based sweeps for expiry and deferred changes
//! - **Invariants**: Read-only consistency checks

pub mod catalog;
pub mod config;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod invoices;
pub mod postgres;
pub mod pricing;
pub mod reconcile;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod testing;

// Catalog
pub use catalog::{classify_change, Feature, Plan, PlanCatalog, PlanChange};

// Config
pub use config::{BillingConfig, GRACE_PERIOD_DAYS};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Gateway
pub use gateway::{GatewayInvoice, GatewayInvoiceRequest, HttpGatewayClient, PaymentGateway};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoices
pub use invoices::{
    CheckoutRequest, Invoice, InvoiceDraft, InvoiceService, InvoiceSnapshot, PaymentUpdate,
    SettleOutcome,
};

// Postgres
pub use postgres::{PgBillingStore, PgEmployeeCounter};

// Reconciliation
pub use reconcile::{CronReconciler, DeferredSweep, ExpirySweep, SweepReport};

// Stores
pub use store::{EmployeeCounter, InvoiceStore, PlanReader, SubscriptionStore};

// Subscriptions
pub use subscriptions::{can_transition, Subscription, SubscriptionAdvance, SubscriptionService};

// Webhooks
pub use webhooks::{
    HmacWebhookVerifier, WebhookOutcome, WebhookPayload, WebhookReconciler, WebhookVerifier,
    SIGNATURE_HEADER,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Named collaborators the engine is wired from
pub struct Collaborators {
    pub plans: Arc<dyn PlanReader>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub invoices: Arc<dyn InvoiceStore>,
    pub employees: Arc<dyn EmployeeCounter>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub verifier: Arc<dyn WebhookVerifier>,
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub config: BillingConfig,
    pub catalog: PlanCatalog,
    pub subscriptions: SubscriptionService,
    pub invoices: InvoiceService,
    pub webhooks: WebhookReconciler,
    pub reconciler: CronReconciler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Self::new(BillingConfig::from_env()?, pool)
    }

    /// Create a new billing service backed by Postgres and the HTTP gateway
    pub fn new(config: BillingConfig, pool: PgPool) -> BillingResult<Self> {
        let store = Arc::new(PgBillingStore::new(pool.clone()));
        let gateway = Arc::new(HttpGatewayClient::new(&config)?);
        let verifier = Arc::new(HmacWebhookVerifier::new(config.webhook_secret.clone()));

        Ok(Self::with_collaborators(
            config,
            Collaborators {
                plans: store.clone(),
                subscriptions: store.clone(),
                invoices: store,
                employees: Arc::new(PgEmployeeCounter::new(pool)),
                gateway,
                verifier,
            },
        ))
    }

    pub fn with_collaborators(config: BillingConfig, c: Collaborators) -> Self {
        let catalog = PlanCatalog::new(c.plans);
        let invoices = InvoiceService::new(
            catalog.clone(),
            c.invoices.clone(),
            c.subscriptions.clone(),
            c.employees.clone(),
            c.gateway,
            config.invoice_expiry,
        );
        let subscriptions = SubscriptionService::new(
            catalog.clone(),
            c.subscriptions.clone(),
            c.employees,
            invoices.clone(),
        );
        let webhooks = WebhookReconciler::new(
            c.verifier,
            c.invoices.clone(),
            invoices.clone(),
            config.operation_timeout,
        );
        let reconciler = CronReconciler::new(c.subscriptions, c.invoices, &config);

        Self {
            config,
            catalog,
            subscriptions,
            invoices,
            webhooks,
            reconciler,
        }
    }
}
