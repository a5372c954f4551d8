//! HTTP routes
//!
//! Tenant identity is resolved upstream; every tenant route takes the tenant
//! id as a path parameter.

mod invoices;
mod plans;
mod subscriptions;
mod webhooks;

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/payment", post(webhooks::payment_callback))
        .route("/plans", get(plans::list_plans))
        .route("/plans/{plan_id}/features", get(plans::plan_features))
        .route(
            "/tenants/{tenant_id}/subscription",
            get(subscriptions::get_subscription).post(subscriptions::start_trial),
        )
        .route(
            "/tenants/{tenant_id}/subscription/access",
            get(subscriptions::access),
        )
        .route(
            "/tenants/{tenant_id}/subscription/upgrade",
            post(subscriptions::upgrade),
        )
        .route(
            "/tenants/{tenant_id}/subscription/downgrade",
            post(subscriptions::downgrade).delete(subscriptions::cancel_downgrade),
        )
        .route(
            "/tenants/{tenant_id}/subscription/seats/increase",
            post(subscriptions::increase_seats),
        )
        .route(
            "/tenants/{tenant_id}/subscription/seats/decrease",
            post(subscriptions::decrease_seats),
        )
        .route(
            "/tenants/{tenant_id}/subscription/seats/pending",
            delete(subscriptions::cancel_seat_change),
        )
        .route(
            "/tenants/{tenant_id}/subscription/cancel",
            post(subscriptions::cancel),
        )
        .route("/tenants/{tenant_id}/checkout", post(invoices::checkout))
        .route("/tenants/{tenant_id}/invoices", get(invoices::list_invoices))
        .route(
            "/tenants/{tenant_id}/invoices/pending",
            get(invoices::pending_invoice).delete(invoices::cancel_pending),
        )
        .route(
            "/tenants/{tenant_id}/invoices/{invoice_id}",
            get(invoices::get_invoice),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
