//! Tenant invoice routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use hris_billing::{CheckoutRequest, Invoice, SettleOutcome};
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

pub async fn checkout(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<(StatusCode, Json<Invoice>)> {
    let invoice = state
        .billing
        .invoices
        .checkout(tenant_id, req, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn list_invoices(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Invoice>>> {
    Ok(Json(state.billing.invoices.list_for_tenant(tenant_id).await?))
}

/// `null` when nothing is awaiting payment
pub async fn pending_invoice(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Option<Invoice>>> {
    Ok(Json(state.billing.invoices.pending_for_tenant(tenant_id).await?))
}

pub async fn cancel_pending(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<SettleOutcome>> {
    Ok(Json(
        state
            .billing
            .invoices
            .cancel_pending(tenant_id, Utc::now())
            .await?,
    ))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Path((tenant_id, invoice_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Invoice>> {
    Ok(Json(state.billing.invoices.get(tenant_id, invoice_id).await?))
}
