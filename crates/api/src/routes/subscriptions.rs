//! Tenant subscription routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use hris_billing::{Invoice, Subscription};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

const DEFAULT_TRIAL_DAYS: i64 = 14;

fn default_trial_days() -> i64 {
    DEFAULT_TRIAL_DAYS
}

#[derive(Debug, Deserialize)]
pub struct StartTrialRequest {
    pub plan_id: Uuid,
    pub seats: i32,
    #[serde(default = "default_trial_days")]
    pub trial_days: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpgradeRequest {
    pub plan_id: Uuid,
    pub payer_email: String,
}

#[derive(Debug, Deserialize)]
pub struct DowngradeRequest {
    pub plan_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct SeatIncreaseRequest {
    pub seats: i32,
    pub payer_email: String,
}

#[derive(Debug, Deserialize)]
pub struct SeatDecreaseRequest {
    pub seats: i32,
}

pub async fn start_trial(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<StartTrialRequest>,
) -> ApiResult<(StatusCode, Json<Subscription>)> {
    let subscription = state
        .billing
        .subscriptions
        .start_trial(tenant_id, req.plan_id, req.seats, req.trial_days, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.billing.subscriptions.get(tenant_id).await?))
}

pub async fn access(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let has_access = state
        .billing
        .subscriptions
        .has_access(tenant_id, Utc::now())
        .await?;
    Ok(Json(json!({
        "tenant_id": tenant_id,
        "has_access": has_access,
    })))
}

pub async fn upgrade(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<UpgradeRequest>,
) -> ApiResult<(StatusCode, Json<Invoice>)> {
    let invoice = state
        .billing
        .subscriptions
        .request_upgrade(tenant_id, req.plan_id, &req.payer_email, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn downgrade(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<DowngradeRequest>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .billing
        .subscriptions
        .request_downgrade(tenant_id, req.plan_id, Utc::now())
        .await?;
    Ok(Json(subscription))
}

pub async fn cancel_downgrade(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .billing
        .subscriptions
        .cancel_pending_downgrade(tenant_id, Utc::now())
        .await?;
    Ok(Json(subscription))
}

pub async fn increase_seats(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<SeatIncreaseRequest>,
) -> ApiResult<(StatusCode, Json<Invoice>)> {
    let invoice = state
        .billing
        .subscriptions
        .request_seat_increase(tenant_id, req.seats, &req.payer_email, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn decrease_seats(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<SeatDecreaseRequest>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .billing
        .subscriptions
        .request_seat_decrease(tenant_id, req.seats, Utc::now())
        .await?;
    Ok(Json(subscription))
}

pub async fn cancel_seat_change(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .billing
        .subscriptions
        .cancel_pending_seat_change(tenant_id, Utc::now())
        .await?;
    Ok(Json(subscription))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(
        state.billing.subscriptions.cancel(tenant_id, Utc::now()).await?,
    ))
}
