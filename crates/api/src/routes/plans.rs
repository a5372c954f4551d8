use axum::{
    extract::{Path, State},
    Json,
};
use hris_billing::{Feature, Plan};
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<Plan>>> {
    Ok(Json(state.billing.catalog.list_active_plans().await?))
}

pub async fn plan_features(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Feature>>> {
    // 404 for unknown plans rather than an empty list
    state.billing.catalog.get_plan(plan_id).await?;
    Ok(Json(state.billing.catalog.plan_features(plan_id).await?))
}
