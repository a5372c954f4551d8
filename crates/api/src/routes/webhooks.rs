//! Payment gateway callbacks

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use chrono::Utc;
use hris_billing::{WebhookOutcome, SIGNATURE_HEADER};

use crate::{error::ApiResult, state::AppState};

/// Unknown and already-settled invoices still answer 200 so the gateway
/// stops redelivering; only failures it should retry are errors.
pub async fn payment_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookOutcome>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let outcome = state
        .billing
        .webhooks
        .handle(&body, signature, Utc::now())
        .await?;
    Ok(Json(outcome))
}
