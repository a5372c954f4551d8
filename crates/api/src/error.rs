//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hris_billing::{BillingError, ErrorKind};
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(BillingError::InvalidPayload(_)) => StatusCode::BAD_REQUEST,
            ApiError::Billing(e) => match e.kind() {
                ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Integration => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Security => StatusCode::UNAUTHORIZED,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Billing(e) => e.code(),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Billing(e) => e.public_message(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match status {
            StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %self, "Request failed")
            }
            StatusCode::SERVICE_UNAVAILABLE => {
                tracing::warn!(error = %self, "Payment provider unavailable")
            }
            _ => tracing::debug!(error = %self, "Request rejected"),
        }

        let body = Json(json!({
            "error": self.message(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}
