//! Payment gateway client
//!
//! The engine only needs two calls: create a hosted invoice and expire one.
//! Transient failures (connect errors, 429, 5xx) are retried with exponential
//! backoff; the invoice id is sent as the external id so the gateway can
//! deduplicate a retried create.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};

const MAX_RETRIES: usize = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Request to open a hosted invoice at the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayInvoiceRequest {
    /// Our invoice id
    pub external_id: Uuid,
    pub amount: Decimal,
    pub payer_email: String,
    pub description: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl GatewayInvoiceRequest {
    /// Seconds the hosted invoice stays payable, at least one
    pub fn duration_secs(&self) -> i64 {
        (self.expires_at - self.issued_at).num_seconds().max(1)
    }
}

/// Invoice as created at the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayInvoice {
    pub gateway_id: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_invoice(
        &self,
        request: &GatewayInvoiceRequest,
    ) -> BillingResult<GatewayInvoice>;

    async fn expire_invoice(&self, gateway_id: &str) -> BillingResult<()>;
}

#[derive(Debug, Serialize)]
struct CreateInvoiceBody<'a> {
    external_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    payer_email: &'a str,
    description: &'a str,
    invoice_duration: i64,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    id: String,
    invoice_url: String,
    expiry_date: DateTime<Utc>,
}

/// Failure of a single attempt, tagged with whether another attempt may help
#[derive(Debug)]
struct AttemptError {
    transient: bool,
    message: String,
}

impl AttemptError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        Self {
            transient: err.is_timeout() || err.is_connect(),
            message: err.to_string(),
        }
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        Self {
            transient: status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
            message: format!("gateway returned {}: {}", status, body),
        }
    }
}

/// HTTP client for the hosted-invoice gateway API
#[derive(Clone)]
pub struct HttpGatewayClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl HttpGatewayClient {
    pub fn new(config: &BillingConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.gateway_base_url.clone(),
            secret_key: config.gateway_secret_key.clone(),
        })
    }

    fn retry_strategy() -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(10)
            .factor(20)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(MAX_RETRIES)
    }

    async fn post_create(
        &self,
        body: &CreateInvoiceBody<'_>,
    ) -> Result<InvoiceResponse, AttemptError> {
        let response = self
            .http
            .post(format!("{}/v2/invoices", self.base_url))
            .basic_auth(&self.secret_key, Some(""))
            .json(body)
            .send()
            .await
            .map_err(AttemptError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AttemptError::from_status(status, text));
        }

        response
            .json::<InvoiceResponse>()
            .await
            .map_err(|e| AttemptError {
                transient: false,
                message: format!("unreadable gateway response: {}", e),
            })
    }

    async fn post_expire(&self, gateway_id: &str) -> Result<(), AttemptError> {
        let response = self
            .http
            .post(format!("{}/invoices/{}/expire!", self.base_url, gateway_id))
            .basic_auth(&self.secret_key, Some(""))
            .send()
            .await
            .map_err(AttemptError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AttemptError::from_status(status, text));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for HttpGatewayClient {
    async fn create_invoice(
        &self,
        request: &GatewayInvoiceRequest,
    ) -> BillingResult<GatewayInvoice> {
        let body = CreateInvoiceBody {
            external_id: request.external_id.to_string(),
            amount: request.amount,
            payer_email: &request.payer_email,
            description: &request.description,
            invoice_duration: request.duration_secs(),
        };

        let created = RetryIf::spawn(
            Self::retry_strategy(),
            || self.post_create(&body),
            |e: &AttemptError| e.transient,
        )
        .await
        .map_err(|e| {
            tracing::error!(
                external_id = %request.external_id,
                error = %e.message,
                "Failed to create gateway invoice"
            );
            BillingError::Gateway(e.message)
        })?;

        tracing::info!(
            external_id = %request.external_id,
            gateway_id = %created.id,
            amount = %request.amount,
            "Gateway invoice created"
        );

        Ok(GatewayInvoice {
            gateway_id: created.id,
            url: created.invoice_url,
            expires_at: created.expiry_date,
        })
    }

    async fn expire_invoice(&self, gateway_id: &str) -> BillingResult<()> {
        RetryIf::spawn(
            Self::retry_strategy(),
            || self.post_expire(gateway_id),
            |e: &AttemptError| e.transient,
        )
        .await
        .map_err(|e| {
            tracing::error!(
                gateway_id = %gateway_id,
                error = %e.message,
                "Failed to expire gateway invoice"
            );
            BillingError::Gateway(e.message)
        })?;

        tracing::info!(gateway_id = %gateway_id, "Gateway invoice expired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_transient() {
        assert!(AttemptError::from_status(StatusCode::BAD_GATEWAY, String::new()).transient);
        assert!(AttemptError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()).transient);
        assert!(!AttemptError::from_status(StatusCode::UNAUTHORIZED, String::new()).transient);
        assert!(!AttemptError::from_status(StatusCode::BAD_REQUEST, String::new()).transient);
    }

    #[test]
    fn test_retry_strategy_is_bounded() {
        assert_eq!(HttpGatewayClient::retry_strategy().count(), MAX_RETRIES);
    }

    #[test]
    fn test_invoice_response_parses() {
        let json = r#"{
            "id": "inv-gw-1",
            "invoice_url": "https://pay.test/inv-gw-1",
            "expiry_date": "2024-01-16T00:00:00Z",
            "status": "PENDING"
        }"#;
        let parsed: InvoiceResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.id, "inv-gw-1");
        assert_eq!(parsed.expiry_date.to_rfc3339(), "2024-01-16T00:00:00+00:00");
    }

    #[test]
    fn test_duration_counts_from_issue_time() {
        let issued_at = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut request = GatewayInvoiceRequest {
            external_id: Uuid::new_v4(),
            amount: Decimal::from(400_000),
            payer_email: "owner@tenant.test".into(),
            description: "Plan-B, 10 seats, monthly".into(),
            issued_at,
            expires_at: issued_at + chrono::Duration::hours(24),
        };
        assert_eq!(request.duration_secs(), 86_400);

        // Already past expiry still asks for a payable invoice
        request.expires_at = issued_at - chrono::Duration::hours(1);
        assert_eq!(request.duration_secs(), 1);
    }

    #[test]
    fn test_create_body_sends_amount_and_external_id() {
        let id = Uuid::new_v4();
        let body = CreateInvoiceBody {
            external_id: id.to_string(),
            amount: Decimal::from(500_000),
            payer_email: "owner@tenant.test",
            description: "Pro plan, 10 seats, monthly",
            invoice_duration: 86_400,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["external_id"], id.to_string());
        assert_eq!(json["amount"], 500_000.0);
        assert_eq!(json["invoice_duration"], 86_400);
    }
}
