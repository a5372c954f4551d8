//! Payment gateway webhook handling
//!
//! Callbacks are keyed by the gateway invoice id and may arrive late, twice,
//! or out of order. Redelivery is the retry mechanism, so applying a callback
//! must be idempotent: once an invoice is terminal, later callbacks for it are
//! acknowledged without touching state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use hris_shared::{InvoiceStatus, SubscriptionStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};
use crate::invoices::{InvoiceService, PaymentUpdate, SettleOutcome};
use crate::store::InvoiceStore;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC of the raw request body
pub const SIGNATURE_HEADER: &str = "x-callback-signature";

/// Decides whether a webhook body really comes from the gateway
pub trait WebhookVerifier: Send + Sync {
    fn verify(&self, body: &[u8], signature: &str) -> bool;
}

/// HMAC-SHA256 over the raw body with a shared secret, hex encoded
#[derive(Clone)]
pub struct HmacWebhookVerifier {
    secret: String,
}

impl HmacWebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, body: &[u8]) -> Option<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).ok()?;
        mac.update(body);
        Some(mac.finalize().into_bytes().to_vec())
    }

    /// Hex signature the gateway would send for `body`
    pub fn sign(&self, body: &[u8]) -> Option<String> {
        self.mac(body).map(hex::encode)
    }
}

impl WebhookVerifier for HmacWebhookVerifier {
    fn verify(&self, body: &[u8], signature: &str) -> bool {
        let Ok(provided) = hex::decode(signature.trim()) else {
            return false;
        };
        let Some(expected) = self.mac(body) else {
            return false;
        };
        expected.ct_eq(&provided).into()
    }
}

/// Invoice status as reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayStatus {
    Pending,
    Paid,
    Expired,
    Failed,
}

/// Body of a gateway invoice callback
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    /// Gateway invoice id
    pub id: String,
    pub status: GatewayStatus,
    pub amount: Decimal,
    #[serde(default)]
    pub payer_email: Option<String>,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub payment_channel: Option<String>,
}

impl WebhookPayload {
    pub fn parse(body: &[u8]) -> BillingResult<Self> {
        serde_json::from_slice(body).map_err(|e| BillingError::InvalidPayload(e.to_string()))
    }

    fn payment_update(&self, now: DateTime<Utc>) -> Option<PaymentUpdate> {
        match self.status {
            GatewayStatus::Pending => None,
            GatewayStatus::Paid => Some(PaymentUpdate::paid(
                self.paid_at.unwrap_or(now),
                self.payment_method.clone(),
                self.payment_channel.clone(),
            )),
            GatewayStatus::Expired => Some(PaymentUpdate::expired(now, None)),
            GatewayStatus::Failed => Some(PaymentUpdate {
                status: InvoiceStatus::Failed,
                paid_at: None,
                payment_method: self.payment_method.clone(),
                payment_channel: self.payment_channel.clone(),
                notes: None,
                updated_at: now,
            }),
        }
    }
}

/// What a callback did. Every variant is acknowledged to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied(InvoiceStatus),
    /// Paid, but the subscription was no longer in a status to take the change
    PaidNotApplied(SubscriptionStatus),
    AlreadyTerminal(InvoiceStatus),
    UnknownInvoice,
    StillPending,
}

/// Applies verified gateway callbacks to invoices and subscriptions
#[derive(Clone)]
pub struct WebhookReconciler {
    verifier: Arc<dyn WebhookVerifier>,
    store: Arc<dyn InvoiceStore>,
    invoices: InvoiceService,
    timeout: Duration,
}

impl WebhookReconciler {
    pub fn new(
        verifier: Arc<dyn WebhookVerifier>,
        store: Arc<dyn InvoiceStore>,
        invoices: InvoiceService,
        timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            store,
            invoices,
            timeout,
        }
    }

    /// Verify, parse and apply one delivery. Only a bad signature, a malformed
    /// body, a timeout or a store failure is reported as an error.
    pub async fn handle(
        &self,
        body: &[u8],
        signature: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<WebhookOutcome> {
        if !self.verifier.verify(body, signature) {
            tracing::warn!(body_len = body.len(), "Rejected webhook with invalid signature");
            return Err(BillingError::InvalidWebhookSignature);
        }

        let payload = WebhookPayload::parse(body)?;

        // Dropping the future on timeout rolls back any open transaction
        tokio::time::timeout(self.timeout, self.apply(&payload, now))
            .await
            .map_err(|_| {
                tracing::error!(gateway_id = %payload.id, "Webhook processing timed out");
                BillingError::Timeout(self.timeout)
            })?
    }

    async fn apply(
        &self,
        payload: &WebhookPayload,
        now: DateTime<Utc>,
    ) -> BillingResult<WebhookOutcome> {
        let Some(invoice) = self.store.get_by_gateway_id(&payload.id).await? else {
            tracing::warn!(gateway_id = %payload.id, "Webhook for unknown invoice ignored");
            return Ok(WebhookOutcome::UnknownInvoice);
        };

        if invoice.status.is_terminal() {
            if payload.status == GatewayStatus::Paid && invoice.status != InvoiceStatus::Paid {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    local_status = %invoice.status,
                    "Payment reported for a closed invoice; needs manual reconciliation"
                );
            } else {
                tracing::debug!(
                    invoice_id = %invoice.id,
                    status = %invoice.status,
                    "Duplicate webhook"
                );
            }
            return Ok(WebhookOutcome::AlreadyTerminal(invoice.status));
        }

        let Some(update) = payload.payment_update(now) else {
            tracing::debug!(invoice_id = %invoice.id, "Invoice still pending at gateway");
            return Ok(WebhookOutcome::StillPending);
        };

        if payload.amount != invoice.amount {
            tracing::warn!(
                invoice_id = %invoice.id,
                expected = %invoice.amount,
                reported = %payload.amount,
                "Gateway amount differs from invoice amount"
            );
        }

        let status = update.status;
        let outcome = self.invoices.update_payment(invoice.id, update).await?;

        Ok(match outcome {
            SettleOutcome::Applied => {
                tracing::info!(
                    tenant_id = %invoice.tenant_id,
                    invoice_id = %invoice.id,
                    status = %status,
                    payer = payload.payer_email.as_deref().unwrap_or("-"),
                    "Webhook applied"
                );
                WebhookOutcome::Applied(status)
            }
            SettleOutcome::PaidNotApplied(subscription_status) => {
                WebhookOutcome::PaidNotApplied(subscription_status)
            }
            SettleOutcome::AlreadySettled(current) => WebhookOutcome::AlreadyTerminal(current),
        })
    }
}
