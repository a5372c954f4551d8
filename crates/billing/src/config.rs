//! Billing configuration

use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Days a past-due subscription keeps access after its period ends
pub const GRACE_PERIOD_DAYS: i64 = 7;

const DEFAULT_INVOICE_EXPIRY_HOURS: i64 = 24;
const DEFAULT_STALE_INVOICE_HOURS: i64 = 48;
const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 15;

/// Payment gateway and engine settings
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub gateway_base_url: String,
    pub gateway_secret_key: String,
    /// Shared secret for webhook signatures
    pub webhook_secret: String,
    /// How long a gateway invoice stays payable
    pub invoice_expiry: chrono::Duration,
    /// Pending invoices older than this are expired by the sweep
    pub stale_invoice_window: chrono::Duration,
    /// Upper bound for one webhook or sweep run
    pub operation_timeout: Duration,
}

fn required(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{} must be set", name)))
}

fn optional_number<T: std::str::FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| BillingError::Config(format!("{} is not a number: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

impl BillingConfig {
    /// Load from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let gateway_base_url = required("PAYMENT_GATEWAY_BASE_URL")?;
        let gateway_secret_key = required("PAYMENT_GATEWAY_SECRET_KEY")?;
        let webhook_secret = required("PAYMENT_WEBHOOK_SECRET")?;

        let expiry_hours = optional_number("INVOICE_EXPIRY_HOURS", DEFAULT_INVOICE_EXPIRY_HOURS)?;
        let stale_hours = optional_number("STALE_INVOICE_HOURS", DEFAULT_STALE_INVOICE_HOURS)?;
        let timeout_secs = optional_number(
            "BILLING_OPERATION_TIMEOUT_SECS",
            DEFAULT_OPERATION_TIMEOUT_SECS,
        )?;

        let config = Self {
            gateway_base_url: gateway_base_url.trim_end_matches('/').to_string(),
            gateway_secret_key,
            webhook_secret,
            invoice_expiry: chrono::Duration::hours(expiry_hours),
            stale_invoice_window: chrono::Duration::hours(stale_hours),
            operation_timeout: Duration::from_secs(timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> BillingResult<()> {
        if self.invoice_expiry <= chrono::Duration::zero() {
            return Err(BillingError::Config(
                "INVOICE_EXPIRY_HOURS must be positive".to_string(),
            ));
        }
        // A pending invoice must stay payable for its whole gateway lifetime
        if self.stale_invoice_window < self.invoice_expiry {
            return Err(BillingError::Config(
                "STALE_INVOICE_HOURS must not be shorter than INVOICE_EXPIRY_HOURS".to_string(),
            ));
        }
        if self.operation_timeout.is_zero() {
            return Err(BillingError::Config(
                "BILLING_OPERATION_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Grace period as a duration
    pub fn grace_period() -> chrono::Duration {
        chrono::Duration::days(GRACE_PERIOD_DAYS)
    }
}
