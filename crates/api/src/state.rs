//! Application state

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hris_billing::BillingService;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Server settings read from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub request_timeout: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_address = std::env::var("API_BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
            .parse()?;
        let request_timeout = std::env::var("API_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS));

        Ok(Self {
            bind_address,
            request_timeout,
        })
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(billing: BillingService) -> Self {
        Self {
            billing: Arc::new(billing),
        }
    }
}
