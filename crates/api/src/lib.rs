// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! HRIS Billing API
//!
//! Thin HTTP surface over the billing engine: the payment gateway callback
//! and the tenant subscription, checkout and invoice endpoints.

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::{AppState, Config};
