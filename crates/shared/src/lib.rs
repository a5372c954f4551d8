#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! HRIS Shared Types
//!
//! Value types and database plumbing used by the billing engine, the worker
//! and the API server.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations, DatabaseConfig};
pub use types::{BillingCycle, InvoiceKind, InvoiceStatus, ParseEnumError, SubscriptionStatus};
