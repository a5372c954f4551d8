//! Periodic reconciliation sweeps
//!
//! Three independent set-based sweeps close the loop for tenants that take no
//! action. Each is a conditional bulk update keyed on the expected pre-state,
//! so rows moved concurrently by a payment are skipped and re-running a sweep
//! is harmless.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hris_shared::SubscriptionStatus;
use serde::Serialize;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::store::{InvoiceStore, SubscriptionStore};

use SubscriptionStatus::{Active, Cancelled, Expired, PastDue, Trial};

/// Rows moved by the subscription expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpirySweep {
    pub past_due: u64,
    pub expired: u64,
    pub cancelled_expired: u64,
}

/// Rows changed by the deferred change sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeferredSweep {
    pub seats_applied: u64,
    pub plans_applied: u64,
}

/// Outcome of one `run_all`; a failed sweep carries its error message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub subscriptions: Result<ExpirySweep, String>,
    pub invoices: Result<u64, String>,
    pub deferred: Result<DeferredSweep, String>,
}

impl SweepReport {
    pub fn is_ok(&self) -> bool {
        self.subscriptions.is_ok() && self.invoices.is_ok() && self.deferred.is_ok()
    }
}

#[derive(Clone)]
pub struct CronReconciler {
    subscriptions: Arc<dyn SubscriptionStore>,
    invoices: Arc<dyn InvoiceStore>,
    stale_invoice_window: chrono::Duration,
    timeout: Duration,
}

impl CronReconciler {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        invoices: Arc<dyn InvoiceStore>,
        config: &BillingConfig,
    ) -> Self {
        Self {
            subscriptions,
            invoices,
            stale_invoice_window: config.stale_invoice_window,
            timeout: config.operation_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        sweep: &'static str,
        work: impl Future<Output = BillingResult<T>>,
    ) -> BillingResult<T> {
        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(sweep, timeout = ?self.timeout, "Sweep timed out");
                Err(BillingError::Timeout(self.timeout))
            }
        }
    }

    /// `{trial, active} → past_due` once the period ended,
    /// `past_due → expired` once the grace period ended too,
    /// `cancelled → expired` once the period ended
    pub async fn expire_subscriptions(&self, now: DateTime<Utc>) -> BillingResult<ExpirySweep> {
        self.bounded("subscriptions", async {
            let past_due = self
                .subscriptions
                .sweep_status(&[Trial, Active], PastDue, now, now)
                .await?;
            let expired = self
                .subscriptions
                .sweep_status(&[PastDue], Expired, now - BillingConfig::grace_period(), now)
                .await?;
            let cancelled_expired = self
                .subscriptions
                .sweep_status(&[Cancelled], Expired, now, now)
                .await?;

            let sweep = ExpirySweep {
                past_due,
                expired,
                cancelled_expired,
            };
            tracing::info!(
                past_due,
                expired,
                cancelled_expired,
                "Subscription expiry sweep complete"
            );
            Ok(sweep)
        })
        .await
    }

    /// `pending → expired` for invoices older than the stale window or past
    /// their gateway expiry
    pub async fn expire_invoices(&self, now: DateTime<Utc>) -> BillingResult<u64> {
        self.bounded("invoices", async {
            let rows = self
                .invoices
                .expire_stale(now - self.stale_invoice_window, now)
                .await?;
            tracing::info!(rows, "Stale invoice sweep complete");
            Ok(rows)
        })
        .await
    }

    /// Apply pending seat decreases, then pending downgrades, for periods
    /// that have ended
    pub async fn apply_deferred_changes(&self, now: DateTime<Utc>) -> BillingResult<DeferredSweep> {
        self.bounded("deferred", async {
            let seats_applied = self.subscriptions.apply_pending_seats(now).await?;
            let plans_applied = self.subscriptions.apply_pending_plans(now).await?;
            tracing::info!(seats_applied, plans_applied, "Deferred change sweep complete");
            Ok(DeferredSweep {
                seats_applied,
                plans_applied,
            })
        })
        .await
    }

    /// Run every sweep; one failing never stops the others
    pub async fn run_all(&self, now: DateTime<Utc>) -> SweepReport {
        let report = SweepReport {
            subscriptions: self
                .expire_subscriptions(now)
                .await
                .map_err(log_failure("subscriptions")),
            invoices: self
                .expire_invoices(now)
                .await
                .map_err(log_failure("invoices")),
            deferred: self
                .apply_deferred_changes(now)
                .await
                .map_err(log_failure("deferred")),
        };
        if !report.is_ok() {
            tracing::warn!(?report, "Reconciliation finished with failures");
        }
        report
    }
}

fn log_failure(sweep: &'static str) -> impl Fn(BillingError) -> String {
    move |e| {
        tracing::error!(sweep, error = %e, "Sweep failed");
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, Harness};

    #[tokio::test]
    async fn test_rerunning_sweeps_is_harmless() {
        let h = Harness::new();
        let tenant = h.active_tenant(at(2024, 1, 1), 10).await;
        let reconciler = &h.billing.reconciler;

        let first = reconciler.expire_subscriptions(at(2024, 2, 2)).await.unwrap();
        let second = reconciler.expire_subscriptions(at(2024, 2, 2)).await.unwrap();

        assert_eq!(first.past_due, 1);
        assert_eq!(second, ExpirySweep::default());
        let sub = h.billing.subscriptions.get(tenant).await.unwrap();
        assert_eq!(sub.status, PastDue);
    }

    #[tokio::test]
    async fn test_nothing_moves_before_period_end() {
        let h = Harness::new();
        h.active_tenant(at(2024, 1, 1), 10).await;

        let report = h.billing.reconciler.run_all(at(2024, 1, 31)).await;
        assert_eq!(report.subscriptions, Ok(ExpirySweep::default()));
        assert_eq!(report.deferred, Ok(DeferredSweep::default()));
    }

    #[tokio::test]
    async fn test_cancelled_expires_at_period_end() {
        let h = Harness::new();
        let tenant = h.active_tenant(at(2024, 1, 1), 10).await;
        h.billing.subscriptions.cancel(tenant, at(2024, 1, 15)).await.unwrap();

        let sweep = h
            .billing
            .reconciler
            .expire_subscriptions(at(2024, 2, 1))
            .await
            .unwrap();

        assert_eq!(sweep.cancelled_expired, 1);
        assert_eq!(sweep.past_due, 0);
        let sub = h.billing.subscriptions.get(tenant).await.unwrap();
        assert_eq!(sub.status, Expired);
    }

    #[tokio::test]
    async fn test_failed_sweep_does_not_block_others() {
        let h = Harness::new();
        let tenant = h.active_tenant(at(2024, 1, 1), 10).await;
        h.billing
            .subscriptions
            .request_seat_decrease(tenant, 5, at(2024, 1, 10))
            .await
            .unwrap();
        h.store.fail_invoice_sweeps();

        let report = h.billing.reconciler.run_all(at(2024, 2, 1)).await;

        assert!(report.invoices.is_err());
        assert!(!report.is_ok());
        assert_eq!(report.deferred.unwrap().seats_applied, 1);
        assert_eq!(report.subscriptions.unwrap().past_due, 1);
    }

    #[tokio::test]
    async fn test_stale_invoices_expired() {
        let h = Harness::new();
        let tenant = h.trial_tenant(at(2024, 1, 1), 1).await;
        h.billing
            .subscriptions
            .request_upgrade(tenant, h.plan_c.id, "owner@tenant.test", at(2024, 1, 2))
            .await
            .unwrap();

        // Within the 48 hour window and before the 24 hour gateway expiry
        assert_eq!(
            h.billing.reconciler.expire_invoices(at(2024, 1, 2)).await.unwrap(),
            0
        );
        // Past the stale window
        assert_eq!(
            h.billing.reconciler.expire_invoices(at(2024, 1, 5)).await.unwrap(),
            1
        );
        assert!(h.billing.invoices.pending_for_tenant(tenant).await.unwrap().is_none());
    }
}
