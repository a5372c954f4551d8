//! HRIS Billing Worker
//!
//! Runs the reconciliation sweeps on a schedule:
//! - Subscription expiry: trial/active to past due, past due to expired,
//!   cancelled to expired (hourly)
//! - Stale pending invoice expiry (every 15 minutes)
//! - Deferred seat and plan changes at period end (hourly, after expiry)
//! - Invariant checks (daily at 4:00 AM UTC)
//!
//! Each sweep is an independent job. A failing sweep logs and waits for its
//! next tick; it never blocks the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hris_billing::{BillingService, InvariantChecker};
use hris_shared::{create_pool, run_migrations, DatabaseConfig};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Cron expression from `var`, falling back to `default`
fn schedule(var: &str, default: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| default.to_string())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting HRIS billing worker");

    let db_config = DatabaseConfig::from_env()
        .map_err(|e| anyhow::anyhow!("DATABASE_URL must be set: {e}"))?;
    let pool = create_pool(&db_config).await?;
    run_migrations(&pool).await?;

    let billing = Arc::new(BillingService::from_env(pool.clone())?);
    let invariants = Arc::new(InvariantChecker::new(pool));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Subscription expiry
    let expiry_cron = schedule("SWEEP_SUBSCRIPTIONS_CRON", "0 0 * * * *");
    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async(expiry_cron.as_str(), move |_uuid, _l| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                match billing.reconciler.expire_subscriptions(Utc::now()).await {
                    Ok(sweep) => info!(
                        past_due = sweep.past_due,
                        expired = sweep.expired,
                        cancelled_expired = sweep.cancelled_expired,
                        "Subscription expiry sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Subscription expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %expiry_cron, "Scheduled: Subscription expiry sweep");

    // Job 2: Stale pending invoices
    let invoice_cron = schedule("SWEEP_INVOICES_CRON", "0 */15 * * * *");
    let invoice_billing = billing.clone();
    scheduler
        .add(Job::new_async(invoice_cron.as_str(), move |_uuid, _l| {
            let billing = invoice_billing.clone();
            Box::pin(async move {
                match billing.reconciler.expire_invoices(Utc::now()).await {
                    Ok(expired) => info!(expired, "Invoice expiry sweep complete"),
                    Err(e) => error!(error = %e, "Invoice expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %invoice_cron, "Scheduled: Invoice expiry sweep");

    // Job 3: Deferred changes
    // Runs a few minutes after expiry so a period that just ended is settled first
    let deferred_cron = schedule("SWEEP_DEFERRED_CRON", "0 5 * * * *");
    let deferred_billing = billing.clone();
    scheduler
        .add(Job::new_async(deferred_cron.as_str(), move |_uuid, _l| {
            let billing = deferred_billing.clone();
            Box::pin(async move {
                match billing.reconciler.apply_deferred_changes(Utc::now()).await {
                    Ok(sweep) => info!(
                        seats_applied = sweep.seats_applied,
                        plans_applied = sweep.plans_applied,
                        "Deferred change sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Deferred change sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %deferred_cron, "Scheduled: Deferred change sweep");

    // Job 4: Invariant checks
    let invariant_cron = schedule("INVARIANT_CHECK_CRON", "0 0 4 * * *");
    let checker = invariants.clone();
    scheduler
        .add(Job::new_async(invariant_cron.as_str(), move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => info!(
                        checks_run = summary.checks_run,
                        "Billing invariants hold"
                    ),
                    Ok(summary) => {
                        for violation in &summary.violations {
                            warn!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                tenants = violation.tenant_ids.len(),
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                        warn!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant check found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Billing invariant check failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %invariant_cron, "Scheduled: Invariant checks");

    // Job 5: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("HRIS billing worker started with 5 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
