//! Billing invariants
//!
//! Read-only consistency checks over subscriptions and invoices. The worker
//! runs them daily and logs every violation; they never repair anything.
//!
//! ## Checks
//!
//! 1. `single_pending_invoice`: at most one pending invoice per subscription
//! 2. `single_subscription_per_tenant`: one subscription row per tenant
//! 3. `pending_plan_is_downgrade`: a pending plan is a strictly lower tier
//! 4. `pending_seats_below_current`: a pending seat limit is a decrease
//! 5. `paid_amount_matches_snapshot`: paid amounts recompute from snapshots
//! 6. `cancelled_has_timestamp`: cancelled rows record when

use chrono::{DateTime, Utc};
use hris_shared::BillingCycle;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::invoices::InvoiceSnapshot;
use crate::pricing;

/// How far back paid invoices are re-priced
const SNAPSHOT_AUDIT_DAYS: i64 = 90;

#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub tenant_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationSeverity {
    /// Money may be charged or granted incorrectly
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    pub checked_at: DateTime<Utc>,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicatePendingRow {
    tenant_id: Uuid,
    subscription_id: Uuid,
    pending_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateSubscriptionRow {
    tenant_id: Uuid,
    subscription_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PendingPlanRow {
    tenant_id: Uuid,
    current_plan: String,
    current_tier: i32,
    pending_plan: String,
    pending_tier: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct PendingSeatsRow {
    tenant_id: Uuid,
    max_seats: i32,
    pending_max_seats: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidSnapshotRow {
    id: Uuid,
    tenant_id: Uuid,
    amount: Decimal,
    is_prorated: bool,
    plan_id: Uuid,
    plan_name: String,
    price_per_seat: Decimal,
    seat_count: i32,
    target_max_seats: i32,
    billing_cycle: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct CancelledRow {
    tenant_id: Uuid,
    subscription_id: Uuid,
}

/// Re-price one paid invoice; `None` when it is consistent
fn snapshot_violation(row: PaidSnapshotRow) -> Option<InvariantViolation> {
    let cycle: BillingCycle = match row.billing_cycle.parse() {
        Ok(cycle) => cycle,
        Err(e) => {
            return Some(InvariantViolation {
                invariant: "paid_amount_matches_snapshot".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!("Invoice {} has an unreadable snapshot: {}", row.id, e),
                context: serde_json::json!({ "invoice_id": row.id }),
                severity: ViolationSeverity::High,
            })
        }
    };
    let snapshot = InvoiceSnapshot {
        plan_id: row.plan_id,
        plan_name: row.plan_name,
        price_per_seat: row.price_per_seat,
        seat_count: row.seat_count,
        target_max_seats: row.target_max_seats,
        billing_cycle: cycle,
        period_start: row.period_start,
        period_end: row.period_end,
    };

    let expected = pricing::amount_from_snapshot(&snapshot, row.is_prorated).ok()?;
    if expected == row.amount {
        return None;
    }
    Some(InvariantViolation {
        invariant: "paid_amount_matches_snapshot".to_string(),
        tenant_ids: vec![row.tenant_id],
        description: format!(
            "Invoice {} was paid as {} but its snapshot prices to {}",
            row.id, row.amount, expected
        ),
        context: serde_json::json!({
            "invoice_id": row.id,
            "stored_amount": row.amount.to_string(),
            "recomputed_amount": expected.to_string(),
            "plan_name": snapshot.plan_name,
            "seat_count": snapshot.seat_count,
            "billing_cycle": cycle.as_str(),
            "is_prorated": row.is_prorated,
        }),
        severity: ViolationSeverity::Critical,
    })
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every check and summarise
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = Utc::now();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    async fn check_single_pending_invoice(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicatePendingRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, subscription_id, COUNT(*) AS pending_count
            FROM invoices
            WHERE status = 'pending'
            GROUP BY tenant_id, subscription_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_pending_invoice".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Subscription has {} pending invoices (expected at most 1)",
                    row.pending_count
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "pending_count": row.pending_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_single_subscription_per_tenant(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateSubscriptionRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, COUNT(*) AS subscription_count
            FROM subscriptions
            GROUP BY tenant_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_subscription_per_tenant".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!("Tenant has {} subscriptions", row.subscription_count),
                context: serde_json::json!({ "subscription_count": row.subscription_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_pending_plan_is_downgrade(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PendingPlanRow> = sqlx::query_as(
            r#"
            SELECT
                s.tenant_id,
                cur.name AS current_plan,
                cur.tier_level AS current_tier,
                pen.name AS pending_plan,
                pen.tier_level AS pending_tier
            FROM subscriptions s
            JOIN plans cur ON cur.id = s.plan_id
            JOIN plans pen ON pen.id = s.pending_plan_id
            WHERE pen.tier_level >= cur.tier_level
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_plan_is_downgrade".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Pending plan '{}' (tier {}) is not below current plan '{}' (tier {})",
                    row.pending_plan, row.pending_tier, row.current_plan, row.current_tier
                ),
                context: serde_json::json!({
                    "current_plan": row.current_plan,
                    "pending_plan": row.pending_plan,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_pending_seats_below_current(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PendingSeatsRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, max_seats, pending_max_seats
            FROM subscriptions
            WHERE pending_max_seats IS NOT NULL AND pending_max_seats >= max_seats
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_seats_below_current".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Pending seat limit {} is not below current limit {}",
                    row.pending_max_seats, row.max_seats
                ),
                context: serde_json::json!({
                    "max_seats": row.max_seats,
                    "pending_max_seats": row.pending_max_seats,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_paid_amount_matches_snapshot(&self) -> BillingResult<Vec<InvariantViolation>> {
        let since = Utc::now() - chrono::Duration::days(SNAPSHOT_AUDIT_DAYS);
        let rows: Vec<PaidSnapshotRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, amount, is_prorated, plan_id, plan_name, price_per_seat,
                   seat_count, target_max_seats, billing_cycle, period_start, period_end
            FROM invoices
            WHERE status = 'paid' AND paid_at >= $1
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(snapshot_violation).collect())
    }

    async fn check_cancelled_has_timestamp(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CancelledRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, id AS subscription_id
            FROM subscriptions
            WHERE status = 'cancelled' AND cancelled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cancelled_has_timestamp".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: "Cancelled subscription has no cancellation time".to_string(),
                context: serde_json::json!({ "subscription_id": row.subscription_id }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run one check by name; unknown names yield no violations
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_pending_invoice" => self.check_single_pending_invoice().await,
            "single_subscription_per_tenant" => self.check_single_subscription_per_tenant().await,
            "pending_plan_is_downgrade" => self.check_pending_plan_is_downgrade().await,
            "pending_seats_below_current" => self.check_pending_seats_below_current().await,
            "paid_amount_matches_snapshot" => self.check_paid_amount_matches_snapshot().await,
            "cancelled_has_timestamp" => self.check_cancelled_has_timestamp().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_pending_invoice",
            "single_subscription_per_tenant",
            "pending_plan_is_downgrade",
            "pending_seats_below_current",
            "paid_amount_matches_snapshot",
            "cancelled_has_timestamp",
        ]
    }
}
