//! PostgreSQL implementations of the store traits
//!
//! Every mutation carries its expected pre-state in the `WHERE` clause and
//! reports the affected row count; row-level locks taken by `UPDATE` serialise
//! concurrent actors on the same subscription.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hris_shared::SubscriptionStatus;
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::catalog::{Feature, Plan};
use crate::error::{BillingError, BillingResult};
use crate::invoices::{not_applied_note, Invoice, InvoiceSnapshot, PaymentUpdate, SettleOutcome};
use crate::store::{EmployeeCounter, InvoiceStore, PlanReader, SubscriptionStore};
use crate::subscriptions::{Subscription, SubscriptionAdvance};

const SINGLE_PENDING_INDEX: &str = "invoices_single_pending";
const TENANT_UNIQUE_INDEX: &str = "subscriptions_tenant_unique";

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, plan_id, status, max_seats, pending_max_seats, \
     billing_cycle, current_period_start, current_period_end, trial_ends_at, pending_plan_id, \
     auto_renew, cancelled_at, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, tenant_id, subscription_id, kind, gateway_invoice_id, \
     gateway_invoice_url, gateway_expires_at, amount, is_prorated, plan_id, plan_name, \
     price_per_seat, seat_count, target_max_seats, billing_cycle, period_start, period_end, \
     status, issued_at, paid_at, payment_method, payment_channel, notes, created_at";

fn violates(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => db.constraint() == Some(constraint),
        _ => false,
    }
}

fn status_names(statuses: &[SubscriptionStatus]) -> Vec<&'static str> {
    statuses.iter().map(|s| s.as_str()).collect()
}

#[derive(Debug, FromRow)]
struct PlanRow {
    id: Uuid,
    name: String,
    price_per_seat: Decimal,
    tier_level: i32,
    max_seats: Option<i32>,
    is_active: bool,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            price_per_seat: row.price_per_seat,
            tier_level: row.tier_level,
            max_seats: row.max_seats,
            is_active: row.is_active,
        }
    }
}

#[derive(Debug, FromRow)]
struct FeatureRow {
    id: Uuid,
    code: String,
    name: String,
    description: Option<String>,
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    plan_id: Uuid,
    status: String,
    max_seats: i32,
    pending_max_seats: Option<i32>,
    billing_cycle: String,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    trial_ends_at: Option<DateTime<Utc>>,
    pending_plan_id: Option<Uuid>,
    auto_renew: bool,
    cancelled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            max_seats: row.max_seats,
            pending_max_seats: row.pending_max_seats,
            billing_cycle: row.billing_cycle.parse()?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            trial_ends_at: row.trial_ends_at,
            pending_plan_id: row.pending_plan_id,
            auto_renew: row.auto_renew,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct InvoiceRow {
    id: Uuid,
    tenant_id: Uuid,
    subscription_id: Uuid,
    kind: String,
    gateway_invoice_id: Option<String>,
    gateway_invoice_url: Option<String>,
    gateway_expires_at: Option<DateTime<Utc>>,
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
    status: String,
    issued_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
    payment_method: Option<String>,
    payment_channel: Option<String>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = BillingError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            subscription_id: row.subscription_id,
            kind: row.kind.parse()?,
            gateway_invoice_id: row.gateway_invoice_id,
            gateway_invoice_url: row.gateway_invoice_url,
            gateway_expires_at: row.gateway_expires_at,
            amount: row.amount,
            is_prorated: row.is_prorated,
            snapshot: InvoiceSnapshot {
                plan_id: row.plan_id,
                plan_name: row.plan_name,
                price_per_seat: row.price_per_seat,
                seat_count: row.seat_count,
                target_max_seats: row.target_max_seats,
                billing_cycle: row.billing_cycle.parse()?,
                period_start: row.period_start,
                period_end: row.period_end,
            },
            status: row.status.parse()?,
            issued_at: row.issued_at,
            paid_at: row.paid_at,
            payment_method: row.payment_method,
            payment_channel: row.payment_channel,
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}

fn into_invoices(rows: Vec<InvoiceRow>) -> BillingResult<Vec<Invoice>> {
    rows.into_iter().map(Invoice::try_from).collect()
}

/// Plans, subscriptions and invoices in one Postgres database
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanReader for PgBillingStore {
    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, price_per_seat, tier_level, max_seats, is_active
            FROM plans
            WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Plan::from))
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, price_per_seat, tier_level, max_seats, is_active
            FROM plans
            ORDER BY tier_level
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Plan::from).collect())
    }

    async fn plan_features(&self, plan_id: Uuid) -> BillingResult<Vec<Feature>> {
        let rows: Vec<FeatureRow> = sqlx::query_as(
            r#"
            SELECT f.id, f.code, f.name, f.description
            FROM plan_features pf
            JOIN features f ON f.id = pf.feature_id
            WHERE pf.plan_id = $1 AND pf.is_active
            ORDER BY f.code
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Feature {
                id: r.id,
                code: r.code,
                name: r.name,
                description: r.description,
            })
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for PgBillingStore {
    async fn get_by_tenant(&self, tenant_id: Uuid) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE tenant_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn insert(&self, s: &Subscription) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, tenant_id, plan_id, status, max_seats, pending_max_seats, billing_cycle,
                current_period_start, current_period_end, trial_ends_at, pending_plan_id,
                auto_renew, cancelled_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(s.id)
        .bind(s.tenant_id)
        .bind(s.plan_id)
        .bind(s.status.as_str())
        .bind(s.max_seats)
        .bind(s.pending_max_seats)
        .bind(s.billing_cycle.as_str())
        .bind(s.current_period_start)
        .bind(s.current_period_end)
        .bind(s.trial_ends_at)
        .bind(s.pending_plan_id)
        .bind(s.auto_renew)
        .bind(s.cancelled_at)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if violates(&e, TENANT_UNIQUE_INDEX) => Err(BillingError::SubscriptionExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_pending_plan(
        &self,
        tenant_id: Uuid,
        expected_plan_id: Uuid,
        allowed: &[SubscriptionStatus],
        pending_plan_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET pending_plan_id = $1, updated_at = $2
            WHERE tenant_id = $3 AND plan_id = $4 AND status = ANY($5)
            "#,
        )
        .bind(pending_plan_id)
        .bind(now)
        .bind(tenant_id)
        .bind(expected_plan_id)
        .bind(status_names(allowed))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_pending_seats(
        &self,
        tenant_id: Uuid,
        expected_max_seats: i32,
        allowed: &[SubscriptionStatus],
        pending_max_seats: Option<i32>,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET pending_max_seats = $1, updated_at = $2
            WHERE tenant_id = $3 AND max_seats = $4 AND status = ANY($5)
            "#,
        )
        .bind(pending_max_seats)
        .bind(now)
        .bind(tenant_id)
        .bind(expected_max_seats)
        .bind(status_names(allowed))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn transition(
        &self,
        tenant_id: Uuid,
        from: &[SubscriptionStatus],
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1,
                cancelled_at = CASE WHEN $1 = 'cancelled' THEN $2 ELSE cancelled_at END,
                auto_renew = CASE WHEN $1 = 'cancelled' THEN FALSE ELSE auto_renew END,
                updated_at = $2
            WHERE tenant_id = $3 AND status = ANY($4)
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(tenant_id)
        .bind(status_names(from))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn sweep_status(
        &self,
        from: &[SubscriptionStatus],
        to: SubscriptionStatus,
        period_ended_by: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1, updated_at = $2
            WHERE status = ANY($3) AND current_period_end <= $4
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(status_names(from))
        .bind(period_ended_by)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn apply_pending_seats(&self, now: DateTime<Utc>) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET max_seats = pending_max_seats, pending_max_seats = NULL, updated_at = $1
            WHERE pending_max_seats IS NOT NULL AND current_period_end <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn apply_pending_plans(&self, now: DateTime<Utc>) -> BillingResult<u64> {
        // SET expressions see the pre-update row, so the clamp is computed once
        let result = sqlx::query(
            r#"
            UPDATE subscriptions s
            SET plan_id = s.pending_plan_id,
                pending_plan_id = NULL,
                max_seats = LEAST(s.max_seats, COALESCE(p.max_seats, s.max_seats)),
                pending_max_seats = CASE
                    WHEN s.pending_max_seats
                        >= LEAST(s.max_seats, COALESCE(p.max_seats, s.max_seats))
                    THEN NULL
                    ELSE s.pending_max_seats
                END,
                updated_at = $1
            FROM plans p
            WHERE p.id = s.pending_plan_id
              AND s.pending_plan_id IS NOT NULL
              AND s.current_period_end <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl InvoiceStore for PgBillingStore {
    async fn insert(&self, i: &Invoice) -> BillingResult<()> {
        let s = &i.snapshot;
        let result = sqlx::query(
            r#"
            INSERT INTO invoices (
                id, tenant_id, subscription_id, kind, gateway_invoice_id, gateway_invoice_url,
                gateway_expires_at, amount, is_prorated, plan_id, plan_name, price_per_seat,
                seat_count, target_max_seats, billing_cycle, period_start, period_end,
                status, issued_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $20)
            "#,
        )
        .bind(i.id)
        .bind(i.tenant_id)
        .bind(i.subscription_id)
        .bind(i.kind.as_str())
        .bind(&i.gateway_invoice_id)
        .bind(&i.gateway_invoice_url)
        .bind(i.gateway_expires_at)
        .bind(i.amount)
        .bind(i.is_prorated)
        .bind(s.plan_id)
        .bind(&s.plan_name)
        .bind(s.price_per_seat)
        .bind(s.seat_count)
        .bind(s.target_max_seats)
        .bind(s.billing_cycle.as_str())
        .bind(s.period_start)
        .bind(s.period_end)
        .bind(i.status.as_str())
        .bind(i.issued_at)
        .bind(i.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if violates(&e, SINGLE_PENDING_INDEX) => {
                tracing::debug!(
                    subscription_id = %i.subscription_id,
                    "Lost pending invoice race"
                );
                Err(BillingError::PendingInvoiceExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        let sql = format!("SELECT {} FROM invoices WHERE id = $1", INVOICE_COLUMNS);
        let row: Option<InvoiceRow> = sqlx::query_as(&sql)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Invoice::try_from).transpose()
    }

    async fn get_by_gateway_id(&self, gateway_invoice_id: &str) -> BillingResult<Option<Invoice>> {
        let sql = format!(
            "SELECT {} FROM invoices WHERE gateway_invoice_id = $1",
            INVOICE_COLUMNS
        );
        let row: Option<InvoiceRow> = sqlx::query_as(&sql)
            .bind(gateway_invoice_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Invoice::try_from).transpose()
    }

    async fn find_pending(&self, subscription_id: Uuid) -> BillingResult<Option<Invoice>> {
        let sql = format!(
            "SELECT {} FROM invoices WHERE subscription_id = $1 AND status = 'pending'",
            INVOICE_COLUMNS
        );
        let row: Option<InvoiceRow> = sqlx::query_as(&sql)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Invoice::try_from).transpose()
    }

    async fn list_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let sql = format!(
            "SELECT {} FROM invoices WHERE tenant_id = $1 ORDER BY created_at DESC",
            INVOICE_COLUMNS
        );
        let rows: Vec<InvoiceRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        into_invoices(rows)
    }

    async fn settle(
        &self,
        invoice_id: Uuid,
        update: &PaymentUpdate,
        advance: Option<&SubscriptionAdvance>,
    ) -> BillingResult<SettleOutcome> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM invoices WHERE id = $1 FOR UPDATE")
                .bind(invoice_id)
                .fetch_optional(&mut *tx)
                .await?;
        let current = current.ok_or_else(|| BillingError::InvoiceNotFound(invoice_id.to_string()))?;
        if current != "pending" {
            return Ok(SettleOutcome::AlreadySettled(current.parse()?));
        }

        let mut skipped = None;
        if let Some(advance) = advance {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM subscriptions WHERE id = $1 FOR UPDATE")
                    .bind(advance.subscription_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let status: SubscriptionStatus = status
                .ok_or_else(|| {
                    BillingError::CorruptRecord(format!(
                        "invoice {} references missing subscription {}",
                        invoice_id, advance.subscription_id
                    ))
                })?
                .parse()?;
            if !advance.applies_to(status) {
                skipped = Some(status);
            }
        }
        let notes = skipped
            .map(not_applied_note)
            .or_else(|| update.notes.clone());

        sqlx::query(
            r#"
            UPDATE invoices
            SET status = $1,
                paid_at = $2,
                payment_method = $3,
                payment_channel = $4,
                notes = COALESCE($5, notes),
                updated_at = $6
            WHERE id = $7 AND status = 'pending'
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.paid_at)
        .bind(&update.payment_method)
        .bind(&update.payment_channel)
        .bind(&notes)
        .bind(update.updated_at)
        .bind(invoice_id)
        .execute(&mut *tx)
        .await?;

        if let Some(status) = skipped {
            tx.commit().await?;
            return Ok(SettleOutcome::PaidNotApplied(status));
        }

        if let Some(advance) = advance {
            let (start, end) = advance.period.unzip();
            // Seat-only changes leave status, cancellation and renewal alone
            let moved = sqlx::query(
                r#"
                UPDATE subscriptions
                SET plan_id = COALESCE($1, plan_id),
                    max_seats = $2,
                    current_period_start = COALESCE($3, current_period_start),
                    current_period_end = COALESCE($4, current_period_end),
                    billing_cycle = COALESCE($5, billing_cycle),
                    pending_plan_id = CASE WHEN $6 THEN NULL ELSE pending_plan_id END,
                    pending_max_seats = CASE
                        WHEN $7 OR pending_max_seats >= $2 THEN NULL
                        ELSE pending_max_seats
                    END,
                    status = COALESCE($8::text, status),
                    cancelled_at = CASE WHEN $8::text IS NULL THEN cancelled_at ELSE NULL END,
                    auto_renew = CASE WHEN $8::text IS NULL THEN auto_renew ELSE TRUE END,
                    updated_at = $9
                WHERE id = $10
                "#,
            )
            .bind(advance.plan_id)
            .bind(advance.max_seats)
            .bind(start)
            .bind(end)
            .bind(advance.billing_cycle.map(|c| c.as_str()))
            .bind(advance.clear_pending_plan)
            .bind(advance.clear_pending_seats)
            .bind(advance.status_after.map(|s| s.as_str()))
            .bind(update.updated_at)
            .bind(advance.subscription_id)
            .execute(&mut *tx)
            .await?;

            if moved.rows_affected() != 1 {
                // Dropping `tx` rolls the invoice update back
                return Err(BillingError::CorruptRecord(format!(
                    "invoice {} references missing subscription {}",
                    invoice_id, advance.subscription_id
                )));
            }
        }

        tx.commit().await?;
        Ok(SettleOutcome::Applied)
    }

    async fn expire_stale(
        &self,
        created_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'expired',
                notes = COALESCE(notes, 'Expired by reconciliation'),
                updated_at = $1
            WHERE status = 'pending'
              AND (created_at < $2 OR gateway_expires_at <= $1)
            "#,
        )
        .bind(now)
        .bind(created_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Active head count read from the employee module's table
#[derive(Clone)]
pub struct PgEmployeeCounter {
    pool: PgPool,
}

impl PgEmployeeCounter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmployeeCounter for PgEmployeeCounter {
    async fn count_active_by_tenant(&self, tenant_id: Uuid) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM employees WHERE tenant_id = $1 AND is_active",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn subscription_row(status: &str) -> SubscriptionRow {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        SubscriptionRow {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            status: status.to_string(),
            max_seats: 10,
            pending_max_seats: Some(5),
            billing_cycle: "yearly".to_string(),
            current_period_start: now,
            current_period_end: now,
            trial_ends_at: None,
            pending_plan_id: None,
            auto_renew: true,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_subscription_row_converts() {
        let sub = Subscription::try_from(subscription_row("past_due")).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.billing_cycle, hris_shared::BillingCycle::Yearly);
        assert_eq!(sub.pending_max_seats, Some(5));
    }

    #[test]
    fn test_unknown_status_is_corrupt_record() {
        let err = Subscription::try_from(subscription_row("suspended")).unwrap_err();
        assert!(matches!(err, BillingError::CorruptRecord(_)));
    }

    #[test]
    fn test_status_names_bind_as_text() {
        assert_eq!(
            status_names(&[SubscriptionStatus::Trial, SubscriptionStatus::Active]),
            vec!["trial", "active"]
        );
    }
}
