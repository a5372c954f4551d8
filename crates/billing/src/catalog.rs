//! Plan catalog
//!
//! Read-only lookup of plans, their tier ordering and the features they
//! unlock. Plans are never mutated by the engine; invoices snapshot what they
//! need at creation time.

use std::cmp::Ordering;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::PlanReader;

/// A purchasable plan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub price_per_seat: Decimal,
    /// Strictly ordered; higher is a better plan
    pub tier_level: i32,
    /// Upper bound on seats, `None` for uncapped plans
    pub max_seats: Option<i32>,
    pub is_active: bool,
}

impl Plan {
    /// Whether `seats` fits under this plan's cap
    pub fn allows_seats(&self, seats: i32) -> bool {
        self.max_seats.map_or(true, |cap| seats <= cap)
    }

    /// Rejects `seats` above the cap with `ExceedsPlanMaxSeats`
    pub fn ensure_allows_seats(&self, seats: i32) -> BillingResult<()> {
        match self.max_seats {
            Some(cap) if !self.allows_seats(seats) => Err(BillingError::ExceedsPlanMaxSeats {
                plan: self.name.clone(),
                max_seats: cap,
            }),
            _ => Ok(()),
        }
    }
}

/// A capability unlocked by a plan, identified by a stable code
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Feature {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
}

/// Direction of a plan change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChange {
    Upgrade,
    Downgrade,
    Same,
}

/// Classify moving from `from` to `to` by tier level
pub fn classify_change(from: &Plan, to: &Plan) -> PlanChange {
    if from.id == to.id {
        return PlanChange::Same;
    }
    match to.tier_level.cmp(&from.tier_level) {
        Ordering::Greater => PlanChange::Upgrade,
        Ordering::Less => PlanChange::Downgrade,
        Ordering::Equal => PlanChange::Same,
    }
}

/// Registry of plans backed by a [`PlanReader`]
#[derive(Clone)]
pub struct PlanCatalog {
    reader: Arc<dyn PlanReader>,
}

impl PlanCatalog {
    pub fn new(reader: Arc<dyn PlanReader>) -> Self {
        Self { reader }
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        self.reader
            .get_plan(plan_id)
            .await?
            .ok_or(BillingError::PlanNotFound(plan_id))
    }

    /// Like [`get_plan`](Self::get_plan) but rejects plans withdrawn from sale
    pub async fn get_active_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        let plan = self.get_plan(plan_id).await?;
        if !plan.is_active {
            return Err(BillingError::PlanInactive(plan.name));
        }
        Ok(plan)
    }

    /// Plans on sale, lowest tier first
    pub async fn list_active_plans(&self) -> BillingResult<Vec<Plan>> {
        let mut plans: Vec<Plan> = self
            .reader
            .list_plans()
            .await?
            .into_iter()
            .filter(|p| p.is_active)
            .collect();
        plans.sort_by_key(|p| p.tier_level);
        Ok(plans)
    }

    /// Features currently switched on for a plan
    pub async fn plan_features(&self, plan_id: Uuid) -> BillingResult<Vec<Feature>> {
        self.reader.plan_features(plan_id).await
    }

    pub async fn plan_has_feature(&self, plan_id: Uuid, code: &str) -> BillingResult<bool> {
        Ok(self
            .plan_features(plan_id)
            .await?
            .iter()
            .any(|f| f.code == code))
    }
}
