//! Pricing and proration
//!
//! Pure functions: amounts are derived only from the inputs passed in, so an
//! invoice snapshot always reproduces its stored amount.
//!
//! ## Rules
//!
//! - Monthly: `price_per_seat × seats`
//! - Yearly: `price_per_seat × seats × 10` (two months free, never a percentage)
//! - Periods advance by calendar months, clamping to the last day of shorter
//!   months (Jan 31 + 1 month = Feb 29 in a leap year)
//! - Prorated amounts charge whole remaining days of the full cycle ending at
//!   the same period end

use chrono::{DateTime, Months, Utc};
use hris_shared::BillingCycle;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{BillingError, BillingResult};
use crate::invoices::InvoiceSnapshot;

/// Months charged for a yearly cycle
pub const YEARLY_MONTHS_CHARGED: i64 = 10;

const AMOUNT_DECIMALS: u32 = 2;
const SECONDS_PER_DAY: i64 = 86_400;

/// Multiplier applied to the monthly per-seat price for one period
pub fn cycle_multiplier(cycle: BillingCycle) -> Decimal {
    match cycle {
        BillingCycle::Monthly => Decimal::ONE,
        BillingCycle::Yearly => Decimal::from(YEARLY_MONTHS_CHARGED),
    }
}

fn round_amount(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(AMOUNT_DECIMALS, RoundingStrategy::MidpointAwayFromZero)
}

/// Price of one full period
pub fn full_period_amount(price_per_seat: Decimal, seats: i32, cycle: BillingCycle) -> Decimal {
    round_amount(price_per_seat * Decimal::from(seats) * cycle_multiplier(cycle))
}

/// End of a period starting at `start`
pub fn period_end(start: DateTime<Utc>, cycle: BillingCycle) -> BillingResult<DateTime<Utc>> {
    start
        .checked_add_months(Months::new(cycle.months()))
        .ok_or_else(|| BillingError::InvalidPeriod(format!("start {start}")))
}

/// Start of the full period that ends at `end`
pub fn full_period_start(end: DateTime<Utc>, cycle: BillingCycle) -> BillingResult<DateTime<Utc>> {
    end.checked_sub_months(Months::new(cycle.months()))
        .ok_or_else(|| BillingError::InvalidPeriod(format!("end {end}")))
}

/// Whole days from `from` until `until`, rounding partial days up
pub fn remaining_days(from: DateTime<Utc>, until: DateTime<Utc>) -> i64 {
    let seconds = (until - from).num_seconds();
    if seconds <= 0 {
        return 0;
    }
    (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
}

/// Price of `seats` for the partial period `[start, end)`.
///
/// `end` must be the end of a full cycle; the charge is the full period
/// amount scaled by remaining days over the cycle's days.
pub fn prorated_amount(
    price_per_seat: Decimal,
    seats: i32,
    cycle: BillingCycle,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> BillingResult<Decimal> {
    let cycle_start = full_period_start(end, cycle)?;
    let cycle_days = remaining_days(cycle_start, end);
    let days = remaining_days(start, end).min(cycle_days);
    if days == 0 || cycle_days == 0 {
        return Ok(Decimal::ZERO);
    }

    let full = price_per_seat * Decimal::from(seats) * cycle_multiplier(cycle);
    Ok(round_amount(full * Decimal::from(days) / Decimal::from(cycle_days)))
}

/// Recompute an invoice amount from its frozen snapshot alone
pub fn amount_from_snapshot(
    snapshot: &InvoiceSnapshot,
    is_prorated: bool,
) -> BillingResult<Decimal> {
    if is_prorated {
        prorated_amount(
            snapshot.price_per_seat,
            snapshot.seat_count,
            snapshot.billing_cycle,
            snapshot.period_start,
            snapshot.period_end,
        )
    } else {
        Ok(full_period_amount(
            snapshot.price_per_seat,
            snapshot.seat_count,
            snapshot.billing_cycle,
        ))
    }
}
