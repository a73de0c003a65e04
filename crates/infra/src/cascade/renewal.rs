//! Renewal arithmetic: ARR, proration, next cycle date, likelihood and summaries.
//!
//! Everything here is pure. `now` is always passed in so results are reproducible.

use chrono::{DateTime, Datelike, Months, Utc};

use custos_opportunity::RenewalLikelihood;

use crate::read_model::{OpportunityView, ServiceLineItemView};

/// Rate stamped on a renewal whose likelihood is reset to MEDIUM.
pub const MEDIUM_RATE: i64 = 50;

/// Round half-up to two decimals. Amounts are never negative.
pub fn round_amount(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Annualized value of one line item. Non-recurring billing contributes nothing.
pub fn annual_value(item: &ServiceLineItemView) -> f64 {
    item.price * item.quantity as f64 * item.billed.periods_per_year()
}

/// Whether a line item still bills at `now`.
pub fn is_billing(item: &ServiceLineItemView, now: DateTime<Utc>) -> bool {
    item.ended_at.is_none_or(|ended| ended > now)
}

/// Whole calendar months from `start` to `end`, floored at zero.
pub fn months_between(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let years = i64::from(end.year() - start.year());
    let months = i64::from(end.month()) - i64::from(start.month());
    let mut total = years * 12 + months;
    if end.day() < start.day() {
        total -= 1;
    }
    total.max(0)
}

/// Scale a yearly figure down to the months left. A year or more is left untouched.
pub fn prorate(arr: f64, months_remaining: i64) -> f64 {
    if months_remaining > 12 {
        return arr;
    }
    arr / 12.0 * months_remaining as f64
}

/// Full renewal value of a contract, before likelihood.
pub fn max_arr(items: &[ServiceLineItemView], contract_ended_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let arr: f64 = items
        .iter()
        .filter(|item| is_billing(item, now))
        .map(annual_value)
        .sum();
    let arr = match contract_ended_at {
        Some(ended) => prorate(arr, months_between(now, ended)),
        None => arr,
    };
    round_amount(arr)
}

/// Expected renewal value given the adjusted rate (a percentage).
pub fn current_arr(max_arr: f64, adjusted_rate: i64) -> f64 {
    match adjusted_rate {
        r if r <= 0 => 0.0,
        r if r >= 100 => max_arr,
        r => round_amount(max_arr * r as f64 / 100.0),
    }
}

/// Next renewal date: `anchor` plus one renewal cycle.
///
/// Auto-renewing contracts keep rolling forward until the date is after `now`.
/// `None` without an anchor or a positive cycle length.
pub fn next_cycle_date(
    anchor: Option<DateTime<Utc>>,
    length_in_months: i64,
    auto_renew: bool,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let anchor = anchor?;
    let step = u32::try_from(length_in_months).ok().filter(|m| *m > 0)?;

    let mut cycles: u32 = 1;
    loop {
        // Always offset from the anchor so month-end dates do not drift.
        let next = anchor.checked_add_months(Months::new(step.checked_mul(cycles)?))?;
        if !auto_renew || next > now {
            return Some(next);
        }
        cycles = cycles.checked_add(1)?;
    }
}

/// Likelihood correction driven by the contract end date.
///
/// A contract ending before the renewal date cannot renew (ZERO). A ZERO renewal whose
/// contract no longer ends before the renewal date is brought back to MEDIUM.
pub fn recomputed_likelihood(
    current: Option<RenewalLikelihood>,
    renewed_at: Option<DateTime<Utc>>,
    contract_ended_at: Option<DateTime<Utc>>,
) -> Option<(RenewalLikelihood, i64)> {
    let renewed_at = renewed_at?;
    let is_zero = current == Some(RenewalLikelihood::Zero);
    match contract_ended_at {
        Some(ended) if ended < renewed_at && !is_zero => Some((RenewalLikelihood::Zero, 0)),
        Some(ended) if ended > renewed_at && is_zero => Some((RenewalLikelihood::Medium, MEDIUM_RATE)),
        None if is_zero => Some((RenewalLikelihood::Medium, MEDIUM_RATE)),
        _ => None,
    }
}

/// Organization-level renewal forecast.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ArrForecast {
    pub arr: f64,
    pub max_arr: f64,
}

pub fn forecast<'a>(renewals: impl IntoIterator<Item = &'a OpportunityView>) -> ArrForecast {
    let (arr, max_arr) = renewals
        .into_iter()
        .fold((0.0, 0.0), |(arr, max), r| (arr + r.amount, max + r.max_amount));
    ArrForecast {
        arr: round_amount(arr),
        max_arr: round_amount(max_arr),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenewalSummary {
    pub next_renewal_at: Option<DateTime<Utc>>,
    pub likelihood: Option<RenewalLikelihood>,
    pub likelihood_order: i64,
}

/// Earliest upcoming renewal date and the lowest likelihood across open renewals.
pub fn renewal_summary<'a>(
    renewals: impl IntoIterator<Item = &'a OpportunityView>,
    now: DateTime<Utc>,
) -> RenewalSummary {
    let mut next_renewal_at: Option<DateTime<Utc>> = None;
    let mut likelihood: Option<RenewalLikelihood> = None;
    for renewal in renewals {
        if let Some(at) = renewal.renewed_at.filter(|at| *at > now) {
            next_renewal_at = Some(next_renewal_at.map_or(at, |current| current.min(at)));
        }
        if let Some(l) = renewal.renewal_likelihood {
            likelihood = Some(likelihood.map_or(l, |current| current.min(l)));
        }
    }
    RenewalSummary {
        next_renewal_at,
        likelihood,
        likelihood_order: RenewalLikelihood::order(likelihood),
    }
}
