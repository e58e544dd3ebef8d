//! Fixed-length planning periods (sprints/weeks) counted from a workspace start date.
//!
//! Pure functions of `(reference, start, length)`; callers pass "today" in
//! explicitly so nothing here reads a clock.

use chrono::{Duration, NaiveDate};

/// 1-based number of the period containing `reference`.
///
/// Dates before `start` fall in period 1. Returns `None` when
/// `length_days` is zero.
pub fn period_number(reference: NaiveDate, start: NaiveDate, length_days: u32) -> Option<u32> {
    if length_days == 0 {
        return None;
    }
    let elapsed = (reference - start).num_days();
    if elapsed < 0 {
        return Some(1);
    }
    u32::try_from(elapsed / i64::from(length_days) + 1).ok()
}

/// Inclusive first and last day of period `number` (1-based).
pub fn period_bounds(
    number: u32,
    start: NaiveDate,
    length_days: u32,
) -> Option<(NaiveDate, NaiveDate)> {
    if number == 0 || length_days == 0 {
        return None;
    }
    let offset = i64::from(number - 1) * i64::from(length_days);
    let first = start.checked_add_signed(Duration::days(offset))?;
    let last = first.checked_add_signed(Duration::days(i64::from(length_days) - 1))?;
    Some((first, last))
}
